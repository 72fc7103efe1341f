use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;

use crate::session::{ConversationContext, SessionConfig};
use crate::transport::NatsTransportConfig;

/// Environment overrides use this prefix, e.g. `LOQA_DUPLEX__AUDIO__FRAME_SIZE=2048`
const ENV_PREFIX: &str = "LOQA_DUPLEX";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub frame_size: usize,
    pub max_lookahead_ms: u64,
    pub outbound_queue_frames: usize,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            input_sample_rate: session.input_sample_rate,
            output_sample_rate: session.output_sample_rate,
            frame_size: session.frame_size,
            max_lookahead_ms: session.max_lookahead.as_millis() as u64,
            outbound_queue_frames: session.outbound_queue_frames,
            input_device: None,
            output_device: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub nats_url: String,
    pub subject_prefix: String,
    pub handshake_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        let nats = NatsTransportConfig::default();
        Self {
            nats_url: nats.url,
            subject_prefix: nats.subject_prefix,
            handshake_timeout_ms: nats.handshake_timeout.as_millis() as u64,
        }
    }
}

/// Defaults for calls that do not specify a persona or voice
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub persona: String,
    pub voice: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            persona: "You are a friendly conversation partner.".to_string(),
            voice: "Puck".to_string(),
        }
    }
}

impl AgentConfig {
    /// Fill in persona and voice where the caller left them empty
    pub fn apply_defaults(&self, mut context: ConversationContext) -> ConversationContext {
        if context.persona.is_empty() {
            context.persona = self.persona.clone();
        }
        if context.voice.is_empty() {
            context.voice = self.voice.clone();
        }
        context
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            input_sample_rate: self.audio.input_sample_rate,
            output_sample_rate: self.audio.output_sample_rate,
            frame_size: self.audio.frame_size,
            max_lookahead: Duration::from_millis(self.audio.max_lookahead_ms),
            outbound_queue_frames: self.audio.outbound_queue_frames,
            input_device: self.audio.input_device.clone(),
            output_device: self.audio.output_device.clone(),
        }
    }

    pub fn nats_config(&self) -> NatsTransportConfig {
        NatsTransportConfig {
            url: self.transport.nats_url.clone(),
            subject_prefix: self.transport.subject_prefix.clone(),
            handshake_timeout: Duration::from_millis(self.transport.handshake_timeout_ms),
            ..NatsTransportConfig::default()
        }
    }
}
