use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::audio::{CaptureConfig, PlaybackConfig};

/// Runtime configuration shared by all sessions of a controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Capture rate sent to the agent (agent expects 16kHz)
    pub input_sample_rate: u32,

    /// Rate of response audio from the agent (24kHz)
    pub output_sample_rate: u32,

    /// Samples per captured frame
    pub frame_size: usize,

    /// Furthest ahead of the device clock a response buffer may be scheduled
    pub max_lookahead: Duration,

    /// Outbound frames buffered while a send is in flight
    pub outbound_queue_frames: usize,

    /// Microphone name, `None` for the default
    pub input_device: Option<String>,

    /// Speaker name, `None` for the default
    pub output_device: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16000,
            output_sample_rate: 24000,
            frame_size: 4096,
            max_lookahead: Duration::from_secs(8),
            outbound_queue_frames: 32,
            input_device: None,
            output_device: None,
        }
    }
}

impl SessionConfig {
    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            sample_rate: self.input_sample_rate,
            frame_size: self.frame_size,
            device: self.input_device.clone(),
        }
    }

    pub fn playback_config(&self) -> PlaybackConfig {
        PlaybackConfig {
            sample_rate: self.output_sample_rate,
            device: self.output_device.clone(),
        }
    }
}

/// Static per-call configuration supplied by the host
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationContext {
    /// Session identifier (e.g., "call-2025-10-28-coach"); generated when absent
    #[serde(default)]
    pub session_id: Option<String>,

    /// Persona / system instruction for the agent
    #[serde(default)]
    pub persona: String,

    /// Voice name for synthesized speech
    #[serde(default)]
    pub voice: String,

    /// Content excerpt the conversation is about
    #[serde(default)]
    pub excerpt: Option<String>,
}
