use serde::{Deserialize, Serialize};

/// Audio frame sent to the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundFrame {
    pub mime_type: String,  // e.g. "audio/pcm;rate=16000"
    pub data_base64: String,  // Base64-encoded PCM bytes
}

/// Audio received from the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundFrame {
    pub inline_audio_base64: String,
    /// Rate of the payload; the session output rate is assumed when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
}

/// Session setup request, sent once during the handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSetup {
    pub session_id: String,
    pub persona: String,
    pub voice: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
    pub input_mime_type: String,
    pub output_sample_rate: u32,
}

/// Agent reply to a [`SessionSetup`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAccepted {
    pub session_id: String,
    pub accepted: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Lifecycle messages exchanged outside the audio streams
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ControlMessage {
    Close {
        #[serde(default)]
        reason: Option<String>,
    },
    Error {
        message: String,
    },
}
