use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::{CloseReason, SessionState};

/// Statistics about a voice session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_id: String,

    /// Current state
    pub state: SessionState,

    /// Why the session closed, once it has
    pub close_reason: Option<CloseReason>,

    /// When the session was created
    pub started_at: DateTime<Utc>,

    /// Total duration in seconds
    pub duration_secs: f64,

    /// Frames delivered by the microphone
    pub frames_captured: u64,

    /// Frames handed to the transport successfully
    pub frames_sent: u64,

    /// Frames discarded (transport not open, or send queue full)
    pub frames_dropped: u64,

    /// Sends the transport rejected
    pub send_failures: u64,

    /// Response chunks placed on the playback timeline
    pub chunks_scheduled: u64,

    /// Response chunks skipped because they could not be decoded
    pub chunks_malformed: u64,

    /// Total scheduled response audio in seconds
    pub scheduled_audio_secs: f64,
}
