//! Error types for duplex voice sessions

use thiserror::Error;

/// Result type alias for voice session operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur while running a voice session
#[derive(Error, Debug)]
pub enum VoiceError {
    /// Microphone or speaker could not be opened. Fatal during setup.
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The agent did not accept the session. Fatal during setup.
    #[error("Transport handshake failed: {0}")]
    TransportHandshakeFailed(String),

    /// A wire chunk could not be decoded. The chunk is dropped.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// The transport was lost mid-session.
    #[error("Transport dropped: {0}")]
    TransportDropped(String),

    /// Setup was cancelled by a stop request.
    #[error("Session setup cancelled")]
    Cancelled,

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session already active: {0}")]
    SessionExists(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// Stable reason code surfaced to the host layer instead of error text
    pub fn reason_code(&self) -> &'static str {
        match self {
            VoiceError::DeviceUnavailable(_) => "device_unavailable",
            VoiceError::TransportHandshakeFailed(_) => "handshake_failed",
            VoiceError::MalformedFrame(_) => "malformed_frame",
            VoiceError::TransportDropped(_) => "transport_dropped",
            VoiceError::Cancelled => "cancelled",
            VoiceError::SessionNotFound(_) => "session_not_found",
            VoiceError::SessionExists(_) => "session_exists",
            VoiceError::Config(_) => "config",
            VoiceError::Io(_) => "io",
        }
    }

    /// Whether the error ends the session
    pub fn is_fatal(&self) -> bool {
        !matches!(self, VoiceError::MalformedFrame(_))
    }
}

impl From<hound::Error> for VoiceError {
    fn from(err: hound::Error) -> Self {
        match err {
            hound::Error::IoError(e) => VoiceError::Io(e),
            other => VoiceError::DeviceUnavailable(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for VoiceError {
    fn from(err: serde_json::Error) -> Self {
        VoiceError::MalformedFrame(err.to_string())
    }
}

impl From<base64::DecodeError> for VoiceError {
    fn from(err: base64::DecodeError) -> Self {
        VoiceError::MalformedFrame(err.to_string())
    }
}

#[cfg(feature = "cpal")]
impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

#[cfg(feature = "cpal")]
impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

#[cfg(feature = "cpal")]
impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

#[cfg(feature = "cpal")]
impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}
