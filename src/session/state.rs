use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::VoiceError;

/// Lifecycle state of a voice session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Acquiring devices and waiting for the agent handshake
    Connecting,
    /// Capturing and streaming; no response audio pending
    Listening,
    /// Response audio is scheduled. Capture keeps running.
    Speaking,
    /// Terminal
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Listening)
                | (Listening, Speaking)
                | (Speaking, Listening)
                | (Connecting, Closed)
                | (Listening, Closed)
                | (Speaking, Closed)
        )
    }

    pub fn is_closed(self) -> bool {
        self == SessionState::Closed
    }

    /// Listening or Speaking
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Listening | SessionState::Speaking)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Listening => "listening",
            SessionState::Speaking => "speaking",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Local stop request
    Hangup,
    /// The agent closed the session
    RemoteClosed,
    DeviceUnavailable,
    HandshakeFailed,
    TransportDropped,
    /// Any other unrecoverable failure
    Failed,
}

impl CloseReason {
    /// Whether the close was caused by a failure rather than a hang-up
    pub fn is_error(self) -> bool {
        !matches!(self, CloseReason::Hangup | CloseReason::RemoteClosed)
    }

    /// Text shown to the user; never carries transport or codec detail
    pub fn user_message(self) -> &'static str {
        match self {
            CloseReason::Hangup => "call ended",
            CloseReason::RemoteClosed => "call ended by agent",
            _ => "connection lost",
        }
    }
}

impl From<&VoiceError> for CloseReason {
    fn from(err: &VoiceError) -> Self {
        match err {
            VoiceError::DeviceUnavailable(_) => CloseReason::DeviceUnavailable,
            VoiceError::TransportHandshakeFailed(_) => CloseReason::HandshakeFailed,
            VoiceError::TransportDropped(_) => CloseReason::TransportDropped,
            VoiceError::Cancelled => CloseReason::Hangup,
            _ => CloseReason::Failed,
        }
    }
}

/// Status change published to the host layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub session_id: String,
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<CloseReason>,
    pub at: DateTime<Utc>,
}

/// Owner of a session's state.
///
/// Every transition is validated and published while the state lock is
/// held, so readers and subscribers observe the same order.
pub struct StateMachine {
    session_id: String,
    state: Mutex<SessionState>,
    events: broadcast::Sender<StatusEvent>,
}

impl StateMachine {
    pub fn new(session_id: String, events: broadcast::Sender<StatusEvent>) -> Self {
        let machine = Self {
            session_id,
            state: Mutex::new(SessionState::Connecting),
            events,
        };
        machine.publish(SessionState::Connecting, None);
        machine
    }

    pub fn current(&self) -> SessionState {
        match self.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Move to `next` if the transition is allowed
    pub fn transition(&self, next: SessionState, reason: Option<CloseReason>) -> bool {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        if !state.can_transition_to(next) {
            debug!(
                "Session {}: ignoring transition {} -> {}",
                self.session_id, *state, next
            );
            return false;
        }

        info!(session_id = %self.session_id, from = %*state, to = %next, "session state changed");
        *state = next;
        self.publish(next, reason);
        true
    }

    /// Move to `next` only if the current state is `expected`
    pub fn transition_from(&self, expected: SessionState, next: SessionState) -> bool {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        if *state != expected || !expected.can_transition_to(next) {
            return false;
        }

        info!(session_id = %self.session_id, from = %expected, to = %next, "session state changed");
        *state = next;
        self.publish(next, None);
        true
    }

    fn publish(&self, state: SessionState, reason: Option<CloseReason>) {
        // No subscribers is fine.
        let _ = self.events.send(StatusEvent {
            session_id: self.session_id.clone(),
            state,
            reason,
            at: Utc::now(),
        });
    }
}
