//! Voice session management
//!
//! A session owns one microphone, one speaker and one agent connection:
//! - Outbound: captured frames are encoded and pumped to the transport
//! - Inbound: response chunks are decoded and scheduled gaplessly
//! - Lifecycle: Connecting → Listening ⇄ Speaking → Closed, with every
//!   resource released exactly once on close

mod config;
mod controller;
mod guard;
mod playback;
mod pump;
mod session;
mod state;
mod stats;

pub use config::{ConversationContext, SessionConfig};
pub use controller::{SessionController, SessionHandle};
pub use guard::Guarded;
pub use playback::{InboundPlaybackScheduler, PlaybackCursor, PlaybackStats, ScheduledSlot};
pub use pump::{OutboundFramePump, PumpStats};
pub use session::VoiceSession;
pub use state::{CloseReason, SessionState, StateMachine, StatusEvent};
pub use stats::SessionStats;
