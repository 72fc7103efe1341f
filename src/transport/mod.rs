//! Transport boundary to the external conversational agent.
//!
//! The engine treats the agent as an ordered duplex channel of audio
//! frames. A [`Connector`] performs the handshake and yields a
//! [`Connection`]: a [`TransportLink`] for sending plus a channel of
//! [`TransportEvent`]s standing in for the message/close/error callbacks.

pub mod memory;
pub mod messages;
pub mod nats;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::VoiceResult;

pub use memory::{AgentEndpoint, AgentSession, MemoryConnector, MemoryTransportConfig};
pub use messages::{ControlMessage, InboundFrame, OutboundFrame, SessionAccepted, SessionSetup};
pub use nats::{NatsConnector, NatsTransportConfig};

/// Event delivered by an open transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Audio to play
    Audio(InboundFrame),
    /// Remote side closed the session
    Closed(Option<String>),
    /// Connection failure; ends the session
    Error(String),
}

/// Sending half of an open session
#[async_trait::async_trait]
pub trait TransportLink: Send + Sync {
    /// Send one frame. Frames are delivered in call order.
    async fn send(&self, frame: OutboundFrame) -> VoiceResult<()>;

    /// Close the session; calling it again is a no-op
    async fn close(&self) -> VoiceResult<()>;
}

/// An open session with the agent
pub struct Connection {
    pub link: Arc<dyn TransportLink>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Opens sessions with the agent
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Perform the handshake. Returns once the session is open.
    async fn connect(&self, setup: SessionSetup) -> VoiceResult<Connection>;

    /// Get connector name for logging
    fn name(&self) -> &str;
}
