//! In-process transport.
//!
//! The connector hands each accepted session to an [`AgentEndpoint`], which
//! plays the role of the remote agent: it sees every outbound frame and
//! can push audio, close the session, or drop the connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use super::messages::{InboundFrame, OutboundFrame, SessionSetup};
use super::{Connection, Connector, TransportEvent, TransportLink};
use crate::error::{VoiceError, VoiceResult};

/// Behaviour knobs for the in-process transport
#[derive(Debug, Clone, Default)]
pub struct MemoryTransportConfig {
    /// Delay before the handshake completes
    pub open_delay: Duration,
    /// Reject every handshake with this reason
    pub reject: Option<String>,
    /// Delay applied to every send
    pub send_latency: Duration,
}

/// Agent side of one in-process session
pub struct AgentSession {
    pub setup: SessionSetup,
    /// Frames sent by the engine, in send order
    pub outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    events: mpsc::Sender<TransportEvent>,
    closed_by_engine: Arc<AtomicBool>,
}

impl AgentSession {
    /// Deliver a response chunk to the engine
    pub async fn send_audio(&self, frame: InboundFrame) -> VoiceResult<()> {
        self.events
            .send(TransportEvent::Audio(frame))
            .await
            .map_err(|_| VoiceError::TransportDropped("engine side closed".to_string()))
    }

    /// Close the session from the agent side
    pub async fn close(&self, reason: Option<String>) -> VoiceResult<()> {
        self.events
            .send(TransportEvent::Closed(reason))
            .await
            .map_err(|_| VoiceError::TransportDropped("engine side closed".to_string()))
    }

    /// Simulate a network failure
    pub async fn drop_connection(&self, message: &str) -> VoiceResult<()> {
        self.events
            .send(TransportEvent::Error(message.to_string()))
            .await
            .map_err(|_| VoiceError::TransportDropped("engine side closed".to_string()))
    }

    /// Whether the engine has closed its link
    pub fn is_closed_by_engine(&self) -> bool {
        self.closed_by_engine.load(Ordering::SeqCst)
    }
}

/// Receives sessions accepted by a [`MemoryConnector`]
pub struct AgentEndpoint {
    sessions: mpsc::UnboundedReceiver<AgentSession>,
}

impl AgentEndpoint {
    /// Wait for the next accepted session
    pub async fn accept(&mut self) -> Option<AgentSession> {
        self.sessions.recv().await
    }
}

pub struct MemoryConnector {
    config: MemoryTransportConfig,
    sessions: mpsc::UnboundedSender<AgentSession>,
}

impl MemoryConnector {
    pub fn new(config: MemoryTransportConfig) -> (Self, AgentEndpoint) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                sessions: tx,
            },
            AgentEndpoint { sessions: rx },
        )
    }
}

#[async_trait::async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, setup: SessionSetup) -> VoiceResult<Connection> {
        if !self.config.open_delay.is_zero() {
            tokio::time::sleep(self.config.open_delay).await;
        }

        if let Some(reason) = &self.config.reject {
            return Err(VoiceError::TransportHandshakeFailed(reason.clone()));
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(256);
        let closed = Arc::new(AtomicBool::new(false));

        let agent = AgentSession {
            setup: setup.clone(),
            outbound: outbound_rx,
            events: events_tx,
            closed_by_engine: Arc::clone(&closed),
        };

        self.sessions
            .send(agent)
            .map_err(|_| VoiceError::TransportHandshakeFailed("agent endpoint gone".to_string()))?;

        info!("In-process session {} open", setup.session_id);

        let link = MemoryLink {
            outbound: Mutex::new(Some(outbound_tx)),
            send_latency: self.config.send_latency,
            closed,
        };

        Ok(Connection {
            link: Arc::new(link),
            events: events_rx,
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}

struct MemoryLink {
    outbound: Mutex<Option<mpsc::UnboundedSender<OutboundFrame>>>,
    send_latency: Duration,
    closed: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl TransportLink for MemoryLink {
    async fn send(&self, frame: OutboundFrame) -> VoiceResult<()> {
        if !self.send_latency.is_zero() {
            tokio::time::sleep(self.send_latency).await;
        }

        let outbound = self.outbound.lock().await;
        match outbound.as_ref() {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| VoiceError::TransportDropped("agent went away".to_string())),
            None => Err(VoiceError::TransportDropped("link closed".to_string())),
        }
    }

    async fn close(&self) -> VoiceResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.outbound.lock().await.take();
        debug!("In-process link closed");
        Ok(())
    }
}
