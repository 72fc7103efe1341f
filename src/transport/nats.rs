use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_nats::{Client, Subscriber};
use futures::stream::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::messages::{ControlMessage, InboundFrame, OutboundFrame, SessionAccepted, SessionSetup};
use super::{Connection, Connector, TransportEvent, TransportLink};
use crate::error::{VoiceError, VoiceResult};

/// NATS transport settings
#[derive(Debug, Clone)]
pub struct NatsTransportConfig {
    /// NATS server URL
    pub url: String,
    /// Prefix for all session subjects (e.g. "voice.session")
    pub subject_prefix: String,
    /// How long to wait for the agent to accept a session
    pub handshake_timeout: Duration,
    /// Capacity of the inbound event channel
    pub event_buffer: usize,
}

impl Default for NatsTransportConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            subject_prefix: "voice.session".to_string(),
            handshake_timeout: Duration::from_secs(5),
            event_buffer: 256,
        }
    }
}

/// Subject layout for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSubjects {
    pub open: String,
    pub audio_out: String,
    pub audio_in: String,
    pub control_in: String,
    pub control_out: String,
}

impl SessionSubjects {
    pub fn new(prefix: &str, session_id: &str) -> Self {
        Self {
            open: format!("{}.open", prefix),
            audio_out: format!("{}.{}.audio.out", prefix, session_id),
            audio_in: format!("{}.{}.audio.in", prefix, session_id),
            control_in: format!("{}.{}.control", prefix, session_id),
            control_out: format!("{}.{}.control.out", prefix, session_id),
        }
    }
}

/// Connects sessions to an agent service over NATS
pub struct NatsConnector {
    config: NatsTransportConfig,
}

impl NatsConnector {
    pub fn new(config: NatsTransportConfig) -> Self {
        Self { config }
    }

    async fn open_client(&self, events_tx: mpsc::Sender<TransportEvent>) -> VoiceResult<Client> {
        info!("Connecting to NATS at {}", self.config.url);

        let client = async_nats::ConnectOptions::new()
            .event_callback(move |event| {
                let events_tx = events_tx.clone();
                async move {
                    match event {
                        async_nats::Event::Disconnected => {
                            warn!("NATS connection lost");
                            if events_tx
                                .try_send(TransportEvent::Error("NATS disconnected".to_string()))
                                .is_err()
                            {
                                debug!("Transport event channel full or closed");
                            }
                        }
                        other => debug!("NATS event: {}", other),
                    }
                }
            })
            .connect(self.config.url.as_str())
            .await
            .map_err(|e| VoiceError::TransportHandshakeFailed(format!("NATS connect: {}", e)))?;

        info!("Connected to NATS successfully");
        Ok(client)
    }
}

#[async_trait::async_trait]
impl Connector for NatsConnector {
    async fn connect(&self, setup: SessionSetup) -> VoiceResult<Connection> {
        let subjects = SessionSubjects::new(&self.config.subject_prefix, &setup.session_id);
        let (events_tx, events_rx) = mpsc::channel(self.config.event_buffer.max(1));

        let client = self.open_client(events_tx.clone()).await?;

        // Subscribe before the handshake so no early audio is missed.
        let audio_sub = client
            .subscribe(subjects.audio_in.clone())
            .await
            .map_err(|e| VoiceError::TransportHandshakeFailed(format!("subscribe: {}", e)))?;
        let control_sub = client
            .subscribe(subjects.control_in.clone())
            .await
            .map_err(|e| VoiceError::TransportHandshakeFailed(format!("subscribe: {}", e)))?;

        let payload = serde_json::to_vec(&setup)
            .map_err(|e| VoiceError::TransportHandshakeFailed(e.to_string()))?;

        info!("Requesting session {} on {}", setup.session_id, subjects.open);
        let reply = tokio::time::timeout(
            self.config.handshake_timeout,
            client.request(subjects.open.clone(), payload.into()),
        )
        .await
        .map_err(|_| {
            VoiceError::TransportHandshakeFailed(format!(
                "no reply within {:?}",
                self.config.handshake_timeout
            ))
        })?
        .map_err(|e| VoiceError::TransportHandshakeFailed(e.to_string()))?;

        let accepted: SessionAccepted = serde_json::from_slice(&reply.payload)
            .map_err(|e| VoiceError::TransportHandshakeFailed(format!("bad reply: {}", e)))?;

        if !accepted.accepted {
            return Err(VoiceError::TransportHandshakeFailed(
                accepted.reason.unwrap_or_else(|| "rejected by agent".to_string()),
            ));
        }

        info!("Session {} accepted by agent", setup.session_id);

        let forwarder = tokio::spawn(forward_inbound(audio_sub, control_sub, events_tx));

        let link = NatsLink {
            client,
            subjects,
            closed: AtomicBool::new(false),
            forwarder: Mutex::new(Some(forwarder)),
        };

        Ok(Connection {
            link: Arc::new(link),
            events: events_rx,
        })
    }

    fn name(&self) -> &str {
        "nats"
    }
}

/// Merge the audio and control subscriptions into transport events
async fn forward_inbound(
    mut audio_sub: Subscriber,
    mut control_sub: Subscriber,
    events_tx: mpsc::Sender<TransportEvent>,
) {
    debug!("Inbound forwarder started");

    loop {
        let event = tokio::select! {
            msg = audio_sub.next() => match msg {
                Some(msg) => match serde_json::from_slice::<InboundFrame>(&msg.payload) {
                    Ok(frame) => TransportEvent::Audio(frame),
                    Err(e) => {
                        warn!("Failed to parse inbound audio message: {}", e);
                        continue;
                    }
                },
                None => TransportEvent::Error("audio subscription ended".to_string()),
            },
            msg = control_sub.next() => match msg {
                Some(msg) => match serde_json::from_slice::<ControlMessage>(&msg.payload) {
                    Ok(ControlMessage::Close { reason }) => TransportEvent::Closed(reason),
                    Ok(ControlMessage::Error { message }) => TransportEvent::Error(message),
                    Err(e) => {
                        warn!("Failed to parse control message: {}", e);
                        continue;
                    }
                },
                None => TransportEvent::Error("control subscription ended".to_string()),
            },
        };

        let terminal = !matches!(event, TransportEvent::Audio(_));
        if events_tx.send(event).await.is_err() || terminal {
            break;
        }
    }

    debug!("Inbound forwarder stopped");
}

struct NatsLink {
    client: Client,
    subjects: SessionSubjects,
    closed: AtomicBool,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait::async_trait]
impl TransportLink for NatsLink {
    async fn send(&self, frame: OutboundFrame) -> VoiceResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VoiceError::TransportDropped("link closed".to_string()));
        }

        let payload = serde_json::to_vec(&frame)
            .map_err(|e| VoiceError::TransportDropped(e.to_string()))?;

        self.client
            .publish(self.subjects.audio_out.clone(), payload.into())
            .await
            .map_err(|e| VoiceError::TransportDropped(format!("publish: {}", e)))?;

        Ok(())
    }

    async fn close(&self) -> VoiceResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Closing NATS session on {}", self.subjects.control_out);

        if let Some(forwarder) = self.forwarder.lock().ok().and_then(|mut f| f.take()) {
            forwarder.abort();
        }

        let message = ControlMessage::Close {
            reason: Some("hangup".to_string()),
        };
        let result = match serde_json::to_vec(&message) {
            Ok(payload) => self
                .client
                .publish(self.subjects.control_out.clone(), payload.into())
                .await
                .map_err(|e| VoiceError::TransportDropped(format!("publish close: {}", e))),
            Err(e) => Err(VoiceError::TransportDropped(e.to_string())),
        };

        if let Err(e) = self.client.flush().await {
            error!("Failed to flush NATS connection: {}", e);
        }

        result
    }
}
