use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use super::config::{ConversationContext, SessionConfig};
use super::session::VoiceSession;
use super::state::{CloseReason, SessionState, StatusEvent};
use super::stats::SessionStats;
use crate::audio::DeviceProvider;
use crate::error::{VoiceError, VoiceResult};
use crate::transport::Connector;

const STATUS_EVENT_CAPACITY: usize = 256;

/// Opaque reference to a session owned by a [`SessionController`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionHandle(String);

impl SessionHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Host-facing entry point: starts, stops and observes sessions
pub struct SessionController {
    config: SessionConfig,
    devices: Arc<dyn DeviceProvider>,
    connector: Arc<dyn Connector>,
    sessions: RwLock<HashMap<String, Arc<VoiceSession>>>,
    events: broadcast::Sender<StatusEvent>,
}

impl SessionController {
    pub fn new(
        config: SessionConfig,
        devices: Arc<dyn DeviceProvider>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (events, _) = broadcast::channel(STATUS_EVENT_CAPACITY);
        Self {
            config,
            devices,
            connector,
            sessions: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Status events for every session of this controller
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Start a session and wait until it is Listening.
    ///
    /// The session is registered before setup begins, so [`stop`] can
    /// cancel it while it is still Connecting.
    ///
    /// [`stop`]: SessionController::stop
    pub async fn start(&self, context: ConversationContext) -> VoiceResult<SessionHandle> {
        let id = context
            .session_id
            .clone()
            .unwrap_or_else(|| format!("call-{}", uuid::Uuid::new_v4()));

        let session = {
            let mut sessions = self.sessions.write().await;
            if let Some(existing) = sessions.get(&id) {
                if !existing.state().is_closed() {
                    return Err(VoiceError::SessionExists(id));
                }
            }
            let session = Arc::new(VoiceSession::new(
                id.clone(),
                context,
                self.config.clone(),
                self.events.clone(),
            ));
            sessions.insert(id.clone(), Arc::clone(&session));
            session
        };

        info!("Starting session {} via {}", id, self.connector.name());
        session
            .establish(self.devices.as_ref(), self.connector.as_ref())
            .await?;

        Ok(SessionHandle(id))
    }

    /// Stop a session. Stopping a session that is already closed is a no-op.
    pub async fn stop(&self, handle: &SessionHandle) -> VoiceResult<SessionStats> {
        let session = self.get(handle).await?;

        if session.state().is_closed() {
            info!("Session {} already closed", handle);
        } else {
            info!("Stopping session {}", handle);
        }
        session.close(CloseReason::Hangup).await;

        Ok(session.stats())
    }

    pub async fn current_state(&self, handle: &SessionHandle) -> VoiceResult<SessionState> {
        Ok(self.get(handle).await?.state())
    }

    pub async fn stats(&self, handle: &SessionHandle) -> VoiceResult<SessionStats> {
        Ok(self.get(handle).await?.stats())
    }

    pub async fn sessions(&self) -> Vec<SessionHandle> {
        self.sessions
            .read()
            .await
            .keys()
            .cloned()
            .map(SessionHandle)
            .collect()
    }

    /// Forget closed sessions, returning how many were removed
    pub async fn prune_closed(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| !session.state().is_closed());
        before - sessions.len()
    }

    /// Stop every live session
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<VoiceSession>> =
            self.sessions.read().await.values().cloned().collect();

        for session in sessions {
            if !session.state().is_closed() {
                warn!("Stopping session {} on shutdown", session.id());
            }
            session.close(CloseReason::Hangup).await;
        }
    }

    async fn get(&self, handle: &SessionHandle) -> VoiceResult<Arc<VoiceSession>> {
        self.sessions
            .read()
            .await
            .get(handle.id())
            .cloned()
            .ok_or_else(|| VoiceError::SessionNotFound(handle.id().to_string()))
    }
}
