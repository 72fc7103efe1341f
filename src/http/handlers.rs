use super::state::AppState;
use crate::error::VoiceError;
use crate::session::{
    CloseReason, ConversationContext, SessionHandle, SessionState, SessionStats, StatusEvent,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, info, warn};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct StartSessionRequest {
    /// Optional session ID (if not provided, generate UUID)
    pub session_id: Option<String>,

    /// Persona instruction; the configured default when omitted
    pub persona: Option<String>,

    /// Voice name; the configured default when omitted
    pub voice: Option<String>,

    /// Content the conversation is about
    pub excerpt: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartSessionResponse {
    pub session_id: String,
    pub state: SessionState,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable reason code
    pub error: String,
    /// Text safe to show the user
    pub message: String,
}

/// Status event as delivered to HTTP clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPayload {
    pub session_id: String,
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<CloseReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusPayload {
    fn new(session_id: String, state: SessionState, reason: Option<CloseReason>) -> Self {
        Self {
            session_id,
            state,
            reason,
            message: reason.map(|r| r.user_message().to_string()),
        }
    }
}

impl From<StatusEvent> for StatusPayload {
    fn from(event: StatusEvent) -> Self {
        Self::new(event.session_id, event.state, event.reason)
    }
}

fn error_response(err: &VoiceError) -> Response {
    let status = match err {
        VoiceError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        VoiceError::SessionExists(_) | VoiceError::Cancelled => StatusCode::CONFLICT,
        VoiceError::DeviceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        VoiceError::TransportHandshakeFailed(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let message = match err {
        VoiceError::SessionNotFound(id) => format!("Session {} not found", id),
        VoiceError::SessionExists(id) => format!("Session {} already exists", id),
        other => CloseReason::from(other).user_message().to_string(),
    };

    (
        status,
        Json(ErrorResponse {
            error: err.reason_code().to_string(),
            message,
        }),
    )
        .into_response()
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /sessions
/// Start a new voice session; returns once it is listening
pub async fn start_session(
    State(state): State<AppState>,
    Json(req): Json<StartSessionRequest>,
) -> impl IntoResponse {
    let context = state.agent.apply_defaults(ConversationContext {
        session_id: req.session_id,
        persona: req.persona.unwrap_or_default(),
        voice: req.voice.unwrap_or_default(),
        excerpt: req.excerpt,
    });

    match state.controller.start(context).await {
        Ok(handle) => {
            info!("Session started: {}", handle);
            let session_state = state
                .controller
                .current_state(&handle)
                .await
                .unwrap_or(SessionState::Listening);
            (
                StatusCode::OK,
                Json(StartSessionResponse {
                    session_id: handle.id().to_string(),
                    state: session_state,
                }),
            )
                .into_response()
        }
        Err(e) => {
            error!("Failed to start session: {}", e);
            error_response(&e)
        }
    }
}

/// POST /sessions/:session_id/stop
/// Hang up; stopping a closed session succeeds
pub async fn stop_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let handle = SessionHandle::new(session_id);

    match state.controller.stop(&handle).await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => {
            warn!("Failed to stop session {}: {}", handle, e);
            error_response(&e)
        }
    }
}

/// GET /sessions/:session_id/status
pub async fn get_session_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let handle = SessionHandle::new(session_id);

    match state.controller.stats(&handle).await {
        Ok(stats) => (StatusCode::OK, Json::<SessionStats>(stats)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /sessions/:session_id/events
/// Server-sent events: the current state, then every change until Closed
pub async fn session_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let handle = SessionHandle::new(session_id.clone());

    // Subscribe first so no transition between the snapshot and the stream is lost.
    let events = state.controller.subscribe();
    let stats = match state.controller.stats(&handle).await {
        Ok(stats) => stats,
        Err(e) => return error_response(&e),
    };

    let snapshot = StatusPayload::new(session_id.clone(), stats.state, stats.close_reason);
    let live: BoxStream<'static, StatusPayload> = if stats.state.is_closed() {
        stream::empty().boxed()
    } else {
        status_stream(events, session_id).boxed()
    };

    let stream = stream::once(async move { snapshot })
        .chain(live)
        .map(|payload| Event::default().event("status").json_data(payload));

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Events for one session, ending after it closes
fn status_stream(
    events: broadcast::Receiver<StatusEvent>,
    session_id: String,
) -> impl futures::Stream<Item = StatusPayload> + Send + 'static {
    stream::unfold(
        (events, session_id, false),
        |(mut events, session_id, finished)| async move {
            if finished {
                return None;
            }
            loop {
                match events.recv().await {
                    Ok(event) if event.session_id == session_id => {
                        let closed = event.state.is_closed();
                        return Some((StatusPayload::from(event), (events, session_id, closed)));
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Status stream for {} lagged by {} events", session_id, skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        },
    )
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
