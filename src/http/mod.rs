//! HTTP API for the host application
//!
//! - POST /sessions - Start a voice session
//! - POST /sessions/:id/stop - Hang up
//! - GET /sessions/:id/status - Query state and statistics
//! - GET /sessions/:id/events - Server-sent status events
//! - GET /health - Health check

mod handlers;
mod routes;
mod state;

pub use handlers::{ErrorResponse, StartSessionRequest, StartSessionResponse, StatusPayload};
pub use routes::create_router;
pub use state::AppState;
