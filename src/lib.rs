pub mod audio;
pub mod config;
pub mod error;
pub mod http;
pub mod session;
pub mod transport;

pub use audio::{
    AudioBackendFactory, AudioFile, AudioFrame, AudioSink, AudioSource, CaptureDevice,
    DeviceProvider, PlaybackDevice, WireChunk,
};
pub use config::Config;
pub use error::{VoiceError, VoiceResult};
pub use http::{create_router, AppState};
pub use session::{
    CloseReason, ConversationContext, SessionConfig, SessionController, SessionHandle,
    SessionState, SessionStats, StatusEvent,
};
pub use transport::{Connector, MemoryConnector, NatsConnector, TransportLink};
