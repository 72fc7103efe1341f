pub mod backend;
pub mod codec;
pub mod file;
pub mod software;
pub mod timeline;

#[cfg(feature = "cpal")]
pub mod cpal_backend;

pub use backend::{
    samples_to_duration, AudioBackendFactory, AudioFrame, AudioSink, AudioSource, CaptureConfig,
    CaptureDevice, DeviceProvider, FrameAssembler, FrameSink, PlaybackConfig, PlaybackDevice,
    ScheduledBuffer,
};
pub use codec::{StreamResampler, WireChunk};
pub use file::{AudioFile, FileCapture};
pub use software::SoftwarePlayback;
pub use timeline::PlaybackTimeline;
