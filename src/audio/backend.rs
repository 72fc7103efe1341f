use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{VoiceError, VoiceResult};

/// Captured audio block (mono f32 PCM, normalized to [-1.0, 1.0])
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Raw audio samples
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Capture order, starting at 0 for each capture stream
    pub sequence: u64,
    /// Timestamp in milliseconds since capture started
    pub timestamp_ms: u64,
}

impl AudioFrame {
    pub fn duration(&self) -> Duration {
        samples_to_duration(self.samples.len(), self.sample_rate)
    }
}

/// Exact playback duration of `samples` mono samples at `sample_rate`
pub fn samples_to_duration(samples: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos((samples as u64 * 1_000_000_000) / sample_rate as u64)
}

/// Configuration for microphone capture
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Rate frames are delivered at (resampled if the device differs)
    pub sample_rate: u32,
    /// Samples per frame
    pub frame_size: usize,
    /// Device name, `None` for the system default
    pub device: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000, // agent input rate
            frame_size: 4096,
            device: None,
        }
    }
}

/// Configuration for speaker playback
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Preferred output rate; devices may open at a different rate
    pub sample_rate: u32,
    /// Device name, `None` for the system default
    pub device: Option<String>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24000, // agent output rate
            device: None,
        }
    }
}

/// Receives frames on the capture thread. Must return without blocking.
pub type FrameSink = Box<dyn FnMut(AudioFrame) + Send + 'static>;

/// Microphone capture handle
///
/// `start` may be called once; the frame sequence it produces is infinite
/// and cannot be restarted. `release` closes the device and must tolerate
/// being called after `stop`.
pub trait CaptureDevice: Send {
    /// Start delivering frames to `sink`
    fn start(&mut self, sink: FrameSink) -> VoiceResult<()>;

    /// Stop delivering frames (unsubscribe from the input)
    fn stop(&mut self) -> VoiceResult<()>;

    /// Release the OS device
    fn release(&mut self) -> VoiceResult<()>;

    fn is_capturing(&self) -> bool;

    /// Get backend name for logging
    fn name(&self) -> &str;
}

/// A buffer accepted by a playback device
#[derive(Debug)]
pub struct ScheduledBuffer {
    /// Actual start on the device clock (never earlier than requested or than `now`)
    pub start: Duration,
    /// Playback duration at the device rate
    pub duration: Duration,
    /// Resolves when the buffer has fully played. Dropped without a value
    /// if the buffer is flushed before it finishes.
    pub finished: oneshot::Receiver<()>,
}

impl ScheduledBuffer {
    pub fn end(&self) -> Duration {
        self.start + self.duration
    }
}

/// Speaker output handle with a monotonic device clock
pub trait PlaybackDevice: Send + Sync {
    fn name(&self) -> &str;

    /// Rate buffers passed to `schedule` must already be at
    fn sample_rate(&self) -> u32;

    /// Current device clock time
    fn now(&self) -> Duration;

    /// Schedule `samples` to begin at or after `at`. Times in the past are
    /// clamped to "as soon as possible"; the actual start is returned.
    fn schedule(&self, samples: Vec<f32>, at: Duration) -> VoiceResult<ScheduledBuffer>;

    /// Drop every buffer that has not finished playing
    fn flush(&self);

    /// Release the OS device
    fn release(&self) -> VoiceResult<()>;
}

/// Opens the devices a session needs
pub trait DeviceProvider: Send + Sync {
    fn open_capture(&self, config: &CaptureConfig) -> VoiceResult<Box<dyn CaptureDevice>>;

    fn open_playback(&self, config: &PlaybackConfig) -> VoiceResult<Arc<dyn PlaybackDevice>>;
}

/// Where captured audio comes from
#[derive(Debug, Clone)]
pub enum AudioSource {
    /// Microphone input (cpal)
    Microphone,
    /// WAV file played as if it were a microphone (headless/testing)
    File(PathBuf),
}

/// Where response audio goes
#[derive(Debug, Clone)]
pub enum AudioSink {
    /// Speaker output (cpal)
    Speaker,
    /// Rendered in real time to a WAV file
    File(PathBuf),
    /// Rendered in real time and discarded
    Null,
}

/// Audio backend factory
///
/// Picks device implementations based on configured source and sink.
#[derive(Debug, Clone)]
pub struct AudioBackendFactory {
    source: AudioSource,
    sink: AudioSink,
}

impl AudioBackendFactory {
    pub fn new(source: AudioSource, sink: AudioSink) -> Self {
        Self { source, sink }
    }
}

impl DeviceProvider for AudioBackendFactory {
    fn open_capture(&self, config: &CaptureConfig) -> VoiceResult<Box<dyn CaptureDevice>> {
        match &self.source {
            AudioSource::Microphone => {
                #[cfg(feature = "cpal")]
                {
                    let capture = super::cpal_backend::CpalCapture::open(config)?;
                    Ok(Box::new(capture))
                }

                #[cfg(not(feature = "cpal"))]
                {
                    let _ = config;
                    Err(VoiceError::DeviceUnavailable(
                        "microphone capture requires the `cpal` feature".to_string(),
                    ))
                }
            }

            AudioSource::File(path) => {
                let capture = super::file::FileCapture::open(path, config)?;
                Ok(Box::new(capture))
            }
        }
    }

    fn open_playback(&self, config: &PlaybackConfig) -> VoiceResult<Arc<dyn PlaybackDevice>> {
        match &self.sink {
            AudioSink::Speaker => {
                #[cfg(feature = "cpal")]
                {
                    let playback = super::cpal_backend::CpalPlayback::open(config)?;
                    Ok(Arc::new(playback))
                }

                #[cfg(not(feature = "cpal"))]
                {
                    let _ = config;
                    Err(VoiceError::DeviceUnavailable(
                        "speaker playback requires the `cpal` feature".to_string(),
                    ))
                }
            }

            AudioSink::File(path) => {
                let playback = super::software::SoftwarePlayback::open(config, Some(path.clone()))?;
                Ok(Arc::new(playback))
            }

            AudioSink::Null => {
                let playback = super::software::SoftwarePlayback::open(config, None)?;
                Ok(Arc::new(playback))
            }
        }
    }
}

/// Accumulates incoming mono samples into fixed-size frames.
///
/// Frames are numbered in capture order and timestamped from the number of
/// samples delivered so far.
pub struct FrameAssembler {
    buffer: Vec<f32>,
    frame_size: usize,
    sample_rate: u32,
    next_sequence: u64,
    samples_emitted: u64,
}

impl FrameAssembler {
    pub fn new(frame_size: usize, sample_rate: u32) -> Self {
        Self {
            buffer: Vec::with_capacity(frame_size * 2),
            frame_size: frame_size.max(1),
            sample_rate,
            next_sequence: 0,
            samples_emitted: 0,
        }
    }

    /// Push samples, calling `on_frame` for each completed frame
    pub fn push(&mut self, samples: &[f32], mut on_frame: impl FnMut(AudioFrame)) {
        self.buffer.extend_from_slice(samples);

        while self.buffer.len() >= self.frame_size {
            let samples: Vec<f32> = self.buffer.drain(..self.frame_size).collect();
            let timestamp_ms = if self.sample_rate == 0 {
                0
            } else {
                self.samples_emitted * 1000 / self.sample_rate as u64
            };

            let frame = AudioFrame {
                samples,
                sample_rate: self.sample_rate,
                sequence: self.next_sequence,
                timestamp_ms,
            };

            self.next_sequence += 1;
            self.samples_emitted += self.frame_size as u64;
            on_frame(frame);
        }
    }

    /// Number of frames emitted so far
    pub fn frames_emitted(&self) -> u64 {
        self.next_sequence
    }
}
