use anyhow::{Context, Result};
use hound::WavReader;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::backend::{samples_to_duration, CaptureConfig, CaptureDevice, FrameAssembler, FrameSink};
use super::codec::{downmix_to_mono, pcm16_to_float, resample_linear};
use crate::error::{VoiceError, VoiceResult};

pub struct AudioFile {
    pub path: String,
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<i16>,
}

impl AudioFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening audio file: {}", path.display());

        let reader = WavReader::open(path)
            .context("Failed to open WAV file")?;

        let spec = reader.spec();
        if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
            anyhow::bail!(
                "Unsupported WAV format: {}-bit {:?} (expected 16-bit PCM)",
                spec.bits_per_sample,
                spec.sample_format
            );
        }

        let samples: Vec<i16> = reader
            .into_samples::<i16>()
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read audio samples")?;

        let duration_seconds = samples.len() as f64 /
            (spec.sample_rate as f64 * spec.channels as f64);

        info!(
            "Audio file loaded: {:.1}s, {}Hz, {} channels, {} samples",
            duration_seconds,
            spec.sample_rate,
            spec.channels,
            samples.len()
        );

        Ok(Self {
            path: path.display().to_string(),
            duration_seconds,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
            samples,
        })
    }

    /// Convert to normalized mono samples at `target_rate`
    pub fn to_mono(&self, target_rate: u32) -> Vec<f32> {
        let floats: Vec<f32> = self.samples.iter().map(|&s| pcm16_to_float(s)).collect();
        let mono = downmix_to_mono(&floats, self.channels);
        resample_linear(&mono, self.sample_rate, target_rate)
    }
}

/// Capture device that replays a WAV file at real-time cadence.
///
/// After the file is exhausted it keeps producing silent frames, so the
/// frame sequence behaves like a live microphone.
pub struct FileCapture {
    name: String,
    samples: Option<Vec<f32>>,
    config: CaptureConfig,
    running: Arc<AtomicBool>,
    /// Dropping this wakes the worker out of its frame wait
    stop_tx: Option<mpsc::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl FileCapture {
    pub fn open(path: impl AsRef<Path>, config: &CaptureConfig) -> VoiceResult<Self> {
        let path = path.as_ref();
        let audio = AudioFile::open(path)
            .map_err(|e| VoiceError::DeviceUnavailable(format!("{:#}", e)))?;

        Ok(Self {
            name: format!("file:{}", path.display()),
            samples: Some(audio.to_mono(config.sample_rate)),
            config: config.clone(),
            running: Arc::new(AtomicBool::new(false)),
            stop_tx: None,
            worker: None,
        })
    }
}

impl CaptureDevice for FileCapture {
    fn start(&mut self, mut sink: FrameSink) -> VoiceResult<()> {
        let samples = self.samples.take().ok_or_else(|| {
            VoiceError::DeviceUnavailable("file capture cannot be restarted".to_string())
        })?;

        let frame_size = self.config.frame_size.max(1);
        let frame_duration = samples_to_duration(frame_size, self.config.sample_rate);
        let mut assembler = FrameAssembler::new(frame_size, self.config.sample_rate);
        let running = Arc::clone(&self.running);
        running.store(true, Ordering::SeqCst);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        info!(
            "Starting file capture: {} ({} frames of {} samples)",
            self.name,
            samples.len() / frame_size,
            frame_size
        );

        let worker = std::thread::Builder::new()
            .name("file-capture".to_string())
            .spawn(move || {
                let silence = vec![0.0f32; frame_size];
                let mut blocks = samples.chunks(frame_size);
                let mut deadline = Instant::now();

                while running.load(Ordering::SeqCst) {
                    let block = blocks.next().unwrap_or(&silence);
                    assembler.push(block, &mut sink);

                    deadline += frame_duration;
                    let now = Instant::now();
                    if now > deadline + frame_duration {
                        debug!("File capture fell behind by {:?}", now - deadline);
                    }
                    match stop_rx.recv_timeout(deadline.saturating_duration_since(now)) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }

                debug!("File capture thread exiting after {} frames", assembler.frames_emitted());
            })?;

        self.stop_tx = Some(stop_tx);
        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) -> VoiceResult<()> {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Stopping file capture: {}", self.name);
        }
        self.stop_tx.take();
        Ok(())
    }

    fn release(&mut self) -> VoiceResult<()> {
        self.running.store(false, Ordering::SeqCst);
        self.stop_tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("File capture thread panicked");
            }
        }
        self.samples = None;
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
