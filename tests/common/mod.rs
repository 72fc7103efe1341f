// Shared test devices
//
// The mock playback device uses the Tokio clock, so tests running with
// `start_paused = true` see a deterministic device clock.

#![allow(dead_code)]

use base64::Engine;
use loqa_duplex::audio::{
    samples_to_duration, AudioFrame, CaptureConfig, CaptureDevice, DeviceProvider, FrameSink,
    PlaybackConfig, PlaybackDevice, ScheduledBuffer,
};
use loqa_duplex::error::{VoiceError, VoiceResult};
use loqa_duplex::transport::InboundFrame;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct DeviceCounters {
    pub capture_opened: AtomicUsize,
    pub capture_started: AtomicUsize,
    pub capture_stopped: AtomicUsize,
    pub capture_released: AtomicUsize,
    pub playback_opened: AtomicUsize,
    pub playback_flushed: AtomicUsize,
    pub playback_released: AtomicUsize,
    pub scheduled_after_release: AtomicUsize,
}

impl DeviceCounters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

type SharedSink = Arc<Mutex<Option<FrameSink>>>;

pub struct MockCapture {
    sink: SharedSink,
    counters: Arc<DeviceCounters>,
    fail_release: bool,
    release_delay: Duration,
}

impl CaptureDevice for MockCapture {
    fn start(&mut self, sink: FrameSink) -> VoiceResult<()> {
        self.counters.capture_started.fetch_add(1, Ordering::SeqCst);
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn stop(&mut self) -> VoiceResult<()> {
        self.counters.capture_stopped.fetch_add(1, Ordering::SeqCst);
        self.sink.lock().unwrap().take();
        Ok(())
    }

    fn release(&mut self) -> VoiceResult<()> {
        self.counters.capture_released.fetch_add(1, Ordering::SeqCst);
        self.sink.lock().unwrap().take();
        if !self.release_delay.is_zero() {
            // Stands in for joining a device thread.
            std::thread::sleep(self.release_delay);
        }
        if self.fail_release {
            return Err(VoiceError::DeviceUnavailable("microphone close failed".to_string()));
        }
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.sink.lock().unwrap().is_some()
    }

    fn name(&self) -> &str {
        "mock-microphone"
    }
}

pub struct MockPlayback {
    origin: Instant,
    sample_rate: u32,
    scheduled: Mutex<Vec<(Duration, Duration)>>,
    pending: Mutex<Vec<JoinHandle<()>>>,
    released: AtomicBool,
    counters: Arc<DeviceCounters>,
}

impl MockPlayback {
    pub fn new(sample_rate: u32, counters: Arc<DeviceCounters>) -> Self {
        Self {
            origin: Instant::now(),
            sample_rate,
            scheduled: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            released: AtomicBool::new(false),
            counters,
        }
    }

    /// `(start, duration)` of every buffer, in scheduling order
    pub fn scheduled(&self) -> Vec<(Duration, Duration)> {
        self.scheduled.lock().unwrap().clone()
    }
}

impl PlaybackDevice for MockPlayback {
    fn name(&self) -> &str {
        "mock-speaker"
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn schedule(&self, samples: Vec<f32>, at: Duration) -> VoiceResult<ScheduledBuffer> {
        if self.released.load(Ordering::SeqCst) {
            self.counters.scheduled_after_release.fetch_add(1, Ordering::SeqCst);
            return Err(VoiceError::DeviceUnavailable("speaker released".to_string()));
        }
        let start = at.max(self.now());
        let duration = samples_to_duration(samples.len(), self.sample_rate);
        let (tx, rx) = oneshot::channel();

        let deadline = self.origin + start + duration;
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = tx.send(());
        });

        self.pending.lock().unwrap().push(task);
        self.scheduled.lock().unwrap().push((start, duration));

        Ok(ScheduledBuffer {
            start,
            duration,
            finished: rx,
        })
    }

    fn flush(&self) {
        self.counters.playback_flushed.fetch_add(1, Ordering::SeqCst);
        for task in self.pending.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    fn release(&self) -> VoiceResult<()> {
        self.counters.playback_released.fetch_add(1, Ordering::SeqCst);
        self.released.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Device provider handing out mock devices
pub struct MockDevices {
    pub counters: Arc<DeviceCounters>,
    pub fail_capture: bool,
    pub fail_playback: bool,
    pub fail_capture_release: bool,
    pub capture_release_delay: Duration,
    sink: SharedSink,
    playback: Mutex<Option<Arc<MockPlayback>>>,
}

impl MockDevices {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(DeviceCounters::default()),
            fail_capture: false,
            fail_playback: false,
            fail_capture_release: false,
            capture_release_delay: Duration::ZERO,
            sink: Arc::new(Mutex::new(None)),
            playback: Mutex::new(None),
        }
    }

    /// Deliver a frame as the capture callback would. Returns false if
    /// capture is not running.
    pub fn emit(&self, frame: AudioFrame) -> bool {
        match self.sink.lock().unwrap().as_mut() {
            Some(sink) => {
                sink(frame);
                true
            }
            None => false,
        }
    }

    /// The most recently opened playback device
    pub fn playback(&self) -> Arc<MockPlayback> {
        self.playback.lock().unwrap().clone().expect("playback not opened")
    }
}

impl DeviceProvider for MockDevices {
    fn open_capture(&self, _config: &CaptureConfig) -> VoiceResult<Box<dyn CaptureDevice>> {
        if self.fail_capture {
            return Err(VoiceError::DeviceUnavailable("microphone permission denied".to_string()));
        }
        self.counters.capture_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockCapture {
            sink: Arc::clone(&self.sink),
            counters: Arc::clone(&self.counters),
            fail_release: self.fail_capture_release,
            release_delay: self.capture_release_delay,
        }))
    }

    fn open_playback(&self, config: &PlaybackConfig) -> VoiceResult<Arc<dyn PlaybackDevice>> {
        if self.fail_playback {
            return Err(VoiceError::DeviceUnavailable("no output device".to_string()));
        }
        self.counters.playback_opened.fetch_add(1, Ordering::SeqCst);
        let playback = Arc::new(MockPlayback::new(config.sample_rate, Arc::clone(&self.counters)));
        *self.playback.lock().unwrap() = Some(Arc::clone(&playback));
        Ok(playback)
    }
}

/// Mono frame with every sample set to `value`
pub fn frame(sequence: u64, value: f32, len: usize) -> AudioFrame {
    AudioFrame {
        samples: vec![value; len],
        sample_rate: 16000,
        sequence,
        timestamp_ms: sequence * 1000 * len as u64 / 16000,
    }
}

/// Base64 PCM of `duration` of a constant tone at `rate`
pub fn pcm_base64(duration: Duration, rate: u32, value: i16) -> String {
    let samples = (duration.as_nanos() * rate as u128 / 1_000_000_000) as usize;
    let bytes: Vec<u8> = std::iter::repeat(value.to_le_bytes())
        .take(samples)
        .flatten()
        .collect();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Response chunk of `duration` at 24kHz
pub fn response_chunk(duration: Duration) -> InboundFrame {
    InboundFrame {
        inline_audio_base64: pcm_base64(duration, 24000, 1000),
        sample_rate: Some(24000),
    }
}
