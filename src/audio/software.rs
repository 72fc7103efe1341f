// Software-clocked playback device for headless runs.
//
// A render thread advances the playback timeline in step with the wall
// clock and optionally writes the rendered audio to a WAV file.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::backend::{PlaybackConfig, PlaybackDevice, ScheduledBuffer};
use super::timeline::PlaybackTimeline;
use crate::error::{VoiceError, VoiceResult};

const RENDER_INTERVAL: Duration = Duration::from_millis(10);

pub struct SoftwarePlayback {
    name: String,
    sample_rate: u32,
    timeline: Arc<Mutex<PlaybackTimeline>>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SoftwarePlayback {
    pub fn open(config: &PlaybackConfig, output: Option<PathBuf>) -> VoiceResult<Self> {
        let sample_rate = config.sample_rate;

        let writer = match &output {
            Some(path) => {
                let spec = hound::WavSpec {
                    channels: 1,
                    sample_rate,
                    bits_per_sample: 16,
                    sample_format: hound::SampleFormat::Int,
                };
                Some(hound::WavWriter::create(path, spec)?)
            }
            None => None,
        };

        let name = match &output {
            Some(path) => format!("wav:{}", path.display()),
            None => "null".to_string(),
        };

        let timeline = Arc::new(Mutex::new(PlaybackTimeline::new(sample_rate)));
        let running = Arc::new(AtomicBool::new(true));

        let worker = {
            let timeline = Arc::clone(&timeline);
            let running = Arc::clone(&running);
            std::thread::Builder::new()
                .name("software-playback".to_string())
                .spawn(move || render_loop(timeline, running, writer, sample_rate))?
        };

        info!("Software playback opened: {} ({}Hz)", name, sample_rate);

        Ok(Self {
            name,
            sample_rate,
            timeline,
            running,
            worker: Mutex::new(Some(worker)),
        })
    }

    fn timeline(&self) -> VoiceResult<std::sync::MutexGuard<'_, PlaybackTimeline>> {
        self.timeline
            .lock()
            .map_err(|_| VoiceError::DeviceUnavailable("playback timeline poisoned".to_string()))
    }
}

fn render_loop(
    timeline: Arc<Mutex<PlaybackTimeline>>,
    running: Arc<AtomicBool>,
    mut writer: Option<hound::WavWriter<BufWriter<File>>>,
    sample_rate: u32,
) {
    let started = Instant::now();
    let mut rendered: u64 = 0;
    let mut block = Vec::new();

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(RENDER_INTERVAL);

        let due = (started.elapsed().as_nanos() * sample_rate as u128 / 1_000_000_000) as u64;
        let frames = due.saturating_sub(rendered) as usize;
        if frames == 0 {
            continue;
        }

        block.resize(frames, 0.0);
        match timeline.lock() {
            Ok(mut timeline) => timeline.render(&mut block),
            Err(_) => break,
        }
        rendered += frames as u64;

        if let Some(w) = writer.as_mut() {
            for &sample in &block {
                if let Err(e) = w.write_sample(super::codec::float_to_pcm16(sample)) {
                    warn!("Failed to write playback sample: {}", e);
                    writer = None;
                    break;
                }
            }
        }
    }

    if let Some(w) = writer.take() {
        if let Err(e) = w.finalize() {
            warn!("Failed to finalize playback WAV: {}", e);
        }
    }

    debug!("Software playback rendered {} frames", rendered);
}

impl PlaybackDevice for SoftwarePlayback {
    fn name(&self) -> &str {
        &self.name
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn now(&self) -> Duration {
        self.timeline().map(|t| t.now()).unwrap_or_default()
    }

    fn schedule(&self, samples: Vec<f32>, at: Duration) -> VoiceResult<ScheduledBuffer> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(VoiceError::DeviceUnavailable(format!("{} is released", self.name)));
        }
        Ok(self.timeline()?.schedule(samples, at))
    }

    fn flush(&self) {
        if let Ok(mut timeline) = self.timeline.lock() {
            let dropped = timeline.flush();
            if dropped > 0 {
                debug!("Flushed {} pending playback buffers", dropped);
            }
        }
    }

    fn release(&self) -> VoiceResult<()> {
        self.running.store(false, Ordering::SeqCst);

        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            info!("Releasing software playback: {}", self.name);
            if worker.join().is_err() {
                warn!("Software playback thread panicked");
            }
        }
        Ok(())
    }
}

impl Drop for SoftwarePlayback {
    fn drop(&mut self) {
        let _ = self.release();
    }
}
