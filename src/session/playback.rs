//! Gapless scheduling of response audio.
//!
//! Chunks are placed back to back on the device clock. The cursor holds
//! the end time of the last scheduled buffer; each new buffer starts at
//! `max(now, cursor)`, so consecutive buffers neither overlap nor leave a
//! gap unless the stream underran.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::audio::{codec, PlaybackDevice, StreamResampler, WireChunk};
use crate::error::{VoiceError, VoiceResult};
use crate::transport::InboundFrame;

/// Next start time on the device clock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackCursor {
    next_start: Duration,
}

impl PlaybackCursor {
    pub fn next_start_time(&self) -> Duration {
        self.next_start
    }

    /// Where a buffer scheduled now should begin
    pub fn start_for(&self, now: Duration) -> Duration {
        now.max(self.next_start)
    }

    /// Record a buffer placed at `start`. The cursor never moves backwards.
    pub fn advance(&mut self, start: Duration, duration: Duration) {
        self.next_start = self.next_start.max(start + duration);
    }
}

/// Shared playback counters, readable while the scheduler runs
#[derive(Debug, Default)]
pub struct PlaybackStats {
    scheduled: AtomicU64,
    malformed: AtomicU64,
    scheduled_nanos: AtomicU64,
}

impl PlaybackStats {
    pub fn chunks_scheduled(&self) -> u64 {
        self.scheduled.load(Ordering::Relaxed)
    }

    pub fn chunks_malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub fn scheduled_audio(&self) -> Duration {
        Duration::from_nanos(self.scheduled_nanos.load(Ordering::Relaxed))
    }
}

/// A response chunk placed on the device timeline
#[derive(Debug)]
pub struct ScheduledSlot {
    pub start: Duration,
    pub duration: Duration,
    pub finished: oneshot::Receiver<()>,
}

pub struct InboundPlaybackScheduler {
    device: Arc<dyn PlaybackDevice>,
    cursor: PlaybackCursor,
    default_rate: u32,
    max_lookahead: Duration,
    resampler: Option<StreamResampler>,
    stats: Arc<PlaybackStats>,
}

impl InboundPlaybackScheduler {
    /// `default_rate` applies to chunks that do not carry their own rate
    pub fn new(
        device: Arc<dyn PlaybackDevice>,
        default_rate: u32,
        max_lookahead: Duration,
        stats: Arc<PlaybackStats>,
    ) -> Self {
        Self {
            device,
            cursor: PlaybackCursor::default(),
            default_rate,
            max_lookahead,
            resampler: None,
            stats,
        }
    }

    pub fn cursor(&self) -> PlaybackCursor {
        self.cursor
    }

    pub fn chunk_from_frame(&self, frame: InboundFrame) -> WireChunk {
        WireChunk {
            payload: frame.inline_audio_base64,
            sample_rate: frame.sample_rate.unwrap_or(self.default_rate),
            channels: 1,
            sequence: 0,
        }
    }

    /// Decode a chunk and queue it after everything already scheduled.
    ///
    /// Returns `Ok(None)` for a chunk with no samples. A chunk that fails
    /// to decode yields `MalformedFrame` and leaves the cursor untouched.
    /// While the cursor is more than the look-ahead ahead of the device
    /// clock this waits for playback to catch up.
    pub async fn schedule(&mut self, chunk: WireChunk) -> VoiceResult<Option<ScheduledSlot>> {
        let decoded = match codec::decode(&chunk) {
            Ok(samples) => samples,
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                warn!("Skipping malformed response chunk: {}", e);
                return Err(e);
            }
        };

        let samples = self.to_device_rate(&decoded, chunk.sample_rate);
        if samples.is_empty() {
            return Ok(None);
        }

        loop {
            let now = self.device.now();
            let start = self.cursor.start_for(now);
            let horizon = now + self.max_lookahead;
            if start <= horizon {
                break;
            }
            let wait = start - horizon;
            debug!("Playback {:?} ahead of the device clock, waiting {:?}", start - now, wait);
            tokio::time::sleep(wait).await;
        }

        let start = self.cursor.start_for(self.device.now());
        let buffer = self.device.schedule(samples, start)?;

        if buffer.start < self.cursor.next_start_time() {
            return Err(VoiceError::DeviceUnavailable(format!(
                "{} placed a buffer at {:?}, before the cursor at {:?}",
                self.device.name(),
                buffer.start,
                self.cursor.next_start_time()
            )));
        }

        self.cursor.advance(buffer.start, buffer.duration);
        self.stats.scheduled.fetch_add(1, Ordering::Relaxed);
        self.stats
            .scheduled_nanos
            .fetch_add(buffer.duration.as_nanos() as u64, Ordering::Relaxed);

        Ok(Some(ScheduledSlot {
            start: buffer.start,
            duration: buffer.duration,
            finished: buffer.finished,
        }))
    }

    /// True once the device clock has passed the end of everything scheduled
    pub fn is_drained(&self) -> bool {
        self.device.now() >= self.cursor.next_start_time()
    }

    fn to_device_rate(&mut self, samples: &[f32], rate: u32) -> Vec<f32> {
        let target = self.device.sample_rate();
        if rate == target || rate == 0 {
            return samples.to_vec();
        }

        // Keep resampler state across chunks of one stream so there is no
        // discontinuity at chunk boundaries.
        if self.resampler.as_ref().map(|r| r.rates()) != Some((rate, target)) {
            self.resampler = Some(StreamResampler::new(rate, target));
        }

        let mut out = Vec::with_capacity(samples.len() * target as usize / rate as usize + 1);
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.process(samples, &mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioFrame, PlaybackTimeline, ScheduledBuffer};
    use std::sync::Mutex;

    struct TimelineDevice(Mutex<PlaybackTimeline>);

    impl PlaybackDevice for TimelineDevice {
        fn name(&self) -> &str {
            "timeline"
        }

        fn sample_rate(&self) -> u32 {
            24000
        }

        fn now(&self) -> Duration {
            self.0.lock().unwrap().now()
        }

        fn schedule(&self, samples: Vec<f32>, at: Duration) -> VoiceResult<ScheduledBuffer> {
            Ok(self.0.lock().unwrap().schedule(samples, at))
        }

        fn flush(&self) {
            self.0.lock().unwrap().flush();
        }

        fn release(&self) -> VoiceResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_cursor_starts_at_now_when_idle() {
        let cursor = PlaybackCursor::default();
        assert_eq!(cursor.start_for(Duration::from_millis(300)), Duration::from_millis(300));
    }

    #[test]
    fn test_cursor_never_moves_backwards() {
        let mut cursor = PlaybackCursor::default();
        cursor.advance(Duration::from_millis(100), Duration::from_millis(500));
        cursor.advance(Duration::ZERO, Duration::from_millis(100));
        assert_eq!(cursor.next_start_time(), Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_uneven_chunks_chain_on_the_device_timeline() {
        let device = Arc::new(TimelineDevice(Mutex::new(PlaybackTimeline::new(24000))));
        let mut scheduler = InboundPlaybackScheduler::new(
            device,
            24000,
            Duration::from_secs(60),
            Arc::new(PlaybackStats::default()),
        );

        let mut previous_end = None;
        for sequence in 0..10 {
            let chunk = codec::encode(AudioFrame {
                samples: vec![0.25; 1001],
                sample_rate: 24000,
                sequence,
                timestamp_ms: 0,
            });
            let slot = scheduler.schedule(chunk).await.unwrap().expect("scheduled");

            if let Some(end) = previous_end {
                assert_eq!(slot.start, end);
            }
            previous_end = Some(slot.start + slot.duration);
            assert_eq!(scheduler.cursor().next_start_time(), slot.start + slot.duration);
        }
    }
}
