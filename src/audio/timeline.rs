//! Sample-accurate playback timeline shared by the output devices.
//!
//! Buffers are placed at absolute positions on a frame clock. Rendering
//! advances the clock; a buffer signals completion once the clock has
//! passed its last sample.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::oneshot;

use super::backend::{samples_to_duration, ScheduledBuffer};

struct PendingBuffer {
    start_frame: u64,
    samples: Vec<f32>,
    finished: Option<oneshot::Sender<()>>,
}

impl PendingBuffer {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

pub struct PlaybackTimeline {
    sample_rate: u32,
    /// Frames rendered so far; this is the device clock
    position: u64,
    pending: VecDeque<PendingBuffer>,
}

impl PlaybackTimeline {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            position: 0,
            pending: VecDeque::new(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Current device clock
    pub fn now(&self) -> Duration {
        self.frames_to_duration(self.position)
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn frames_to_duration(&self, frames: u64) -> Duration {
        samples_to_duration(frames as usize, self.sample_rate)
    }

    fn duration_to_frames(&self, at: Duration) -> u64 {
        // Round up so a buffer never starts before the requested time.
        let nanos = at.as_nanos() * self.sample_rate as u128;
        nanos.div_ceil(1_000_000_000) as u64
    }

    /// Place `samples` at or after `at`, clamped to the current clock
    pub fn schedule(&mut self, samples: Vec<f32>, at: Duration) -> ScheduledBuffer {
        let start_frame = self.duration_to_frames(at).max(self.position);
        // Both ends come from the frame clock, so `start + duration` is
        // exactly the start reported for a buffer placed right after.
        let start = self.frames_to_duration(start_frame);
        let end = self.frames_to_duration(start_frame + samples.len() as u64);
        let (tx, rx) = oneshot::channel();

        let buffer = PendingBuffer {
            start_frame,
            samples,
            finished: Some(tx),
        };

        if buffer.samples.is_empty() {
            if let Some(tx) = buffer.finished {
                let _ = tx.send(());
            }
        } else {
            let idx = self.pending.partition_point(|b| b.start_frame <= start_frame);
            self.pending.insert(idx, buffer);
        }

        ScheduledBuffer {
            start,
            duration: end - start,
            finished: rx,
        }
    }

    /// Render the next `out.len()` frames and advance the clock.
    ///
    /// Overlapping buffers are summed; gaps are silence.
    pub fn render(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        let window_start = self.position;
        let window_end = window_start + out.len() as u64;

        for buffer in self.pending.iter() {
            if buffer.start_frame >= window_end {
                break;
            }
            let from = buffer.start_frame.max(window_start);
            let to = buffer.end_frame().min(window_end);
            for frame in from..to {
                let src = (frame - buffer.start_frame) as usize;
                let dst = (frame - window_start) as usize;
                out[dst] += buffer.samples[src];
            }
        }

        self.advance(out.len() as u64);
    }

    /// Advance the clock without producing output
    pub fn advance(&mut self, frames: u64) {
        self.position += frames;
        let position = self.position;

        self.pending.retain_mut(|buffer| {
            if buffer.end_frame() > position {
                return true;
            }
            if let Some(tx) = buffer.finished.take() {
                let _ = tx.send(());
            }
            false
        });
    }

    /// Drop all unfinished buffers; their completion receivers see a closed channel
    pub fn flush(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_clamps_to_clock() {
        let mut timeline = PlaybackTimeline::new(1000);
        timeline.advance(250);

        let buffer = timeline.schedule(vec![0.5; 100], Duration::from_millis(100));
        assert_eq!(buffer.start, Duration::from_millis(250));
        assert_eq!(buffer.duration, Duration::from_millis(100));
    }

    #[test]
    fn test_render_places_samples_at_start() {
        let mut timeline = PlaybackTimeline::new(1000);
        let _buffer = timeline.schedule(vec![1.0; 4], Duration::from_millis(2));

        let mut out = vec![9.0; 8];
        timeline.render(&mut out);
        assert_eq!(out, vec![0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0]);
        assert_eq!(timeline.pending_len(), 0);
    }

    #[test]
    fn test_finished_fires_only_after_last_sample() {
        let mut timeline = PlaybackTimeline::new(1000);
        let mut buffer = timeline.schedule(vec![0.1; 10], Duration::ZERO);

        timeline.advance(9);
        assert!(buffer.finished.try_recv().is_err());
        timeline.advance(1);
        assert!(buffer.finished.try_recv().is_ok());
    }

    #[test]
    fn test_back_to_back_buffers_chain_exactly() {
        // 1001 samples at 24kHz is not a whole number of nanoseconds.
        let mut timeline = PlaybackTimeline::new(24000);
        let mut next = Duration::ZERO;

        for i in 0..10 {
            let buffer = timeline.schedule(vec![0.1; 1001], next);
            assert_eq!(buffer.start, next, "buffer {} starts off the previous end", i);
            next = buffer.end();
        }

        assert_eq!(next, timeline.frames_to_duration(10 * 1001));
    }

    #[test]
    fn test_flush_drops_pending_buffers() {
        let mut timeline = PlaybackTimeline::new(1000);
        let mut buffer = timeline.schedule(vec![0.1; 10], Duration::from_millis(5));

        assert_eq!(timeline.flush(), 1);
        assert!(matches!(
            buffer.finished.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }
}
