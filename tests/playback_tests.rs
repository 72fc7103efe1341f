// Tests for gapless response scheduling
//
// All tests run on a paused Tokio clock; the mock speaker's device clock
// follows it exactly.

mod common;

use common::{pcm_base64, DeviceCounters, MockPlayback};
use loqa_duplex::audio::{PlaybackDevice, WireChunk};
use loqa_duplex::error::VoiceError;
use loqa_duplex::session::{InboundPlaybackScheduler, PlaybackStats};
use std::sync::Arc;
use std::time::Duration;

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

fn chunk(duration: Duration) -> WireChunk {
    WireChunk {
        payload: pcm_base64(duration, 24000, 2000),
        sample_rate: 24000,
        channels: 1,
        sequence: 0,
    }
}

fn scheduler(lookahead: Duration) -> (Arc<MockPlayback>, InboundPlaybackScheduler, Arc<PlaybackStats>) {
    let device = Arc::new(MockPlayback::new(24000, Arc::new(DeviceCounters::default())));
    let stats = Arc::new(PlaybackStats::default());
    let scheduler = InboundPlaybackScheduler::new(device.clone(), 24000, lookahead, stats.clone());
    (device, scheduler, stats)
}

#[tokio::test(start_paused = true)]
async fn test_burst_is_scheduled_back_to_back() {
    let (device, mut scheduler, stats) = scheduler(Duration::from_secs(60));

    for _ in 0..10 {
        scheduler.schedule(chunk(ms(120))).await.unwrap().unwrap();
    }

    let scheduled = device.scheduled();
    assert_eq!(scheduled.len(), 10);
    assert_eq!(scheduled[0].0, Duration::ZERO);
    for pair in scheduled.windows(2) {
        let (start, duration) = pair[0];
        // No overlap and no inserted gap
        assert_eq!(pair[1].0, start + duration);
    }
    assert_eq!(scheduler.cursor().next_start_time(), ms(1200));
    assert_eq!(stats.chunks_scheduled(), 10);
    assert_eq!(stats.scheduled_audio(), ms(1200));
}

#[tokio::test(start_paused = true)]
async fn test_late_chunk_starts_immediately() {
    let (device, mut scheduler, _) = scheduler(Duration::from_secs(60));

    scheduler.schedule(chunk(ms(100))).await.unwrap();
    tokio::time::sleep(ms(300)).await;
    let late = scheduler.schedule(chunk(ms(100))).await.unwrap().unwrap();

    assert_eq!(late.start, ms(300));
    assert_eq!(device.scheduled()[1], (ms(300), ms(100)));
    assert_eq!(scheduler.cursor().next_start_time(), ms(400));
}

#[tokio::test(start_paused = true)]
async fn test_chunks_arriving_at_0_400_1200() {
    let (device, mut scheduler, _) = scheduler(Duration::from_secs(60));

    scheduler.schedule(chunk(ms(500))).await.unwrap();
    tokio::time::sleep(ms(400)).await;
    scheduler.schedule(chunk(ms(500))).await.unwrap();
    tokio::time::sleep(ms(800)).await;
    scheduler.schedule(chunk(ms(500))).await.unwrap();

    assert_eq!(
        device.scheduled(),
        vec![(ms(0), ms(500)), (ms(500), ms(500)), (ms(1200), ms(500))]
    );
    assert_eq!(scheduler.cursor().next_start_time(), ms(1700));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_chunk_leaves_cursor_alone() {
    let (device, mut scheduler, stats) = scheduler(Duration::from_secs(60));

    scheduler.schedule(chunk(ms(200))).await.unwrap();
    let cursor = scheduler.cursor();

    let bad = WireChunk {
        payload: "%%% not audio %%%".to_string(),
        sample_rate: 24000,
        channels: 1,
        sequence: 0,
    };
    let result = scheduler.schedule(bad).await;

    assert!(matches!(result, Err(VoiceError::MalformedFrame(_))));
    assert_eq!(scheduler.cursor(), cursor);
    assert_eq!(stats.chunks_malformed(), 1);

    // The next good chunk follows directly; the skipped one is not silence
    scheduler.schedule(chunk(ms(200))).await.unwrap();
    assert_eq!(device.scheduled()[1].0, ms(200));
}

#[tokio::test(start_paused = true)]
async fn test_empty_chunk_is_ignored() {
    let (device, mut scheduler, _) = scheduler(Duration::from_secs(60));

    let empty = WireChunk {
        payload: String::new(),
        sample_rate: 24000,
        channels: 1,
        sequence: 0,
    };

    assert!(scheduler.schedule(empty).await.unwrap().is_none());
    assert!(device.scheduled().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_lookahead_backpressures_scheduling() {
    let (device, mut scheduler, _) = scheduler(Duration::from_secs(1));

    scheduler.schedule(chunk(ms(1000))).await.unwrap();
    scheduler.schedule(chunk(ms(1000))).await.unwrap();

    // Third chunk would start 2s ahead; it waits until that is within 1s
    let third = scheduler.schedule(chunk(ms(1000))).await.unwrap().unwrap();

    assert_eq!(third.start, ms(2000));
    assert!(device.now() >= ms(1000));
    assert_eq!(scheduler.cursor().next_start_time(), ms(3000));
}

#[tokio::test(start_paused = true)]
async fn test_drained_only_after_last_buffer() {
    let (_device, mut scheduler, _) = scheduler(Duration::from_secs(60));

    let first = scheduler.schedule(chunk(ms(300))).await.unwrap().unwrap();
    let second = scheduler.schedule(chunk(ms(300))).await.unwrap().unwrap();

    first.finished.await.unwrap();
    assert!(!scheduler.is_drained(), "second buffer still pending");

    second.finished.await.unwrap();
    assert!(scheduler.is_drained());
}

#[tokio::test(start_paused = true)]
async fn test_other_rates_are_resampled_to_device_rate() {
    let (device, mut scheduler, _) = scheduler(Duration::from_secs(60));

    let narrowband = WireChunk {
        payload: pcm_base64(ms(100), 16000, 1000),
        sample_rate: 16000,
        channels: 1,
        sequence: 0,
    };
    scheduler.schedule(narrowband).await.unwrap();

    let (_, duration) = device.scheduled()[0];
    let error = duration.as_secs_f64() - 0.1;
    assert!(error.abs() < 0.001, "duration {:?}", duration);
}
