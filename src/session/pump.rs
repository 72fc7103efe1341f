//! Outbound frame pump.
//!
//! Frames arrive from the capture callback and must never block it. A
//! frame is encoded and queued only while the transport is open; otherwise
//! it is dropped and counted. A single consumer task drains the queue so
//! frames reach the transport in capture order.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio::{codec, AudioFrame, WireChunk};
use crate::error::{VoiceError, VoiceResult};
use crate::transport::{OutboundFrame, TransportLink};

/// Counters reported by the pump
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PumpStats {
    pub captured: u64,
    pub sent: u64,
    pub dropped: u64,
    pub send_failures: u64,
}

#[derive(Default)]
struct Counters {
    captured: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
    send_failures: AtomicU64,
}

pub struct OutboundFramePump {
    open: AtomicBool,
    queue_tx: mpsc::Sender<WireChunk>,
    queue_rx: Mutex<Option<mpsc::Receiver<WireChunk>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl OutboundFramePump {
    pub fn new(queue_frames: usize) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(queue_frames.max(1));
        Self {
            open: AtomicBool::new(false),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            consumer: Mutex::new(None),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Hand over one captured frame. Returns immediately.
    pub fn submit(&self, frame: AudioFrame) {
        self.counters.captured.fetch_add(1, Ordering::Relaxed);

        if !self.open.load(Ordering::Acquire) {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match self.queue_tx.try_send(codec::encode(frame)) {
            Ok(()) => {}
            Err(TrySendError::Full(chunk)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!("Send queue full, dropped frame {} ({} dropped)", chunk.sequence, dropped);
            }
            Err(TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Start forwarding to `link` and open the gate. Must be called from
    /// within a Tokio runtime, at most once.
    pub fn attach(&self, link: Arc<dyn TransportLink>) -> VoiceResult<()> {
        let queue_rx = self
            .queue_rx
            .lock()
            .ok()
            .and_then(|mut rx| rx.take())
            .ok_or_else(|| VoiceError::TransportDropped("pump already attached".to_string()))?;

        let consumer = tokio::spawn(run_consumer(queue_rx, link, Arc::clone(&self.counters)));
        if let Ok(mut slot) = self.consumer.lock() {
            *slot = Some(consumer);
        }

        self.open.store(true, Ordering::Release);
        info!("Outbound audio flowing");
        Ok(())
    }

    /// Shut the gate and cancel any queued or in-flight sends
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);

        let consumer = self.consumer.lock().ok().and_then(|mut c| c.take());
        if let Some(consumer) = consumer {
            consumer.abort();
            debug!("Outbound consumer cancelled");
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PumpStats {
        PumpStats {
            captured: self.counters.captured.load(Ordering::Relaxed),
            sent: self.counters.sent.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            send_failures: self.counters.send_failures.load(Ordering::Relaxed),
        }
    }
}

impl Drop for OutboundFramePump {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_consumer(
    mut queue: mpsc::Receiver<WireChunk>,
    link: Arc<dyn TransportLink>,
    counters: Arc<Counters>,
) {
    while let Some(chunk) = queue.recv().await {
        let frame = OutboundFrame {
            mime_type: chunk.mime_type(),
            data_base64: chunk.payload,
        };

        match link.send(frame).await {
            Ok(()) => {
                counters.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.send_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to send frame {}: {}", chunk.sequence, e);
            }
        }
    }
}
