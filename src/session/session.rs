use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::config::{ConversationContext, SessionConfig};
use super::guard::Guarded;
use super::playback::{InboundPlaybackScheduler, PlaybackStats};
use super::pump::OutboundFramePump;
use super::state::{CloseReason, SessionState, StateMachine, StatusEvent};
use super::stats::SessionStats;
use crate::audio::{codec, CaptureDevice, DeviceProvider, PlaybackDevice};
use crate::error::{VoiceError, VoiceResult};
use crate::transport::{Connector, SessionSetup, TransportEvent, TransportLink};

/// Resources held while a session is live. Each one is released by its
/// guard if an orderly close never reaches it.
struct SessionResources {
    capture: Guarded<Box<dyn CaptureDevice>>,
    playback: Guarded<Arc<dyn PlaybackDevice>>,
    link: Guarded<Arc<dyn TransportLink>>,
}

fn release_capture(device: &mut Box<dyn CaptureDevice>) -> VoiceResult<()> {
    device.release()
}

fn release_playback(device: &mut Arc<dyn PlaybackDevice>) -> VoiceResult<()> {
    device.release()
}

fn release_link(link: &mut Arc<dyn TransportLink>) -> VoiceResult<()> {
    let link = Arc::clone(link);
    let handle = tokio::runtime::Handle::try_current()
        .map_err(|_| VoiceError::TransportDropped("no runtime to close transport".to_string()))?;
    handle.spawn(async move {
        if let Err(e) = link.close().await {
            warn!("Failed to close transport: {}", e);
        }
    });
    Ok(())
}

/// Release the microphone, then the speaker, on the blocking pool. Device
/// release may join audio threads. A failure or panic releasing the
/// microphone still releases the speaker through its guard.
async fn release_devices(
    mut capture: Guarded<Box<dyn CaptureDevice>>,
    mut playback: Guarded<Arc<dyn PlaybackDevice>>,
) {
    let released = tokio::task::spawn_blocking(move || {
        capture.release();
        playback.release();
    })
    .await;
    if let Err(e) = released {
        warn!("Device release task failed: {}", e);
    }
}

/// One duplex voice conversation
pub struct VoiceSession {
    id: String,
    context: ConversationContext,
    config: SessionConfig,
    started_at: DateTime<Utc>,
    state: StateMachine,
    pump: Arc<OutboundFramePump>,
    playback_stats: Arc<PlaybackStats>,
    resources: Mutex<Option<SessionResources>>,
    inbound_task: Mutex<Option<JoinHandle<()>>>,
    close_reason: Mutex<Option<CloseReason>>,
    closing: AtomicBool,
    cancel: watch::Sender<bool>,
    released: watch::Sender<bool>,
}

impl VoiceSession {
    pub fn new(
        id: String,
        context: ConversationContext,
        config: SessionConfig,
        events: broadcast::Sender<StatusEvent>,
    ) -> Self {
        info!("Creating voice session: {}", id);

        let pump = Arc::new(OutboundFramePump::new(config.outbound_queue_frames));
        let (cancel, _) = watch::channel(false);
        let (released, _) = watch::channel(false);

        Self {
            state: StateMachine::new(id.clone(), events),
            id,
            context,
            config,
            started_at: Utc::now(),
            pump,
            playback_stats: Arc::new(PlaybackStats::default()),
            resources: Mutex::new(None),
            inbound_task: Mutex::new(None),
            close_reason: Mutex::new(None),
            closing: AtomicBool::new(false),
            cancel,
            released,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state.current()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().ok().and_then(|r| *r)
    }

    /// Acquire devices, connect to the agent and start both audio
    /// directions. Returns once the session is Listening.
    ///
    /// On failure every resource acquired so far has been released and
    /// the session is Closed.
    pub async fn establish(
        self: &Arc<Self>,
        devices: &dyn DeviceProvider,
        connector: &dyn Connector,
    ) -> VoiceResult<()> {
        let mut cancel_rx = self.cancel.subscribe();
        if *cancel_rx.borrow() {
            return Err(VoiceError::Cancelled);
        }

        let outcome = tokio::select! {
            result = self.setup(devices, connector) => result,
            _ = cancel_rx.wait_for(|cancelled| *cancelled) => Err(VoiceError::Cancelled),
        };

        let (resources, events, scheduler) = match outcome {
            Ok(ready) => ready,
            Err(e) => {
                if !matches!(e, VoiceError::Cancelled) {
                    error!("Session {} failed to start: {}", self.id, e);
                }
                self.shutdown(CloseReason::from(&e), false).await;
                return Err(e);
            }
        };

        let stale = {
            let mut slot = self
                .resources
                .lock()
                .map_err(|_| VoiceError::Config("session state poisoned".to_string()))?;
            if !self.closing.load(Ordering::SeqCst) {
                *slot = Some(resources);
                None
            } else {
                Some(resources)
            }
        };

        if let Some(resources) = stale {
            // Stopped between handshake and commit.
            let SessionResources {
                capture,
                playback,
                link,
            } = resources;
            drop(link);
            release_devices(capture, playback).await;
            return Err(VoiceError::Cancelled);
        }

        {
            // A close either sees this task in the slot or has already set
            // `closing`, in which case the task is never spawned.
            let mut slot = self
                .inbound_task
                .lock()
                .map_err(|_| VoiceError::Config("session state poisoned".to_string()))?;
            if self.closing.load(Ordering::SeqCst)
                || !self.state.transition(SessionState::Listening, None)
            {
                return Err(VoiceError::Cancelled);
            }
            let session = Arc::clone(self);
            *slot = Some(tokio::spawn(async move {
                session.run_inbound(events, scheduler).await
            }));
        }

        info!("Session {} is live", self.id);
        Ok(())
    }

    async fn setup(
        &self,
        devices: &dyn DeviceProvider,
        connector: &dyn Connector,
    ) -> VoiceResult<(SessionResources, mpsc::Receiver<TransportEvent>, InboundPlaybackScheduler)> {
        let mut capture = Guarded::new(
            "microphone",
            devices.open_capture(&self.config.capture_config())?,
            release_capture,
        );
        let playback = Guarded::new(
            "speaker",
            devices.open_playback(&self.config.playback_config())?,
            release_playback,
        );
        info!(
            "Session {}: capture {} / playback {}",
            self.id,
            (**capture).name(),
            (**playback).name()
        );

        let pump = Arc::clone(&self.pump);
        capture.start(Box::new(move |frame| pump.submit(frame)))?;

        let setup = SessionSetup {
            session_id: self.id.clone(),
            persona: self.context.persona.clone(),
            voice: self.context.voice.clone(),
            excerpt: self.context.excerpt.clone(),
            input_mime_type: codec::pcm_mime_type(self.config.input_sample_rate),
            output_sample_rate: self.config.output_sample_rate,
        };

        debug!("Session {}: connecting via {}", self.id, connector.name());
        let connection = connector.connect(setup).await?;
        let link = Guarded::new("transport", connection.link, release_link);

        self.pump.attach(Arc::clone(&*link))?;

        let scheduler = InboundPlaybackScheduler::new(
            Arc::clone(&*playback),
            self.config.output_sample_rate,
            self.config.max_lookahead,
            Arc::clone(&self.playback_stats),
        );

        Ok((
            SessionResources {
                capture,
                playback,
                link,
            },
            connection.events,
            scheduler,
        ))
    }

    async fn run_inbound(
        self: Arc<Self>,
        events: mpsc::Receiver<TransportEvent>,
        scheduler: InboundPlaybackScheduler,
    ) {
        let mut cancel_rx = self.cancel.subscribe();
        let reason = tokio::select! {
            reason = self.inbound_loop(events, scheduler) => Some(reason),
            _ = cancel_rx.wait_for(|cancelled| *cancelled) => None,
        };

        if let Some(reason) = reason {
            self.shutdown(reason, false).await;
        }
    }

    /// Schedule response audio until the transport ends
    async fn inbound_loop(
        &self,
        mut events: mpsc::Receiver<TransportEvent>,
        mut scheduler: InboundPlaybackScheduler,
    ) -> CloseReason {
        let mut playing = FuturesUnordered::new();

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(TransportEvent::Audio(frame)) => {
                        let chunk = scheduler.chunk_from_frame(frame);
                        match scheduler.schedule(chunk).await {
                            Ok(Some(slot)) => {
                                self.state.transition_from(SessionState::Listening, SessionState::Speaking);
                                playing.push(slot.finished);
                            }
                            Ok(None) => {}
                            Err(e) if !e.is_fatal() => {}
                            Err(e) => {
                                error!("Session {}: playback failed: {}", self.id, e);
                                return CloseReason::from(&e);
                            }
                        }
                    }
                    Some(TransportEvent::Closed(reason)) => {
                        info!(
                            "Session {} closed by agent: {}",
                            self.id,
                            reason.as_deref().unwrap_or("no reason")
                        );
                        return CloseReason::RemoteClosed;
                    }
                    Some(TransportEvent::Error(message)) => {
                        warn!("Session {} transport error: {}", self.id, message);
                        return CloseReason::TransportDropped;
                    }
                    None => {
                        warn!("Session {} transport event stream ended", self.id);
                        return CloseReason::TransportDropped;
                    }
                },
                Some(_) = playing.next(), if !playing.is_empty() => {
                    if scheduler.is_drained() {
                        self.state.transition_from(SessionState::Speaking, SessionState::Listening);
                    }
                }
            }
        }
    }

    /// End the session and release everything it holds. Safe to call in
    /// any state and from several tasks; every caller returns after the
    /// release has completed.
    pub async fn close(&self, reason: CloseReason) {
        self.shutdown(reason, true).await;
    }

    async fn shutdown(&self, reason: CloseReason, wait: bool) {
        if self.closing.swap(true, Ordering::SeqCst) {
            if wait {
                let mut released = self.released.subscribe();
                let _ = released.wait_for(|done| *done).await;
            }
            return;
        }

        info!("Closing session {} ({:?})", self.id, reason);
        self.cancel.send_replace(true);

        if let Ok(mut slot) = self.close_reason.lock() {
            *slot = Some(reason);
        }
        self.state.transition(SessionState::Closed, Some(reason));

        let resources = self.resources.lock().ok().and_then(|mut r| r.take());
        let inbound = self.inbound_task.lock().ok().and_then(|mut t| t.take());

        match resources {
            Some(SessionResources {
                mut capture,
                playback,
                mut link,
            }) => {
                if let Err(e) = capture.stop() {
                    warn!("Failed to stop capture: {}", e);
                }

                self.pump.close();

                // The inbound task observes the cancel signal; wait for it
                // so nothing is scheduled after the flush.
                if wait {
                    if let Some(task) = inbound {
                        if let Err(e) = task.await {
                            warn!("Inbound task ended abnormally: {}", e);
                        }
                    }
                }

                playback.flush();

                if let Err(e) = link.close().await {
                    warn!("Failed to close transport: {}", e);
                }
                link.disarm();

                release_devices(capture, playback).await;
            }
            None => self.pump.close(),
        }

        self.released.send_replace(true);
        info!("Session {} closed", self.id);
    }

    pub fn stats(&self) -> SessionStats {
        let pump = self.pump.stats();
        let duration = Utc::now().signed_duration_since(self.started_at);

        SessionStats {
            session_id: self.id.clone(),
            state: self.state(),
            close_reason: self.close_reason(),
            started_at: self.started_at,
            duration_secs: duration.num_milliseconds() as f64 / 1000.0,
            frames_captured: pump.captured,
            frames_sent: pump.sent,
            frames_dropped: pump.dropped,
            send_failures: pump.send_failures,
            chunks_scheduled: self.playback_stats.chunks_scheduled(),
            chunks_malformed: self.playback_stats.chunks_malformed(),
            scheduled_audio_secs: self.playback_stats.scheduled_audio().as_secs_f64(),
        }
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        self.pump.close();
        if let Some(task) = self.inbound_task.get_mut().ok().and_then(|t| t.take()) {
            task.abort();
        }
    }
}
