//! Microphone and speaker devices using cpal.
//!
//! cpal streams are not `Send` on every host, so each stream is built and
//! owned by a dedicated thread that parks until it is told to release the
//! device. The capture callback converts to mono f32, resamples to the
//! session capture rate and assembles fixed-size frames; it never blocks.
//! The playback callback renders a [`PlaybackTimeline`], whose frame
//! counter is the device clock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfig};
use tracing::{debug, error, info, warn};

use super::backend::{
    CaptureConfig, CaptureDevice, FrameAssembler, FrameSink, PlaybackConfig, PlaybackDevice,
    ScheduledBuffer,
};
use super::codec::{downmix_to_mono, StreamResampler};
use super::timeline::PlaybackTimeline;
use crate::error::{VoiceError, VoiceResult};

fn device_name(device: &Device) -> String {
    device.name().unwrap_or_else(|_| "Unknown".to_string())
}

fn find_input_device(name: Option<&str>) -> VoiceResult<Device> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .input_devices()?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| VoiceError::DeviceUnavailable(format!("input device not found: {}", name))),
        None => host
            .default_input_device()
            .ok_or_else(|| VoiceError::DeviceUnavailable("No input device available".to_string())),
    }
}

fn find_output_device(name: Option<&str>) -> VoiceResult<Device> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .output_devices()?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| VoiceError::DeviceUnavailable(format!("output device not found: {}", name))),
        None => host
            .default_output_device()
            .ok_or_else(|| VoiceError::DeviceUnavailable("No output device available".to_string())),
    }
}

/// Stream thread: builds the stream, reports the outcome, then holds the
/// stream until the release channel fires or is dropped.
struct StreamThread {
    release_tx: Option<std_mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl StreamThread {
    fn spawn<B>(name: &str, build: B) -> VoiceResult<Self>
    where
        B: FnOnce() -> VoiceResult<Stream> + Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<()>>();
        let (release_tx, release_rx) = std_mpsc::channel::<()>();

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(e.into()));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Either a release signal or the sender being dropped ends the stream.
                let _ = release_rx.recv();
                drop(stream);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                release_tx: Some(release_tx),
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(VoiceError::DeviceUnavailable(format!("{} thread exited during setup", name)))
            }
        }
    }

    fn release(&mut self) {
        if let Some(tx) = self.release_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("audio stream thread panicked");
            }
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.release();
    }
}

/// Microphone capture via cpal
pub struct CpalCapture {
    name: String,
    config: CaptureConfig,
    device: Option<Device>,
    supported: SupportedStreamConfig,
    capturing: Arc<AtomicBool>,
    stream: Option<StreamThread>,
}

impl CpalCapture {
    pub fn open(config: &CaptureConfig) -> VoiceResult<Self> {
        let device = find_input_device(config.device.as_deref())?;
        let name = device_name(&device);
        let supported = device.default_input_config()?;

        info!(
            "Microphone opened: {} ({}Hz, {} channels, {:?}) -> {}Hz frames of {}",
            name,
            supported.sample_rate().0,
            supported.channels(),
            supported.sample_format(),
            config.sample_rate,
            config.frame_size
        );

        Ok(Self {
            name,
            config: config.clone(),
            device: Some(device),
            supported,
            capturing: Arc::new(AtomicBool::new(false)),
            stream: None,
        })
    }
}

/// Everything the input callback owns; no locks on the capture path.
struct InputPipeline {
    channels: u16,
    resampler: StreamResampler,
    assembler: FrameAssembler,
    resampled: Vec<f32>,
    sink: FrameSink,
}

impl InputPipeline {
    fn process(&mut self, interleaved: &[f32]) {
        let mono = downmix_to_mono(interleaved, self.channels);
        self.resampled.clear();
        self.resampler.process(&mono, &mut self.resampled);
        let sink = &mut self.sink;
        self.assembler.push(&self.resampled, |frame| sink(frame));
    }
}

impl CaptureDevice for CpalCapture {
    fn start(&mut self, sink: FrameSink) -> VoiceResult<()> {
        let device = self.device.take().ok_or_else(|| {
            VoiceError::DeviceUnavailable("microphone capture cannot be restarted".to_string())
        })?;

        let stream_config: StreamConfig = self.supported.config();
        let sample_format = self.supported.sample_format();
        let mut pipeline = InputPipeline {
            channels: stream_config.channels,
            resampler: StreamResampler::new(stream_config.sample_rate.0, self.config.sample_rate),
            assembler: FrameAssembler::new(self.config.frame_size, self.config.sample_rate),
            resampled: Vec::with_capacity(self.config.frame_size * 2),
            sink,
        };

        let capturing = Arc::clone(&self.capturing);
        capturing.store(true, Ordering::SeqCst);

        let stream = StreamThread::spawn("cpal-capture", move || {
            let err_fn = |err: cpal::StreamError| error!("audio input error: {}", err);
            let stream = match sample_format {
                SampleFormat::F32 => device.build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if capturing.load(Ordering::Relaxed) {
                            pipeline.process(data);
                        }
                    },
                    err_fn,
                    None,
                )?,
                SampleFormat::I16 => device.build_input_stream(
                    &stream_config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        if capturing.load(Ordering::Relaxed) {
                            let floats: Vec<f32> =
                                data.iter().map(|&s| s as f32 / 32768.0).collect();
                            pipeline.process(&floats);
                        }
                    },
                    err_fn,
                    None,
                )?,
                other => {
                    return Err(VoiceError::DeviceUnavailable(format!(
                        "Unsupported input sample format: {:?}",
                        other
                    )))
                }
            };
            Ok(stream)
        });

        match stream {
            Ok(stream) => {
                self.stream = Some(stream);
                info!("Microphone capture started: {}", self.name);
                Ok(())
            }
            Err(e) => {
                self.capturing.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn stop(&mut self) -> VoiceResult<()> {
        if self.capturing.swap(false, Ordering::SeqCst) {
            info!("Microphone capture stopped: {}", self.name);
        }
        Ok(())
    }

    fn release(&mut self) -> VoiceResult<()> {
        self.capturing.store(false, Ordering::SeqCst);
        if let Some(mut stream) = self.stream.take() {
            stream.release();
            info!("Microphone released: {}", self.name);
        }
        self.device = None;
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Pick an output config at the preferred rate if the device supports it,
/// otherwise fall back to the device default.
fn choose_output_config(device: &Device, preferred_rate: u32) -> VoiceResult<SupportedStreamConfig> {
    let preference = |format: SampleFormat| match format {
        SampleFormat::F32 => 2,
        SampleFormat::I16 => 1,
        _ => 0,
    };

    let candidate = device
        .supported_output_configs()
        .ok()
        .and_then(|configs| {
            configs
                .filter(|c| preference(c.sample_format()) > 0)
                .filter(|c| {
                    c.min_sample_rate().0 <= preferred_rate && c.max_sample_rate().0 >= preferred_rate
                })
                .max_by_key(|c| (preference(c.sample_format()), std::cmp::Reverse(c.channels())))
        })
        .map(|c| c.with_sample_rate(cpal::SampleRate(preferred_rate)));

    match candidate {
        Some(config) => Ok(config),
        None => {
            debug!("No output config at {}Hz, using device default", preferred_rate);
            Ok(device.default_output_config()?)
        }
    }
}

/// Speaker playback via cpal
pub struct CpalPlayback {
    name: String,
    sample_rate: u32,
    timeline: Arc<Mutex<PlaybackTimeline>>,
    stream: Mutex<Option<StreamThread>>,
    released: AtomicBool,
}

impl CpalPlayback {
    pub fn open(config: &PlaybackConfig) -> VoiceResult<Self> {
        let device = find_output_device(config.device.as_deref())?;
        let name = device_name(&device);
        let supported = choose_output_config(&device, config.sample_rate)?;
        let sample_format = supported.sample_format();
        let stream_config: StreamConfig = supported.config();
        let sample_rate = stream_config.sample_rate.0;
        let channels = stream_config.channels.max(1) as usize;

        let timeline = Arc::new(Mutex::new(PlaybackTimeline::new(sample_rate)));

        let stream = {
            let timeline = Arc::clone(&timeline);
            StreamThread::spawn("cpal-playback", move || {
                let err_fn = |err: cpal::StreamError| error!("audio output error: {}", err);
                let mut mono: Vec<f32> = Vec::new();
                let stream = match sample_format {
                    SampleFormat::F32 => device.build_output_stream(
                        &stream_config,
                        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                            mono.resize(data.len() / channels, 0.0);
                            match timeline.lock() {
                                Ok(mut t) => t.render(&mut mono),
                                Err(_) => mono.fill(0.0),
                            }
                            for (frame, &s) in data.chunks_mut(channels).zip(mono.iter()) {
                                frame.fill(s);
                            }
                        },
                        err_fn,
                        None,
                    )?,
                    SampleFormat::I16 => device.build_output_stream(
                        &stream_config,
                        move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                            mono.resize(data.len() / channels, 0.0);
                            match timeline.lock() {
                                Ok(mut t) => t.render(&mut mono),
                                Err(_) => mono.fill(0.0),
                            }
                            for (frame, &s) in data.chunks_mut(channels).zip(mono.iter()) {
                                frame.fill(super::codec::float_to_pcm16(s));
                            }
                        },
                        err_fn,
                        None,
                    )?,
                    other => {
                        return Err(VoiceError::DeviceUnavailable(format!(
                            "Unsupported output sample format: {:?}",
                            other
                        )))
                    }
                };
                Ok(stream)
            })?
        };

        info!(
            "Speaker opened: {} ({}Hz, {} channels, requested {}Hz)",
            name, sample_rate, channels, config.sample_rate
        );

        Ok(Self {
            name,
            sample_rate,
            timeline,
            stream: Mutex::new(Some(stream)),
            released: AtomicBool::new(false),
        })
    }
}

impl PlaybackDevice for CpalPlayback {
    fn name(&self) -> &str {
        &self.name
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn now(&self) -> Duration {
        self.timeline.lock().map(|t| t.now()).unwrap_or_default()
    }

    fn schedule(&self, samples: Vec<f32>, at: Duration) -> VoiceResult<ScheduledBuffer> {
        if self.released.load(Ordering::SeqCst) {
            return Err(VoiceError::DeviceUnavailable(format!("{} is released", self.name)));
        }
        let mut timeline = self
            .timeline
            .lock()
            .map_err(|_| VoiceError::DeviceUnavailable("playback timeline poisoned".to_string()))?;
        Ok(timeline.schedule(samples, at))
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
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let stream = self.stream.lock().ok().and_then(|mut s| s.take());
        if let Some(mut stream) = stream {
            stream.release();
            info!("Speaker released: {}", self.name);
        }
        Ok(())
    }
}
