//! Conversion between float sample buffers and the wire format.
//!
//! The wire format is 16-bit signed little-endian PCM carried as base64
//! text. All functions here are pure.

use base64::Engine;

use super::backend::AudioFrame;
use crate::error::{VoiceError, VoiceResult};

/// One encoded audio payload plus its format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireChunk {
    /// Base64 text of little-endian i16 PCM
    pub payload: String,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of interleaved channels in the payload
    pub channels: u16,
    /// Sequence number of the source frame (0 for inbound chunks)
    pub sequence: u64,
}

impl WireChunk {
    /// MIME type advertised to the agent, e.g. `audio/pcm;rate=16000`
    pub fn mime_type(&self) -> String {
        pcm_mime_type(self.sample_rate)
    }
}

pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Parse the rate out of an `audio/pcm;rate=N` MIME type
pub fn rate_from_mime_type(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.parse().ok())
}

/// Clamp-then-scale a normalized sample to i16 (asymmetric: 32768 below zero, 32767 above)
pub fn float_to_pcm16(sample: f32) -> i16 {
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    let scaled = if s < 0.0 { s * 32768.0 } else { s * 32767.0 };
    scaled.round() as i16
}

pub fn pcm16_to_float(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Encode a captured frame for transmission
pub fn encode(frame: AudioFrame) -> WireChunk {
    let pcm_bytes: Vec<u8> = frame
        .samples
        .iter()
        .flat_map(|&s| float_to_pcm16(s).to_le_bytes())
        .collect();

    WireChunk {
        payload: base64::engine::general_purpose::STANDARD.encode(pcm_bytes),
        sample_rate: frame.sample_rate,
        channels: 1,
        sequence: frame.sequence,
    }
}

/// Decode a wire chunk to mono float samples at the chunk's rate
pub fn decode(chunk: &WireChunk) -> VoiceResult<Vec<f32>> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(chunk.payload.trim())?;

    if bytes.len() % 2 != 0 {
        return Err(VoiceError::MalformedFrame(format!(
            "odd PCM byte count: {}",
            bytes.len()
        )));
    }

    let samples: Vec<f32> = bytes
        .chunks_exact(2)
        .map(|pair| pcm16_to_float(i16::from_le_bytes([pair[0], pair[1]])))
        .collect();

    if chunk.channels > 1 {
        if samples.len() % chunk.channels as usize != 0 {
            return Err(VoiceError::MalformedFrame(format!(
                "{} samples do not divide into {} channels",
                samples.len(),
                chunk.channels
            )));
        }
        return Ok(downmix_to_mono(&samples, chunk.channels));
    }

    Ok(samples)
}

/// Average interleaved channels into mono
pub fn downmix_to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }

    samples
        .chunks_exact(channels as usize)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Linear-interpolation resampling of mono samples
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 || samples.is_empty() {
        return samples.to_vec();
    }

    let out_len = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let step = from_rate as f64 / to_rate as f64;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos.floor() as usize;
            if idx >= last {
                return samples[last];
            }
            let frac = (pos - idx as f64) as f32;
            samples[idx] + (samples[idx + 1] - samples[idx]) * frac
        })
        .collect()
}

/// Incremental resampler for capture streams arriving in small callbacks
///
/// Keeps the fractional read position and last sample between calls so
/// block boundaries do not introduce clicks.
pub struct StreamResampler {
    from_rate: u32,
    to_rate: u32,
    step: f64,
    position: f64,
    previous: Option<f32>,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        let step = if to_rate == 0 { 1.0 } else { from_rate as f64 / to_rate as f64 };
        Self {
            from_rate,
            to_rate,
            step,
            position: 0.0,
            previous: None,
        }
    }

    /// `(from, to)` rates this resampler converts between
    pub fn rates(&self) -> (u32, u32) {
        (self.from_rate, self.to_rate)
    }

    pub fn is_passthrough(&self) -> bool {
        (self.step - 1.0).abs() < f64::EPSILON
    }

    /// Resample one block, appending output to `out`
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        if self.is_passthrough() {
            out.extend_from_slice(input);
            return;
        }
        if input.is_empty() {
            return;
        }

        // Position is relative to this block; index -1 is the last sample
        // of the previous block.
        let sample_at = |i: isize, previous: Option<f32>| -> f32 {
            if i < 0 {
                previous.unwrap_or(input[0])
            } else {
                input[i as usize]
            }
        };

        let limit = input.len() as f64 - 1.0;

        while self.position <= limit {
            let idx = self.position.floor();
            let frac = (self.position - idx) as f32;
            let a = sample_at(idx as isize, self.previous);
            let b = if idx + 1.0 > limit {
                a
            } else {
                sample_at(idx as isize + 1, self.previous)
            };
            out.push(a + (b - a) * frac);
            self.position += self.step;
        }

        self.position -= input.len() as f64;
        self.previous = input.last().copied();
    }
}
