//! Frame codec: float samples ↔ 16-bit little-endian PCM, plus the base64 transport encoding.
//!
//! Everything here is a pure function over its inputs and safe to call from any thread.

use crate::error::{VoiceError, VoiceResult};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use std::sync::Arc;
use std::time::Duration;

/// Bytes per sample on the wire.
pub const SAMPLE_WIDTH: usize = 2;

/// An immutable buffer of signed samples at a fixed rate, tagged with its sequence index.
///
/// Cloning is cheap (the samples are shared), so a frame can be handed to exactly one
/// destination without copying.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Arc<[i16]>,
    sample_rate: u32,
    channels: u16,
    sequence: u64,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, sample_rate: u32, channels: u16, sequence: u64) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            channels,
            sequence,
        }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Frames per channel.
    pub fn len(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.len() as f64 / self.sample_rate as f64
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_secs())
    }

    /// Wire bytes for this frame.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.samples.len() * SAMPLE_WIDTH);
        for s in self.samples.iter() {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }
}

/// Quantize normalized float samples (-1.0..1.0) to 16-bit fixed point. Out-of-range input is clamped.
pub fn quantize(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| {
            let clamped = if s.is_nan() { 0.0 } else { s.clamp(-1.0, 1.0) };
            (clamped * 32767.0).round() as i16
        })
        .collect()
}

/// Encode float samples as mono 16-bit little-endian PCM.
pub fn encode(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * SAMPLE_WIDTH);
    for s in quantize(samples) {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Decode 16-bit little-endian PCM into a frame.
///
/// Fails with `MalformedFrame` when the byte length is not a whole number of samples.
pub fn decode(bytes: &[u8], sample_rate: u32, channels: u16, sequence: u64) -> VoiceResult<AudioFrame> {
    if bytes.len() % SAMPLE_WIDTH != 0 {
        return Err(VoiceError::MalformedFrame(format!(
            "{} bytes is not a multiple of the {}-byte sample width",
            bytes.len(),
            SAMPLE_WIDTH
        )));
    }
    if channels == 0 {
        return Err(VoiceError::MalformedFrame("zero channels".to_string()));
    }
    let samples = bytes
        .chunks_exact(SAMPLE_WIDTH)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect::<Vec<_>>();
    if samples.len() % channels as usize != 0 {
        return Err(VoiceError::MalformedFrame(format!(
            "{} samples do not divide into {} channels",
            samples.len(),
            channels
        )));
    }
    Ok(AudioFrame::new(samples, sample_rate, channels, sequence))
}

/// Decode a base64 transport chunk, then the PCM inside it.
pub fn decode_base64(data: &str, sample_rate: u32, channels: u16, sequence: u64) -> VoiceResult<AudioFrame> {
    let bytes = BASE64_STANDARD
        .decode(data.trim())
        .map_err(|e| VoiceError::MalformedFrame(format!("invalid base64: {}", e)))?;
    decode(&bytes, sample_rate, channels, sequence)
}

pub fn to_base64(bytes: &[u8]) -> String {
    BASE64_STANDARD.encode(bytes)
}

/// Convert fixed-point samples back to normalized floats.
pub fn to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// MIME type the endpoint expects for raw PCM at `sample_rate`.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}
