//! Wire codec for the voice service
//! Audio travels as base64 of 16-bit little-endian mono PCM

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;

use super::PcmBuffer;
use crate::error::{CallError, Result};

/// Convert f32 samples to 16-bit PCM, clamping out-of-range input
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| {
            let clamped = s.clamp(-1.0, 1.0);
            if clamped < 0.0 {
                (clamped * 32768.0) as i16
            } else {
                (clamped * i16::MAX as f32) as i16
            }
        })
        .collect()
}

/// Convert 16-bit PCM to f32 samples in [-1, 1]
pub fn pcm16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Encode f32 samples as base64 PCM16 LE for an outbound frame
pub fn encode_pcm16_base64(samples: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in f32_to_pcm16(samples) {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    B64.encode(bytes)
}

/// Decode a base64 PCM16 LE payload. A dangling odd byte is dropped.
pub fn decode_pcm16_base64(data: &str) -> Result<Vec<i16>> {
    let bytes = B64
        .decode(data.trim())
        .map_err(|e| CallError::Codec(e.to_string()))?;
    if bytes.len() % 2 != 0 {
        tracing::trace!("Dropping trailing byte of odd-length PCM payload");
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Turn an inbound audio payload into a buffer playable at `output_rate`
pub fn decode_audio_chunk(data: &str, chunk_rate: u32, output_rate: u32) -> Result<PcmBuffer> {
    if chunk_rate == 0 {
        return Err(CallError::Codec("sample rate of audio chunk is zero".into()));
    }
    let pcm = decode_pcm16_base64(data)?;
    Ok(PcmBuffer::new(pcm16_to_f32(&pcm), chunk_rate).into_rate(output_rate))
}

/// MIME type for raw PCM at a given rate
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Extract the rate from `audio/pcm;rate=24000`-style MIME types
pub fn rate_from_mime(mime: &str) -> Option<u32> {
    let mut parts = mime.split(';').map(str::trim);
    let kind = parts.next()?;
    if !kind.eq_ignore_ascii_case("audio/pcm") && !kind.eq_ignore_ascii_case("audio/l16") {
        return None;
    }
    parts
        .filter_map(|p| p.split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, v)| v.trim().parse().ok())
}

/// Simple linear resampling
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 {
        return samples.to_vec();
    }
    let ratio = to_rate as f64 / from_rate as f64;
    let output_len = (samples.len() as f64 * ratio).ceil() as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_idx = i as f64 / ratio;
        let idx_floor = src_idx.floor() as usize;
        let idx_ceil = (idx_floor + 1).min(samples.len() - 1);
        let frac = (src_idx - idx_floor as f64) as f32;

        let sample = match samples.get(idx_floor) {
            Some(&s1) => s1 + (samples[idx_ceil] - s1) * frac,
            None => 0.0,
        };
        output.push(sample);
    }

    output
}
