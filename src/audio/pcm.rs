//! Sample-format helpers shared by capture and playback.
//!
//! Everything here is pure and allocation-light so it can run inside the
//! cpal audio callback.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Convert interleaved multi-channel audio to mono by averaging channels.
pub fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels.max(1) as usize;
    if ch == 1 {
        return data.to_vec();
    }
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Upsampling was requested; only rate reduction is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot upsample from {from}Hz to {to}Hz")]
pub struct UpsampleError {
    pub from: u32,
    pub to: u32,
}

/// Block-averaging downsampler.
///
/// Output length is `round(len / ratio)`. Each output sample is the mean of
/// the input samples between consecutive rounded block offsets, which acts
/// as a crude low-pass filter ahead of decimation.
///
/// # Errors
///
/// Returns [`UpsampleError`] when `out_rate > in_rate`.
pub fn downsample(
    buffer: &[f32],
    in_rate: u32,
    out_rate: u32,
) -> std::result::Result<Vec<f32>, UpsampleError> {
    if in_rate == out_rate {
        return Ok(buffer.to_vec());
    }
    if out_rate > in_rate || out_rate == 0 {
        return Err(UpsampleError {
            from: in_rate,
            to: out_rate,
        });
    }

    let ratio = f64::from(in_rate) / f64::from(out_rate);
    let out_len = (buffer.len() as f64 / ratio).round() as usize;
    let mut output = Vec::with_capacity(out_len);

    let mut offset = 0usize;
    for i in 0..out_len {
        let next = (((i + 1) as f64) * ratio).round() as usize;
        let end = next.min(buffer.len());
        let block = buffer.get(offset..end).unwrap_or(&[]);
        let sample = if block.is_empty() {
            0.0
        } else {
            block.iter().sum::<f32>() / block.len() as f32
        };
        output.push(sample);
        offset = next;
    }

    Ok(output)
}

/// Convert float samples in \[-1, 1\] to signed 16-bit PCM.
///
/// Values are clamped first; negatives scale by 0x8000, positives by 0x7FFF,
/// so both -1.0 and 1.0 map onto the extremes of the i16 range.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| {
            let s = s.clamp(-1.0, 1.0);
            if s < 0.0 {
                (s * 32_768.0) as i16
            } else {
                (s * 32_767.0) as i16
            }
        })
        .collect()
}

/// Convert signed 16-bit PCM back to floats in \[-1, 1).
pub fn pcm16_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| f32::from(s) / 32_768.0).collect()
}

/// Base64-encode PCM as little-endian bytes.
pub fn pcm16_to_base64(samples: &[i16]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    STANDARD.encode(bytes)
}

/// Interpret raw bytes as little-endian i16 samples (a trailing odd byte is ignored).
pub fn le_bytes_to_pcm16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Root-mean-square energy of a frame (0.0 for an empty frame).
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// Whether a frame carries voice, by RMS against `threshold`.
pub fn detect_voice_activity(samples: &[f32], threshold: f32) -> bool {
    rms(samples) > threshold
}
