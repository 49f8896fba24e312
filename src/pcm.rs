//! Audio extraction: converts whatever PCM layout the OS delivers into
//! int16 little-endian mono, preserving the buffer's PTS.
//!
//! The extractor is pure and thread-safe; it is called from the capture
//! dispatch queues and must not block or allocate excessively.

use crate::error::ExtractError;

/// Format description attached to a sample buffer. Absent until the OS
/// reports it, in which case extraction fails with `MissingFormat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub is_float: bool,
    pub bits_per_channel: u16,
    pub channels: u16,
    pub interleaved: bool,
    pub sample_rate: u32,
}

/// An opaque sample buffer as delivered by the OS capture session.
///
/// Interleaved layouts carry one data buffer; non-interleaved layouts carry
/// one buffer per channel plane.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    pub format: Option<PcmFormat>,
    pub buffers: Vec<Vec<u8>>,
    pub frames: usize,
    /// Host-clock presentation timestamp in microseconds.
    pub pts_us: i64,
}

/// Canonical s16le mono chunk plus its PTS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmChunk {
    pub samples: Vec<i16>,
    pub pts_us: i64,
}

impl PcmChunk {
    pub fn into_bytes(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.samples.len() * 2);
        for s in self.samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }
}

/// Convert a sample buffer to int16 LE mono.
///
/// Downmix is the arithmetic mean across channels. Float32 input is clipped
/// to [-1, 1] then scaled by 32767; int16 input stays in its own amplitude
/// domain through the float downmix; int32 input is normalised by 2^31.
/// Non-interleaved planes are averaged across buffers as a final division.
pub fn extract_mono_s16(buf: &SampleBuffer) -> Result<PcmChunk, ExtractError> {
    let format = buf.format.ok_or(ExtractError::MissingFormat)?;

    if format.channels == 0 {
        return Err(ExtractError::BufferListError("zero channels".into()));
    }
    if buf.buffers.is_empty() {
        return Err(ExtractError::BufferListError("empty buffer list".into()));
    }

    let mono = if format.interleaved {
        if buf.buffers.len() != 1 {
            return Err(ExtractError::BufferListError(format!(
                "interleaved layout with {} buffers",
                buf.buffers.len()
            )));
        }
        decode_interleaved(&buf.buffers[0], format)?
    } else {
        decode_planar(&buf.buffers, format)?
    };

    let mut samples: Vec<i16> = mono
        .into_iter()
        .map(|v| v.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect();

    if buf.frames > 0 && samples.len() > buf.frames {
        samples.truncate(buf.frames);
    }

    Ok(PcmChunk {
        samples,
        pts_us: buf.pts_us,
    })
}

/// Decode one raw buffer into f32 samples in the i16 amplitude domain.
fn decode_samples(bytes: &[u8], format: PcmFormat) -> Result<Vec<f32>, ExtractError> {
    match (format.is_float, format.bits_per_channel) {
        (true, 32) => {
            if bytes.len() % 4 != 0 {
                return Err(ExtractError::BufferListError("f32 buffer misaligned".into()));
            }
            Ok(bytes
                .chunks_exact(4)
                .map(|c| {
                    let v = f32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                    v.clamp(-1.0, 1.0) * 32767.0
                })
                .collect())
        }
        (false, 16) => {
            if bytes.len() % 2 != 0 {
                return Err(ExtractError::BufferListError("i16 buffer misaligned".into()));
            }
            Ok(bytes
                .chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32)
                .collect())
        }
        (false, 32) => {
            if bytes.len() % 4 != 0 {
                return Err(ExtractError::BufferListError("i32 buffer misaligned".into()));
            }
            Ok(bytes
                .chunks_exact(4)
                .map(|c| {
                    let v = i32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                    (v as f64 / 2_147_483_648.0) as f32 * 32767.0
                })
                .collect())
        }
        (is_float, bits) => Err(ExtractError::UnsupportedFormat { is_float, bits }),
    }
}

fn decode_interleaved(bytes: &[u8], format: PcmFormat) -> Result<Vec<f32>, ExtractError> {
    let decoded = decode_samples(bytes, format)?;
    let channels = format.channels as usize;
    if channels == 1 {
        return Ok(decoded);
    }
    Ok(decoded
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect())
}

/// Average non-interleaved channel planes, truncating to the shortest plane.
fn decode_planar(buffers: &[Vec<u8>], format: PcmFormat) -> Result<Vec<f32>, ExtractError> {
    let plane_format = PcmFormat {
        channels: 1,
        interleaved: true,
        ..format
    };
    let mut planes = Vec::with_capacity(buffers.len());
    for b in buffers {
        planes.push(decode_samples(b, plane_format)?);
    }
    let min_len = planes.iter().map(|p| p.len()).min().unwrap_or(0);
    if min_len == 0 {
        return Err(ExtractError::BufferListError("empty channel plane".into()));
    }
    let n = planes.len() as f32;
    Ok((0..min_len)
        .map(|i| planes.iter().map(|p| p[i]).sum::<f32>() / n)
        .collect())
}

/// RMS level of an s16le mono chunk, normalised to [0, 1].
pub fn rms_level(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    let rms = (sum_sq / samples.len() as f64).sqrt() / 32768.0;
    rms.clamp(0.0, 1.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_bytes(samples: &[f32]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn i16_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn fmt(is_float: bool, bits: u16, channels: u16, interleaved: bool) -> PcmFormat {
        PcmFormat {
            is_float,
            bits_per_channel: bits,
            channels,
            interleaved,
            sample_rate: 48_000,
        }
    }

    #[test]
    fn test_missing_format() {
        let buf = SampleBuffer {
            format: None,
            buffers: vec![vec![0, 0]],
            frames: 1,
            pts_us: 0,
        };
        assert!(matches!(
            extract_mono_s16(&buf),
            Err(ExtractError::MissingFormat)
        ));
    }

    #[test]
    fn test_float32_is_clipped_and_scaled() {
        let buf = SampleBuffer {
            format: Some(fmt(true, 32, 1, true)),
            buffers: vec![f32_bytes(&[0.5, -1.5, 2.0, 0.0])],
            frames: 4,
            pts_us: 100,
        };
        let chunk = extract_mono_s16(&buf).unwrap();
        assert_eq!(chunk.pts_us, 100);
        assert_eq!(chunk.samples, vec![16384, -32767, 32767, 0]);
    }

    #[test]
    fn test_i16_stereo_downmix_is_mean() {
        let buf = SampleBuffer {
            format: Some(fmt(false, 16, 2, true)),
            buffers: vec![i16_bytes(&[100, 300, -100, -300])],
            frames: 2,
            pts_us: 0,
        };
        let chunk = extract_mono_s16(&buf).unwrap();
        assert_eq!(chunk.samples, vec![200, -200]);
    }

    #[test]
    fn test_i32_normalised() {
        let buf = SampleBuffer {
            format: Some(fmt(false, 32, 1, true)),
            buffers: vec![i32::MAX.to_le_bytes().to_vec()],
            frames: 1,
            pts_us: 0,
        };
        let chunk = extract_mono_s16(&buf).unwrap();
        // 2^31-1 over 2^31 rounds back up to full scale.
        assert_eq!(chunk.samples, vec![32767]);
    }

    #[test]
    fn test_planar_planes_are_averaged() {
        let buf = SampleBuffer {
            format: Some(fmt(false, 16, 2, false)),
            buffers: vec![i16_bytes(&[100, 200, 300]), i16_bytes(&[300, 400])],
            frames: 0,
            pts_us: 0,
        };
        let chunk = extract_mono_s16(&buf).unwrap();
        // Truncated to the shortest plane.
        assert_eq!(chunk.samples, vec![200, 300]);
    }

    #[test]
    fn test_unsupported_format() {
        let buf = SampleBuffer {
            format: Some(fmt(true, 16, 1, true)),
            buffers: vec![vec![0, 0]],
            frames: 1,
            pts_us: 0,
        };
        assert!(matches!(
            extract_mono_s16(&buf),
            Err(ExtractError::UnsupportedFormat { is_float: true, bits: 16 })
        ));
    }

    #[test]
    fn test_frames_bound_truncates() {
        let buf = SampleBuffer {
            format: Some(fmt(false, 16, 1, true)),
            buffers: vec![i16_bytes(&[1, 2, 3, 4])],
            frames: 3,
            pts_us: 0,
        };
        assert_eq!(extract_mono_s16(&buf).unwrap().samples, vec![1, 2, 3]);
    }

    #[test]
    fn test_rms_level_bounds() {
        assert_eq!(rms_level(&[]), 0.0);
        assert_eq!(rms_level(&[0, 0, 0]), 0.0);
        let full = rms_level(&[i16::MIN, i16::MIN]);
        assert!(full <= 1.0 && full > 0.99);
        let half = rms_level(&[16384, -16384]);
        assert!((half - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_chunk_into_bytes_is_le() {
        let chunk = PcmChunk {
            samples: vec![1, -2],
            pts_us: 0,
        };
        assert_eq!(chunk.into_bytes(), vec![0x01, 0x00, 0xfe, 0xff]);
    }
}
