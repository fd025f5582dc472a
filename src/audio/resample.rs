//! Channel folding and band-limited rate conversion.
//!
//! The speech model wants 16 kHz mono. Rate conversion goes through rubato's
//! FFT resampler, which low-passes at the target Nyquist so content above
//! 8 kHz is removed instead of aliasing into the speech band.

use crate::error::DecodeError;
use rubato::{FftFixedIn, Resampler};

/// Input frames per resampler call
const CHUNK_FRAMES: usize = 1024;
const SUB_CHUNKS: usize = 2;

/// Fold interleaved multi-channel audio into mono by averaging each frame.
pub fn to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels as usize)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Resample mono audio from `source_rate` to `target_rate`.
///
/// The output has exactly `len * target / source` samples: the resampler's
/// start-up delay is trimmed and the tail is flushed with silence.
pub fn resample(samples: &[f32], source_rate: u32, target_rate: u32) -> Result<Vec<f32>, DecodeError> {
    if source_rate == target_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut resampler =
        FftFixedIn::<f32>::new(source_rate as usize, target_rate as usize, CHUNK_FRAMES, SUB_CHUNKS, 1)
            .map_err(|e| DecodeError::Resample(e.to_string()))?;

    let expected = (samples.len() as u64 * target_rate as u64 / source_rate as u64) as usize;
    let delay = resampler.output_delay();
    let mut output = Vec::with_capacity(expected + delay + CHUNK_FRAMES);
    let mut position = 0;

    while output.len() < expected + delay {
        let needed = resampler.input_frames_next();
        let end = (position + needed).min(samples.len());

        // Past the end of the input the chunk stays zero, which flushes the filter
        let mut chunk = vec![0.0f32; needed];
        chunk[..end - position].copy_from_slice(&samples[position..end]);
        position = end;

        let processed = resampler
            .process(&[chunk], None)
            .map_err(|e| DecodeError::Resample(e.to_string()))?;
        output.extend_from_slice(&processed[0]);
    }

    output.drain(..delay);
    output.truncate(expected);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn sine(freq: f32, rate: u32, seconds: f32) -> Vec<f32> {
        let count = (rate as f32 * seconds) as usize;
        (0..count).map(|i| (2.0 * PI * freq * i as f32 / rate as f32).sin()).collect()
    }

    fn rms(samples: &[f32]) -> f32 {
        (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
    }

    #[test]
    fn test_stereo_to_mono() {
        let stereo = vec![0.5, 0.3, 0.8, 0.2, 1.0, 0.0];
        let mono = to_mono(&stereo, 2);
        assert_eq!(mono.len(), 3);
        assert!((mono[0] - 0.4).abs() < 0.001);
        assert!((mono[1] - 0.5).abs() < 0.001);
        assert!((mono[2] - 0.5).abs() < 0.001);
    }

    #[test]
    fn test_resample_passthrough_16k() {
        let samples = vec![0.1, 0.2, 0.3, 0.4, 0.5];
        assert_eq!(resample(&samples, 16_000, 16_000).unwrap(), samples);
    }

    #[test]
    fn test_resample_output_length_matches_rate_ratio() {
        let samples = sine(440.0, 44_100, 1.0);
        assert_eq!(resample(&samples, 44_100, 16_000).unwrap().len(), 16_000);
    }

    #[test]
    fn test_tone_above_target_nyquist_is_removed() {
        // 12 kHz cannot be represented at 16 kHz and must not fold back to 4 kHz
        let input = sine(12_000.0, 48_000, 1.0);
        let output = resample(&input, 48_000, 16_000).unwrap();
        assert_eq!(output.len(), 16_000);

        let level = rms(&output[2_000..14_000]);
        assert!(level < 0.05, "12 kHz tone leaked through at RMS {}", level);
    }

    #[test]
    fn test_speech_band_tone_is_preserved() {
        let input = sine(1_000.0, 48_000, 1.0);
        let output = resample(&input, 48_000, 16_000).unwrap();

        let level = rms(&output[2_000..14_000]);
        assert!((level - rms(&input)).abs() < 0.05, "1 kHz tone RMS changed to {}", level);
    }
}
