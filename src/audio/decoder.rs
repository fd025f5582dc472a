//! WAV decoding into normalized samples.

use super::resample::{resample, to_mono};
use super::AudioDecoder;
use crate::error::DecodeError;
use crate::transcription::SAMPLE_RATE;
use hound::{SampleFormat, WavReader};
use std::path::Path;

/// Decoder for RIFF/WAV uploads.
#[derive(Debug, Default, Clone, Copy)]
pub struct WavDecoder;

impl WavDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl AudioDecoder for WavDecoder {
    fn decode(&self, path: &Path) -> Result<Vec<f32>, DecodeError> {
        let mut reader = WavReader::open(path).map_err(wav_error)?;
        let spec = reader.spec();

        if spec.channels == 0 || spec.sample_rate == 0 {
            return Err(DecodeError::Unsupported("WAV header declares no channels or no sample rate".to_string()));
        }

        let interleaved: Vec<f32> = match spec.sample_format {
            SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>().map_err(wav_error)?,
            SampleFormat::Int => {
                // hound hands 8-bit unsigned samples back already centred on zero
                let full_scale = (1u64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / full_scale))
                    .collect::<Result<_, _>>()
                    .map_err(wav_error)?
            }
        };

        if interleaved.is_empty() {
            return Err(DecodeError::Empty);
        }

        let mono = to_mono(&interleaved, spec.channels);
        let resampled = resample(&mono, spec.sample_rate, SAMPLE_RATE)?;
        if resampled.is_empty() {
            return Err(DecodeError::Empty);
        }

        tracing::debug!(
            channels = spec.channels,
            source_rate = spec.sample_rate,
            bits = spec.bits_per_sample,
            samples = resampled.len(),
            "decoded WAV upload"
        );

        Ok(resampled)
    }
}

fn wav_error(err: hound::Error) -> DecodeError {
    match err {
        hound::Error::IoError(e) => DecodeError::Io(e),
        other => DecodeError::Unsupported(format!("not a readable WAV file: {}", other)),
    }
}
