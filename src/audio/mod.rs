//! # Audio Decoding
//!
//! Turns a staged upload into the 16 kHz mono `f32` samples the speech model
//! expects.
//!
//! ## Key Components:
//! - **AudioDecoder**: the decode seam used by the request handler
//! - **WavDecoder**: RIFF/WAV implementation (8/16/24-bit PCM and 32-bit float)
//! - **to_mono / resample**: channel folding and band-limited rate conversion

pub mod decoder;
pub mod resample;

use crate::error::DecodeError;
use std::path::Path;

pub use decoder::WavDecoder;
pub use resample::{resample, to_mono};

/// Decode capability consumed by the request handler.
///
/// Decoding is CPU-bound and synchronous; callers run it on the blocking pool.
pub trait AudioDecoder: Send + Sync {
    /// Decode the file at `path` into 16 kHz mono samples in `[-1, 1]`.
    fn decode(&self, path: &Path) -> Result<Vec<f32>, DecodeError>;
}
