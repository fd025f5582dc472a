//! # Transcription Module
//!
//! Seams to the speech-recognition engine. The rest of the crate only talks
//! to these traits; the concrete Whisper implementation lives in [`whisper`].
//!
//! ## Key Components:
//! - **SpeechEngine**: downloads the model asset and turns it into a loaded model
//! - **LoadedModel**: transcribes 16 kHz mono samples into text
//! - **ModelVersion / ModelAssets**: identity and on-disk location of the model
//!
//! ## Concurrency contract:
//! A `LoadedModel` may be called from many requests at once. Implementations
//! are responsible for their own internal synchronization; the lifecycle
//! controller does not serialize transcription calls.

pub mod whisper; // Candle-based Whisper engine

use crate::error::EngineError;
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use whisper::WhisperEngine;

/// Sample rate every `LoadedModel` expects.
pub const SAMPLE_RATE: u32 = 16_000;

/// Identity of the model asset: repository id plus revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelVersion {
    pub repo: String,
    pub revision: String,
}

impl ModelVersion {
    pub fn new(repo: impl Into<String>, revision: impl Into<String>) -> Self {
        Self { repo: repo.into(), revision: revision.into() }
    }

    /// Directory name for this version inside the installation directory.
    ///
    /// `openai/whisper-base` at `main` becomes `models--openai--whisper-base--main`.
    pub fn folder_name(&self) -> String {
        let sanitized = |s: &str| s.replace(['/', '\\', ':'], "--");
        format!("models--{}--{}", sanitized(&self.repo), sanitized(&self.revision))
    }
}

impl fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.repo, self.revision)
    }
}

/// Location of a fully installed model on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelAssets {
    dir: PathBuf,
}

impl ModelAssets {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of one asset file, e.g. `assets.path("config.json")`.
    pub fn path(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }
}

/// The speech-recognition engine, seen from the lifecycle controller.
#[async_trait]
pub trait SpeechEngine: Send + Sync {
    /// File names that must all be present for the asset to count as installed.
    fn required_files(&self) -> &[&'static str];

    /// Transfer the asset for `version` into `destination`.
    ///
    /// No progress is reported; callers that want progress have to watch the
    /// filesystem themselves.
    async fn download(&self, version: &ModelVersion, destination: &Path) -> Result<ModelAssets, EngineError>;

    /// Load installed assets into memory.
    async fn initialize(&self, assets: &ModelAssets) -> Result<Arc<dyn LoadedModel>, EngineError>;
}

/// A model that is loaded and can transcribe.
#[async_trait]
pub trait LoadedModel: Send + Sync {
    /// Transcribe 16 kHz mono samples. `language` is an optional ISO 639-1 hint.
    async fn transcribe(&self, samples: Vec<f32>, language: Option<String>) -> Result<String, EngineError>;
}
