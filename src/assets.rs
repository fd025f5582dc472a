//! # Model Asset Store
//!
//! Knows where the single model lives on disk and whether it is there.
//!
//! The installation folder is `<install_dir>/<version.folder_name()>/` and is
//! the only source of truth for "model present": there is no marker file and
//! no in-memory flag. A version counts as installed when every file the engine
//! requires exists there and is non-empty.

use crate::error::FetchError;
use crate::transcription::{ModelAssets, ModelVersion, SpeechEngine};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Descriptive snapshot of the model asset.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ModelAsset {
    pub version: String,
    pub path: PathBuf,
    pub present: bool,
    /// Approximate total size, from configuration
    pub expected_bytes: u64,
    /// Bytes of required files currently on disk
    pub observed_bytes: u64,
}

/// Presence check and one-shot fetch for the model asset.
pub struct AssetStore {
    version: ModelVersion,
    install_dir: PathBuf,
    expected_bytes: u64,
    engine: Arc<dyn SpeechEngine>,
}

impl AssetStore {
    pub fn new(
        version: ModelVersion,
        install_dir: impl Into<PathBuf>,
        expected_bytes: u64,
        engine: Arc<dyn SpeechEngine>,
    ) -> Self {
        Self {
            version,
            install_dir: install_dir.into(),
            expected_bytes,
            engine,
        }
    }

    pub fn version(&self) -> &ModelVersion {
        &self.version
    }

    /// Root directory that holds every installed version.
    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    /// Folder of this particular version.
    pub fn asset_dir(&self) -> PathBuf {
        self.install_dir.join(self.version.folder_name())
    }

    pub fn expected_bytes(&self) -> u64 {
        self.expected_bytes
    }

    /// Path of the largest required file; the progress estimator watches it.
    pub fn target_file(&self) -> Option<PathBuf> {
        self.engine.required_files().last().map(|name| self.asset_dir().join(name))
    }

    /// True when every required file is present and non-empty. Stat only.
    pub fn exists(&self) -> bool {
        let dir = self.asset_dir();
        self.engine.required_files().iter().all(|name| {
            std::fs::metadata(dir.join(name))
                .map(|meta| meta.is_file() && meta.len() > 0)
                .unwrap_or(false)
        })
    }

    /// Installed assets, if present.
    pub fn assets(&self) -> Option<ModelAssets> {
        self.exists().then(|| ModelAssets::new(self.asset_dir()))
    }

    /// Make sure the asset is installed.
    ///
    /// Returns immediately without contacting the engine when it already is.
    /// Otherwise the engine transfers the files and the result is verified
    /// against the filesystem before it is reported as success.
    pub async fn fetch(&self) -> Result<ModelAssets, FetchError> {
        if let Some(assets) = self.assets() {
            return Ok(assets);
        }

        let destination = self.asset_dir();
        info!(version = %self.version, path = %destination.display(), "Downloading model asset");

        self.engine
            .download(&self.version, &destination)
            .await
            .map_err(|e| FetchError::Transfer(e.to_string()))?;

        match self.assets() {
            Some(assets) => {
                info!(version = %self.version, "Model asset installed");
                Ok(assets)
            }
            None => {
                let missing = self.missing_files();
                warn!(version = %self.version, ?missing, "Download finished but files are missing");
                Err(FetchError::Incomplete(format!("missing {}", missing.join(", "))))
            }
        }
    }

    /// Current snapshot, for status endpoints.
    pub fn describe(&self) -> ModelAsset {
        let dir = self.asset_dir();
        let observed_bytes = self
            .engine
            .required_files()
            .iter()
            .filter_map(|name| std::fs::metadata(dir.join(name)).ok())
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len())
            .sum();

        ModelAsset {
            version: self.version.to_string(),
            path: dir,
            present: self.exists(),
            expected_bytes: self.expected_bytes,
            observed_bytes,
        }
    }

    fn missing_files(&self) -> Vec<String> {
        let dir = self.asset_dir();
        self.engine
            .required_files()
            .iter()
            .filter(|name| {
                !std::fs::metadata(dir.join(name))
                    .map(|meta| meta.len() > 0)
                    .unwrap_or(false)
            })
            .map(|name| name.to_string())
            .collect()
    }
}
