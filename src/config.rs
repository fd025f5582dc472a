//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP__ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `PORT` environment variable (deployment convenience)
//! 2. Environment variables (APP__SERVER__PORT, APP__MODEL__REPO, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Why the server has no `host` field:
//! The transcription endpoint is loopback-only. The bind address is fixed to
//! 127.0.0.1 in the supervisor, so there is nothing to configure here.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

/// Default listening port for the transcription endpoint.
pub const DEFAULT_PORT: u16 = 1643;

/// Default request body ceiling: 4 GiB.
///
/// Multi-minute uncompressed audio easily exceeds the usual few-megabyte
/// defaults of HTTP frameworks, so the ceiling is always set explicitly.
pub const DEFAULT_MAX_BODY_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Main application configuration that contains all settings.
///
/// ## Sections:
/// - `server`: listener port and request limits
/// - `model`: which speech model to fetch and where it is installed
/// - `progress`: tuning of the download progress estimator
/// - `staging`: where uploaded audio is written before transcription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub progress: ProgressConfig,
    pub staging: StagingConfig,
}

/// Server-specific configuration settings.
///
/// ## Fields:
/// - `port`: TCP port on 127.0.0.1 (default 1643)
/// - `max_body_bytes`: largest accepted upload, counted by the transcribe handler as it streams
/// - `shutdown_timeout_secs`: grace period for in-flight requests on stop
/// - `workers`: number of HTTP worker threads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub max_body_bytes: u64,
    pub shutdown_timeout_secs: u64,
    pub workers: usize,
}

/// Speech model configuration.
///
/// ## Fields:
/// - `repo`: HuggingFace repository id, e.g. "openai/whisper-base"
/// - `revision`: branch or commit of the repository
/// - `install_dir`: directory the model asset is installed into (hf-hub cache layout)
/// - `expected_size_bytes`: approximate total download size, used only for progress estimation
/// - `prepare_on_start`: download and load the model before the server starts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub repo: String,
    pub revision: String,
    pub install_dir: PathBuf,
    pub expected_size_bytes: u64,
    pub prepare_on_start: bool,
}

/// Download progress estimator tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// How often the filesystem is scanned while downloading
    pub poll_interval_ms: u64,
    /// Files in the system temp dir smaller than this are ignored
    pub min_temp_file_bytes: u64,
}

/// Upload staging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Scoped temporary directory for uploaded audio
    pub dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                port: DEFAULT_PORT,
                max_body_bytes: DEFAULT_MAX_BODY_BYTES,
                shutdown_timeout_secs: 30,
                workers: 2,
            },
            model: ModelConfig {
                repo: "openai/whisper-base".to_string(),
                revision: "main".to_string(),
                install_dir: default_data_dir().join("models"),
                expected_size_bytes: 292_000_000, // safetensors + tokenizer + config
                prepare_on_start: true,
            },
            progress: ProgressConfig {
                poll_interval_ms: 500,
                min_temp_file_bytes: 1024 * 1024,
            },
            staging: StagingConfig {
                dir: env::temp_dir().join("local-transcribe-uploads"),
            },
        }
    }
}

/// Base directory for persistent data (`$XDG_DATA_HOME`, `$HOME/.local/share`, or the working dir).
fn default_data_dir() -> PathBuf {
    if let Ok(xdg) = env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg).join("local-transcribe");
    }
    match env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".local").join("share").join("local-transcribe"),
        Err(_) => PathBuf::from(".local-transcribe"),
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVER__PORT=3000`: Override server port
    /// - `APP__MODEL__REPO=openai/whisper-tiny`: Use a smaller model
    /// - `PORT=3000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        Self::load_from("config")
    }

    /// Same as [`AppConfig::load`] but with an explicit config file stem.
    pub fn load_from(file_stem: &str) -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name(file_stem).required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__"),
            );

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings
            .build()
            .context("failed to assemble configuration sources")?
            .try_deserialize()
            .context("configuration has invalid values")?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0 (an ephemeral port would be unreachable for clients)
    /// - Body ceiling, worker count and poll interval are non-zero
    /// - A model repository is named
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.server.max_body_bytes == 0 {
            return Err(anyhow::anyhow!("Request body ceiling must be greater than 0"));
        }

        if self.server.workers == 0 {
            return Err(anyhow::anyhow!("Worker count must be greater than 0"));
        }

        if self.progress.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("Progress poll interval must be greater than 0"));
        }

        if self.model.repo.trim().is_empty() {
            return Err(anyhow::anyhow!("Model repository cannot be empty"));
        }

        if self.model.expected_size_bytes == 0 {
            return Err(anyhow::anyhow!("Expected model size must be greater than 0"));
        }

        Ok(())
    }

    /// Persist the configuration as TOML (used when the user picks a new port).
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let rendered = toml::to_string_pretty(self).context("failed to serialize configuration")?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        std::fs::write(path, rendered)
            .with_context(|| format!("failed to write configuration to {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 1643);
        assert_eq!(config.server.max_body_bytes, 4 * 1024 * 1024 * 1024);
        assert_eq!(config.progress.poll_interval_ms, 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.model.repo = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.progress.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_roundtrips_through_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = AppConfig::default();
        config.server.port = 9090;
        config.save_to(&path).unwrap();

        let stem = dir.path().join("config");
        let loaded = AppConfig::load_from(stem.to_str().unwrap()).unwrap();
        assert_eq!(loaded.server.port, 9090);
        assert_eq!(loaded.model.repo, config.model.repo);
    }
}
