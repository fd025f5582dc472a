//! Fakes and helpers shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use local_transcribe::audio::AudioDecoder;
use local_transcribe::error::{DecodeError, EngineError};
use local_transcribe::lifecycle::ProgressSettings;
use local_transcribe::state::RequestLimits;
use local_transcribe::transcription::{LoadedModel, ModelAssets, ModelVersion, SpeechEngine};
use local_transcribe::assets::AssetStore;
use local_transcribe::{AppState, EventBus, ModelLifecycleController};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const BOUNDARY: &str = "local-transcribe-test-boundary";
const FILES: &[&str] = &["config.json", "weights.bin"];

/// Speech engine that writes dummy files and counts every call.
#[derive(Default)]
pub struct FakeEngine {
    pub downloads: AtomicUsize,
    pub loads: AtomicUsize,
    pub transcriptions: Arc<AtomicUsize>,
    pub download_delay_ms: u64,
    /// Number of upcoming loads that fail
    pub failing_loads: AtomicUsize,
    pub fail_downloads: AtomicBool,
}

impl FakeEngine {
    pub fn with_download_delay(ms: u64) -> Self {
        Self { download_delay_ms: ms, ..Self::default() }
    }
}

#[async_trait]
impl SpeechEngine for FakeEngine {
    fn required_files(&self) -> &[&'static str] {
        FILES
    }

    async fn download(&self, _version: &ModelVersion, destination: &Path) -> Result<ModelAssets, EngineError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(self.download_delay_ms)).await;
        if self.fail_downloads.load(Ordering::SeqCst) {
            return Err(EngineError::Download("network unreachable".into()));
        }
        std::fs::create_dir_all(destination).map_err(|e| EngineError::Download(e.to_string()))?;
        for name in FILES {
            std::fs::write(destination.join(name), b"fake model").map_err(|e| EngineError::Download(e.to_string()))?;
        }
        Ok(ModelAssets::new(destination))
    }

    async fn initialize(&self, _assets: &ModelAssets) -> Result<Arc<dyn LoadedModel>, EngineError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        if self
            .failing_loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(EngineError::Load("weights are corrupt".into()));
        }
        Ok(Arc::new(EchoModel { calls: self.transcriptions.clone() }))
    }
}

/// Turns samples back into the bytes they were decoded from.
pub struct EchoModel {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl LoadedModel for EchoModel {
    async fn transcribe(&self, samples: Vec<f32>, language: Option<String>) -> Result<String, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let text: String = samples.iter().map(|&s| s as u8 as char).collect();
        if text == "FAIL" {
            return Err(EngineError::Inference("model produced NaNs".into()));
        }
        Ok(match language {
            Some(lang) => format!("[{}] {}", lang, text),
            None => text,
        })
    }
}

/// Every byte becomes one sample. Files starting with `BAD` are rejected.
pub struct ByteDecoder;

impl AudioDecoder for ByteDecoder {
    fn decode(&self, path: &Path) -> Result<Vec<f32>, DecodeError> {
        let bytes = std::fs::read(path)?;
        if bytes.starts_with(b"BAD") {
            return Err(DecodeError::Unsupported("not RIFF".into()));
        }
        Ok(bytes.into_iter().map(f32::from).collect())
    }
}

pub struct Harness {
    pub state: AppState,
    pub engine: Arc<FakeEngine>,
    pub staging_dir: PathBuf,
    _dir: TempDir,
}

impl Harness {
    pub fn new(engine: FakeEngine) -> Self {
        Self::with_limit(engine, 1024 * 1024)
    }

    pub fn with_limit(engine: FakeEngine, max_body_bytes: u64) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(engine);
        let events = EventBus::new(64);
        let store = AssetStore::new(ModelVersion::new("test/model", "main"), dir.path().join("models"), 20, engine.clone());
        let lifecycle = ModelLifecycleController::with_progress_settings(
            store,
            engine.clone(),
            events.clone(),
            ProgressSettings { interval: Duration::from_millis(10), min_temp_file_bytes: u64::MAX, temp_dir: None },
        );
        let staging_dir = dir.path().join("staging");
        let state = AppState::new(
            lifecycle,
            Arc::new(ByteDecoder),
            events,
            RequestLimits { max_body_bytes, staging_dir: staging_dir.clone() },
        );

        Self { state, engine, staging_dir, _dir: dir }
    }

    /// Files currently left in the staging directory.
    pub fn staged_files(&self) -> usize {
        std::fs::read_dir(&self.staging_dir).map(|entries| entries.count()).unwrap_or(0)
    }
}

/// Build a `multipart/form-data` body. The `audio` part gets a filename.
pub fn multipart_body(parts: &[(&str, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, data) in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        if *name == "audio" {
            body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"clip.wav\"\r\nContent-Type: audio/wav\r\n\r\n",
                    name
                )
                .as_bytes(),
            );
        } else {
            body.extend_from_slice(format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes());
        }
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

pub fn multipart_content_type() -> String {
    format!("multipart/form-data; boundary={}", BOUNDARY)
}
