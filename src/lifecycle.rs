//! # Model Lifecycle Controller
//!
//! Owns the one speech model: downloads it if it is absent, loads it, and
//! hands out [`ModelHandle`]s once it is ready.
//!
//! ## Concurrency contract:
//! - While no model is loaded, any number of concurrent [`ensure_ready`]
//!   calls trigger exactly one download-then-load sequence. Every caller
//!   receives a clone of the same outcome (same handle or same error).
//! - The sequence runs on its own task. A caller that goes away (for example
//!   an HTTP client that disconnects) does not cancel it.
//! - Once ready, `ensure_ready` returns the cached handle without waiting.
//!   Transcriptions do not go through the controller at all after that.
//! - A failed sequence leaves the controller retryable: the next call starts
//!   a fresh attempt. Files already on disk are not downloaded again.
//!
//! ## State Transitions:
//! ```text
//! Idle ──ensure_ready──► Initializing(shared) ──ok──► Ready(handle)
//!                              │
//!                              └──err──► Idle (status Failed)
//! ```
//!
//! [`ensure_ready`]: ModelLifecycleController::ensure_ready

use crate::assets::{AssetStore, ModelAsset};
use crate::config::AppConfig;
use crate::error::{EngineError, LifecycleError};
use crate::events::{DownloadProgress, EventBus, ModelStatus, StatusEvent};
use crate::progress::{ProgressEstimator, ScanSources};
use crate::transcription::{LoadedModel, ModelAssets, ModelVersion, SpeechEngine};
use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Capability to run transcriptions on the loaded model.
///
/// Only the controller creates these, and only after a successful load.
/// Clones share the same underlying model.
#[derive(Clone)]
pub struct ModelHandle {
    id: Uuid,
    loaded_at: DateTime<Utc>,
    model: Arc<dyn LoadedModel>,
}

impl ModelHandle {
    fn new(model: Arc<dyn LoadedModel>) -> Self {
        Self { id: Uuid::new_v4(), loaded_at: Utc::now(), model }
    }

    /// Identity of the load that produced this handle.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub async fn transcribe(&self, samples: Vec<f32>, language: Option<String>) -> Result<String, EngineError> {
        self.model.transcribe(samples, language).await
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("id", &self.id)
            .field("loaded_at", &self.loaded_at)
            .finish()
    }
}

/// Progress poller settings used during downloads.
#[derive(Debug, Clone)]
pub struct ProgressSettings {
    pub interval: Duration,
    pub min_temp_file_bytes: u64,
    /// Scanned for large staging files; `None` disables that source
    pub temp_dir: Option<PathBuf>,
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            min_temp_file_bytes: 1024 * 1024,
            temp_dir: Some(std::env::temp_dir()),
        }
    }
}

type InitFuture = Shared<BoxFuture<'static, Result<ModelHandle, LifecycleError>>>;

enum Phase {
    Idle,
    Initializing(InitFuture),
    Ready(ModelHandle),
}

struct Inner {
    store: AssetStore,
    engine: Arc<dyn SpeechEngine>,
    progress_settings: ProgressSettings,
    phase: Mutex<Phase>,
    downloading: AtomicBool,
    status: watch::Sender<ModelStatus>,
    progress: watch::Sender<DownloadProgress>,
    events: EventBus,
}

/// Single owner of the model's lifecycle. Cheap to clone.
#[derive(Clone)]
pub struct ModelLifecycleController {
    inner: Arc<Inner>,
}

impl ModelLifecycleController {
    pub fn new(store: AssetStore, engine: Arc<dyn SpeechEngine>, events: EventBus) -> Self {
        Self::with_progress_settings(store, engine, events, ProgressSettings::default())
    }

    pub fn with_progress_settings(
        store: AssetStore,
        engine: Arc<dyn SpeechEngine>,
        events: EventBus,
        progress_settings: ProgressSettings,
    ) -> Self {
        let initial = if store.exists() { ModelStatus::Installed } else { ModelStatus::Absent };
        let (status, _) = watch::channel(initial);
        let (progress, _) = watch::channel(DownloadProgress::idle());

        Self {
            inner: Arc::new(Inner {
                store,
                engine,
                progress_settings,
                phase: Mutex::new(Phase::Idle),
                downloading: AtomicBool::new(false),
                status,
                progress,
                events,
            }),
        }
    }

    /// Build the controller described by the `model` and `progress` config sections.
    pub fn from_config(config: &AppConfig, engine: Arc<dyn SpeechEngine>, events: EventBus) -> Self {
        let store = AssetStore::new(
            ModelVersion::new(&config.model.repo, &config.model.revision),
            &config.model.install_dir,
            config.model.expected_size_bytes,
            engine.clone(),
        );
        let settings = ProgressSettings {
            interval: Duration::from_millis(config.progress.poll_interval_ms),
            min_temp_file_bytes: config.progress.min_temp_file_bytes,
            temp_dir: Some(std::env::temp_dir()),
        };
        Self::with_progress_settings(store, engine, events, settings)
    }

    /// Get a ready model, downloading and loading it first if needed.
    ///
    /// Suspends until the (possibly shared) initialization finishes.
    pub async fn ensure_ready(&self) -> Result<ModelHandle, LifecycleError> {
        let pending = {
            let mut phase = self.inner.lock_phase();
            match &*phase {
                Phase::Ready(handle) => return Ok(handle.clone()),
                Phase::Initializing(pending) => pending.clone(),
                Phase::Idle => {
                    let pending = self.start_initialization();
                    *phase = Phase::Initializing(pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    /// Kick off `ensure_ready` without waiting for it.
    pub fn prepare_in_background(&self) {
        let controller = self.clone();
        tokio::spawn(async move {
            if let Err(e) = controller.ensure_ready().await {
                warn!("Background model preparation failed: {}", e);
            }
        });
    }

    pub fn status(&self) -> ModelStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ModelStatus> {
        self.inner.status.subscribe()
    }

    pub fn progress(&self) -> DownloadProgress {
        self.inner.progress.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(&*self.inner.lock_phase(), Phase::Ready(_))
    }

    pub fn is_downloading(&self) -> bool {
        self.inner.downloading.load(Ordering::SeqCst)
    }

    pub fn asset(&self) -> ModelAsset {
        self.inner.store.describe()
    }

    /// Must be called with the phase lock held.
    fn start_initialization(&self) -> InitFuture {
        let inner = self.inner.clone();
        let task = tokio::spawn(inner.clone().run_initialization());

        async move {
            match task.await {
                Ok(result) => result,
                Err(join_error) => {
                    error!("Model initialization task died: {}", join_error);
                    let err = LifecycleError::Aborted(join_error.to_string());
                    let mut phase = inner.lock_phase();
                    if matches!(&*phase, Phase::Initializing(_)) {
                        *phase = Phase::Idle;
                        inner.downloading.store(false, Ordering::SeqCst);
                        inner.set_status(ModelStatus::Failed { message: err.to_string() });
                    }
                    Err(err)
                }
            }
        }
        .boxed()
        .shared()
    }
}

impl Inner {
    fn lock_phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_status(&self, status: ModelStatus) {
        self.status.send_replace(status.clone());
        self.events.publish(StatusEvent::Model(status));
    }

    fn set_progress(&self, progress: DownloadProgress) {
        self.progress.send_replace(progress.clone());
        self.events.publish(StatusEvent::Download(progress));
    }

    async fn run_initialization(self: Arc<Self>) -> Result<ModelHandle, LifecycleError> {
        let result = self.download_and_load().await;

        let mut phase = self.lock_phase();
        match &result {
            Ok(handle) => {
                info!(model = %self.store.version(), handle = %handle.id(), "Model ready");
                *phase = Phase::Ready(handle.clone());
                self.set_status(ModelStatus::Ready { loaded_at: handle.loaded_at().to_rfc3339() });
            }
            Err(e) => {
                error!(model = %self.store.version(), "Model initialization failed: {}", e);
                *phase = Phase::Idle;
                self.set_status(ModelStatus::Failed { message: e.to_string() });
            }
        }
        result
    }

    async fn download_and_load(&self) -> Result<ModelHandle, LifecycleError> {
        let assets = match self.store.assets() {
            Some(assets) => assets,
            None => self.download().await?,
        };

        self.set_status(ModelStatus::Loading);
        info!(path = %assets.dir().display(), "Loading model");

        let model = self
            .engine
            .initialize(&assets)
            .await
            .map_err(|e| LifecycleError::Load(e.to_string()))?;

        Ok(ModelHandle::new(model))
    }

    async fn download(&self) -> Result<ModelAssets, LifecycleError> {
        self.downloading.store(true, Ordering::SeqCst);
        self.set_status(ModelStatus::Downloading);
        self.set_progress(DownloadProgress::started());

        let sources = ScanSources {
            target_file: self.store.target_file(),
            install_dir: self.store.asset_dir(),
            temp_dir: self.progress_settings.temp_dir.clone(),
            min_temp_file_bytes: self.progress_settings.min_temp_file_bytes,
        };
        let progress_tx = self.progress.clone();
        let events = self.events.clone();
        let poller = ProgressEstimator::new(sources, self.store.expected_bytes(), self.progress_settings.interval)
            .spawn(move |progress| {
                progress_tx.send_replace(progress.clone());
                events.publish(StatusEvent::Download(progress));
            });

        let result = self.store.fetch().await;
        poller.stop().await;

        match &result {
            Ok(_) => self.set_progress(DownloadProgress::completed()),
            Err(e) => self.set_progress(DownloadProgress::failed(&e.to_string())),
        }
        self.downloading.store(false, Ordering::SeqCst);

        result.map_err(LifecycleError::from)
    }
}
