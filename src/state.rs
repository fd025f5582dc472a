//! # Application State Management
//!
//! Shared state handed to every HTTP handler through `web::Data<AppState>`.
//!
//! ## What lives here:
//! - **lifecycle**: the model controller; handlers ask it for a ready model
//! - **decoder**: turns staged uploads into samples
//! - **events**: the status event bus (the SSE endpoint subscribes to it)
//! - **limits**: body ceiling and staging directory for uploads
//! - **metrics**: request counters, updated by the metrics middleware
//!
//! The server's own lifecycle state is deliberately not in here. The
//! `ServerSupervisor` owns it and registers a read-only [`ServerStateView`]
//! as separate app data on the apps it builds.
//!
//! ## Locking:
//! `AppState` is cloned into every actix worker, so everything mutable sits
//! behind `Arc`. Metrics use a `RwLock`: many readers (health checks), one
//! writer per finished request. Lock poisoning is ignored because counters
//! stay meaningful even if a writer panicked mid-update.

use crate::audio::AudioDecoder;
use crate::config::AppConfig;
use crate::events::{EventBus, ServerState};
use crate::lifecycle::ModelLifecycleController;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tokio::sync::watch;

/// Per-request limits for the transcription endpoint.
#[derive(Debug, Clone)]
pub struct RequestLimits {
    /// Largest accepted upload in bytes
    pub max_body_bytes: u64,
    /// Where uploads are staged before decoding
    pub staging_dir: PathBuf,
}

impl RequestLimits {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_body_bytes: config.server.max_body_bytes,
            staging_dir: config.staging.dir.clone(),
        }
    }
}

/// The main application state shared across all HTTP request handlers.
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: ModelLifecycleController,
    pub decoder: Arc<dyn AudioDecoder>,
    pub events: EventBus,
    pub limits: RequestLimits,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub start_time: Instant,
}

/// Request counters collected across all HTTP requests.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Requests that ended with a 4xx or 5xx status
    pub error_count: u64,

    /// Transcriptions currently in flight
    pub active_transcriptions: u32,

    /// Key: endpoint name (e.g., "POST /transcribe")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Counters for one endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(
        lifecycle: ModelLifecycleController,
        decoder: Arc<dyn AudioDecoder>,
        events: EventBus,
        limits: RequestLimits,
    ) -> Self {
        Self {
            lifecycle,
            decoder,
            events,
            limits,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    fn metrics_read(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn metrics_write(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Called by the metrics middleware for every request.
    pub fn increment_request_count(&self) {
        self.metrics_write().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_write().error_count += 1;
    }

    /// Record the outcome of one request against its endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_write();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Count a transcription as in flight until the returned guard drops.
    pub fn track_transcription(&self) -> TranscriptionGuard {
        self.metrics_write().active_transcriptions += 1;
        TranscriptionGuard { metrics: self.metrics.clone() }
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Decrements the in-flight transcription gauge on drop.
pub struct TranscriptionGuard {
    metrics: Arc<RwLock<AppMetrics>>,
}

impl Drop for TranscriptionGuard {
    fn drop(&mut self) {
        let mut metrics = self.metrics.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        metrics.active_transcriptions = metrics.active_transcriptions.saturating_sub(1);
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

/// Read-only view of the server's lifecycle state, registered as app data
/// by the supervisor.
#[derive(Debug, Clone)]
pub struct ServerStateView {
    receiver: watch::Receiver<ServerState>,
    port: u16,
}

impl ServerStateView {
    pub fn new(receiver: watch::Receiver<ServerState>, port: u16) -> Self {
        Self { receiver, port }
    }

    pub fn current(&self) -> ServerState {
        self.receiver.borrow().clone()
    }

    /// Resolves once the server is no longer starting or running.
    pub fn stopping(&self) -> impl std::future::Future<Output = ()> + 'static {
        let mut receiver = self.receiver.clone();
        async move {
            // A dropped sender means the server is gone as well
            let _ = receiver
                .wait_for(|state| !matches!(state, ServerState::Starting | ServerState::Running))
                .await;
        }
    }

    /// Port the serving listener is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }
}
