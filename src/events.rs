//! # Status Events
//!
//! Observable state of the service and the channel it is published on.
//!
//! Owners publish, everyone else observes:
//! - `ServerState` is owned by the `ServerSupervisor`
//! - `ModelStatus` and `DownloadProgress` are owned by the `ModelLifecycleController`
//!
//! Each owner keeps its latest value in a `tokio::sync::watch` channel (for
//! "what is it now?" queries) and additionally emits every transition on the
//! shared [`EventBus`] (for "tell me whenever it changes"). Nothing here knows
//! about rendering; the HTTP event stream and the log lines in `main` are just
//! two subscribers.

use serde::Serialize;
use tokio::sync::broadcast;

/// Highest fraction the estimator may report before the download is confirmed.
pub const MAX_ESTIMATED_FRACTION: f64 = 0.98;

/// Lifecycle of the HTTP listener.
///
/// ## State Transitions:
/// Idle → Starting → Running → Stopping → Idle
/// Starting → Failed (bind error); Failed → Starting (retry)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ServerState {
    Idle,
    Starting,
    Running,
    Stopping,
    Failed(String),
}

impl ServerState {
    pub fn is_running(&self) -> bool {
        matches!(self, ServerState::Running)
    }

    /// Short label used in logs and health output.
    pub fn label(&self) -> &'static str {
        match self {
            ServerState::Idle => "idle",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Stopping => "stopping",
            ServerState::Failed(_) => "failed",
        }
    }
}

/// Current phase of the single speech model.
///
/// ## State Transitions:
/// Absent → Downloading → Loading → Ready
/// Installed → Loading → Ready
/// Downloading | Loading → Failed; Failed → Downloading | Loading (retry)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ModelStatus {
    /// No model files on disk
    Absent,
    /// Files are on disk but nothing is loaded yet
    Installed,
    /// Files are being transferred
    Downloading,
    /// Files are on disk and being loaded into memory
    Loading,
    /// Model loaded and accepting transcriptions
    Ready { loaded_at: String },
    /// Last initialization attempt failed
    Failed { message: String },
}

impl ModelStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, ModelStatus::Ready { .. })
    }

    pub fn is_preparing(&self) -> bool {
        matches!(self, ModelStatus::Downloading | ModelStatus::Loading)
    }

    /// Human-readable status description.
    pub fn description(&self) -> String {
        match self {
            ModelStatus::Absent => "Not downloaded".to_string(),
            ModelStatus::Installed => "Downloaded but not loaded".to_string(),
            ModelStatus::Downloading => "Downloading".to_string(),
            ModelStatus::Loading => "Loading into memory".to_string(),
            ModelStatus::Ready { .. } => "Ready for transcription".to_string(),
            ModelStatus::Failed { message } => format!("Error: {}", message),
        }
    }
}

/// Approximate progress of the current model download.
///
/// `fraction` stays within `[0, 0.98]` while downloading. It becomes exactly
/// `1.0` only through [`DownloadProgress::completed`], which the lifecycle
/// controller calls after the transfer has been confirmed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadProgress {
    pub fraction: f64,
    pub message: String,
}

impl DownloadProgress {
    pub fn idle() -> Self {
        Self { fraction: 0.0, message: "No download in progress".to_string() }
    }

    pub fn started() -> Self {
        Self { fraction: 0.0, message: "Downloading model".to_string() }
    }

    /// An estimate from the progress poller. Clamped to `[0, 0.98]`.
    pub fn estimated(fraction: f64) -> Self {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, MAX_ESTIMATED_FRACTION)
        } else {
            0.0
        };
        Self {
            fraction,
            message: format!("Downloading model ({:.0}%)", fraction * 100.0),
        }
    }

    pub fn completed() -> Self {
        Self { fraction: 1.0, message: "Download complete".to_string() }
    }

    pub fn failed(reason: &str) -> Self {
        Self { fraction: 0.0, message: format!("Download failed: {}", reason) }
    }
}

/// A single observable transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum StatusEvent {
    Server(ServerState),
    Model(ModelStatus),
    Download(DownloadProgress),
}

/// Fan-out channel for [`StatusEvent`]s.
///
/// Cloning the bus is cheap; all clones publish into the same channel.
/// Slow subscribers lose the oldest events rather than blocking publishers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StatusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: StatusEvent) {
        tracing::trace!(?event, "status event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimated_fraction_is_capped() {
        assert_eq!(DownloadProgress::estimated(1.5).fraction, MAX_ESTIMATED_FRACTION);
        assert_eq!(DownloadProgress::estimated(-0.2).fraction, 0.0);
        assert_eq!(DownloadProgress::estimated(f64::NAN).fraction, 0.0);
        assert_eq!(DownloadProgress::completed().fraction, 1.0);
        assert_eq!(DownloadProgress::failed("boom").fraction, 0.0);
    }

    #[test]
    fn test_server_state_serialization() {
        let json = serde_json::to_value(ServerState::Failed("port busy".into())).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["reason"], "port busy");

        let json = serde_json::to_value(ServerState::Running).unwrap();
        assert_eq!(json["state"], "running");
    }

    #[tokio::test]
    async fn test_bus_delivers_to_all_subscribers() {
        let bus = EventBus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(StatusEvent::Server(ServerState::Starting));

        assert_eq!(first.recv().await.unwrap(), StatusEvent::Server(ServerState::Starting));
        assert_eq!(second.recv().await.unwrap(), StatusEvent::Server(ServerState::Starting));
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.publish(StatusEvent::Model(ModelStatus::Absent));
    }
}
