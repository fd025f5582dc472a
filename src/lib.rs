//! # local-transcribe
//!
//! A loopback HTTP service that turns uploaded audio into text with a locally
//! cached Whisper model.
//!
//! ## Architecture:
//! - **assets**: where the model lives on disk and whether it is complete
//! - **progress**: filesystem-based download progress estimation
//! - **lifecycle**: one-time download and load of the model, shared by all callers
//! - **server**: runtime start/stop of the HTTP listener
//! - **handlers**: transcription, status and event-stream endpoints
//! - **transcription / audio**: the speech engine and audio decoder seams
//! - **events**: observable state published to any number of subscribers
//! - **config / error / state / health / middleware**: the service plumbing

pub mod assets;
pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod handlers;
pub mod health;
pub mod lifecycle;
pub mod middleware;
pub mod progress;
pub mod server;
pub mod staging;
pub mod state;
pub mod transcription;

pub use config::AppConfig;
pub use error::{AppError, AppResult};
pub use events::{DownloadProgress, EventBus, ModelStatus, ServerState, StatusEvent};
pub use lifecycle::{ModelHandle, ModelLifecycleController};
pub use server::{ServerSupervisor, SupervisorSettings};
pub use state::AppState;
