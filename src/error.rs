//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - **Domain errors** (`FetchError`, `EngineError`, `LifecycleError`,
//!   `DecodeError`, `SupervisorError`) describe what went wrong inside the
//!   model lifecycle and the server supervisor. They are `Clone` where a single
//!   failure has to be handed to many waiting callers.
//! - **`AppError`** is what HTTP handlers return. It implements actix-web's
//!   `ResponseError`, so every failure turns into a JSON error envelope with the
//!   right status code.
//!
//! ## Error Categories:
//! - **Download / Load**: lifecycle failures, retryable by calling `ensure_ready` again
//! - **Bind**: the port is taken, the server goes to `Failed`
//! - **BadRequest / PayloadTooLarge / UnsupportedAudio**: per-request, caller's fault
//! - **ServiceUnavailable**: the model could not be made ready for this request
//! - **Inference**: the engine failed on this request; the model stays loaded

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Failure reported by the inference collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// Network or storage failure while transferring model files
    #[error("download failed: {0}")]
    Download(String),

    /// Model files are corrupt, incompatible, or do not fit in memory
    #[error("model load failed: {0}")]
    Load(String),

    /// The loaded model failed on one request
    #[error("inference failed: {0}")]
    Inference(String),
}

/// Failure of `AssetStore::fetch`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("model download failed: {0}")]
    Transfer(String),

    /// Transfer reported success but the files are not where they should be
    #[error("model files incomplete after download: {0}")]
    Incomplete(String),
}

/// Failure of `ModelLifecycleController::ensure_ready`.
///
/// Every caller that waited on the same initialization receives a clone of
/// the same value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("model download failed: {0}")]
    Download(String),

    #[error("model initialization failed: {0}")]
    Load(String),

    /// The initialization task itself died (panic or runtime shutdown)
    #[error("model initialization aborted: {0}")]
    Aborted(String),
}

impl From<FetchError> for LifecycleError {
    fn from(err: FetchError) -> Self {
        LifecycleError::Download(err.to_string())
    }
}

/// Failure of the audio decode collaborator.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unsupported audio format: {0}")]
    Unsupported(String),

    #[error("audio contains no samples")]
    Empty,

    #[error("could not convert sample rate: {0}")]
    Resample(String),

    #[error("could not read staged audio: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the server supervisor.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SupervisorError {
    /// The listener could not be bound (usually: port already in use)
    #[error("failed to bind 127.0.0.1:{port}: {reason}")]
    Bind { port: u16, reason: String },

    /// The port cannot change while the server is running
    #[error("port {port} is in use by the running server; stop it before changing the port")]
    PortLocked { port: u16 },
}

/// Errors returned by HTTP handlers.
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::BadRequest("audio field is empty".to_string()));
/// ```
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors (I/O failures, task panics, etc.)
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Upload exceeds the configured body ceiling
    PayloadTooLarge(String),

    /// Uploaded bytes are not audio we can decode
    UnsupportedAudio(String),

    /// The model is not ready and could not be made ready
    ServiceUnavailable(String),

    /// The inference engine failed for this request
    Inference(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::PayloadTooLarge(msg) => write!(f, "Payload too large: {}", msg),
            AppError::UnsupportedAudio(msg) => write!(f, "Unsupported audio: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
            AppError::Inference(msg) => write!(f, "Transcription failed: {}", msg),
        }
    }
}

impl AppError {
    /// Machine-readable error type used in the JSON envelope.
    pub fn error_type(&self) -> &'static str {
        match self {
            AppError::Internal(_) => "internal_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::PayloadTooLarge(_) => "payload_too_large",
            AppError::UnsupportedAudio(_) => "unsupported_audio",
            AppError::ServiceUnavailable(_) => "service_unavailable",
            AppError::Inference(_) => "inference_error",
        }
    }

    fn message(&self) -> &str {
        match self {
            AppError::Internal(msg)
            | AppError::BadRequest(msg)
            | AppError::PayloadTooLarge(msg)
            | AppError::UnsupportedAudio(msg)
            | AppError::ServiceUnavailable(msg)
            | AppError::Inference(msg) => msg,
        }
    }
}

/// Converts handler errors into HTTP responses.
///
/// ## HTTP Status Code Mapping:
/// - BadRequest → 400
/// - PayloadTooLarge → 413
/// - UnsupportedAudio → 422
/// - Internal / Inference → 500
/// - ServiceUnavailable → 503
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "service_unavailable",
///     "message": "model download failed: connection reset",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Internal(_) | AppError::Inference(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::UnsupportedAudio(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.error_type(),
                "message": self.message(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(format!("I/O error: {}", err))
    }
}

/// Malformed multipart bodies are always the client's fault.
impl From<actix_multipart::MultipartError> for AppError {
    fn from(err: actix_multipart::MultipartError) -> Self {
        AppError::BadRequest(format!("Multipart error: {}", err))
    }
}

impl From<LifecycleError> for AppError {
    fn from(err: LifecycleError) -> Self {
        AppError::ServiceUnavailable(err.to_string())
    }
}

impl From<DecodeError> for AppError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::Io(io) => AppError::Internal(format!("could not read staged audio: {}", io)),
            other => AppError::UnsupportedAudio(other.to_string()),
        }
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        AppError::Inference(err.to_string())
    }
}

/// Shorthand for handler results.
pub type AppResult<T> = Result<T, AppError>;
