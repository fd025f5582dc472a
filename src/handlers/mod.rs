pub mod status;
pub mod transcribe;

pub use status::*;
pub use transcribe::*;

use crate::health;
use actix_web::web;

/// Register every route on an app.
///
/// `/transcribe` and `/health` also exist at the root so simple clients can
/// use short URLs.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/health", web::get().to(health::health_check))
            .route("/metrics", web::get().to(health::detailed_metrics))
            .route("/status", web::get().to(status::status))
            .route("/events", web::get().to(status::events))
            .route("/model/prepare", web::post().to(status::prepare))
            .route("/transcribe", web::post().to(transcribe::transcribe)),
    )
    .route("/health", web::get().to(health::health_check))
    .route("/transcribe", web::post().to(transcribe::transcribe));
}
