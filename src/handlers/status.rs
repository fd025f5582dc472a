//! Status snapshot, live event stream and background model preparation.

use crate::assets::ModelAsset;
use crate::events::{DownloadProgress, ModelStatus, ServerState, StatusEvent};
use crate::state::{AppState, ServerStateView};
use actix_web::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use actix_web::{web, HttpResponse};
use futures_util::{stream, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub server: ServerState,
    pub model: ModelStatus,
    pub download: DownloadProgress,
    pub asset: ModelAsset,
}

/// `GET /api/v1/status`
pub async fn status(state: web::Data<AppState>, server: web::Data<ServerStateView>) -> HttpResponse {
    HttpResponse::Ok().json(StatusSnapshot {
        server: server.current(),
        model: state.lifecycle.status(),
        download: state.lifecycle.progress(),
        asset: state.lifecycle.asset(),
    })
}

/// `GET /api/v1/events`
///
/// Server-Sent Events. The stream opens with the current state of each
/// component, then forwards every transition. Subscribers that fall behind
/// skip the events they missed. The stream ends when the server starts
/// stopping, so open subscribers never hold up a graceful shutdown.
pub async fn events(state: web::Data<AppState>, server: web::Data<ServerStateView>) -> HttpResponse {
    // Subscribe before taking the snapshot so nothing falls in between.
    let receiver = state.events.subscribe();
    let snapshot = vec![
        StatusEvent::Server(server.current()),
        StatusEvent::Model(state.lifecycle.status()),
        StatusEvent::Download(state.lifecycle.progress()),
    ];

    let updates = BroadcastStream::new(receiver).filter_map(|item| async move {
        match item {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                debug!(skipped, "Event stream subscriber lagged");
                None
            }
        }
    });

    let body = stream::iter(snapshot)
        .chain(updates)
        .filter_map(|event| async move { sse_frame(&event) })
        .map(Ok::<_, Infallible>)
        .take_until(server.stopping());

    HttpResponse::Ok()
        .insert_header((CONTENT_TYPE, "text/event-stream"))
        .insert_header((CACHE_CONTROL, "no-cache"))
        .streaming(body)
}

/// `POST /api/v1/model/prepare`
pub async fn prepare(state: web::Data<AppState>) -> HttpResponse {
    let status = state.lifecycle.status();
    if status.is_ready() {
        return HttpResponse::Ok().json(json!({
            "status": status,
            "message": "Model is already loaded"
        }));
    }

    state.lifecycle.prepare_in_background();
    HttpResponse::Accepted().json(json!({
        "status": status,
        "message": "Model preparation started"
    }))
}

fn sse_frame(event: &StatusEvent) -> Option<web::Bytes> {
    let kind = match event {
        StatusEvent::Server(_) => "server",
        StatusEvent::Model(_) => "model",
        StatusEvent::Download(_) => "download",
    };
    match serde_json::to_string(event) {
        Ok(data) => Some(web::Bytes::from(format!("event: {}\ndata: {}\n\n", kind, data))),
        Err(e) => {
            warn!("Failed to serialize status event: {}", e);
            None
        }
    }
}
