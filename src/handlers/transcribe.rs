//! `POST /transcribe`: multipart upload in, plain text out.
//!
//! ## Request:
//! `multipart/form-data` with
//! - `audio` (required): the audio file, streamed to disk chunk by chunk
//! - `language` (optional): ISO 639-1 hint such as `en`
//!
//! ## Pipeline:
//! 1. Reject bodies whose `Content-Length` exceeds the ceiling (413)
//! 2. Stage `audio` into `upload-<uuid>` in the staging dir, counting bytes (413 if the header lied)
//! 3. Missing or empty audio → 400, before the model is touched
//! 4. Wait for a ready model (503 if it cannot be made ready)
//! 5. Decode on the blocking pool (422 if undecodable)
//! 6. Transcribe (500 on engine failure)
//!
//! Requests that arrive while the model is still downloading or loading are
//! held at step 4 until initialization finishes, then served.

use crate::error::{AppError, AppResult};
use crate::staging::StagedUpload;
use crate::state::AppState;
use actix_multipart::{Field, Multipart};
use actix_web::http::header::CONTENT_LENGTH;
use actix_web::{web, HttpRequest, HttpResponse};
use futures_util::StreamExt;
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, info};

/// Longest accepted `language` field value.
const MAX_LANGUAGE_BYTES: usize = 16;

#[derive(Debug, Serialize)]
pub struct TranscriptionResponse {
    pub text: String,
}

/// Parsed multipart body. Dropping it removes any staged audio.
#[derive(Debug, Default)]
struct TranscriptionUpload {
    audio: Option<StagedUpload>,
    language: Option<String>,
}

pub async fn transcribe(
    req: HttpRequest,
    payload: Multipart,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    // Multipart ignores actix's PayloadConfig, so the ceiling is enforced here
    let limit = state.limits.max_body_bytes;

    if let Some(declared) = declared_length(&req) {
        if declared > limit {
            return Err(too_large(limit));
        }
    }

    let started = Instant::now();
    let upload = read_upload(payload, &state, limit).await?;

    let audio = match upload.audio {
        Some(audio) if !audio.is_empty() => audio,
        _ => return Err(AppError::BadRequest("missing or empty 'audio' field".to_string())),
    };
    let bytes = audio.len();

    let _in_flight = state.track_transcription();
    let result = run_transcription(&state, &audio, upload.language).await;
    audio.remove().await;

    let text = result?;
    info!(
        bytes,
        chars = text.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Transcription completed"
    );

    Ok(HttpResponse::Ok().json(TranscriptionResponse { text }))
}

async fn run_transcription(state: &AppState, audio: &StagedUpload, language: Option<String>) -> AppResult<String> {
    let model = state.lifecycle.ensure_ready().await?;

    let decoder = state.decoder.clone();
    let path = audio.path().to_path_buf();
    let samples = tokio::task::spawn_blocking(move || decoder.decode(&path))
        .await
        .map_err(|e| AppError::Internal(format!("decode task failed: {}", e)))??;

    debug!(samples = samples.len(), ?language, "Decoded upload");
    Ok(model.transcribe(samples, language).await?)
}

async fn read_upload(mut payload: Multipart, state: &AppState, limit: u64) -> AppResult<TranscriptionUpload> {
    let mut upload = TranscriptionUpload::default();
    let mut received: u64 = 0;

    while let Some(item) = payload.next().await {
        let mut field = item?;
        let name = field
            .content_disposition()
            .and_then(|cd| cd.get_name())
            .map(|name| name.to_string());

        match name.as_deref() {
            Some("audio") => {
                if upload.audio.is_some() {
                    return Err(AppError::BadRequest("more than one 'audio' field".to_string()));
                }
                upload.audio = stage_audio(&mut field, state, limit, &mut received).await?;
            }
            Some("language") => {
                let value = read_small_field(&mut field, limit, &mut received).await?;
                let value = value.trim();
                if !value.is_empty() {
                    upload.language = Some(value.to_string());
                }
            }
            _ => {
                while let Some(chunk) = field.next().await {
                    count_bytes(&mut received, chunk?.len(), limit)?;
                }
            }
        }
    }

    Ok(upload)
}

/// Stream the audio field to disk. The file is only created once the first
/// non-empty chunk arrives, so an empty field never touches the staging dir.
async fn stage_audio(
    field: &mut Field,
    state: &AppState,
    limit: u64,
    received: &mut u64,
) -> AppResult<Option<StagedUpload>> {
    let mut staged: Option<StagedUpload> = None;

    while let Some(chunk) = field.next().await {
        let chunk = chunk?;
        if chunk.is_empty() {
            continue;
        }
        count_bytes(received, chunk.len(), limit)?;

        if staged.is_none() {
            staged = Some(StagedUpload::create(&state.limits.staging_dir).await?);
        }
        if let Some(file) = staged.as_mut() {
            file.write_chunk(&chunk).await?;
        }
    }

    if let Some(file) = staged.as_mut() {
        file.finish().await?;
    }
    Ok(staged)
}

async fn read_small_field(field: &mut Field, limit: u64, received: &mut u64) -> AppResult<String> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk?;
        count_bytes(received, chunk.len(), limit)?;
        bytes.extend_from_slice(&chunk);
        if bytes.len() > MAX_LANGUAGE_BYTES {
            return Err(AppError::BadRequest("'language' field is too long".to_string()));
        }
    }
    String::from_utf8(bytes).map_err(|_| AppError::BadRequest("'language' field is not UTF-8".to_string()))
}

fn count_bytes(received: &mut u64, chunk_len: usize, limit: u64) -> AppResult<()> {
    *received += chunk_len as u64;
    if *received > limit {
        return Err(too_large(limit));
    }
    Ok(())
}

fn declared_length(req: &HttpRequest) -> Option<u64> {
    req.headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

fn too_large(limit: u64) -> AppError {
    AppError::PayloadTooLarge(format!("upload exceeds the {} byte limit", limit))
}
