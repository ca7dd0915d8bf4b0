//! Restore endpoints.

use std::io::Cursor;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use testvault_core::{RestoreResult, RestoreSource};

use crate::error::AppError;
use crate::json::{CandidatesResponse, RestoreRequest};
use crate::AppState;

/// Restore routes. Uploads accept bodies up to `max_upload_bytes`.
pub fn routes(max_upload_bytes: usize) -> Router<AppState> {
    Router::new()
        .route(
            "/admin/restore/uploads",
            post(handle_upload).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .route("/admin/restore/uploads/:id", delete(handle_discard_upload))
        .route("/admin/restore/generations/:name", get(handle_preview_generation))
        .route("/admin/restore/commit", post(handle_commit))
}

/// Stage an uploaded archive and list what it offers.
async fn handle_upload(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<CandidatesResponse>, AppError> {
    if body.is_empty() {
        return Err(AppError::BadRequest("empty upload".to_string()));
    }

    let (staged, candidates) = state
        .blocking(move |state| state.restorer.stage_and_preview(Cursor::new(body)))
        .await?;
    Ok(Json(CandidatesResponse {
        upload_id: Some(staged.upload_id),
        candidates,
    }))
}

/// Drop a staged upload without restoring from it.
async fn handle_discard_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state
        .blocking(move |state| state.restorer.discard_upload(&id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// List what a generation offers.
async fn handle_preview_generation(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<CandidatesResponse>, AppError> {
    let candidates = state
        .blocking(move |state| state.restorer.preview(&RestoreSource::Generation(name)))
        .await?;
    Ok(Json(CandidatesResponse {
        upload_id: None,
        candidates,
    }))
}

/// Import the selected records.
async fn handle_commit(
    State(state): State<AppState>,
    Json(request): Json<RestoreRequest>,
) -> Result<Json<RestoreResult>, AppError> {
    let result = state
        .blocking(move |state| state.restorer.restore(&request.source, &request.records))
        .await?;
    Ok(Json(result))
}
