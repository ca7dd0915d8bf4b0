//! Backup generation endpoints.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use testvault_core::{BackupGeneration, PruneReport};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::info;

use crate::error::AppError;
use crate::json::PruneParams;
use crate::AppState;

/// Backup routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/admin/backups",
            get(handle_list_backups).post(handle_create_backup),
        )
        .route("/admin/backups/prune", post(handle_prune))
        .route("/admin/backups/:name", get(handle_download))
}

/// Generations, newest first.
async fn handle_list_backups(
    State(state): State<AppState>,
) -> Result<Json<Vec<BackupGeneration>>, AppError> {
    let generations = state.blocking(|state| state.archiver.list()).await?;
    Ok(Json(generations))
}

/// Create a generation and return its bytes.
async fn handle_create_backup(State(state): State<AppState>) -> Result<Response, AppError> {
    let generation = state
        .blocking(|state| state.archiver.create_backup())
        .await?;
    info!(name = %generation.name, size = %generation.size_formatted, "backup created on request");
    send_generation(&state, &generation.name).await
}

/// Download an existing generation.
async fn handle_download(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    send_generation(&state, &name).await
}

/// Delete generations beyond `keep` (default: configured retention).
async fn handle_prune(
    State(state): State<AppState>,
    Query(params): Query<PruneParams>,
) -> Result<Json<PruneReport>, AppError> {
    let keep = params.keep.unwrap_or(state.vault.retention);
    let report = state.blocking(move |state| state.pruner.prune(keep)).await?;
    Ok(Json(report))
}

async fn send_generation(state: &AppState, name: &str) -> Result<Response, AppError> {
    // Keep the pruner off the file until it is open; the handle outlives deletion.
    let file = {
        let _lease = state.leases.lease(name);
        let path = state.archiver.open_generation(name)?;
        File::open(&path)
            .await
            .map_err(|e| AppError::Internal(format!("opening {name}: {e}")))?
    };
    let size_bytes = file
        .metadata()
        .await
        .map_err(|e| AppError::Internal(format!("reading {name}: {e}")))?
        .len();

    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, size_bytes.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{name}\""),
            ),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}
