//! Migration endpoints.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use testvault_core::catalog;
use testvault_core::migration::{ledger, FailureKind, LedgerEntry, MigrationRunner, RunReport};
use tracing::info;

use crate::error::AppError;
use crate::AppState;

/// Migration routes.
pub fn routes() -> Router<AppState> {
    Router::new().route(
        "/admin/migrations",
        get(handle_list_applied).post(handle_run_migrations),
    )
}

/// Status code for a finished run.
fn run_status(report: &RunReport) -> StatusCode {
    match report.cause.as_ref().map(|c| c.kind) {
        None => StatusCode::OK,
        Some(FailureKind::Validation) => StatusCode::BAD_REQUEST,
        Some(FailureKind::IntegrityViolation)
        | Some(FailureKind::RowCountMismatch)
        | Some(FailureKind::RolledBack) => StatusCode::CONFLICT,
        Some(FailureKind::Storage) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Apply the built-in steps. The body is the run report in every case.
async fn handle_run_migrations(State(state): State<AppState>) -> Result<Response, AppError> {
    let report = state
        .blocking(|state| {
            let steps = catalog::builtin_steps();
            let report = MigrationRunner::new(&state.store, &state.registry)
                .with_batch_size(state.vault.copy_batch_size)
                .run(&steps);
            Ok::<_, AppError>(report)
        })
        .await?;

    info!(outcome = ?report.outcome(), completed = report.completed.len(), "migration run finished");
    Ok((run_status(&report), Json(report)).into_response())
}

/// Steps recorded in the schema-version ledger.
async fn handle_list_applied(
    State(state): State<AppState>,
) -> Result<Json<Vec<LedgerEntry>>, AppError> {
    let entries = state
        .blocking(|state| state.store.with_conn(ledger::entries))
        .await?;
    Ok(Json(entries))
}
