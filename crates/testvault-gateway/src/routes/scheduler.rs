//! Scheduler endpoints.

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use testvault_core::scheduler::CycleReport;
use testvault_core::SchedulerStatus;

use crate::error::AppError;
use crate::AppState;

/// Scheduler routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/admin/scheduler", get(handle_status))
        .route("/admin/scheduler/start", post(handle_start))
        .route("/admin/scheduler/stop", post(handle_stop))
        .route("/admin/scheduler/run", post(handle_run_now))
}

async fn handle_status(State(state): State<AppState>) -> Json<SchedulerStatus> {
    Json(state.scheduler.status())
}

async fn handle_start(State(state): State<AppState>) -> Json<SchedulerStatus> {
    state.scheduler.start();
    Json(state.scheduler.status())
}

async fn handle_stop(State(state): State<AppState>) -> Json<SchedulerStatus> {
    state.scheduler.stop();
    Json(state.scheduler.status())
}

/// Run one archive-then-prune cycle now.
async fn handle_run_now(State(state): State<AppState>) -> Result<Json<CycleReport>, AppError> {
    let report = state.scheduler.trigger_now().await?;
    Ok(Json(report))
}
