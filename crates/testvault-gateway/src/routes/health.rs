//! Health check endpoint.

use axum::{extract::State, routing::get, Json, Router};

use crate::json::HealthResponse;
use crate::AppState;

/// Health check routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

/// Health check handler.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let maintenance = state.store.maintenance().is_held();
    let store_connected = state
        .blocking(|state| {
            state
                .store
                .with_conn(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)))
                .map_err(testvault_core::Error::from)
        })
        .await
        .is_ok();

    Json(HealthResponse {
        status: if store_connected { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store_connected,
        maintenance,
    })
}
