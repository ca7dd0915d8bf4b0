//! testvault administrative HTTP gateway.
//!
//! Exposes migrations, backup generations, selective restore and the backup
//! scheduler to operators. All engine work runs on the blocking pool.

pub mod config;
pub mod error;
pub mod json;
pub mod routes;

pub use config::{Args, GatewayConfig};
pub use error::AppError;

use std::sync::Arc;

use axum::Router;
use testvault_core::{
    BackupArchiver, BackupScheduler, GenerationLeases, RestoreCoordinator, RetentionPruner,
    SchemaRegistry, SharedStore, VaultConfig,
};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across all routes.
#[derive(Clone)]
pub struct AppState {
    /// The managed store.
    pub store: SharedStore,
    /// Managed tables.
    pub registry: Arc<SchemaRegistry>,
    /// Engine configuration.
    pub vault: Arc<VaultConfig>,
    /// Backup generation writer.
    pub archiver: Arc<BackupArchiver>,
    /// Retention pruner.
    pub pruner: RetentionPruner,
    /// Restore coordinator.
    pub restorer: Arc<RestoreCoordinator>,
    /// Generations in use by downloads and restores.
    pub leases: GenerationLeases,
    /// The process-wide backup scheduler.
    pub scheduler: BackupScheduler,
    /// Gateway configuration.
    pub config: GatewayConfig,
}

impl AppState {
    /// Wire the engine components around an opened store.
    pub fn new(
        store: SharedStore,
        registry: SchemaRegistry,
        vault: VaultConfig,
        config: GatewayConfig,
    ) -> Self {
        let registry = Arc::new(registry);
        let leases = GenerationLeases::new();
        let archiver = Arc::new(BackupArchiver::new(store.clone(), &vault));
        let pruner = RetentionPruner::new(&vault.backups_dir, leases.clone());
        let restorer = Arc::new(RestoreCoordinator::new(
            store.clone(),
            registry.clone(),
            &vault,
            leases.clone(),
        ));
        let scheduler = BackupScheduler::new(
            archiver.clone(),
            pruner.clone(),
            vault.retention,
            vault.schedule.clone(),
        );

        Self {
            store,
            registry,
            vault: Arc::new(vault),
            archiver,
            pruner,
            restorer,
            leases,
            scheduler,
            config,
        }
    }

    /// Run engine work on the blocking pool.
    pub async fn blocking<T, E, F>(&self, f: F) -> Result<T, AppError>
    where
        F: FnOnce(AppState) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Into<AppError> + Send + 'static,
    {
        let state = self.clone();
        tokio::task::spawn_blocking(move || f(state))
            .await?
            .map_err(Into::into)
    }
}

/// Create the router with all routes.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(routes::health::routes())
        .merge(routes::migration::routes())
        .merge(routes::backup::routes())
        .merge(routes::restore::routes(state.config.max_upload_bytes))
        .merge(routes::scheduler::routes())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}
