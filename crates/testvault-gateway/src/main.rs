//! testvault administrative gateway binary.

use std::sync::Arc;

use clap::Parser;
use testvault_core::migration::{MigrationRunner, RunOutcome};
use testvault_core::{catalog, Store};
use testvault_gateway::{create_router, AppState, Args, GatewayConfig};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "testvault_gateway=info,testvault_core=info,tower_http=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    // Parse command line args
    let args = Args::parse();
    let config = GatewayConfig::from(&args);
    let vault = config.vault()?;

    info!(
        listen = %config.listen_addr,
        data_dir = %vault.data_dir.display(),
        retention = vault.retention,
        "Starting testvault gateway"
    );

    let store = Arc::new(Store::open(&vault.store_path)?);
    let created = store.with_conn(catalog::install_baseline)?;
    if created > 0 {
        info!(tables = created, "initialised empty store");
    }

    if config.migrate_on_start {
        let registry = catalog::registry();
        let report = MigrationRunner::new(&store, &registry)
            .with_batch_size(vault.copy_batch_size)
            .run(&catalog::builtin_steps());
        match report.outcome() {
            RunOutcome::Failed => anyhow::bail!(
                "startup migration failed at {}: {}",
                report.failed_at.as_deref().unwrap_or("?"),
                report
                    .cause
                    .as_ref()
                    .map(|c| c.message.as_str())
                    .unwrap_or("unknown cause")
            ),
            outcome => info!(?outcome, "startup migrations done"),
        }
    }

    // Create application state
    let state = AppState::new(store, catalog::registry(), vault, config.clone());

    let swept = state.archiver.sweep_partials()?;
    if swept > 0 {
        warn!(swept, "removed unfinished backup artifacts");
    }
    state.scheduler.init();

    // Create router
    let app = create_router(state.clone());

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!("Gateway listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.scheduler.shutdown().await;
    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
