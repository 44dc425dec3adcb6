//! Devbox - per-workspace sandbox execution engine.
//!
//! Loads layered configuration, sets up logging and metrics, selects the
//! sandbox backend once, and keeps workspace containers managed until a
//! shutdown signal arrives.

use std::sync::Arc;

use devbox_core::telemetry::{configure_tracing, install_metrics_exporter};
use devbox_core::{AppConfig, DirectoryFileStore, FileStore};
use devbox_sandbox::select_sandbox;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;

    configure_tracing(&config.telemetry)?;
    tracing::info!("Starting Devbox v{}", env!("CARGO_PKG_VERSION"));

    if !install_metrics_exporter(&config.telemetry)? {
        tracing::info!("Metrics exporter disabled (no telemetry.metrics_addr)");
    }

    // =========================================================================
    // Sandbox backend
    // =========================================================================
    let files: Arc<dyn FileStore> =
        Arc::new(DirectoryFileStore::new(&config.sandbox.workspaces_root));
    let sandbox = select_sandbox(&config.sandbox, files).await?;
    sandbox.initialize().await?;

    tracing::info!(
        backend = sandbox.backend(),
        prefix = %config.sandbox.container_prefix,
        idle_ttl_secs = config.sandbox.idle_ttl_secs,
        sweep_interval_secs = config.sandbox.sweep_interval_secs,
        "Sandbox ready"
    );

    shutdown_signal().await;

    tracing::info!("Shutdown signal received, removing workspace containers...");
    if let Err(e) = sandbox.shutdown().await {
        tracing::warn!(error = %e, "Error during shutdown");
    }
    tracing::info!("Devbox stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
