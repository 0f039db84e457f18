#![deny(unused)]
//! CloudRepl - per-user sandboxed development environments.
//!
//! Boots the WebSocket gateway in front of a Docker-backed sandbox engine.
//! Every user gets one container with their host directory mounted at the
//! working directory; clients drive it with JSON messages over `/ws`.

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use cloudrepl_core::config::AppConfig;
use cloudrepl_gateway::{GatewayConfig, GatewayServer};
use cloudrepl_sandbox::{DockerBackend, SandboxBackend, SandboxManager};
use cloudrepl_store::InMemoryIdentityStore;

/// How long teardown may spend stopping sandboxes before giving up.
const STOP_ALL_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("Failed to load configuration")?;

    // Initialize tracing
    cloudrepl_telemetry::configure_tracing(config.logging.json)?;

    tracing::info!("Starting CloudRepl v{}", env!("CARGO_PKG_VERSION"));

    // =========================================================================
    // Observability
    // =========================================================================
    let metrics_handle = cloudrepl_telemetry::setup_metrics_recorder()?;

    // =========================================================================
    // Container engine
    // =========================================================================
    let backend = DockerBackend::connect()?;
    backend.ping().await?;
    tracing::info!("Docker daemon reachable");

    config.sandbox.limits.validate()?;
    std::fs::create_dir_all(&config.sandbox.host_root)?;

    // =========================================================================
    // Session engine
    // =========================================================================
    let identity = Arc::new(InMemoryIdentityStore::from_config(&config.identity));
    let manager = Arc::new(SandboxManager::new(
        Arc::new(backend),
        identity,
        config.sandbox.clone(),
    ));
    tracing::info!(
        image = %config.sandbox.image,
        host_root = %config.sandbox.host_root.display(),
        workdir = %config.sandbox.container_workdir,
        "Sandbox engine initialized"
    );

    // =========================================================================
    // Gateway
    // =========================================================================
    let shutdown = CancellationToken::new();
    let gateway_config = GatewayConfig::from(&config.server);
    let server = GatewayServer::new(gateway_config.clone(), manager.clone())
        .with_metrics(metrics_handle)
        .with_shutdown(shutdown.clone());

    tracing::info!(
        host = %gateway_config.host,
        port = gateway_config.port,
        "Gateway initialized"
    );

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown signal received"),
            Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
        }
        signal.cancel();
    });

    let served = server.run().await;
    shutdown.cancel();

    // =========================================================================
    // Teardown
    // =========================================================================
    let teardown = CancellationToken::new();
    let deadline = teardown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(STOP_ALL_DEADLINE).await;
        deadline.cancel();
    });

    match manager.stop_all(&teardown).await {
        Ok(report) if report.is_clean() => {
            tracing::info!(stopped = report.stopped.len(), "All sandboxes stopped");
        }
        Ok(report) => {
            tracing::warn!(
                stopped = report.stopped.len(),
                failed = report.failed.len(),
                "Some sandboxes could not be stopped"
            );
            for (id, reason) in &report.failed {
                tracing::warn!(sandbox_id = %id, reason = %reason, "Sandbox left behind");
            }
        }
        Err(e) => tracing::error!(error = %e, "Failed to stop sandboxes"),
    }

    served?;
    Ok(())
}
