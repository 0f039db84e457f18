//! Metrics implementation using Prometheus.

use cloudrepl_core::{Error, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Initialize Prometheus recorder and return the handle.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::internal(format!("Failed to install Prometheus recorder: {}", e)))?;

    describe_metrics();
    tracing::info!("Prometheus metrics recorder initialized");
    Ok(handle)
}

/// Register descriptions for the metrics emitted by the sandbox engine
/// and the gateway.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "sandbox_created_total",
        "Sandboxes created and started, by image"
    );
    metrics::describe_counter!(
        "sandbox_destroyed_total",
        "Sandboxes removed, one at a time or by a stop-all sweep"
    );
    metrics::describe_counter!(
        "sandbox_exec_total",
        "One-shot commands run inside sandboxes, by outcome"
    );
    metrics::describe_histogram!(
        "sandbox_exec_duration_seconds",
        metrics::Unit::Seconds,
        "Wall time of one-shot commands including output relay"
    );
    metrics::describe_gauge!(
        "sandbox_detached_processes",
        "Background processes whose output is still being relayed"
    );
    metrics::describe_counter!(
        "sandbox_interactive_sessions_total",
        "Interactive session start attempts, by outcome"
    );
    metrics::describe_gauge!("gateway_ws_connections", "Open WebSocket connections");
    metrics::describe_counter!(
        "gateway_messages_total",
        "Inbound WebSocket messages, by type"
    );
}
