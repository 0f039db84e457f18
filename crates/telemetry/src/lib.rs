#![deny(unused)]
//! Logging and metrics setup for CloudRepl.
//!
//! - Structured logging through `tracing-subscriber` (plain or JSON)
//! - Optional OpenTelemetry export when `OTEL_EXPORTER_OTLP_ENDPOINT` is set
//! - Prometheus recorder for the counters emitted by the sandbox engine

pub mod metrics;
pub mod tracing_layer;

pub use metrics::{describe_metrics, setup_metrics_recorder};
pub use tracing_layer::configure_tracing;
