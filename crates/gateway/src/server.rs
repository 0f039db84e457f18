//! Axum-based HTTP server for the gateway.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Json, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use cloudrepl_core::config::ServerConfig;
use cloudrepl_core::{Error, Result};
use cloudrepl_sandbox::SandboxManager;

use crate::dispatcher::Dispatcher;
use crate::sink::WsOutputSink;

/// Outbound frames buffered per connection before producers wait.
const OUTBOUND_BUFFER: usize = 256;

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to bind to.
    pub port: u16,
    /// Enable CORS.
    pub enable_cors: bool,
    /// Enable request tracing.
    pub enable_tracing: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            enable_cors: true,
            enable_tracing: true,
        }
    }
}

impl From<&ServerConfig> for GatewayConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            enable_cors: config.enable_cors,
            enable_tracing: config.enable_tracing,
        }
    }
}

/// Shared application state.
pub struct AppState {
    pub manager: Arc<SandboxManager>,
    /// Parent of every connection token; cancelled on shutdown.
    pub shutdown: CancellationToken,
}

/// Gateway server.
pub struct GatewayServer {
    config: GatewayConfig,
    state: Arc<AppState>,
    metrics_handle: Option<PrometheusHandle>,
}

impl GatewayServer {
    /// Create a new gateway server.
    pub fn new(config: GatewayConfig, manager: Arc<SandboxManager>) -> Self {
        Self {
            config,
            state: Arc::new(AppState {
                manager,
                shutdown: CancellationToken::new(),
            }),
            metrics_handle: None,
        }
    }

    /// Use `shutdown` as the parent token for connections and for
    /// graceful shutdown of [`run`](Self::run).
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.state = Arc::new(AppState {
            manager: self.state.manager.clone(),
            shutdown,
        });
        self
    }

    /// Set metrics handle.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// Build the Axum router.
    pub fn build_router(&self) -> Router {
        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/ws", get(ws_handler))
            .with_state(self.state.clone());

        if let Some(handle) = &self.metrics_handle {
            let handle = handle.clone();
            router = router.route("/metrics", get(move || async move { handle.render() }));
        }

        if self.config.enable_cors {
            router = router.layer(CorsLayer::new().allow_origin(Any).allow_methods(Any));
        }

        if self.config.enable_tracing {
            router = router.layer(TraceLayer::new_for_http());
        }

        router
    }

    /// Run the server until the shutdown token fires.
    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::internal(format!("Failed to bind {}: {}", addr, e)))?;

        tracing::info!(addr = %addr, "Gateway server starting");

        let shutdown = self.state.shutdown.clone();
        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(|e| Error::internal(format!("Server error: {}", e)))?;

        tracing::info!("Gateway server stopped");
        Ok(())
    }
}

// =============================================================================
// Handlers
// =============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);

    metrics::gauge!("gateway_ws_connections").increment(1.0);
    tracing::info!(connection_id = %connection_id, "WebSocket connected");

    // Single writer: every output frame for this socket goes through here.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let cancel = state.shutdown.child_token();
    let dispatcher = Dispatcher::new(
        state.manager.clone(),
        Arc::new(WsOutputSink::new(tx)),
        cancel.clone(),
    );

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = receiver.next() => message,
        };
        match message {
            Some(Ok(Message::Text(text))) => dispatcher.handle_text(&text).await,
            Some(Ok(Message::Binary(data))) => {
                dispatcher.handle_text(&String::from_utf8_lossy(&data)).await
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::debug!(connection_id = %connection_id, error = %e, "WebSocket read error");
                break;
            }
        }
    }

    dispatcher.shutdown().await;
    drop(dispatcher);
    let _ = writer.await;

    metrics::gauge!("gateway_ws_connections").decrement(1.0);
    tracing::info!(connection_id = %connection_id, "WebSocket disconnected");
}
