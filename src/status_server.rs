//! Local status endpoints
//!
//! Lets on-node tooling and load balancers check the agent without going
//! through the control plane.

use std::sync::Arc;

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::device_code::DeviceCode;
use crate::node_id::NodeId;
use crate::telemetry::{StatusCollector, StatusSnapshot};
use crate::{Error, Result};

/// Default listen port
pub const DEFAULT_STATUS_PORT: u16 = 8081;

/// Shared handler state
struct StatusState {
    collector: Arc<dyn StatusCollector>,
    node_id: NodeId,
    device_code: DeviceCode,
}

/// Liveness response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn status(
    State(state): State<Arc<StatusState>>,
) -> std::result::Result<Json<StatusSnapshot>, (StatusCode, Json<ErrorResponse>)> {
    StatusSnapshot::collect(state.collector.as_ref(), &state.node_id, &state.device_code)
        .await
        .map(Json)
        .map_err(|e| {
            tracing::warn!(error = %e, "status collection failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
        })
}

/// HTTP server exposing `/health` and `/status`
pub struct StatusServer {
    state: Arc<StatusState>,
    port: u16,
}

impl std::fmt::Debug for StatusServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusServer")
            .field("node_id", &self.state.node_id)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl StatusServer {
    /// Create a server for `node_id` on `port`
    #[must_use]
    pub fn new(
        collector: Arc<dyn StatusCollector>,
        node_id: NodeId,
        device_code: DeviceCode,
        port: u16,
    ) -> Self {
        Self {
            state: Arc::new(StatusState {
                collector,
                node_id,
                device_code,
            }),
            port,
        }
    }

    /// Build the router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/status", get(status))
            .with_state(Arc::clone(&self.state))
            .layer(TraceLayer::new_for_http())
    }

    /// Serve on an already-bound listener until cancelled
    ///
    /// # Errors
    ///
    /// Returns error if the server fails
    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .map_err(|e| Error::Config(format!("status server error: {e}")))
    }

    /// Bind the configured port and serve until cancelled
    ///
    /// # Errors
    ///
    /// Returns error if the port cannot be bound or the server fails
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind status server: {e}")))?;

        tracing::info!(port = self.port, "status server listening");
        self.serve(listener, cancel).await
    }
}
