//! Local status HTTP server
//!
//! Liveness and readiness probes for process supervision (systemd/launchd)
//! plus a JSON view of every managed tunnel.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use crate::error::{Result, TunnelError};
use crate::orchestrator::Orchestrator;

/// Serves tunnel status over a local HTTP port
pub struct StatusServer {
    orchestrator: Arc<Orchestrator>,
    port: u16,
}

impl StatusServer {
    pub fn new(orchestrator: Arc<Orchestrator>, port: u16) -> Self {
        Self { orchestrator, port }
    }

    /// Bind and serve until the process exits
    pub async fn run(&self) -> Result<()> {
        let app = Router::new()
            .route("/status", get(status_handler))
            .route("/healthz", get(liveness_handler))
            .route("/readyz", get(readiness_handler))
            .with_state(Arc::clone(&self.orchestrator));

        let addr = SocketAddr::from(([127, 0, 0, 1], self.port));
        info!("starting status server on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .await
            .map_err(|e| TunnelError::Internal(format!("status server error: {e}")))?;
        Ok(())
    }
}

/// Per-tunnel status snapshots, keyed by tunnel name
async fn status_handler(State(orchestrator): State<Arc<Orchestrator>>) -> impl IntoResponse {
    Json(orchestrator.status().await)
}

/// Is the keeper process alive?
async fn liveness_handler() -> impl IntoResponse {
    StatusCode::OK
}

/// Ready once at least one tunnel is up
async fn readiness_handler(State(orchestrator): State<Arc<Orchestrator>>) -> impl IntoResponse {
    let status = orchestrator.status().await;
    if status.values().any(|s| s.running) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
