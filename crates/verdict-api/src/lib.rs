//! HTTP surface for the verdict pipeline.
//!
//! One unified service exposes the analysis endpoint, per-run progress
//! streaming over SSE, and the health trio:
//!
//! - `POST /api/v1/analyze`: run an analysis, returns the response
//! - `GET  /api/v1/analyze/{id}`: fetch a finished run
//! - `GET  /api/v1/analyze/{id}/events`: SSE progress stream
//! - `/health`, `/health/live`, `/health/ready`

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;

use verdict_core::response::AnalysisResponse;
use verdict_core::Result;
use verdict_orchestrator::Orchestrator;

pub mod handlers;
pub mod routes;

pub use routes::create_router;

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,
    /// Request timeout applied by the HTTP layer. Must exceed the run
    /// deadline so the pipeline, not the transport, decides timeouts.
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: ([0, 0, 0, 0], 8080).into(),
            request_timeout_secs: 150,
        }
    }
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Finished runs, by analysis id.
    pub runs: Arc<DashMap<String, AnalysisResponse>>,
    pub version: String,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, version: impl Into<String>) -> Self {
        Self {
            orchestrator,
            runs: Arc::new(DashMap::new()),
            version: version.into(),
        }
    }
}

/// Serve the API until the shutdown future resolves.
pub async fn serve(
    config: ApiConfig,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(&config, state);
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .map_err(|e| verdict_core::Error::config(format!("cannot bind {}: {}", config.bind_addr, e)))?;

    tracing::info!(addr = %config.bind_addr, "API server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| verdict_core::Error::backend(format!("server error: {}", e)))
}
