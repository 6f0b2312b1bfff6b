//! API route definitions.

use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower_http::timeout::TimeoutLayer;

use crate::handlers::{analysis, health};
use crate::{ApiConfig, AppState};

/// Create the unified API router.
pub fn create_router(config: &ApiConfig, state: AppState) -> Router {
    let api_v1 = Router::new()
        .route("/analyze", post(analysis::analyze))
        .route("/analyze/:id", get(analysis::get_run))
        .route("/analyze/:id/events", get(analysis::run_events))
        .with_state(state.clone());

    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_v1)
        .merge(health_routes)
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.request_timeout_secs,
        )))
}
