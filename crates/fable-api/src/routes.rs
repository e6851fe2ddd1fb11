//! API routes.

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::limit::RequestBodyLimitLayer;

use crate::handlers::generations::{
    cancel_generation, create_generation, get_generation_status, retry_generation,
};
use crate::handlers::{health, ready};
use crate::metrics::metrics_middleware;
use crate::middleware::{cors_layer, request_id, request_logging, security_headers};
use crate::state::AppState;

/// Create the API router.
pub fn create_router(state: AppState, metrics_handle: Option<PrometheusHandle>) -> Router {
    let generation_routes = Router::new()
        // Submit a run
        .route("/generations", post(create_generation))
        // Poll run status
        .route("/generations/:generation_id", get(get_generation_status))
        // Retry a failed run
        .route("/generations/:generation_id/retry", post(retry_generation))
        // Cancel an active run
        .route("/generations/:generation_id/cancel", post(cancel_generation));

    let health_routes = Router::new()
        .route("/health", get(health))
        .route("/healthz", get(health))
        .route("/ready", get(ready));

    // Metrics endpoint (if enabled)
    let metrics_routes = if let Some(handle) = metrics_handle {
        Router::new().route("/metrics", get(move || async move { handle.render() }))
    } else {
        Router::new()
    };

    Router::new()
        .nest("/api", generation_routes)
        .merge(health_routes)
        .merge(metrics_routes)
        // Request body size limit; run submissions are small JSON documents
        .layer(RequestBodyLimitLayer::new(state.config.max_body_size))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(security_headers))
        .layer(middleware::from_fn(request_id))
        .layer(middleware::from_fn(request_logging))
        .layer(cors_layer(&state.config.cors_origins))
        .with_state(state)
}
