//! Axum HTTP API server.
//!
//! This crate provides:
//! - Run submission, status polling, retry, and cancel routes
//! - Readiness/liveness probes backed by a Redis ping
//! - Prometheus metrics

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod services;
pub mod state;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use services::StaleRunDetector;
pub use state::AppState;
