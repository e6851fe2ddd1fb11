//! Prometheus metrics for the API server.

use axum::body::Body;
use axum::http::{Request, Response};
use axum::middleware::Next;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Instant;

/// Initialize the Prometheus metrics recorder.
/// Returns a handle that can be used to render metrics.
pub fn init_metrics() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder")
}

/// Metric names as constants for consistency.
pub mod names {
    // HTTP metrics
    pub const HTTP_REQUESTS_TOTAL: &str = "fable_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "fable_http_request_duration_seconds";
    pub const HTTP_REQUESTS_IN_FLIGHT: &str = "fable_http_requests_in_flight";

    // Run lifecycle metrics (API side)
    pub const RUNS_SUBMITTED_TOTAL: &str = "fable_runs_submitted_total";
    pub const RETRIES_REQUESTED_TOTAL: &str = "fable_retries_requested_total";
    pub const CANCELS_REQUESTED_TOTAL: &str = "fable_cancels_requested_total";
}

/// Record an HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", sanitize_path(path)),
        ("status", status.to_string()),
    ];

    counter!(names::HTTP_REQUESTS_TOTAL, &labels).increment(1);
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, &labels).record(duration_secs);
}

/// Record a run submission.
pub fn record_run_submitted(tier: &str) {
    let labels = [("tier", tier.to_string())];
    counter!(names::RUNS_SUBMITTED_TOTAL, &labels).increment(1);
}

/// Record a retry request.
pub fn record_retry_requested() {
    counter!(names::RETRIES_REQUESTED_TOTAL).increment(1);
}

/// Record a cancel request.
pub fn record_cancel_requested() {
    counter!(names::CANCELS_REQUESTED_TOTAL).increment(1);
}

/// Sanitize path for metrics labels (replace IDs with a placeholder to
/// keep label cardinality bounded).
fn sanitize_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if is_id_segment(segment) {
                ":id"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Generation ids are UUIDs; numeric segments are treated as ids too.
fn is_id_segment(segment: &str) -> bool {
    if segment.is_empty() {
        return false;
    }
    if segment.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    if segment.len() == 36 {
        return segment.char_indices().all(|(i, c)| match i {
            8 | 13 | 18 | 23 => c == '-',
            _ => c.is_ascii_hexdigit(),
        });
    }
    false
}

/// Metrics middleware for HTTP requests.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    // Increment in-flight counter
    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).increment(1.0);

    let response = next.run(request).await;

    // Decrement in-flight counter
    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).decrement(1.0);

    let status = response.status().as_u16();
    let duration = start.elapsed().as_secs_f64();

    record_http_request(&method, &path, status, duration);

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_path_replaces_uuids() {
        assert_eq!(
            sanitize_path("/api/generations/550e8400-e29b-41d4-a716-446655440000"),
            "/api/generations/:id"
        );
        assert_eq!(
            sanitize_path("/api/generations/550e8400-e29b-41d4-a716-446655440000/retry"),
            "/api/generations/:id/retry"
        );
    }

    #[test]
    fn test_sanitize_path_replaces_numeric_segments() {
        assert_eq!(sanitize_path("/api/generations/12345"), "/api/generations/:id");
    }

    #[test]
    fn test_sanitize_path_keeps_static_routes() {
        assert_eq!(sanitize_path("/health"), "/health");
        assert_eq!(sanitize_path("/api/generations"), "/api/generations");
    }

    #[test]
    fn test_malformed_uuid_not_treated_as_id() {
        // Right length, wrong hyphen positions
        assert_eq!(
            sanitize_path("/api/generations/550e8400e29b-41d4-a716-4466554400000"),
            "/api/generations/550e8400e29b-41d4-a716-4466554400000"
        );
    }
}
