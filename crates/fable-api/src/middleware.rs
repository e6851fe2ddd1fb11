//! API middleware.

use std::time::Instant;

use axum::body::Body;
use axum::http::{HeaderValue, Request, Response};
use axum::middleware::Next;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, Span};
use uuid::Uuid;

/// Create CORS layer.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    use axum::http::{header, Method};

    // Common headers needed for API requests
    let allowed_headers = [
        header::AUTHORIZATION,
        header::CONTENT_TYPE,
        header::ACCEPT,
        header::ORIGIN,
    ];

    // Headers to expose to the browser
    let exposed_headers = [header::CONTENT_LENGTH, header::CONTENT_TYPE];

    let allowed_methods = [Method::GET, Method::POST, Method::OPTIONS];

    if origins.iter().any(|o| o == "*") {
        // Wildcard origin - no credentials allowed, can use Any
        CorsLayer::new()
            .allow_methods(Any)
            .allow_headers(Any)
            .expose_headers(Any)
            .allow_origin(Any)
            .max_age(std::time::Duration::from_secs(600))
    } else {
        // Explicit origins - credentials allowed BUT cannot use Any for headers
        // tower-http panics if you combine credentials with wildcard headers
        let origins: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_methods(allowed_methods)
            .allow_headers(allowed_headers)
            .expose_headers(exposed_headers)
            .allow_credentials(true)
            .allow_origin(origins)
            .max_age(std::time::Duration::from_secs(600))
    }
}

/// Security headers middleware.
pub async fn security_headers(request: Request<Body>, next: Next) -> Response<Body> {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    // SAFETY: All header values below are compile-time constants that are valid.
    headers.insert(
        "X-Content-Type-Options",
        "nosniff".parse().expect("valid header value"),
    );
    headers.insert("X-Frame-Options", "DENY".parse().expect("valid header value"));
    headers.insert(
        "Strict-Transport-Security",
        "max-age=31536000; includeSubDomains"
            .parse()
            .expect("valid header value"),
    );
    headers.insert(
        "Referrer-Policy",
        "strict-origin-when-cross-origin"
            .parse()
            .expect("valid header value"),
    );
    headers.insert(
        "Cross-Origin-Resource-Policy",
        "same-origin".parse().expect("valid header value"),
    );

    response
}

/// Request ID middleware.
pub async fn request_id(mut request: Request<Body>, next: Next) -> Response<Body> {
    // Generate or extract request ID
    let request_id = request
        .headers()
        .get("X-Request-ID")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // Add to request extensions
    request.extensions_mut().insert(request_id.clone());

    // Record in span
    Span::current().record("request_id", &request_id);

    let mut response = next.run(request).await;

    // Add to response headers
    if let Ok(header_value) = request_id.parse() {
        response.headers_mut().insert("X-Request-ID", header_value);
    }

    response
}

/// Request logging middleware.
pub async fn request_logging(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;

    let status = response.status();
    let duration = start.elapsed();

    // Skip health check logging
    if uri.path() != "/health" && uri.path() != "/healthz" && uri.path() != "/ready" {
        info!(
            method = %method,
            uri = %uri,
            status = %status,
            duration_ms = %duration.as_millis(),
            "Request completed"
        );
    }

    response
}
