//! HTTP adapter for the provider gateway.
//!
//! All generative providers are reached through one gateway that exposes a
//! uniform `POST /v1/{capability}/{provider}` endpoint and returns the flat
//! response envelope. Provider-specific wire formats stay behind the
//! gateway; this adapter only speaks the envelope.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use fable_models::ProviderId;

use crate::adapter::{ProviderAdapter, ProviderRequest, ProviderResponse};
use crate::error::{ProviderError, ProviderResult};

/// Gateway response envelope.
#[derive(Debug, Deserialize)]
struct GatewayReply {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    duration_ms: Option<u64>,
    #[serde(default)]
    cost_cents: Option<u64>,
}

/// Gateway error body, returned with non-2xx statuses.
#[derive(Debug, Deserialize)]
struct GatewayErrorReply {
    #[serde(default)]
    error: Option<String>,
}

/// HTTP client for the provider gateway.
pub struct HttpProviderAdapter {
    base_url: String,
    api_key: String,
    client: Client,
}

impl HttpProviderAdapter {
    /// Create an adapter for a gateway at `base_url`.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            api_key: api_key.into(),
            client: Client::new(),
        }
    }

    /// Create from environment variables.
    pub fn from_env() -> ProviderResult<Self> {
        let base_url = std::env::var("FABLE_GATEWAY_URL")
            .map_err(|_| ProviderError::config("FABLE_GATEWAY_URL not set"))?;
        let api_key = std::env::var("FABLE_GATEWAY_API_KEY")
            .map_err(|_| ProviderError::config("FABLE_GATEWAY_API_KEY not set"))?;
        Ok(Self::new(base_url, api_key))
    }

    fn endpoint(&self, request: &ProviderRequest, provider: &ProviderId) -> String {
        format!(
            "{}/v1/{}/{}",
            self.base_url,
            request.capability(),
            provider
        )
    }
}

#[async_trait]
impl ProviderAdapter for HttpProviderAdapter {
    async fn invoke(
        &self,
        provider: &ProviderId,
        request: &ProviderRequest,
    ) -> ProviderResult<ProviderResponse> {
        let url = self.endpoint(request, provider);
        debug!("Calling provider gateway: {}", url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| ProviderError::transport(format!("Gateway request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<GatewayErrorReply>(&body)
                .ok()
                .and_then(|r| r.error)
                .unwrap_or(body);

            return Err(match status {
                StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited(message),
                _ => ProviderError::Http {
                    status: status.as_u16(),
                    message,
                },
            });
        }

        let reply: GatewayReply = response
            .json()
            .await
            .map_err(|e| ProviderError::malformed(format!("Failed to parse gateway reply: {}", e)))?;

        Ok(ProviderResponse {
            content: reply.content,
            url: reply.url,
            duration_ms: reply.duration_ms,
            cost_cents: reply.cost_cents,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{bearer_token, body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_invoke_posts_to_capability_endpoint() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/image_generation/muralist-v3"))
            .and(bearer_token("test-key"))
            .and(body_partial_json(serde_json::json!({
                "task": "image",
                "prompt": "a stone lighthouse at dusk"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "url": "https://cdn.test/img.png",
                "cost_cents": 11
            })))
            .mount(&server)
            .await;

        let adapter = HttpProviderAdapter::new(server.uri(), "test-key");
        let request = ProviderRequest::Image {
            prompt: "a stone lighthouse at dusk".to_string(),
            reference_urls: Vec::new(),
        };

        let response = adapter
            .invoke(&ProviderId::from("muralist-v3"), &request)
            .await
            .expect("invoke should succeed");

        assert_eq!(response.url.as_deref(), Some("https://cdn.test/img.png"));
        assert_eq!(response.cost_cents, Some(11));
        assert!(response.content.is_none());
    }

    #[tokio::test]
    async fn test_invoke_maps_rate_limit() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429)
                    .set_body_json(serde_json::json!({"error": "quota exceeded"})),
            )
            .mount(&server)
            .await;

        let adapter = HttpProviderAdapter::new(server.uri(), "test-key");
        let request = ProviderRequest::Script {
            prompt: "breakdown".to_string(),
        };

        let err = adapter
            .invoke(&ProviderId::from("scriptor-xl"), &request)
            .await
            .expect_err("429 should fail");

        match err {
            ProviderError::RateLimited(message) => assert_eq!(message, "quota exceeded"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invoke_maps_server_error_with_body() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream down"))
            .mount(&server)
            .await;

        let adapter = HttpProviderAdapter::new(server.uri(), "test-key");
        let request = ProviderRequest::Script {
            prompt: "breakdown".to_string(),
        };

        let err = adapter
            .invoke(&ProviderId::from("scriptor-xl"), &request)
            .await
            .expect_err("503 should fail");

        match err {
            ProviderError::Http { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "upstream down");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invoke_rejects_unparseable_reply() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let adapter = HttpProviderAdapter::new(server.uri(), "test-key");
        let request = ProviderRequest::Script {
            prompt: "breakdown".to_string(),
        };

        let err = adapter
            .invoke(&ProviderId::from("scriptor-xl"), &request)
            .await
            .expect_err("garbage body should fail");

        assert!(matches!(err, ProviderError::Malformed(_)));
    }
}
