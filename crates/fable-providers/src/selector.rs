//! Fallback selector: walks a provider chain until one candidate delivers.
//!
//! For each candidate the selector consults the circuit breaker, invokes
//! the adapter under a timeout, and normalizes the raw response. Any of
//! those going wrong counts as a candidate failure: the breaker records
//! it and the selector moves down the chain. Only when the whole chain is
//! exhausted does the caller see an error.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use fable_models::{Capability, PlanTier, ProviderId};

use crate::adapter::{ProviderAdapter, ProviderRequest, ProviderResponse};
use crate::catalog::FallbackCatalog;
use crate::circuit::{Acquire, CircuitRegistry};
use crate::error::{AttemptRecord, ExhaustedError, ProviderError};

/// Result of a successful chain walk.
#[derive(Debug)]
pub struct SelectorOutcome<T> {
    /// Normalized stage output
    pub value: T,
    /// Provider that actually delivered
    pub provider: ProviderId,
    /// Primary candidate of the chain
    pub requested: ProviderId,
    /// Candidates skipped because their circuit was open
    pub skipped: Vec<ProviderId>,
    /// Number of candidates invoked, including the successful one
    pub attempts: u32,
    /// Cost of the successful call (provider-reported, else catalog price)
    pub cost_cents: u64,
}

impl<T> SelectorOutcome<T> {
    /// True when a non-primary candidate delivered.
    pub fn fell_back(&self) -> bool {
        self.provider != self.requested
    }
}

/// Walks fallback chains with circuit breaking and per-candidate timeouts.
pub struct FallbackSelector {
    adapter: Arc<dyn ProviderAdapter>,
    catalog: Arc<FallbackCatalog>,
    circuits: Arc<CircuitRegistry>,
    call_timeout: Duration,
}

impl FallbackSelector {
    pub fn new(
        adapter: Arc<dyn ProviderAdapter>,
        catalog: Arc<FallbackCatalog>,
        circuits: Arc<CircuitRegistry>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            adapter,
            catalog,
            circuits,
            call_timeout,
        }
    }

    pub fn catalog(&self) -> &FallbackCatalog {
        &self.catalog
    }

    /// Execute `request` against the chain for (capability, tier).
    ///
    /// `normalize` turns the raw gateway response into the stage's typed
    /// output; a normalization failure is treated exactly like a provider
    /// failure so unusable output also trips the breaker and falls back.
    pub async fn execute<T, F>(
        &self,
        tier: PlanTier,
        request: &ProviderRequest,
        normalize: F,
    ) -> Result<SelectorOutcome<T>, ExhaustedError>
    where
        F: Fn(&ProviderResponse) -> Result<T, ProviderError>,
    {
        let capability = request.capability();
        let chain = self.catalog.chain(capability, tier);

        let requested = match chain.first() {
            Some(primary) => primary.clone(),
            None => {
                return Err(ExhaustedError {
                    capability,
                    attempts: Vec::new(),
                    skipped: Vec::new(),
                })
            }
        };

        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut skipped: Vec<ProviderId> = Vec::new();

        for candidate in chain {
            let breaker = self.circuits.breaker(capability, candidate);

            match breaker.try_acquire() {
                Acquire::Rejected => {
                    debug!(
                        capability = %capability,
                        provider = %candidate,
                        "Skipping candidate, circuit open"
                    );
                    skipped.push(candidate.clone());
                    continue;
                }
                Acquire::Trial => {
                    info!(
                        capability = %capability,
                        provider = %candidate,
                        "Circuit half-open, sending trial request"
                    );
                }
                Acquire::Allowed => {}
            }

            debug!(
                capability = %capability,
                provider = %candidate,
                "Invoking provider"
            );

            let call = self.adapter.invoke(candidate, request);
            let result = match tokio::time::timeout(self.call_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(self.call_timeout)),
            };

            let normalized = result.and_then(|response| normalize(&response).map(|v| (v, response)));

            match normalized {
                Ok((value, response)) => {
                    breaker.record_success();
                    let cost_cents = response
                        .cost_cents
                        .unwrap_or_else(|| self.catalog.price_cents(candidate));

                    if *candidate != requested {
                        info!(
                            capability = %capability,
                            requested = %requested,
                            used = %candidate,
                            "Provider fallback succeeded"
                        );
                    }

                    return Ok(SelectorOutcome {
                        value,
                        provider: candidate.clone(),
                        requested,
                        skipped,
                        attempts: attempts.len() as u32 + 1,
                        cost_cents,
                    });
                }
                Err(e) => {
                    breaker.record_failure();
                    warn!(
                        capability = %capability,
                        provider = %candidate,
                        error = %e,
                        "Provider candidate failed"
                    );
                    attempts.push(AttemptRecord {
                        provider: candidate.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        Err(ExhaustedError {
            capability,
            attempts,
            skipped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::circuit::CircuitConfig;

    /// Adapter that replays a scripted sequence of results and records
    /// which providers were called.
    struct ScriptedAdapter {
        results: Mutex<VecDeque<Result<ProviderResponse, ProviderError>>>,
        calls: Mutex<Vec<ProviderId>>,
    }

    impl ScriptedAdapter {
        fn new(results: Vec<Result<ProviderResponse, ProviderError>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<ProviderId> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        async fn invoke(
            &self,
            provider: &ProviderId,
            _request: &ProviderRequest,
        ) -> Result<ProviderResponse, ProviderError> {
            self.calls.lock().unwrap().push(provider.clone());
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ProviderError::transport("script exhausted")))
        }
    }

    fn media_response(url: &str) -> ProviderResponse {
        ProviderResponse {
            url: Some(url.to_string()),
            ..Default::default()
        }
    }

    fn audio_request() -> ProviderRequest {
        ProviderRequest::Audio {
            text: "narration".to_string(),
            voice: "narrator_f1".to_string(),
            speed: 1.0,
            language: "en-US".to_string(),
        }
    }

    fn url_or_malformed(response: &ProviderResponse) -> Result<String, ProviderError> {
        response
            .url
            .clone()
            .ok_or_else(|| ProviderError::malformed("missing url"))
    }

    fn selector(adapter: Arc<dyn ProviderAdapter>) -> FallbackSelector {
        FallbackSelector::new(
            adapter,
            Arc::new(FallbackCatalog::with_defaults()),
            Arc::new(CircuitRegistry::new(CircuitConfig::default())),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_primary_success_does_not_fall_back() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![Ok(media_response(
            "https://cdn.test/a0.mp3",
        ))]));
        let selector = selector(adapter.clone());

        let outcome = selector
            .execute(PlanTier::Creator, &audio_request(), url_or_malformed)
            .await
            .expect("primary should succeed");

        assert_eq!(outcome.value, "https://cdn.test/a0.mp3");
        assert_eq!(outcome.provider.as_str(), "sonata-hd");
        assert!(!outcome.fell_back());
        assert_eq!(outcome.attempts, 1);
        assert_eq!(adapter.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_falls_back_on_transient_failure() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![
            Err(ProviderError::Http {
                status: 503,
                message: "down".to_string(),
            }),
            Ok(media_response("https://cdn.test/a0.mp3")),
        ]));
        let selector = selector(adapter.clone());

        let outcome = selector
            .execute(PlanTier::Creator, &audio_request(), url_or_malformed)
            .await
            .expect("fallback should succeed");

        assert_eq!(outcome.provider.as_str(), "sonata-lite");
        assert_eq!(outcome.requested.as_str(), "sonata-hd");
        assert!(outcome.fell_back());
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test]
    async fn test_malformed_output_counts_as_candidate_failure() {
        // Primary returns 200 with no url; secondary delivers.
        let adapter = Arc::new(ScriptedAdapter::new(vec![
            Ok(ProviderResponse::default()),
            Ok(media_response("https://cdn.test/a0.mp3")),
        ]));
        let selector = selector(adapter.clone());

        let outcome = selector
            .execute(PlanTier::Creator, &audio_request(), url_or_malformed)
            .await
            .expect("fallback should succeed");

        assert!(outcome.fell_back());
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test]
    async fn test_exhausted_error_lists_every_attempt() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![
            Err(ProviderError::Http {
                status: 500,
                message: "boom".to_string(),
            }),
            Err(ProviderError::RateLimited("quota".to_string())),
        ]));
        let selector = selector(adapter.clone());

        let err = selector
            .execute(PlanTier::Creator, &audio_request(), url_or_malformed)
            .await
            .expect_err("chain should exhaust");

        assert_eq!(err.capability, Capability::AudioSynthesis);
        assert_eq!(err.attempts.len(), 2);
        assert_eq!(err.attempts[0].provider.as_str(), "sonata-hd");
        assert!(err.attempts[0].error.contains("500"));
        assert_eq!(err.attempts[1].provider.as_str(), "sonata-lite");
    }

    #[tokio::test]
    async fn test_open_circuit_skips_candidate_without_invoking() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![Ok(media_response(
            "https://cdn.test/a0.mp3",
        ))]));

        let circuits = Arc::new(CircuitRegistry::new(CircuitConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(300),
        }));
        circuits
            .breaker(Capability::AudioSynthesis, &ProviderId::from("sonata-hd"))
            .record_failure();

        let selector = FallbackSelector::new(
            adapter.clone(),
            Arc::new(FallbackCatalog::with_defaults()),
            circuits,
            Duration::from_secs(5),
        );

        let outcome = selector
            .execute(PlanTier::Creator, &audio_request(), url_or_malformed)
            .await
            .expect("secondary should deliver");

        assert_eq!(outcome.provider.as_str(), "sonata-lite");
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].as_str(), "sonata-hd");
        // The open candidate was never invoked
        let calls = adapter.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].as_str(), "sonata-lite");
    }

    #[tokio::test]
    async fn test_timeout_counts_as_candidate_failure() {
        struct SlowAdapter;

        #[async_trait]
        impl ProviderAdapter for SlowAdapter {
            async fn invoke(
                &self,
                _provider: &ProviderId,
                _request: &ProviderRequest,
            ) -> Result<ProviderResponse, ProviderError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(ProviderResponse::default())
            }
        }

        let selector = FallbackSelector::new(
            Arc::new(SlowAdapter),
            Arc::new(FallbackCatalog::with_defaults()),
            Arc::new(CircuitRegistry::new(CircuitConfig::default())),
            Duration::from_millis(10),
        );

        let err = selector
            .execute(PlanTier::Free, &audio_request(), url_or_malformed)
            .await
            .expect_err("all candidates time out");

        assert_eq!(err.attempts.len(), 1);
        assert!(err.attempts[0].error.contains("timed out"));
    }

    #[tokio::test]
    async fn test_provider_reported_cost_wins_over_catalog() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![Ok(ProviderResponse {
            url: Some("https://cdn.test/a0.mp3".to_string()),
            cost_cents: Some(3),
            ..Default::default()
        })]));
        let selector = selector(adapter);

        let outcome = selector
            .execute(PlanTier::Creator, &audio_request(), url_or_malformed)
            .await
            .expect("primary should succeed");

        assert_eq!(outcome.cost_cents, 3);
    }

    #[tokio::test]
    async fn test_catalog_price_used_when_cost_not_reported() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![Ok(media_response(
            "https://cdn.test/a0.mp3",
        ))]));
        let selector = selector(adapter);

        let outcome = selector
            .execute(PlanTier::Creator, &audio_request(), url_or_malformed)
            .await
            .expect("primary should succeed");

        // sonata-hd catalog price
        assert_eq!(outcome.cost_cents, 8);
    }
}
