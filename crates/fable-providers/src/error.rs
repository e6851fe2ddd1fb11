//! Provider error types.

use std::time::Duration;

use thiserror::Error;

use fable_models::{Capability, ProviderId};

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Failure of a single provider call.
///
/// Every variant counts as a candidate failure for circuit-breaker and
/// fallback purposes, including timeouts and unusable output.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Provider returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed provider output: {0}")]
    Malformed(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// One failed candidate inside an exhausted chain.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    /// Provider that was tried
    pub provider: ProviderId,
    /// Why it failed
    pub error: String,
}

/// Every candidate in the fallback chain failed or was skipped.
///
/// Carries the full attempt log so callers can surface exactly which
/// providers were tried and why each one failed.
#[derive(Debug, Error)]
#[error("All providers exhausted for {capability} ({} tried, {} skipped)", attempts.len(), skipped.len())]
pub struct ExhaustedError {
    /// Capability whose chain was exhausted
    pub capability: Capability,
    /// Candidates that were invoked and failed, in chain order
    pub attempts: Vec<AttemptRecord>,
    /// Candidates skipped because their circuit was open
    pub skipped: Vec<ProviderId>,
}

impl ExhaustedError {
    /// Human-readable attempt-by-attempt description.
    pub fn describe(&self) -> String {
        let mut parts: Vec<String> = self
            .attempts
            .iter()
            .map(|a| format!("{}: {}", a.provider, a.error))
            .collect();
        for provider in &self.skipped {
            parts.push(format!("{}: skipped (circuit open)", provider));
        }
        if parts.is_empty() {
            format!("no candidates configured for {}", self.capability)
        } else {
            parts.join("; ")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_describe_lists_all_candidates() {
        let err = ExhaustedError {
            capability: Capability::AudioSynthesis,
            attempts: vec![AttemptRecord {
                provider: ProviderId::from("sonata-hd"),
                error: "HTTP 503".to_string(),
            }],
            skipped: vec![ProviderId::from("sonata-lite")],
        };

        let description = err.describe();
        assert!(description.contains("sonata-hd: HTTP 503"));
        assert!(description.contains("sonata-lite: skipped (circuit open)"));
        assert!(err.to_string().contains("audio_synthesis"));
    }
}
