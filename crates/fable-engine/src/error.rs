//! Engine error types.

use thiserror::Error;

use fable_models::{ErrorKind, GenerationId};
use fable_providers::ExhaustedError;
use fable_queue::QueueError;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Every candidate provider for an item failed or was circuit-skipped.
    #[error("Fallback exhausted: {0}")]
    Exhausted(#[from] ExhaustedError),

    /// An item estimate did not fit the user's remaining monthly budget.
    #[error("Budget exceeded: {message} (needed {needed_cents}c, {available_cents}c available)")]
    BudgetExceeded {
        needed_cents: u64,
        available_cents: u64,
        message: String,
    },

    /// Local merge failed after its bounded retries.
    #[error("Merge failed: {0}")]
    Merge(String),

    /// The caller cancelled the run while it was executing.
    #[error("Run cancelled")]
    Cancelled,

    /// The run is already being executed by this or another engine.
    #[error("Run {0} is locked by another executor")]
    RunLocked(GenerationId),

    /// A retry job referenced a run this engine cannot retry.
    #[error("Retry rejected: {0}")]
    RetryRejected(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn merge(msg: impl Into<String>) -> Self {
        Self::Merge(msg.into())
    }

    pub fn ledger(msg: impl Into<String>) -> Self {
        Self::Ledger(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn retry_rejected(msg: impl Into<String>) -> Self {
        Self::RetryRejected(msg.into())
    }

    /// Failure kind recorded on the run when this error fails it.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Exhausted(_) => ErrorKind::ExhaustedFallback,
            EngineError::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
            EngineError::Merge(_) => ErrorKind::Merge,
            _ => ErrorKind::Internal,
        }
    }

    /// Semantic failures are final for the run: the pipeline records them on
    /// the ledger and the job is acked. Everything else is infrastructure
    /// trouble and goes back through queue redelivery.
    pub fn is_semantic(&self) -> bool {
        matches!(
            self,
            EngineError::Exhausted(_)
                | EngineError::BudgetExceeded { .. }
                | EngineError::Merge(_)
                | EngineError::RetryRejected(_)
        )
    }

    /// Whether queue redelivery should retry the job.
    pub fn is_retryable(&self) -> bool {
        !self.is_semantic() && !matches!(self, EngineError::Cancelled)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fable_models::Capability;

    #[test]
    fn test_semantic_errors_are_not_retryable() {
        let budget = EngineError::BudgetExceeded {
            needed_cents: 90,
            available_cents: 12,
            message: "scene_video item 2".into(),
        };
        assert!(budget.is_semantic());
        assert!(!budget.is_retryable());
        assert_eq!(budget.kind(), ErrorKind::BudgetExceeded);

        let exhausted = EngineError::Exhausted(ExhaustedError {
            capability: Capability::AudioSynthesis,
            attempts: vec![],
            skipped: vec![],
        });
        assert!(exhausted.is_semantic());
        assert_eq!(exhausted.kind(), ErrorKind::ExhaustedFallback);
    }

    #[test]
    fn test_infra_errors_are_retryable() {
        let err = EngineError::internal("redis hiccup");
        assert!(!err.is_semantic());
        assert!(err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_cancelled_is_neither_semantic_nor_retryable() {
        let err = EngineError::Cancelled;
        assert!(!err.is_semantic());
        assert!(!err.is_retryable());
        assert!(err.is_cancelled());
    }
}
