//! Run job types for the queue.

use chrono::{DateTime, Utc};
use fable_models::{GenerationId, GenerationRequest, GenerationStep};
use serde::{Deserialize, Serialize};

/// Job to start a fresh generation run.
///
/// Carries the full request so the engine can execute without a
/// round-trip to the API process. The generation record is created
/// by the engine when the job is picked up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRunJob {
    /// Generation this run belongs to
    pub generation_id: GenerationId,
    /// Full generation request
    pub request: GenerationRequest,
    /// When the job was created
    pub created_at: DateTime<Utc>,
}

impl StartRunJob {
    /// Create a new start job.
    pub fn new(generation_id: GenerationId, request: GenerationRequest) -> Self {
        Self {
            generation_id,
            request,
            created_at: Utc::now(),
        }
    }

    /// Generate idempotency key for deduplication.
    pub fn idempotency_key(&self) -> String {
        format!("start:{}:{}", self.request.user_id, self.generation_id)
    }
}

/// Job to retry a failed generation run.
///
/// `from_step` forces re-execution from a specific stage; when absent
/// the engine resumes from the last completed stage. `failed_only`
/// limits re-execution to items that previously failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryRunJob {
    /// Generation to retry
    pub generation_id: GenerationId,
    /// User ID
    pub user_id: String,
    /// Stage to restart from, or None to resume automatically
    pub from_step: Option<GenerationStep>,
    /// Only re-run items that failed, keep completed ones
    pub failed_only: bool,
    /// When the job was created
    pub created_at: DateTime<Utc>,
}

impl RetryRunJob {
    /// Create a new retry job that resumes from the last completed stage.
    pub fn new(generation_id: GenerationId, user_id: impl Into<String>) -> Self {
        Self {
            generation_id,
            user_id: user_id.into(),
            from_step: None,
            failed_only: false,
            created_at: Utc::now(),
        }
    }

    /// Force the retry to restart from a specific stage.
    pub fn with_from_step(mut self, step: GenerationStep) -> Self {
        self.from_step = Some(step);
        self
    }

    /// Only re-run items that previously failed.
    pub fn with_failed_only(mut self, failed_only: bool) -> Self {
        self.failed_only = failed_only;
        self
    }

    /// Generate idempotency key for deduplication.
    pub fn idempotency_key(&self) -> String {
        let step = self.from_step.map(|s| s.as_str()).unwrap_or("auto");
        format!(
            "retry:{}:{}:{}",
            self.generation_id, step, self.failed_only
        )
    }
}

/// Generic job wrapper for queue storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunJob {
    /// Start a fresh generation run
    StartRun(StartRunJob),
    /// Retry a failed generation run
    RetryRun(RetryRunJob),
}

impl RunJob {
    pub fn generation_id(&self) -> &GenerationId {
        match self {
            RunJob::StartRun(j) => &j.generation_id,
            RunJob::RetryRun(j) => &j.generation_id,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            RunJob::StartRun(j) => &j.request.user_id,
            RunJob::RetryRun(j) => &j.user_id,
        }
    }

    pub fn idempotency_key(&self) -> String {
        match self {
            RunJob::StartRun(j) => j.idempotency_key(),
            RunJob::RetryRun(j) => j.idempotency_key(),
        }
    }

    /// Returns true if this is a retry of an existing run.
    pub fn is_retry(&self) -> bool {
        matches!(self, RunJob::RetryRun(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_job_start_serde_roundtrip() {
        let request = GenerationRequest::new("user_1", "script_9", "Once upon a time...");
        let job = StartRunJob::new(GenerationId::new(), request.clone());

        let wrapper = RunJob::StartRun(job.clone());
        let json = serde_json::to_string(&wrapper).expect("serialize RunJob");
        let decoded: RunJob = serde_json::from_str(&json).expect("deserialize RunJob");

        match decoded {
            RunJob::StartRun(j) => {
                assert_eq!(j.generation_id, job.generation_id);
                assert_eq!(j.request.user_id, request.user_id);
                assert_eq!(j.request.source_text, request.source_text);
                assert_eq!(j.created_at, job.created_at);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn retry_idempotency_key_distinguishes_params() {
        let id = GenerationId::new();
        let auto = RetryRunJob::new(id.clone(), "user_1");
        let from_audio = RetryRunJob::new(id.clone(), "user_1").with_from_step(GenerationStep::Audio);
        let failed_only = RetryRunJob::new(id, "user_1").with_failed_only(true);

        assert_ne!(auto.idempotency_key(), from_audio.idempotency_key());
        assert_ne!(auto.idempotency_key(), failed_only.idempotency_key());
        assert!(from_audio.idempotency_key().contains("audio"));
    }

    #[test]
    fn run_job_accessors() {
        let request = GenerationRequest::new("user_7", "script_2", "text");
        let start = RunJob::StartRun(StartRunJob::new(GenerationId::new(), request));
        let retry = RunJob::RetryRun(RetryRunJob::new(GenerationId::new(), "user_7"));

        assert_eq!(start.user_id(), "user_7");
        assert!(!start.is_retry());
        assert!(retry.is_retry());
        assert!(start.idempotency_key().starts_with("start:"));
        assert!(retry.idempotency_key().starts_with("retry:"));
    }
}
