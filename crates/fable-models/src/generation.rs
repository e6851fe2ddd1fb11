//! Generation run records and the pipeline step vocabulary.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{Capability, PlanTier, ProviderId};

/// Unique identifier for a generation run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct GenerationId(pub String);

impl GenerationId {
    /// Generate a new random generation ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for GenerationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One step of the generation pipeline, in execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStep {
    /// Condense the source text into a structured script
    Script,
    /// One reference image per named character
    CharacterImages,
    /// One still image per scene
    SceneImages,
    /// Narration audio per scene
    Audio,
    /// Animate each scene image into a clip
    SceneVideo,
    /// Align each clip with its narration
    #[serde(rename = "lipsync")]
    LipSync,
    /// Local concatenation of the lip-synced clips
    Merge,
}

impl GenerationStep {
    /// All steps in execution order.
    pub const ALL: [GenerationStep; 7] = [
        GenerationStep::Script,
        GenerationStep::CharacterImages,
        GenerationStep::SceneImages,
        GenerationStep::Audio,
        GenerationStep::SceneVideo,
        GenerationStep::LipSync,
        GenerationStep::Merge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStep::Script => "script",
            GenerationStep::CharacterImages => "character_images",
            GenerationStep::SceneImages => "scene_images",
            GenerationStep::Audio => "audio",
            GenerationStep::SceneVideo => "scene_video",
            GenerationStep::LipSync => "lipsync",
            GenerationStep::Merge => "merge",
        }
    }

    /// Parse from the snake_case name.
    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|step| step.as_str() == s)
    }

    /// Position of this step in the pipeline (0-based).
    pub fn index(&self) -> usize {
        match self {
            GenerationStep::Script => 0,
            GenerationStep::CharacterImages => 1,
            GenerationStep::SceneImages => 2,
            GenerationStep::Audio => 3,
            GenerationStep::SceneVideo => 4,
            GenerationStep::LipSync => 5,
            GenerationStep::Merge => 6,
        }
    }

    /// Step that follows this one, if any.
    pub fn next(&self) -> Option<GenerationStep> {
        GenerationStep::ALL.get(self.index() + 1).copied()
    }

    /// Capability consulted for this step; `None` for the local merge.
    pub fn capability(&self) -> Option<Capability> {
        match self {
            GenerationStep::Script => Some(Capability::ScriptGeneration),
            GenerationStep::CharacterImages | GenerationStep::SceneImages => {
                Some(Capability::ImageGeneration)
            }
            GenerationStep::Audio => Some(Capability::AudioSynthesis),
            GenerationStep::SceneVideo => Some(Capability::VideoSynthesis),
            GenerationStep::LipSync => Some(Capability::LipSync),
            GenerationStep::Merge => None,
        }
    }

    /// Relative weight of this step in overall progress. Weights sum to 100.
    pub fn progress_weight(&self) -> u8 {
        match self {
            GenerationStep::Script => 10,
            GenerationStep::CharacterImages => 10,
            GenerationStep::SceneImages => 20,
            GenerationStep::Audio => 15,
            GenerationStep::SceneVideo => 25,
            GenerationStep::LipSync => 10,
            GenerationStep::Merge => 10,
        }
    }

    /// Cumulative weight of all steps before this one.
    pub fn progress_offset(&self) -> u8 {
        GenerationStep::ALL[..self.index()]
            .iter()
            .map(|step| step.progress_weight())
            .sum()
    }
}

impl fmt::Display for GenerationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a generation run.
///
/// Active statuses mirror the step currently executing so a poller can read
/// where a run is without joining asset rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    /// Accepted, not yet picked up by the engine
    #[default]
    Pending,
    Script,
    CharacterImages,
    SceneImages,
    Audio,
    SceneVideo,
    #[serde(rename = "lipsync")]
    LipSync,
    Merge,
    /// Final video produced
    Completed,
    /// A stage failed; retryable
    Failed,
    /// Explicitly cancelled by the caller
    Cancelled,
}

impl GenerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStatus::Pending => "pending",
            GenerationStatus::Script => "script",
            GenerationStatus::CharacterImages => "character_images",
            GenerationStatus::SceneImages => "scene_images",
            GenerationStatus::Audio => "audio",
            GenerationStatus::SceneVideo => "scene_video",
            GenerationStatus::LipSync => "lipsync",
            GenerationStatus::Merge => "merge",
            GenerationStatus::Completed => "completed",
            GenerationStatus::Failed => "failed",
            GenerationStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GenerationStatus::Completed | GenerationStatus::Failed | GenerationStatus::Cancelled
        )
    }

    /// True while the engine is actively inside a stage.
    pub fn is_active(&self) -> bool {
        !self.is_terminal() && *self != GenerationStatus::Pending
    }

    /// Status that mirrors an executing step.
    pub fn from_step(step: GenerationStep) -> Self {
        match step {
            GenerationStep::Script => GenerationStatus::Script,
            GenerationStep::CharacterImages => GenerationStatus::CharacterImages,
            GenerationStep::SceneImages => GenerationStatus::SceneImages,
            GenerationStep::Audio => GenerationStatus::Audio,
            GenerationStep::SceneVideo => GenerationStatus::SceneVideo,
            GenerationStep::LipSync => GenerationStatus::LipSync,
            GenerationStep::Merge => GenerationStatus::Merge,
        }
    }

    /// Step currently executing, if the run is inside a stage.
    pub fn active_step(&self) -> Option<GenerationStep> {
        match self {
            GenerationStatus::Script => Some(GenerationStep::Script),
            GenerationStatus::CharacterImages => Some(GenerationStep::CharacterImages),
            GenerationStatus::SceneImages => Some(GenerationStep::SceneImages),
            GenerationStatus::Audio => Some(GenerationStep::Audio),
            GenerationStatus::SceneVideo => Some(GenerationStep::SceneVideo),
            GenerationStatus::LipSync => Some(GenerationStep::LipSync),
            GenerationStatus::Merge => Some(GenerationStep::Merge),
            _ => None,
        }
    }
}

impl fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Failure kinds recorded on a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Every candidate provider failed or was circuit-open
    ExhaustedFallback,
    /// The user's period budget could not cover the item estimate
    BudgetExceeded,
    /// Local merge processing failed after bounded retries
    Merge,
    /// Bugs, I/O, queue plumbing
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ExhaustedFallback => "exhausted_fallback",
            ErrorKind::BudgetExceeded => "budget_exceeded",
            ErrorKind::Merge => "merge",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Structured error recorded on a failed run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GenerationError {
    pub kind: ErrorKind,
    /// Step that was executing when the run failed.
    pub step: GenerationStep,
    /// Human-readable reason, surfaced verbatim to pollers.
    pub message: String,
}

impl GenerationError {
    pub fn new(kind: ErrorKind, step: GenerationStep, message: impl Into<String>) -> Self {
        Self {
            kind,
            step,
            message: message.into(),
        }
    }
}

/// Audit record of one provider downgrade.
///
/// Written whenever the selector succeeds on anything other than the first
/// candidate of the chain, so a run that silently downgraded quality stays
/// auditable.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FallbackRecord {
    pub step: GenerationStep,
    pub item_index: u32,
    /// First candidate of the chain (what the tier nominally buys).
    pub requested: ProviderId,
    /// Candidate that actually produced the output.
    pub used: ProviderId,
    /// Candidates that failed or were circuit-skipped before `used`.
    #[serde(default)]
    pub skipped: Vec<ProviderId>,
    pub recorded_at: DateTime<Utc>,
}

/// One pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Generation {
    /// Unique run ID
    pub id: GenerationId,

    /// Owning user
    pub user_id: String,

    /// Source script document this run renders
    pub script_id: String,

    /// Subscription tier driving provider chains and budget
    pub tier: PlanTier,

    /// Run status
    #[serde(default)]
    pub status: GenerationStatus,

    /// Step currently executing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<GenerationStep>,

    /// Last step whose every item completed; retry resumes after it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_completed_step: Option<GenerationStep>,

    /// Overall progress (0-100); never decreases while the run is live
    #[serde(default)]
    pub progress: u8,

    /// Scene count, known once the script stage completes
    #[serde(default)]
    pub total_scenes: u32,

    /// Scenes whose every per-scene item completed
    #[serde(default)]
    pub completed_scenes: u32,

    /// Accumulated spend in cents
    #[serde(default)]
    pub total_cost_cents: u64,

    /// Structured error (if failed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<GenerationError>,

    /// Provider downgrades recorded during the run
    #[serde(default)]
    pub fallbacks: Vec<FallbackRecord>,

    /// Final artifact, set on completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_video_url: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,

    /// First execution timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Completion timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Generation {
    /// Create a new pending run.
    pub fn new(
        id: GenerationId,
        user_id: impl Into<String>,
        script_id: impl Into<String>,
        tier: PlanTier,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id: user_id.into(),
            script_id: script_id.into(),
            tier,
            status: GenerationStatus::Pending,
            current_step: None,
            last_completed_step: None,
            progress: 0,
            total_scenes: 0,
            completed_scenes: 0,
            total_cost_cents: 0,
            error: None,
            fallbacks: Vec::new(),
            final_video_url: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Mark the run as actively executing `step`.
    pub fn begin_step(&mut self, step: GenerationStep) {
        self.status = GenerationStatus::from_step(step);
        self.current_step = Some(step);
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.touch();
    }

    /// Record that every item of `step` completed.
    pub fn complete_step(&mut self, step: GenerationStep) {
        self.last_completed_step = Some(step);
        self.touch();
    }

    /// Raise progress; values at or below the current one are ignored.
    pub fn raise_progress(&mut self, progress: u8) {
        let clamped = progress.min(100);
        if clamped > self.progress {
            self.progress = clamped;
            self.touch();
        }
    }

    /// Record settled spend for one item.
    pub fn add_cost(&mut self, cents: u64) {
        self.total_cost_cents = self.total_cost_cents.saturating_add(cents);
        self.touch();
    }

    /// Record a provider downgrade.
    pub fn record_fallback(&mut self, record: FallbackRecord) {
        self.fallbacks.push(record);
        self.touch();
    }

    /// Mark the run completed with its final artifact.
    pub fn complete(&mut self, final_video_url: impl Into<String>) {
        self.status = GenerationStatus::Completed;
        self.current_step = None;
        self.last_completed_step = Some(GenerationStep::Merge);
        self.progress = 100;
        self.final_video_url = Some(final_video_url.into());
        self.completed_at = Some(Utc::now());
        self.touch();
    }

    /// Mark the run failed at the error's step.
    pub fn fail(&mut self, error: GenerationError) {
        self.status = GenerationStatus::Failed;
        self.current_step = Some(error.step);
        self.error = Some(error);
        self.touch();
    }

    /// Mark the run cancelled. Not a failure: no error payload.
    pub fn cancel(&mut self) {
        self.status = GenerationStatus::Cancelled;
        self.error = None;
        self.completed_at = Some(Utc::now());
        self.touch();
    }

    /// Only failed runs may be retried.
    pub fn can_retry(&self) -> bool {
        self.status == GenerationStatus::Failed
    }

    /// Reopen a failed run at `step`, clearing the recorded error.
    pub fn reopen(&mut self, step: GenerationStep) {
        self.status = GenerationStatus::from_step(step);
        self.current_step = Some(step);
        self.error = None;
        self.completed_at = None;
        self.touch();
    }

    /// First step a retry executes when the caller does not pick one.
    pub fn resume_step(&self) -> GenerationStep {
        match self.last_completed_step {
            Some(step) => step.next().unwrap_or(GenerationStep::Merge),
            None => GenerationStep::Script,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_order_and_next() {
        assert_eq!(
            GenerationStep::Script.next(),
            Some(GenerationStep::CharacterImages)
        );
        assert_eq!(GenerationStep::LipSync.next(), Some(GenerationStep::Merge));
        assert_eq!(GenerationStep::Merge.next(), None);
        assert!(GenerationStep::Script < GenerationStep::Merge);
    }

    #[test]
    fn test_step_weights_sum_to_100() {
        let total: u32 = GenerationStep::ALL
            .iter()
            .map(|s| s.progress_weight() as u32)
            .sum();
        assert_eq!(total, 100);
        assert_eq!(GenerationStep::Script.progress_offset(), 0);
        assert_eq!(GenerationStep::Merge.progress_offset(), 90);
    }

    #[test]
    fn test_step_serde_names() {
        let json = serde_json::to_string(&GenerationStep::LipSync).unwrap();
        assert_eq!(json, "\"lipsync\"");
        assert_eq!(GenerationStep::from_str("scene_video"), Some(GenerationStep::SceneVideo));
        assert_eq!(GenerationStep::from_str("bogus"), None);
    }

    #[test]
    fn test_status_terminal_and_active() {
        assert!(GenerationStatus::Completed.is_terminal());
        assert!(GenerationStatus::Cancelled.is_terminal());
        assert!(!GenerationStatus::Audio.is_terminal());
        assert!(GenerationStatus::Audio.is_active());
        assert!(!GenerationStatus::Pending.is_active());
        assert_eq!(
            GenerationStatus::Audio.active_step(),
            Some(GenerationStep::Audio)
        );
    }

    #[test]
    fn test_progress_is_monotonic() {
        let mut run = Generation::new(GenerationId::new(), "user123", "script-1", PlanTier::Free);
        run.raise_progress(40);
        run.raise_progress(25);
        assert_eq!(run.progress, 40);
        run.raise_progress(100);
        run.raise_progress(250);
        assert_eq!(run.progress, 100);
    }

    #[test]
    fn test_fail_then_reopen() {
        let mut run = Generation::new(GenerationId::new(), "user123", "script-1", PlanTier::Creator);
        run.begin_step(GenerationStep::Script);
        run.complete_step(GenerationStep::Script);
        run.begin_step(GenerationStep::Audio);
        run.fail(GenerationError::new(
            ErrorKind::ExhaustedFallback,
            GenerationStep::Audio,
            "all audio providers failed",
        ));

        assert!(run.can_retry());
        assert_eq!(run.status, GenerationStatus::Failed);
        assert_eq!(run.current_step, Some(GenerationStep::Audio));

        run.reopen(GenerationStep::Audio);
        assert!(run.error.is_none());
        assert_eq!(run.status, GenerationStatus::Audio);
    }

    #[test]
    fn test_resume_step_defaults() {
        let mut run = Generation::new(GenerationId::new(), "user123", "script-1", PlanTier::Free);
        assert_eq!(run.resume_step(), GenerationStep::Script);
        run.complete_step(GenerationStep::SceneImages);
        assert_eq!(run.resume_step(), GenerationStep::Audio);
        run.complete_step(GenerationStep::Merge);
        assert_eq!(run.resume_step(), GenerationStep::Merge);
    }
}
