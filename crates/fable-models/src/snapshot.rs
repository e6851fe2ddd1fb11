//! Cached run status for fast polling.
//!
//! The engine writes a snapshot to Redis on every transition; the API serves
//! `GetStatus` straight from the cache without reaching into the engine.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{GenerationError, GenerationId, GenerationStatus, GenerationStep};

/// Externally visible state of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl StepState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepState::Pending => "pending",
            StepState::InProgress => "in_progress",
            StepState::Completed => "completed",
            StepState::Failed => "failed",
        }
    }
}

/// Per-step rollup inside a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepSnapshot {
    pub step: GenerationStep,
    pub state: StepState,
    pub completed_items: u32,
    /// 0 until the work set for the step is known.
    pub total_items: u32,
}

impl StepSnapshot {
    pub fn pending(step: GenerationStep) -> Self {
        Self {
            step,
            state: StepState::Pending,
            completed_items: 0,
            total_items: 0,
        }
    }
}

/// Snapshot of one run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GenerationSnapshot {
    /// Run identifier
    pub generation_id: GenerationId,
    /// Owning user
    pub user_id: String,
    /// Run status
    pub status: GenerationStatus,
    /// Overall progress (0-100)
    pub progress: u8,
    /// Step currently executing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<GenerationStep>,
    /// Last fully completed step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_completed_step: Option<GenerationStep>,
    /// Per-step rollups, in pipeline order
    pub steps: Vec<StepSnapshot>,
    /// Scene count (0 until the script stage completes)
    pub total_scenes: u32,
    /// Scenes whose every per-scene item completed
    pub completed_scenes: u32,
    /// Accumulated spend in cents
    pub total_cost_cents: u64,
    /// Structured error if the run failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<GenerationError>,
    /// Final artifact URL once completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    /// When the run was accepted
    pub created_at: DateTime<Utc>,
    /// When the snapshot was last written
    pub updated_at: DateTime<Utc>,
    /// Last heartbeat from the executing engine
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Sequence number for ordering snapshot writes (monotonically increasing)
    #[serde(default)]
    pub event_seq: u64,
}

impl GenerationSnapshot {
    /// Initial snapshot written when a request is accepted, before the
    /// engine picks the run up.
    pub fn pending(generation_id: GenerationId, user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            generation_id,
            user_id: user_id.into(),
            status: GenerationStatus::Pending,
            progress: 0,
            current_step: None,
            last_completed_step: None,
            steps: GenerationStep::ALL.iter().map(|s| StepSnapshot::pending(*s)).collect(),
            total_scenes: 0,
            completed_scenes: 0,
            total_cost_cents: 0,
            error: None,
            preview_url: None,
            created_at: now,
            updated_at: now,
            last_heartbeat: None,
            event_seq: 0,
        }
    }

    /// Bump the write sequence and timestamp.
    pub fn bump(&mut self) {
        self.event_seq += 1;
        self.updated_at = Utc::now();
    }

    /// Record a heartbeat from the executing engine.
    pub fn record_heartbeat(&mut self) {
        self.last_heartbeat = Some(Utc::now());
        self.updated_at = Utc::now();
    }

    /// True while the run can still change.
    pub fn is_live(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Whether the executing engine looks dead.
    ///
    /// A live run is stale when its last heartbeat (or, before any heartbeat,
    /// its creation) is older than the given thresholds.
    pub fn is_stale(&self, stale_threshold_secs: i64, grace_period_secs: i64) -> bool {
        if !self.is_live() {
            return false;
        }

        let now = Utc::now();
        match self.last_heartbeat {
            Some(hb) => (now - hb).num_seconds() > stale_threshold_secs,
            None => (now - self.created_at).num_seconds() > grace_period_secs,
        }
    }
}
