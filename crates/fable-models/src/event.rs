//! Typed run events published while a pipeline executes.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{ErrorKind, GenerationStep, ProviderId};

/// Event published on the per-generation progress channel.
///
/// Live observers (a websocket bridge, a log tailer) consume these; pollers
/// use the cached snapshot instead.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// Free-form progress note
    Log {
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Overall progress moved (0-100)
    Progress { value: u8 },

    /// A stage began executing
    StepStarted {
        step: GenerationStep,
        total_items: u32,
    },

    /// One item of the current stage finished
    ItemCompleted {
        step: GenerationStep,
        index: u32,
        provider: ProviderId,
    },

    /// Every item of a stage finished
    StepCompleted { step: GenerationStep },

    /// The selector downgraded a provider for one item
    Fallback {
        step: GenerationStep,
        index: u32,
        requested: ProviderId,
        used: ProviderId,
    },

    /// The run produced its final artifact
    Completed { final_video_url: String },

    /// The run failed
    Failed {
        step: GenerationStep,
        kind: ErrorKind,
        message: String,
    },

    /// The run was cancelled
    Cancelled,
}

impl RunEvent {
    /// Log event stamped now.
    pub fn log(message: impl Into<String>) -> Self {
        RunEvent::Log {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Short name for metrics/log labels.
    pub fn kind(&self) -> &'static str {
        match self {
            RunEvent::Log { .. } => "log",
            RunEvent::Progress { .. } => "progress",
            RunEvent::StepStarted { .. } => "step_started",
            RunEvent::ItemCompleted { .. } => "item_completed",
            RunEvent::StepCompleted { .. } => "step_completed",
            RunEvent::Fallback { .. } => "fallback",
            RunEvent::Completed { .. } => "completed",
            RunEvent::Failed { .. } => "failed",
            RunEvent::Cancelled => "cancelled",
        }
    }
}
