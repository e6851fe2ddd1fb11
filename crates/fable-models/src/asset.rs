//! Per-item work records within a stage.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{GenerationId, GenerationStep, ProviderId, ScriptBreakdown};

/// Key of one unit of work: the stage plus the scene/character index.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
pub struct AssetKey {
    pub step: GenerationStep,
    pub index: u32,
}

impl AssetKey {
    pub fn new(step: GenerationStep, index: u32) -> Self {
        Self { step, index }
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.step, self.index)
    }
}

/// Status of one scene asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum AssetStatus {
    /// Not yet dispatched
    #[default]
    Pending,
    /// Dispatched to a provider
    InProgress,
    /// Output accepted
    Completed,
    /// Failed after exhausting fallback (or denied budget)
    Failed,
}

impl AssetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetStatus::Pending => "pending",
            AssetStatus::InProgress => "in_progress",
            AssetStatus::Completed => "completed",
            AssetStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AssetStatus::Completed | AssetStatus::Failed)
    }
}

/// Normalized output of one completed asset.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssetOutput {
    /// Structured script produced by the script stage
    Script { breakdown: ScriptBreakdown },
    /// A generated still image
    Image { url: String },
    /// Synthesized narration for one scene
    Audio { url: String, duration_ms: u64 },
    /// A rendered clip (scene video or lip-synced scene)
    Video { url: String },
}

impl AssetOutput {
    /// URL of the produced artifact, if the output is a remote file.
    pub fn url(&self) -> Option<&str> {
        match self {
            AssetOutput::Script { .. } => None,
            AssetOutput::Image { url }
            | AssetOutput::Audio { url, .. }
            | AssetOutput::Video { url } => Some(url),
        }
    }

    /// The script breakdown, when this is a script output.
    pub fn breakdown(&self) -> Option<&ScriptBreakdown> {
        match self {
            AssetOutput::Script { breakdown } => Some(breakdown),
            _ => None,
        }
    }
}

/// One unit of work within a stage.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SceneAsset {
    /// Owning run
    pub generation_id: GenerationId,

    /// (stage, index) key
    pub key: AssetKey,

    /// Item status
    #[serde(default)]
    pub status: AssetStatus,

    /// Provider that produced the accepted output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_used: Option<ProviderId>,

    /// Provider calls made for this item so far, across retries
    #[serde(default)]
    pub attempt_count: u32,

    /// Settled spend for this item in cents
    #[serde(default)]
    pub cost_cents: u64,

    /// Normalized output (present once completed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<AssetOutput>,

    /// Failure reason (present once failed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl SceneAsset {
    /// Create a new pending asset.
    pub fn new(generation_id: GenerationId, key: AssetKey) -> Self {
        let now = Utc::now();
        Self {
            generation_id,
            key,
            status: AssetStatus::Pending,
            provider_used: None,
            attempt_count: 0,
            cost_cents: 0,
            output: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Mark the asset as dispatched.
    pub fn start(&mut self) {
        self.status = AssetStatus::InProgress;
        self.touch();
    }

    /// Accept an output for this asset.
    pub fn complete(
        &mut self,
        provider: ProviderId,
        attempts: u32,
        cost_cents: u64,
        output: AssetOutput,
    ) {
        self.status = AssetStatus::Completed;
        self.provider_used = Some(provider);
        self.attempt_count += attempts;
        self.cost_cents = self.cost_cents.saturating_add(cost_cents);
        self.output = Some(output);
        self.error_message = None;
        self.touch();
    }

    /// Mark the asset failed.
    pub fn fail(&mut self, attempts: u32, error: impl Into<String>) {
        self.status = AssetStatus::Failed;
        self.attempt_count += attempts;
        self.error_message = Some(error.into());
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_key_display() {
        let key = AssetKey::new(GenerationStep::SceneImages, 2);
        assert_eq!(key.to_string(), "scene_images/2");
    }

    #[test]
    fn test_asset_lifecycle() {
        let mut asset = SceneAsset::new(
            GenerationId::new(),
            AssetKey::new(GenerationStep::Audio, 0),
        );
        assert_eq!(asset.status, AssetStatus::Pending);

        asset.start();
        assert_eq!(asset.status, AssetStatus::InProgress);

        asset.complete(
            ProviderId::new("sonata-hd"),
            2,
            8,
            AssetOutput::Audio {
                url: "https://cdn.example.com/a0.mp3".into(),
                duration_ms: 5400,
            },
        );
        assert_eq!(asset.status, AssetStatus::Completed);
        assert_eq!(asset.attempt_count, 2);
        assert_eq!(asset.cost_cents, 8);
        assert_eq!(
            asset.output.as_ref().and_then(|o| o.url()),
            Some("https://cdn.example.com/a0.mp3")
        );
    }

    #[test]
    fn test_attempts_accumulate_across_redispatch() {
        let mut asset = SceneAsset::new(
            GenerationId::new(),
            AssetKey::new(GenerationStep::SceneVideo, 3),
        );
        asset.start();
        asset.fail(2, "all video providers failed");
        assert_eq!(asset.status, AssetStatus::Failed);
        assert!(asset.status.is_terminal());

        asset.start();
        asset.complete(
            ProviderId::new("kinetix-1.5"),
            1,
            90,
            AssetOutput::Video {
                url: "https://cdn.example.com/v3.mp4".into(),
            },
        );
        assert_eq!(asset.status, AssetStatus::Completed);
        assert_eq!(asset.attempt_count, 3);
        assert!(asset.error_message.is_none());
    }
}
