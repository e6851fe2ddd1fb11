//! Generation request payloads.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::PlanTier;

/// Longest scene-count hint a caller may pass to the script stage.
pub const MAX_TARGET_SCENES: u32 = 24;

/// Voice configuration for audio synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct VoiceSettings {
    /// Provider-agnostic voice preset name
    pub voice: String,

    /// Playback speed multiplier
    #[serde(default = "default_speed")]
    pub speed: f32,

    /// BCP-47 language tag
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_speed() -> f32 {
    1.0
}

fn default_language() -> String {
    "en-US".to_string()
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            voice: "narrator_f1".to_string(),
            speed: default_speed(),
            language: default_language(),
        }
    }
}

/// Camera-motion parameters for scene video synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MotionParams {
    /// Motion intensity, 0.0 (static) to 1.0 (sweeping)
    #[serde(default = "default_motion_strength")]
    pub strength: f32,

    /// Target clip length per scene
    #[serde(default = "default_clip_duration_ms")]
    pub duration_ms: u64,
}

fn default_motion_strength() -> f32 {
    0.5
}

fn default_clip_duration_ms() -> u64 {
    6_000
}

impl Default for MotionParams {
    fn default() -> Self {
        Self {
            strength: default_motion_strength(),
            duration_ms: default_clip_duration_ms(),
        }
    }
}

/// A caller's request to render one script into a video.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GenerationRequest {
    /// Owning user
    pub user_id: String,

    /// Source script document id
    pub script_id: String,

    /// Long-form source text the script stage condenses
    pub source_text: String,

    /// Optional working title
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Subscription tier
    #[serde(default)]
    pub tier: PlanTier,

    /// Narration voice
    #[serde(default)]
    pub voice: VoiceSettings,

    /// Scene-video motion
    #[serde(default)]
    pub motion: MotionParams,

    /// Scene-count hint forwarded to the script provider
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_scene_count: Option<u32>,
}

impl GenerationRequest {
    /// Create a request with default tier, voice, and motion.
    pub fn new(
        user_id: impl Into<String>,
        script_id: impl Into<String>,
        source_text: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            script_id: script_id.into(),
            source_text: source_text.into(),
            title: None,
            tier: PlanTier::default(),
            voice: VoiceSettings::default(),
            motion: MotionParams::default(),
            target_scene_count: None,
        }
    }

    pub fn with_tier(mut self, tier: PlanTier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_voice(mut self, voice: VoiceSettings) -> Self {
        self.voice = voice;
        self
    }

    pub fn with_motion(mut self, motion: MotionParams) -> Self {
        self.motion = motion;
        self
    }

    pub fn with_target_scene_count(mut self, count: u32) -> Self {
        self.target_scene_count = Some(count);
        self
    }

    /// Cheap shape check before the run is accepted.
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.user_id.trim().is_empty() {
            return Err(RequestError::MissingUser);
        }
        if self.script_id.trim().is_empty() {
            return Err(RequestError::MissingScript);
        }
        if self.source_text.trim().is_empty() {
            return Err(RequestError::MissingSource);
        }
        if let Some(count) = self.target_scene_count {
            if count == 0 || count > MAX_TARGET_SCENES {
                return Err(RequestError::SceneCountOutOfRange {
                    got: count,
                    max: MAX_TARGET_SCENES,
                });
            }
        }
        Ok(())
    }
}

/// Why a generation request was rejected before enqueueing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("user_id is required")]
    MissingUser,

    #[error("script_id is required")]
    MissingScript,

    #[error("source_text is required")]
    MissingSource,

    #[error("target_scene_count must be between 1 and {max}, got {got}")]
    SceneCountOutOfRange { got: u32, max: u32 },
}
