//! Provider and subscription vocabulary shared across the pipeline.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A logical generation capability, independent of any concrete provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Turn long-form text into a structured script
    ScriptGeneration,
    /// Generate a still image from a prompt
    ImageGeneration,
    /// Synthesize narration audio for one scene
    AudioSynthesis,
    /// Animate a still image into a short clip
    VideoSynthesis,
    /// Align a rendered clip's faces with narration audio
    LipSync,
}

impl Capability {
    /// All capabilities the pipeline consumes.
    pub const ALL: [Capability; 5] = [
        Capability::ScriptGeneration,
        Capability::ImageGeneration,
        Capability::AudioSynthesis,
        Capability::VideoSynthesis,
        Capability::LipSync,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::ScriptGeneration => "script_generation",
            Capability::ImageGeneration => "image_generation",
            Capability::AudioSynthesis => "audio_synthesis",
            Capability::VideoSynthesis => "video_synthesis",
            Capability::LipSync => "lip_sync",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identifier of one external provider/model (e.g. `"muralist-v3"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct ProviderId(pub String);

impl ProviderId {
    /// Create from an existing string.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProviderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ProviderId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Subscription tier of the requesting user.
///
/// The tier picks the fallback chain (better models first on higher tiers)
/// and the monthly budget ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    #[default]
    Free,
    Creator,
    Studio,
}

impl PlanTier {
    /// All tiers, cheapest first.
    pub const ALL: [PlanTier; 3] = [PlanTier::Free, PlanTier::Creator, PlanTier::Studio];

    /// Parse from string (case-insensitive).
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "creator" => PlanTier::Creator,
            "studio" => PlanTier::Studio,
            _ => PlanTier::Free,
        }
    }

    /// Get the tier name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Creator => "creator",
            PlanTier::Studio => "studio",
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_round_trip() {
        for cap in Capability::ALL {
            let json = serde_json::to_string(&cap).unwrap();
            assert_eq!(json, format!("\"{}\"", cap.as_str()));
            let back: Capability = serde_json::from_str(&json).unwrap();
            assert_eq!(back, cap);
        }
    }

    #[test]
    fn test_plan_tier_from_string() {
        assert_eq!(PlanTier::from_str("free"), PlanTier::Free);
        assert_eq!(PlanTier::from_str("creator"), PlanTier::Creator);
        assert_eq!(PlanTier::from_str("Studio"), PlanTier::Studio);
        assert_eq!(PlanTier::from_str("unknown"), PlanTier::Free);
    }

    #[test]
    fn test_provider_id_transparent_serde() {
        let id = ProviderId::new("kinetix-1.5");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"kinetix-1.5\"");
    }
}
