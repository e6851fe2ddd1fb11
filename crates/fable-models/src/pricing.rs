//! Cost tables and run estimates.
//!
//! All amounts are integer cents. Per-capability base prices feed budget
//! estimates; the provider catalog may override them with provider-specific
//! prices at settlement time.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Capability, PlanTier};

// =============================================================================
// Base price tables
// =============================================================================

/// Fallback price for one call when a provider has no catalog entry.
pub fn estimated_cost_cents(capability: Capability) -> u64 {
    match capability {
        Capability::ScriptGeneration => 40,
        Capability::ImageGeneration => 12,
        Capability::AudioSynthesis => 8,
        Capability::VideoSynthesis => 90,
        Capability::LipSync => 35,
    }
}

/// Monthly spend ceiling for a tier, in cents.
pub fn monthly_budget_cents(tier: PlanTier) -> u64 {
    match tier {
        PlanTier::Free => 1_500,
        PlanTier::Creator => 8_000,
        PlanTier::Studio => 40_000,
    }
}

// =============================================================================
// Run estimates
// =============================================================================

/// Itemized up-front estimate for one run at base prices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CostBreakdown {
    pub scene_count: u32,
    pub character_count: u32,
    pub script_cents: u64,
    pub character_images_cents: u64,
    pub scene_images_cents: u64,
    pub audio_cents: u64,
    pub scene_video_cents: u64,
    pub lipsync_cents: u64,
}

impl CostBreakdown {
    /// Estimate a run with `scenes` scenes and `characters` distinct
    /// characters, at base prices.
    pub fn estimate(scenes: u32, characters: u32) -> Self {
        let per = estimated_cost_cents;
        Self {
            scene_count: scenes,
            character_count: characters,
            script_cents: per(Capability::ScriptGeneration),
            character_images_cents: per(Capability::ImageGeneration) * characters as u64,
            scene_images_cents: per(Capability::ImageGeneration) * scenes as u64,
            audio_cents: per(Capability::AudioSynthesis) * scenes as u64,
            scene_video_cents: per(Capability::VideoSynthesis) * scenes as u64,
            lipsync_cents: per(Capability::LipSync) * scenes as u64,
        }
    }

    /// Grand total in cents.
    pub fn total_cents(&self) -> u64 {
        self.script_cents
            + self.character_images_cents
            + self.scene_images_cents
            + self.audio_cents
            + self.scene_video_cents
            + self.lipsync_cents
    }

    /// Whether the whole run fits inside a tier's monthly ceiling.
    pub fn fits_within(&self, tier: PlanTier) -> bool {
        self.total_cents() <= monthly_budget_cents(tier)
    }

    /// Human-readable summary, e.g. for pre-flight confirmation.
    ///
    /// Format: "N scene(s), M character(s): $X.YZ estimated"
    pub fn to_description(&self) -> String {
        let scene_text = if self.scene_count == 1 { "scene" } else { "scenes" };
        let character_text = if self.character_count == 1 {
            "character"
        } else {
            "characters"
        };
        let total = self.total_cents();
        format!(
            "{} {}, {} {}: ${}.{:02} estimated",
            self.scene_count,
            scene_text,
            self.character_count,
            character_text,
            total / 100,
            total % 100
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_scales_with_scene_count() {
        let small = CostBreakdown::estimate(3, 1);
        let large = CostBreakdown::estimate(6, 1);

        assert_eq!(small.script_cents, large.script_cents);
        assert_eq!(small.scene_video_cents * 2, large.scene_video_cents);
        assert!(small.total_cents() < large.total_cents());
    }

    #[test]
    fn test_estimate_totals() {
        let breakdown = CostBreakdown::estimate(3, 2);
        // 40 + 12*2 + 12*3 + 8*3 + 90*3 + 35*3
        assert_eq!(breakdown.total_cents(), 40 + 24 + 36 + 24 + 270 + 105);
    }

    #[test]
    fn test_fits_within_tiers() {
        // 40 + 24 + 120 + 80 + 900 + 350 = 1514, just over the Free ceiling
        let breakdown = CostBreakdown::estimate(10, 2);
        assert!(!breakdown.fits_within(PlanTier::Free));
        assert!(breakdown.fits_within(PlanTier::Studio));

        let small = CostBreakdown::estimate(3, 1);
        assert!(small.fits_within(PlanTier::Free));
    }

    #[test]
    fn test_description_formats_cents() {
        let breakdown = CostBreakdown::estimate(1, 1);
        let text = breakdown.to_description();
        assert!(text.starts_with("1 scene, 1 character:"));
        assert!(text.contains('$'));
    }
}
