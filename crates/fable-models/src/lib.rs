//! Shared data models for the Fable generation pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Generation runs, pipeline steps, and per-item scene assets
//! - Provider capabilities, identifiers, and plan tiers
//! - Script breakdowns produced by the script stage
//! - Cost tables, run events, and cached status snapshots

pub mod asset;
pub mod event;
pub mod generation;
pub mod pricing;
pub mod provider;
pub mod request;
pub mod script;
pub mod snapshot;

// Re-export common types
pub use asset::{AssetKey, AssetOutput, AssetStatus, SceneAsset};
pub use event::RunEvent;
pub use generation::{
    ErrorKind, FallbackRecord, Generation, GenerationError, GenerationId, GenerationStatus,
    GenerationStep,
};
pub use pricing::{estimated_cost_cents, monthly_budget_cents, CostBreakdown};
pub use provider::{Capability, PlanTier, ProviderId};
pub use request::{GenerationRequest, MotionParams, RequestError, VoiceSettings};
pub use script::{CharacterProfile, ScriptBreakdown, ScriptParseError, ScriptScene};
pub use snapshot::{GenerationSnapshot, StepSnapshot, StepState};
