//! Generation pipeline engine.
//!
//! This crate provides:
//! - The run executor that drains the run queue under a concurrency cap
//! - The pipeline runner: stage walk, fan-out, fallback, merge
//! - The in-memory generation ledger with per-run execution locks
//! - Budget reservation and settlement against monthly plan ceilings
//! - Status snapshot projection and progress publishing
//! - Graceful shutdown

pub mod budget;
pub mod config;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod merge;
pub mod metrics;
pub mod pipeline;
pub mod retry;
pub mod stages;
pub mod status;

pub use budget::{BudgetEntry, BudgetEntryKind, BudgetTracker, Reservation};
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use executor::RunExecutor;
pub use ledger::{GenerationLedger, RunGuard};
pub use merge::{FfmpegMerger, Merger};
pub use pipeline::PipelineRunner;
pub use retry::{retry_async, FailureTracker, RetryConfig, RetryResult};
pub use stages::{StageContext, StageItem, StageProcessor};
pub use status::{step_progress, StatusReporter};
