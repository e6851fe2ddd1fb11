//! Redis Streams run queue with progress pub/sub.
//!
//! This crate provides:
//! - Run job enqueueing via Redis Streams
//! - Engine consumption with retry/DLQ
//! - Progress events via Redis Pub/Sub
//! - Snapshot cache for status queries
//! - Cancellation control channel

pub mod control;
pub mod error;
pub mod job;
pub mod progress;
pub mod queue;
pub mod status;

pub use control::{ControlChannel, ControlMessage};
pub use error::{QueueError, QueueResult};
pub use job::{RetryRunJob, RunJob, StartRunJob};
pub use progress::{ProgressChannel, ProgressEvent};
pub use queue::{QueueConfig, RunQueue};
pub use status::{
    StatusStore, STALE_GRACE_PERIOD_SECS, STALE_THRESHOLD_SECS, STATUS_TTL_SECS,
};
