//! Background recovery of runs whose engine stopped reporting.
//!
//! The engine refreshes each executing run's snapshot on a heartbeat
//! interval. When an engine dies mid-run its snapshot stops moving while
//! the run stays non-terminal; this service sweeps the active set, marks
//! such runs failed, and notifies any live subscribers.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{error, info, warn};

use fable_models::{ErrorKind, GenerationError, GenerationSnapshot, GenerationStatus, GenerationStep};
use fable_queue::{
    ProgressChannel, QueueResult, StatusStore, STALE_GRACE_PERIOD_SECS, STALE_THRESHOLD_SECS,
};

/// Interval between detection sweeps.
const DETECTION_INTERVAL: Duration = Duration::from_secs(30);

/// Marks runs with no recent heartbeat as failed.
pub struct StaleRunDetector {
    status: Arc<StatusStore>,
    progress: Arc<ProgressChannel>,
    enabled: bool,
}

impl StaleRunDetector {
    /// Create a new detector.
    pub fn new(status: Arc<StatusStore>, progress: Arc<ProgressChannel>) -> Self {
        let enabled = std::env::var("ENABLE_STALE_DETECTION")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);

        Self {
            status,
            progress,
            enabled,
        }
    }

    /// Start the background detection loop.
    ///
    /// Runs indefinitely and should be spawned as a background task.
    pub async fn run(&self) {
        if !self.enabled {
            info!("Stale run detection is disabled");
            return;
        }

        info!(
            "Starting stale run detector (interval: {:?})",
            DETECTION_INTERVAL
        );

        let mut ticker = interval(DETECTION_INTERVAL);

        loop {
            ticker.tick().await;

            if let Err(e) = self.check_once().await {
                error!("Stale run sweep failed: {}", e);
            }
        }
    }

    /// Run a single sweep; returns (stale, recovered) counts.
    pub async fn check_once(&self) -> QueueResult<(u32, u32)> {
        let snapshots = self.status.active_snapshots().await?;

        let mut stale_count = 0u32;
        let mut recovered_count = 0u32;

        for snapshot in snapshots {
            if snapshot.status.is_terminal() {
                // A terminal run does not belong in the active set;
                // rewriting the snapshot prunes it.
                self.status.put(&snapshot).await.ok();
                continue;
            }

            if !snapshot.is_stale(STALE_THRESHOLD_SECS, STALE_GRACE_PERIOD_SECS) {
                continue;
            }

            stale_count += 1;
            warn!(
                generation_id = %snapshot.generation_id,
                user_id = %snapshot.user_id,
                last_heartbeat = ?snapshot.last_heartbeat,
                created_at = %snapshot.created_at,
                "Detected stale run (no heartbeat)"
            );

            let id = snapshot.generation_id.clone();
            match self.recover(snapshot).await {
                Ok(()) => {
                    recovered_count += 1;
                    info!(generation_id = %id, "Marked stale run as failed");
                }
                Err(e) => {
                    error!(generation_id = %id, "Failed to recover stale run: {}", e);
                }
            }
        }

        if stale_count > 0 {
            info!(
                "Stale run sweep complete: {} stale, {} recovered",
                stale_count, recovered_count
            );
        }

        Ok((stale_count, recovered_count))
    }

    /// Mark one stale run failed and notify subscribers.
    async fn recover(&self, mut snapshot: GenerationSnapshot) -> QueueResult<()> {
        let step = snapshot
            .current_step
            .or_else(|| snapshot.status.active_step())
            .unwrap_or(GenerationStep::Script);
        let message = "Run stopped making progress. The engine may have crashed; retry the run.";

        snapshot.status = GenerationStatus::Failed;
        snapshot.error = Some(GenerationError::new(ErrorKind::Internal, step, message));
        if let Some(row) = snapshot.steps.iter_mut().find(|s| s.step == step) {
            row.state = fable_models::StepState::Failed;
        }
        snapshot.bump();

        // put() also removes the run from the active set
        self.status.put(&snapshot).await?;

        self.progress
            .failed(&snapshot.generation_id, step, ErrorKind::Internal, message)
            .await
            .ok();

        Ok(())
    }
}
