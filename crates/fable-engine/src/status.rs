//! Status projection and progress reporting.
//!
//! The ledger is authoritative; this module projects it into the
//! [`GenerationSnapshot`] the API serves and the [`RunEvent`] stream live
//! clients subscribe to. Publishing is best-effort: a Redis hiccup is logged
//! and the pipeline keeps going, since the ledger still holds the truth.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use tracing::warn;

use fable_models::{
    AssetStatus, Generation, GenerationId, GenerationSnapshot, GenerationStatus, GenerationStep,
    RunEvent, SceneAsset, StepSnapshot, StepState,
};
use fable_queue::{ProgressChannel, StatusStore};

/// Overall progress with `completed_items` of `total_items` done in `step`.
///
/// Progress is the step's cumulative offset plus its weight scaled by item
/// completion, so a run walking the pipeline in order produces a value that
/// only moves forward.
pub fn step_progress(step: GenerationStep, completed_items: u32, total_items: u32) -> u8 {
    let offset = step.progress_offset() as u32;
    let weight = step.progress_weight() as u32;
    let scaled = weight * completed_items.min(total_items) / total_items.max(1);
    (offset + scaled).min(100) as u8
}

/// Project a run and its asset rows into a pollable snapshot.
pub fn project_snapshot(generation: &Generation, assets: &[SceneAsset]) -> GenerationSnapshot {
    let steps = GenerationStep::ALL
        .iter()
        .map(|&step| {
            let rows: Vec<&SceneAsset> = assets.iter().filter(|a| a.key.step == step).collect();
            let total_items = rows.len() as u32;
            let completed_items = rows
                .iter()
                .filter(|a| a.status == AssetStatus::Completed)
                .count() as u32;

            let failed_here = generation
                .error
                .as_ref()
                .map(|e| e.step == step)
                .unwrap_or(false);
            let step_done = total_items > 0 && completed_items == total_items;

            let state = if generation.status == GenerationStatus::Failed && failed_here {
                StepState::Failed
            } else if step_done
                || generation
                    .last_completed_step
                    .map(|done| step.index() <= done.index())
                    .unwrap_or(false)
            {
                StepState::Completed
            } else if generation.current_step == Some(step) && generation.status.is_active() {
                StepState::InProgress
            } else {
                StepState::Pending
            };

            StepSnapshot {
                step,
                state,
                completed_items,
                total_items,
            }
        })
        .collect();

    GenerationSnapshot {
        generation_id: generation.id.clone(),
        user_id: generation.user_id.clone(),
        status: generation.status,
        progress: generation.progress,
        current_step: generation.current_step,
        last_completed_step: generation.last_completed_step,
        steps,
        total_scenes: generation.total_scenes,
        completed_scenes: generation.completed_scenes,
        total_cost_cents: generation.total_cost_cents,
        error: generation.error.clone(),
        preview_url: generation.final_video_url.clone(),
        created_at: generation.created_at,
        updated_at: generation.updated_at,
        // The engine is publishing, so it is alive
        last_heartbeat: Some(Utc::now()),
        event_seq: 0,
    }
}

/// Publishes snapshots and live events for executing runs.
///
/// Constructed detached (no Redis) for ledger-only operation; the executor
/// always wires it to the status store and progress channel.
pub struct StatusReporter {
    store: Option<StatusStore>,
    progress: Option<ProgressChannel>,
    seqs: Mutex<HashMap<GenerationId, u64>>,
}

impl StatusReporter {
    pub fn new(store: StatusStore, progress: ProgressChannel) -> Self {
        Self {
            store: Some(store),
            progress: Some(progress),
            seqs: Mutex::new(HashMap::new()),
        }
    }

    /// Reporter that projects but publishes nowhere.
    pub fn detached() -> Self {
        Self {
            store: None,
            progress: None,
            seqs: Mutex::new(HashMap::new()),
        }
    }

    /// Project the run and write the snapshot to the status cache.
    ///
    /// Each write for a run carries a higher `event_seq` than the last, so
    /// out-of-order cache writes cannot roll a poller backwards.
    pub async fn publish(
        &self,
        generation: &Generation,
        assets: &[SceneAsset],
    ) -> GenerationSnapshot {
        let mut snapshot = project_snapshot(generation, assets);
        snapshot.event_seq = self.next_seq(&generation.id);

        if let Some(store) = &self.store {
            if let Err(e) = store.put(&snapshot).await {
                warn!(
                    generation_id = %generation.id,
                    error = %e,
                    "Failed to write status snapshot"
                );
            }
        }

        snapshot
    }

    /// Emit a live event on the run's progress channel.
    pub async fn emit(&self, id: &GenerationId, event: RunEvent) {
        if let Some(progress) = &self.progress {
            if let Err(e) = progress.emit(id, event).await {
                warn!(generation_id = %id, error = %e, "Failed to emit run event");
            }
        }
    }

    fn next_seq(&self, id: &GenerationId) -> u64 {
        let mut seqs = self.seqs.lock().unwrap();
        let seq = seqs.entry(id.clone()).or_insert(0);
        *seq += 1;
        *seq
    }
}
