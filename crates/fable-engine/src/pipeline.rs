//! Run orchestration.
//!
//! [`PipelineRunner`] executes one queued run job end to end: it walks the
//! stage sequence from the job's entry point, fans each stage out over its
//! planned items with bounded parallelism, and finishes with the local merge.
//! Per item it holds budget before any provider is invoked, walks the
//! fallback chain through the selector, and records the outcome on the
//! ledger so an interrupted run can resume without repeating paid work.
//!
//! Cancellation is observed at checkpoints (between stages and before each
//! item is dispatched). In-flight provider calls are allowed to finish and
//! are settled honestly; the run just never advances past them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use fable_models::{
    AssetKey, AssetOutput, AssetStatus, FallbackRecord, Generation, GenerationError, GenerationId,
    GenerationStep, RunEvent,
};
use fable_providers::{FallbackSelector, SelectorOutcome};
use fable_queue::{RetryRunJob, RunJob, StartRunJob};

use crate::budget::BudgetTracker;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::ledger::GenerationLedger;
use crate::merge::Merger;
use crate::metrics;
use crate::retry::{retry_async, RetryConfig, RetryResult};
use crate::stages::{self, StageContext, StageItem, StageProcessor};
use crate::status::{step_progress, StatusReporter};

/// Per-scene stages; a scene counts as complete once all four delivered.
const PER_SCENE_STEPS: [GenerationStep; 4] = [
    GenerationStep::SceneImages,
    GenerationStep::Audio,
    GenerationStep::SceneVideo,
    GenerationStep::LipSync,
];

/// Executes run jobs against the ledger, budget, and provider selector.
///
/// One runner is shared by every worker slot of the executor; all state
/// lives in the ledger and budget tracker, so concurrent runs only contend
/// on those locks.
pub struct PipelineRunner {
    config: EngineConfig,
    ledger: Arc<GenerationLedger>,
    budget: Arc<BudgetTracker>,
    selector: Arc<FallbackSelector>,
    merger: Arc<dyn Merger>,
    reporter: Arc<StatusReporter>,
}

impl PipelineRunner {
    pub fn new(
        config: EngineConfig,
        ledger: Arc<GenerationLedger>,
        budget: Arc<BudgetTracker>,
        selector: Arc<FallbackSelector>,
        merger: Arc<dyn Merger>,
        reporter: Arc<StatusReporter>,
    ) -> Self {
        Self {
            config,
            ledger,
            budget,
            selector,
            merger,
            reporter,
        }
    }

    /// Execute one queued job to a terminal state or a resumable stop.
    ///
    /// The caller must hold the run lock for the job's generation. On
    /// semantic failures (exhausted chains, budget denial, merge failure)
    /// the run is recorded as failed before the error is returned; on
    /// infrastructure errors the run is left non-terminal so a redelivered
    /// job can resume it.
    pub async fn execute(
        &self,
        job: &RunJob,
        cancel: watch::Receiver<bool>,
    ) -> EngineResult<()> {
        let id = job.generation_id().clone();

        let plan = match job {
            RunJob::StartRun(start) => self.prepare_start(start)?,
            RunJob::RetryRun(retry) => Some(self.prepare_retry(retry).await?),
        };
        let Some((from, failed_only)) = plan else {
            return Ok(());
        };

        let started = Instant::now();
        info!(
            generation_id = %id,
            from_step = %from,
            failed_only,
            retry = job.is_retry(),
            "Run executing"
        );

        match self.drive(&id, from, failed_only, &cancel).await {
            Ok(final_url) => {
                let generation = self.ledger.update(&id, {
                    let url = final_url.clone();
                    move |g| g.complete(url)
                })?;
                self.publish(&id).await;
                self.reporter
                    .emit(
                        &id,
                        RunEvent::Completed {
                            final_video_url: final_url.clone(),
                        },
                    )
                    .await;
                metrics::record_run_completed(started.elapsed().as_secs_f64());
                info!(
                    generation_id = %id,
                    final_video_url = %final_url,
                    total_cost_cents = generation.total_cost_cents,
                    fallbacks = generation.fallbacks.len(),
                    "Run completed"
                );
                Ok(())
            }
            Err(EngineError::Cancelled) => {
                self.ledger.update(&id, |g| g.cancel())?;
                self.publish(&id).await;
                self.reporter.emit(&id, RunEvent::Cancelled).await;
                metrics::record_run_cancelled();
                info!(generation_id = %id, "Run cancelled");
                Err(EngineError::Cancelled)
            }
            Err(e) if e.is_semantic() => {
                let step = self
                    .ledger
                    .generation(&id)
                    .and_then(|g| g.current_step)
                    .unwrap_or(from);
                let run_error = GenerationError::new(e.kind(), step, e.to_string());
                self.ledger.update(&id, {
                    let run_error = run_error.clone();
                    move |g| g.fail(run_error)
                })?;
                self.publish(&id).await;
                self.reporter
                    .emit(
                        &id,
                        RunEvent::Failed {
                            step,
                            kind: run_error.kind,
                            message: run_error.message.clone(),
                        },
                    )
                    .await;
                metrics::record_run_failed(run_error.kind.as_str());
                warn!(
                    generation_id = %id,
                    step = %step,
                    kind = run_error.kind.as_str(),
                    error = %e,
                    "Run failed"
                );
                Err(e)
            }
            Err(e) => {
                // Infrastructure failure: no terminal transition, the
                // redelivered job resumes from the last completed stage.
                error!(generation_id = %id, error = %e, "Run interrupted");
                Err(e)
            }
        }
    }

    // =========================================================================
    // Job admission
    // =========================================================================

    /// Admit a start job. Returns `None` when there is nothing to execute.
    fn prepare_start(
        &self,
        job: &StartRunJob,
    ) -> EngineResult<Option<(GenerationStep, bool)>> {
        let id = &job.generation_id;
        job.request
            .validate()
            .map_err(|e| EngineError::config(format!("Invalid request for run {id}: {e}")))?;

        let generation = Generation::new(
            id.clone(),
            job.request.user_id.clone(),
            job.request.script_id.clone(),
            job.request.tier,
        );
        if self.ledger.register(generation, job.request.clone()) {
            return Ok(Some((GenerationStep::Script, false)));
        }

        // Redelivered start job for a run this process already holds.
        let existing = self.require_generation(id)?;
        if existing.status.is_terminal() {
            info!(
                generation_id = %id,
                status = %existing.status,
                "Start job for a terminal run, nothing to do"
            );
            return Ok(None);
        }
        let resume = existing.resume_step();
        info!(generation_id = %id, resume_step = %resume, "Resuming interrupted run");
        Ok(Some((resume, false)))
    }

    /// Admit a retry job, reopening the failed run at its entry step.
    async fn prepare_retry(&self, job: &RetryRunJob) -> EngineResult<(GenerationStep, bool)> {
        let id = &job.generation_id;
        let generation = self.ledger.generation(id).ok_or_else(|| {
            EngineError::retry_rejected(format!("Run {id} is not on this engine's ledger"))
        })?;
        if !generation.can_retry() {
            return Err(EngineError::retry_rejected(format!(
                "Run {id} is {}; only failed runs can be retried",
                generation.status
            )));
        }

        let resume = generation.resume_step();
        let from = job.from_step.unwrap_or(resume);
        if from.index() > resume.index() {
            return Err(EngineError::retry_rejected(format!(
                "Cannot retry run {id} from {from}: no stage past {resume} has run yet"
            )));
        }

        self.ledger.update(id, |g| g.reopen(from))?;
        self.publish(id).await;
        info!(
            generation_id = %id,
            from_step = %from,
            failed_only = job.failed_only,
            "Retrying failed run"
        );
        Ok((from, job.failed_only))
    }

    // =========================================================================
    // Stage walk
    // =========================================================================

    /// Walk the pipeline from `from`, returning the final video URL.
    async fn drive(
        &self,
        id: &GenerationId,
        from: GenerationStep,
        failed_only: bool,
        cancel: &watch::Receiver<bool>,
    ) -> EngineResult<String> {
        let mut step = Some(from);
        while let Some(current) = step {
            if *cancel.borrow() {
                return Err(EngineError::Cancelled);
            }
            if current == GenerationStep::Merge {
                return self.run_merge(id).await;
            }
            self.run_stage(id, current, failed_only, cancel).await?;
            step = current.next();
        }
        Err(EngineError::internal(format!(
            "Run {id} walked past the merge step"
        )))
    }

    /// Execute one provider-backed stage to completion.
    ///
    /// Items whose assets already completed are never dispatched again;
    /// the stage only counts as complete once every planned item has a
    /// completed asset, and the first item failure fails the whole stage.
    async fn run_stage(
        &self,
        id: &GenerationId,
        step: GenerationStep,
        failed_only: bool,
        cancel: &watch::Receiver<bool>,
    ) -> EngineResult<()> {
        let processor = stages::processor_for(step)
            .ok_or_else(|| EngineError::internal(format!("No processor for step {step}")))?;
        let stage_started = Instant::now();

        self.ledger.update(id, |g| g.begin_step(step))?;

        let items = {
            let generation = self.require_generation(id)?;
            let request = self.require_request(id)?;
            let breakdown = self.ledger.breakdown(id);
            let assets = self.ledger.assets(id);
            let ctx = StageContext {
                generation: &generation,
                request: &request,
                breakdown: breakdown.as_ref(),
                assets: &assets,
            };
            processor.plan(&ctx)?
        };

        let total_items = items.len() as u32;
        self.reporter
            .emit(id, RunEvent::StepStarted { step, total_items })
            .await;
        self.publish(id).await;

        // Completed items are never re-run. Under failed_only, previously
        // attempted items are re-dispatched only if they failed; work that
        // was never attempted is always dispatched so a narrowed retry can
        // still carry the run forward.
        let mut pending: Vec<&StageItem> = Vec::new();
        let mut skipped = 0u32;
        for item in &items {
            let key = AssetKey::new(step, item.index);
            let previous = self.ledger.asset(id, key);
            let dispatch = match &previous {
                None => true,
                Some(asset) => match asset.status {
                    AssetStatus::Completed => false,
                    AssetStatus::Failed => true,
                    AssetStatus::Pending | AssetStatus::InProgress => !failed_only,
                },
            };
            self.ledger.ensure_asset(id, key)?;
            if dispatch {
                pending.push(item);
            } else {
                skipped += 1;
            }
        }

        if !pending.is_empty() {
            debug!(
                generation_id = %id,
                step = %step,
                dispatching = pending.len(),
                skipped,
                "Stage dispatching"
            );

            let semaphore = Arc::new(Semaphore::new(self.config.max_stage_parallel));
            let processor_ref: &dyn StageProcessor = processor.as_ref();
            let futures: Vec<_> = pending
                .iter()
                .map(|&item| {
                    let semaphore = Arc::clone(&semaphore);
                    let cancel = cancel.clone();
                    async move {
                        let _permit = match semaphore.acquire().await {
                            Ok(permit) => permit,
                            Err(_) => {
                                return (
                                    item.index,
                                    Err(EngineError::internal("stage semaphore closed")),
                                )
                            }
                        };
                        if *cancel.borrow() {
                            return (item.index, Err(EngineError::Cancelled));
                        }
                        (item.index, self.run_item(id, processor_ref, item).await)
                    }
                })
                .collect();

            let results = join_all(futures).await;

            let mut cancelled = false;
            let mut first_error: Option<EngineError> = None;
            for (index, result) in results {
                match result {
                    Ok(()) => {}
                    Err(EngineError::Cancelled) => cancelled = true,
                    Err(e) => {
                        warn!(
                            generation_id = %id,
                            step = %step,
                            index,
                            error = %e,
                            "Stage item failed"
                        );
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                }
            }

            if cancelled || *cancel.borrow() {
                return Err(EngineError::Cancelled);
            }
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        let incomplete = self
            .ledger
            .assets_for_step(id, step)
            .iter()
            .filter(|a| a.status != AssetStatus::Completed)
            .count();
        if incomplete > 0 {
            return Err(EngineError::internal(format!(
                "{incomplete} items of {step} did not complete for run {id}"
            )));
        }

        self.finish_stage(id, step, stage_started).await
    }

    /// Record stage completion and advance run-level bookkeeping.
    async fn finish_stage(
        &self,
        id: &GenerationId,
        step: GenerationStep,
        started: Instant,
    ) -> EngineResult<()> {
        if step == GenerationStep::Script {
            if let Some(breakdown) = self.ledger.breakdown(id) {
                let scenes = breakdown.scene_count();
                self.ledger.update(id, |g| g.total_scenes = scenes)?;
            }
        }

        let generation = self.ledger.update(id, |g| {
            g.complete_step(step);
            g.raise_progress(step_progress(step, 1, 1));
        })?;
        metrics::record_stage_duration(step.as_str(), started.elapsed().as_secs_f64());
        self.reporter
            .emit(id, RunEvent::StepCompleted { step })
            .await;
        self.publish(id).await;
        info!(
            generation_id = %id,
            step = %step,
            progress = generation.progress,
            duration_ms = started.elapsed().as_millis() as u64,
            "Stage completed"
        );
        Ok(())
    }

    /// Execute one stage item: hold budget, walk the provider chain,
    /// record the asset outcome.
    async fn run_item(
        &self,
        id: &GenerationId,
        processor: &dyn StageProcessor,
        item: &StageItem,
    ) -> EngineResult<()> {
        let step = processor.step();
        let key = AssetKey::new(step, item.index);

        let generation = self.require_generation(id)?;
        let run_request = self.require_request(id)?;
        let breakdown = self.ledger.breakdown(id);
        let assets = self.ledger.assets(id);
        let provider_request = {
            let ctx = StageContext {
                generation: &generation,
                request: &run_request,
                breakdown: breakdown.as_ref(),
                assets: &assets,
            };
            processor.request_for(&ctx, item)?
        };
        let capability = provider_request.capability();

        debug!(
            generation_id = %id,
            step = %step,
            item = %item.label,
            "Dispatching item"
        );
        self.ledger.update_asset(id, key, |a| a.start())?;

        // The hold prices the chain's primary candidate; settlement below
        // replaces it with what the delivering provider actually cost.
        let estimate = self
            .selector
            .catalog()
            .primary(capability, generation.tier)
            .map(|provider| self.selector.catalog().price_cents(provider))
            .unwrap_or(0);
        let reservation = match self.budget.reserve(
            &generation.user_id,
            generation.tier,
            estimate,
            format!("{step} item {} of {id}", item.index),
        ) {
            Ok(reservation) => reservation,
            Err(e) => {
                if let EngineError::BudgetExceeded {
                    needed_cents,
                    available_cents,
                    ..
                } = &e
                {
                    warn!(
                        generation_id = %id,
                        step = %step,
                        index = item.index,
                        needed_cents = *needed_cents,
                        available_cents = *available_cents,
                        "Budget denied, item not dispatched"
                    );
                    metrics::record_budget_denial(generation.tier.as_str());
                }
                self.ledger.update_asset(id, key, {
                    let detail = e.to_string();
                    move |a| a.fail(0, detail)
                })?;
                metrics::record_stage_item(step.as_str(), "failed");
                return Err(e);
            }
        };

        match self
            .selector
            .execute(generation.tier, &provider_request, |response| {
                processor.normalize(response)
            })
            .await
        {
            Ok(outcome) => {
                let fell_back = outcome.fell_back();
                let SelectorOutcome {
                    value,
                    provider,
                    requested,
                    attempts,
                    cost_cents,
                    ..
                } = outcome;

                let settled = self.budget.settle(reservation, cost_cents);
                metrics::record_budget_settled(settled);

                self.ledger.update_asset(id, key, {
                    let provider = provider.clone();
                    move |a| a.complete(provider, attempts, cost_cents, value)
                })?;

                let progress = {
                    let stage_assets = self.ledger.assets_for_step(id, step);
                    let total = stage_assets.len() as u32;
                    let done = stage_assets
                        .iter()
                        .filter(|a| a.status == AssetStatus::Completed)
                        .count() as u32;
                    step_progress(step, done, total)
                };
                let scenes_done = self.completed_scene_count(id);
                let generation = self.ledger.update(id, {
                    let provider = provider.clone();
                    let requested = requested.clone();
                    let chain_before: Vec<_> = self
                        .selector
                        .catalog()
                        .chain(capability, generation.tier)
                        .iter()
                        .take_while(|candidate| **candidate != provider)
                        .cloned()
                        .collect();
                    move |g| {
                        g.add_cost(cost_cents);
                        g.raise_progress(progress);
                        if scenes_done > g.completed_scenes {
                            g.completed_scenes = scenes_done;
                        }
                        if fell_back {
                            g.record_fallback(FallbackRecord {
                                step,
                                item_index: item.index,
                                requested,
                                used: provider,
                                skipped: chain_before,
                                recorded_at: chrono::Utc::now(),
                            });
                        }
                    }
                })?;

                if fell_back {
                    metrics::record_provider_fallback(step.as_str());
                    info!(
                        generation_id = %id,
                        step = %step,
                        index = item.index,
                        requested = %requested,
                        used = %provider,
                        "Provider fell back"
                    );
                    self.reporter
                        .emit(
                            id,
                            RunEvent::Fallback {
                                step,
                                index: item.index,
                                requested: requested.clone(),
                                used: provider.clone(),
                            },
                        )
                        .await;
                }
                self.reporter
                    .emit(
                        id,
                        RunEvent::ItemCompleted {
                            step,
                            index: item.index,
                            provider: provider.clone(),
                        },
                    )
                    .await;
                self.reporter
                    .emit(
                        id,
                        RunEvent::Progress {
                            value: generation.progress,
                        },
                    )
                    .await;
                self.publish(id).await;
                metrics::record_stage_item(step.as_str(), "completed");
                Ok(())
            }
            Err(exhausted) => {
                self.budget.release(reservation);
                let attempts = exhausted.attempts.len() as u32;
                warn!(
                    generation_id = %id,
                    step = %step,
                    index = item.index,
                    error = %exhausted,
                    "Provider chain exhausted"
                );
                self.ledger.update_asset(id, key, {
                    let detail = exhausted.describe();
                    move |a| a.fail(attempts, detail)
                })?;
                metrics::record_stage_item(step.as_str(), "failed");
                self.publish(id).await;
                Err(EngineError::Exhausted(exhausted))
            }
        }
    }

    // =========================================================================
    // Merge
    // =========================================================================

    /// Concatenate the lip-synced clips into the final video.
    ///
    /// Consumes one clip per scene in scene order and retries the local
    /// merge up to the configured attempt budget before failing the run.
    async fn run_merge(&self, id: &GenerationId) -> EngineResult<String> {
        let key = AssetKey::new(GenerationStep::Merge, 0);

        // A redelivered job may find the merge already done.
        if let Some(asset) = self.ledger.asset(id, key) {
            if asset.status == AssetStatus::Completed {
                if let Some(url) = asset.output.as_ref().and_then(|o| o.url()) {
                    return Ok(url.to_string());
                }
            }
        }

        let merge_started = Instant::now();
        self.ledger
            .update(id, |g| g.begin_step(GenerationStep::Merge))?;
        self.reporter
            .emit(
                id,
                RunEvent::StepStarted {
                    step: GenerationStep::Merge,
                    total_items: 1,
                },
            )
            .await;
        self.publish(id).await;

        let generation = self.require_generation(id)?;
        if generation.total_scenes == 0 || generation.completed_scenes < generation.total_scenes {
            return Err(EngineError::merge(format!(
                "Cannot merge: {} of {} scenes ready",
                generation.completed_scenes, generation.total_scenes
            )));
        }

        let mut inputs = Vec::with_capacity(generation.total_scenes as usize);
        for scene in 0..generation.total_scenes {
            let clip = self
                .ledger
                .asset(id, AssetKey::new(GenerationStep::LipSync, scene))
                .and_then(|asset| {
                    asset
                        .output
                        .as_ref()
                        .and_then(|output| output.url())
                        .map(String::from)
                })
                .ok_or_else(|| {
                    EngineError::merge(format!("Missing lip-synced clip for scene {scene}"))
                })?;
            inputs.push(clip);
        }

        self.ledger.ensure_asset(id, key)?;
        self.ledger.update_asset(id, key, |a| a.start())?;

        let retry_config = RetryConfig::new("merge_concat")
            .with_max_retries(self.config.merge_max_attempts.saturating_sub(1))
            .with_base_delay(Duration::from_millis(500));
        let result = retry_async(&retry_config, || async {
            self.merger.merge(id, &inputs).await
        })
        .await;

        match result {
            RetryResult::Success(url) => {
                self.ledger.update_asset(id, key, {
                    let url = url.clone();
                    move |a| {
                        a.complete(
                            stages::local_merge_provider(),
                            1,
                            0,
                            AssetOutput::Video { url },
                        )
                    }
                })?;
                metrics::record_merge_duration(merge_started.elapsed().as_secs_f64());
                self.reporter
                    .emit(
                        id,
                        RunEvent::StepCompleted {
                            step: GenerationStep::Merge,
                        },
                    )
                    .await;
                Ok(url)
            }
            RetryResult::Failed { error, attempts } => {
                self.ledger.update_asset(id, key, {
                    let detail = error.to_string();
                    move |a| a.fail(attempts, detail)
                })?;
                Err(match error {
                    e @ EngineError::Merge(_) => e,
                    other => EngineError::merge(other.to_string()),
                })
            }
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn require_generation(&self, id: &GenerationId) -> EngineResult<Generation> {
        self.ledger
            .generation(id)
            .ok_or_else(|| EngineError::ledger(format!("Run {id} is not on the ledger")))
    }

    fn require_request(&self, id: &GenerationId) -> EngineResult<fable_models::GenerationRequest> {
        self.ledger
            .request(id)
            .ok_or_else(|| EngineError::ledger(format!("Run {id} has no stored request")))
    }

    /// Scenes with a completed asset in every per-scene stage.
    fn completed_scene_count(&self, id: &GenerationId) -> u32 {
        let Some(generation) = self.ledger.generation(id) else {
            return 0;
        };
        let assets = self.ledger.assets(id);
        (0..generation.total_scenes)
            .filter(|&scene| {
                PER_SCENE_STEPS.iter().all(|&step| {
                    assets.iter().any(|a| {
                        a.key == AssetKey::new(step, scene) && a.status == AssetStatus::Completed
                    })
                })
            })
            .count() as u32
    }

    async fn publish(&self, id: &GenerationId) {
        if let Some(generation) = self.ledger.generation(id) {
            let assets = self.ledger.assets(id);
            self.reporter.publish(&generation, &assets).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use fable_models::{
        Capability, GenerationRequest, GenerationStatus, PlanTier, ProviderId,
    };
    use fable_providers::{
        CircuitConfig, CircuitRegistry, FallbackCatalog, ProviderAdapter, ProviderError,
        ProviderRequest, ProviderResponse, ProviderResult,
    };

    const SCRIPT_JSON: &str = r#"{
        "title": "The Paper Kite",
        "characters": [
            {"name": "Iris", "appearance": "girl in a yellow raincoat"},
            {"name": "Jun", "appearance": "boy with round glasses and a satchel"}
        ],
        "scenes": [
            {"index": 0, "narration": "The wind picked up over the rooftops.", "visual_prompt": "city rooftops at dusk", "characters": ["Iris"]},
            {"index": 1, "narration": "Jun let out more string.", "visual_prompt": "kite against storm clouds", "characters": ["Jun", "Iris"]},
            {"index": 2, "narration": "The kite broke through the clouds.", "visual_prompt": "sunlight above the storm", "characters": []}
        ]
    }"#;

    fn media_response(counter: &AtomicU64, capability: Capability) -> ProviderResponse {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        match capability {
            Capability::ScriptGeneration => ProviderResponse {
                content: Some(SCRIPT_JSON.to_string()),
                ..Default::default()
            },
            Capability::ImageGeneration => ProviderResponse {
                url: Some(format!("https://cdn.test/image/{n}.png")),
                ..Default::default()
            },
            Capability::AudioSynthesis => ProviderResponse {
                url: Some(format!("https://cdn.test/audio/{n}.mp3")),
                duration_ms: Some(4_200),
                ..Default::default()
            },
            Capability::VideoSynthesis => ProviderResponse {
                url: Some(format!("https://cdn.test/video/{n}.mp4")),
                ..Default::default()
            },
            Capability::LipSync => ProviderResponse {
                url: Some(format!("https://cdn.test/lipsync/{n}.mp4")),
                ..Default::default()
            },
        }
    }

    /// Gateway stand-in: succeeds with canned media by default, with
    /// per-(capability, provider) scripted results popped in call order.
    #[derive(Default)]
    struct FakeGateway {
        counter: AtomicU64,
        in_flight: AtomicU64,
        max_in_flight: AtomicU64,
        latency: Option<Duration>,
        calls: Mutex<Vec<(ProviderId, Capability)>>,
        scripted: Mutex<HashMap<(Capability, ProviderId), VecDeque<ProviderResult<ProviderResponse>>>>,
        cancel_on: Mutex<Option<(Capability, watch::Sender<bool>)>>,
    }

    impl FakeGateway {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn with_latency(latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                latency: Some(latency),
                ..Self::default()
            })
        }

        fn push(
            &self,
            capability: Capability,
            provider: &str,
            result: ProviderResult<ProviderResponse>,
        ) {
            self.scripted
                .lock()
                .unwrap()
                .entry((capability, ProviderId::from(provider)))
                .or_default()
                .push_back(result);
        }

        fn ok(&self, capability: Capability) -> ProviderResult<ProviderResponse> {
            Ok(media_response(&self.counter, capability))
        }

        fn cancel_when_called(&self, capability: Capability, tx: watch::Sender<bool>) {
            *self.cancel_on.lock().unwrap() = Some((capability, tx));
        }

        fn calls_for(&self, capability: Capability) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, c)| *c == capability)
                .count()
        }

        fn total_calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ProviderAdapter for FakeGateway {
        async fn invoke(
            &self,
            provider: &ProviderId,
            request: &ProviderRequest,
        ) -> ProviderResult<ProviderResponse> {
            let capability = request.capability();
            self.calls.lock().unwrap().push((provider.clone(), capability));

            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);

            {
                let mut cancel_on = self.cancel_on.lock().unwrap();
                let fire = matches!(&*cancel_on, Some((c, _)) if *c == capability);
                if fire {
                    if let Some((_, tx)) = cancel_on.take() {
                        let _ = tx.send(true);
                    }
                }
            }

            let scripted = self
                .scripted
                .lock()
                .unwrap()
                .get_mut(&(capability, provider.clone()))
                .and_then(|queue| queue.pop_front());

            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match scripted {
                Some(result) => result,
                None => Ok(media_response(&self.counter, capability)),
            }
        }
    }

    struct FakeMerger {
        calls: Mutex<Vec<Vec<String>>>,
        fail_remaining: AtomicU32,
    }

    impl FakeMerger {
        fn new() -> Arc<Self> {
            Self::failing(0)
        }

        fn failing(times: u32) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail_remaining: AtomicU32::new(times),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn last_inputs(&self) -> Vec<String> {
            self.calls.lock().unwrap().last().cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl Merger for FakeMerger {
        async fn merge(
            &self,
            generation_id: &GenerationId,
            inputs: &[String],
        ) -> EngineResult<String> {
            self.calls.lock().unwrap().push(inputs.to_vec());
            let remaining = self.fail_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
                return Err(EngineError::merge("concat exited with status 1"));
            }
            Ok(format!("https://cdn.test/{generation_id}/final.mp4"))
        }
    }

    struct Harness {
        runner: PipelineRunner,
        gateway: Arc<FakeGateway>,
        merger: Arc<FakeMerger>,
        ledger: Arc<GenerationLedger>,
        budget: Arc<BudgetTracker>,
    }

    fn harness() -> Harness {
        harness_with(FakeGateway::new(), FakeMerger::new(), 1)
    }

    fn harness_with(
        gateway: Arc<FakeGateway>,
        merger: Arc<FakeMerger>,
        max_stage_parallel: usize,
    ) -> Harness {
        let mut config = EngineConfig::default();
        // Sequential dispatch keeps scripted gateway results deterministic.
        config.max_stage_parallel = max_stage_parallel;
        config.provider_timeout = Duration::from_secs(5);

        let ledger = Arc::new(GenerationLedger::new());
        let budget = Arc::new(BudgetTracker::new());
        let selector = Arc::new(FallbackSelector::new(
            gateway.clone() as Arc<dyn ProviderAdapter>,
            Arc::new(FallbackCatalog::with_defaults()),
            Arc::new(CircuitRegistry::new(CircuitConfig::default())),
            config.provider_timeout,
        ));
        let runner = PipelineRunner::new(
            config,
            ledger.clone(),
            budget.clone(),
            selector,
            merger.clone() as Arc<dyn Merger>,
            Arc::new(StatusReporter::detached()),
        );

        Harness {
            runner,
            gateway,
            merger,
            ledger,
            budget,
        }
    }

    fn start_job(tier: PlanTier) -> (GenerationId, RunJob) {
        let id = GenerationId::new();
        let request = GenerationRequest::new("u1", "script-1", "A kite, a storm, a rooftop.")
            .with_tier(tier);
        (id.clone(), RunJob::StartRun(StartRunJob::new(id, request)))
    }

    fn no_cancel() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    fn asset_status(h: &Harness, id: &GenerationId, step: GenerationStep, index: u32) -> AssetStatus {
        h.ledger
            .asset(id, AssetKey::new(step, index))
            .map(|a| a.status)
            .unwrap_or(AssetStatus::Pending)
    }

    #[tokio::test]
    async fn test_start_run_completes_full_pipeline() {
        let h = harness();
        let (id, job) = start_job(PlanTier::Creator);

        h.runner.execute(&job, no_cancel()).await.unwrap();

        let generation = h.ledger.generation(&id).unwrap();
        assert_eq!(generation.status, GenerationStatus::Completed);
        assert_eq!(generation.progress, 100);
        assert_eq!(generation.total_scenes, 3);
        assert_eq!(generation.completed_scenes, 3);
        assert_eq!(generation.last_completed_step, Some(GenerationStep::Merge));
        assert_eq!(
            generation.final_video_url,
            Some(format!("https://cdn.test/{id}/final.mp4"))
        );
        assert!(generation.fallbacks.is_empty());
        // Creator prices: script 40, 5 images at 12, 3 audio at 8,
        // 3 videos at 90, 3 lipsyncs at 35, merge free.
        assert_eq!(generation.total_cost_cents, 499);

        // 1 script + 2 characters + 3 scenes x 4 per-scene items + merge.
        let assets = h.ledger.assets(&id);
        assert_eq!(assets.len(), 16);
        assert!(assets.iter().all(|a| a.status == AssetStatus::Completed));

        assert_eq!(h.gateway.calls_for(Capability::ScriptGeneration), 1);
        assert_eq!(h.gateway.calls_for(Capability::ImageGeneration), 5);
        assert_eq!(h.gateway.calls_for(Capability::AudioSynthesis), 3);
        assert_eq!(h.gateway.calls_for(Capability::VideoSynthesis), 3);
        assert_eq!(h.gateway.calls_for(Capability::LipSync), 3);

        // Merge consumed the lip-synced clips in scene order.
        let expected: Vec<String> = (0..3)
            .map(|scene| {
                h.ledger
                    .asset(&id, AssetKey::new(GenerationStep::LipSync, scene))
                    .and_then(|a| a.output.as_ref().and_then(|o| o.url()).map(String::from))
                    .unwrap()
            })
            .collect();
        assert_eq!(h.merger.call_count(), 1);
        assert_eq!(h.merger.last_inputs(), expected);

        assert_eq!(h.budget.spent_cents("u1"), 499);
        assert_eq!(h.budget.reserved_cents("u1"), 0);
    }

    #[tokio::test]
    async fn test_scene_fallback_records_downgrade() {
        let gateway = FakeGateway::new();
        // Studio image chain: muralist-v3, muralist-turbo, sketchline.
        // Calls 1-3 on muralist-v3 are the two characters and scene 0;
        // call 4 (scene 1) fails there and on muralist-turbo.
        for _ in 0..3 {
            gateway.push(
                Capability::ImageGeneration,
                "muralist-v3",
                gateway.ok(Capability::ImageGeneration),
            );
        }
        gateway.push(
            Capability::ImageGeneration,
            "muralist-v3",
            Err(ProviderError::Http {
                status: 503,
                message: "overloaded".to_string(),
            }),
        );
        gateway.push(
            Capability::ImageGeneration,
            "muralist-turbo",
            Err(ProviderError::transport("connection reset")),
        );

        let h = harness_with(gateway, FakeMerger::new(), 1);
        let (id, job) = start_job(PlanTier::Studio);

        h.runner.execute(&job, no_cancel()).await.unwrap();

        let generation = h.ledger.generation(&id).unwrap();
        assert_eq!(generation.status, GenerationStatus::Completed);
        assert_eq!(generation.fallbacks.len(), 1);

        let record = &generation.fallbacks[0];
        assert_eq!(record.step, GenerationStep::SceneImages);
        assert_eq!(record.item_index, 1);
        assert_eq!(record.requested.as_str(), "muralist-v3");
        assert_eq!(record.used.as_str(), "sketchline");
        assert_eq!(
            record.skipped,
            vec![
                ProviderId::from("muralist-v3"),
                ProviderId::from("muralist-turbo")
            ]
        );

        let downgraded = h
            .ledger
            .asset(&id, AssetKey::new(GenerationStep::SceneImages, 1))
            .unwrap();
        assert_eq!(downgraded.provider_used, Some(ProviderId::from("sketchline")));
        assert_eq!(downgraded.attempt_count, 3);
        assert_eq!(downgraded.cost_cents, 4);

        // The untouched scenes stayed on the primary at its price.
        for scene in [0, 2] {
            let asset = h
                .ledger
                .asset(&id, AssetKey::new(GenerationStep::SceneImages, scene))
                .unwrap();
            assert_eq!(asset.provider_used, Some(ProviderId::from("muralist-v3")));
            assert_eq!(asset.cost_cents, 12);
        }
    }

    #[tokio::test]
    async fn test_budget_denial_fails_run_before_dispatch() {
        let h = harness();
        let (id, job) = start_job(PlanTier::Free);

        // Free ceiling is 1500. Script (15), characters (2x6) and scene
        // images (3x6) total 45; hold the rest minus 3 so the first audio
        // item (estimate 4) cannot reserve.
        let _hold = h
            .budget
            .reserve("u1", PlanTier::Free, 1_452, "prior spend")
            .unwrap();

        let err = h.runner.execute(&job, no_cancel()).await.unwrap_err();
        assert!(matches!(err, EngineError::BudgetExceeded { .. }));

        let generation = h.ledger.generation(&id).unwrap();
        assert_eq!(generation.status, GenerationStatus::Failed);
        assert_eq!(generation.current_step, Some(GenerationStep::Audio));
        assert_eq!(
            generation.last_completed_step,
            Some(GenerationStep::SceneImages)
        );
        let error = generation.error.unwrap();
        assert_eq!(error.kind, fable_models::ErrorKind::BudgetExceeded);
        assert_eq!(error.step, GenerationStep::Audio);

        // No audio provider was ever invoked and no downstream work exists.
        assert_eq!(h.gateway.calls_for(Capability::AudioSynthesis), 0);
        assert_eq!(h.gateway.calls_for(Capability::VideoSynthesis), 0);
        for index in 0..3 {
            assert_eq!(
                asset_status(&h, &id, GenerationStep::Audio, index),
                AssetStatus::Failed
            );
            assert!(h
                .ledger
                .asset(&id, AssetKey::new(GenerationStep::SceneVideo, index))
                .is_none());
        }
        assert!(h
            .ledger
            .asset(&id, AssetKey::new(GenerationStep::Merge, 0))
            .is_none());

        assert_eq!(h.budget.spent_cents("u1"), 45);
    }

    #[tokio::test]
    async fn test_cancel_stops_before_new_dispatch() {
        let gateway = FakeGateway::new();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        // Flip the cancel flag the moment the first scene video call lands;
        // that call finishes, the remaining scenes are never dispatched.
        gateway.cancel_when_called(Capability::VideoSynthesis, cancel_tx);

        let h = harness_with(gateway, FakeMerger::new(), 1);
        let (id, job) = start_job(PlanTier::Creator);

        let err = h.runner.execute(&job, cancel_rx).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));

        let generation = h.ledger.generation(&id).unwrap();
        assert_eq!(generation.status, GenerationStatus::Cancelled);
        assert!(generation.error.is_none());
        assert!(generation.completed_at.is_some());
        assert!(generation.progress < 100);

        // The in-flight call completed and was settled; nothing else ran.
        assert_eq!(h.gateway.calls_for(Capability::VideoSynthesis), 1);
        assert_eq!(h.gateway.calls_for(Capability::LipSync), 0);
        assert_eq!(
            asset_status(&h, &id, GenerationStep::SceneVideo, 0),
            AssetStatus::Completed
        );
        for index in [1, 2] {
            assert_eq!(
                asset_status(&h, &id, GenerationStep::SceneVideo, index),
                AssetStatus::Pending
            );
        }
        for index in 0..3 {
            assert!(h
                .ledger
                .asset(&id, AssetKey::new(GenerationStep::LipSync, index))
                .is_none());
        }
        assert!(h
            .ledger
            .asset(&id, AssetKey::new(GenerationStep::Merge, 0))
            .is_none());
        assert_eq!(h.merger.call_count(), 0);
        assert_eq!(h.budget.reserved_cents("u1"), 0);
    }

    #[tokio::test]
    async fn test_retry_resumes_after_failed_stage() {
        let gateway = FakeGateway::new();
        // Audio item 0 succeeds on sonata-hd; item 1 exhausts the Creator
        // chain (sonata-hd then sonata-lite); item 2 succeeds.
        gateway.push(
            Capability::AudioSynthesis,
            "sonata-hd",
            gateway.ok(Capability::AudioSynthesis),
        );
        gateway.push(
            Capability::AudioSynthesis,
            "sonata-hd",
            Err(ProviderError::Timeout(Duration::from_secs(5))),
        );
        gateway.push(
            Capability::AudioSynthesis,
            "sonata-lite",
            Err(ProviderError::Http {
                status: 500,
                message: "synth crashed".to_string(),
            }),
        );

        let h = harness_with(gateway, FakeMerger::new(), 1);
        let (id, job) = start_job(PlanTier::Creator);

        let err = h.runner.execute(&job, no_cancel()).await.unwrap_err();
        assert!(matches!(err, EngineError::Exhausted(_)));

        let generation = h.ledger.generation(&id).unwrap();
        assert_eq!(generation.status, GenerationStatus::Failed);
        assert_eq!(generation.current_step, Some(GenerationStep::Audio));
        assert_eq!(
            generation.error.as_ref().map(|e| e.kind),
            Some(fable_models::ErrorKind::ExhaustedFallback)
        );
        // Script 10 + characters 10 + scene images 20, plus two of three
        // audio items at weight 15.
        assert_eq!(generation.progress, 50);

        let failed = h
            .ledger
            .asset(&id, AssetKey::new(GenerationStep::Audio, 1))
            .unwrap();
        assert_eq!(failed.status, AssetStatus::Failed);
        assert_eq!(failed.attempt_count, 2);
        assert!(failed.error_message.as_deref().unwrap().contains("sonata"));

        // Failed attempts cost nothing; the hold was released.
        assert_eq!(h.budget.reserved_cents("u1"), 0);
        assert_eq!(h.budget.spent_cents("u1"), 116);

        // Retry resumes at audio and touches nothing upstream.
        let calls_before = h.gateway.total_calls();
        let retry = RunJob::RetryRun(RetryRunJob::new(id.clone(), "u1"));
        h.runner.execute(&retry, no_cancel()).await.unwrap();

        let generation = h.ledger.generation(&id).unwrap();
        assert_eq!(generation.status, GenerationStatus::Completed);
        assert_eq!(generation.progress, 100);
        assert_eq!(generation.total_cost_cents, 499);

        assert_eq!(h.gateway.calls_for(Capability::ScriptGeneration), 1);
        assert_eq!(h.gateway.calls_for(Capability::ImageGeneration), 5);
        // 4 first-pass audio calls (one chain walk of 2 for item 1), then
        // exactly one redispatch.
        assert_eq!(h.gateway.calls_for(Capability::AudioSynthesis), 5);
        assert_eq!(
            h.gateway.total_calls() - calls_before,
            1 + 3 + 3,
            "retry dispatched the failed audio item plus downstream stages"
        );
    }

    #[tokio::test]
    async fn test_retry_failed_only_redispatches_only_failed_items() {
        let gateway = FakeGateway::new();
        gateway.push(
            Capability::AudioSynthesis,
            "sonata-hd",
            gateway.ok(Capability::AudioSynthesis),
        );
        gateway.push(
            Capability::AudioSynthesis,
            "sonata-hd",
            Err(ProviderError::transport("connection reset")),
        );
        gateway.push(
            Capability::AudioSynthesis,
            "sonata-lite",
            Err(ProviderError::transport("connection reset")),
        );

        let h = harness_with(gateway, FakeMerger::new(), 1);
        let (id, job) = start_job(PlanTier::Creator);
        h.runner.execute(&job, no_cancel()).await.unwrap_err();

        let retry = RunJob::RetryRun(
            RetryRunJob::new(id.clone(), "u1")
                .with_from_step(GenerationStep::Audio)
                .with_failed_only(true),
        );
        h.runner.execute(&retry, no_cancel()).await.unwrap();

        let generation = h.ledger.generation(&id).unwrap();
        assert_eq!(generation.status, GenerationStatus::Completed);

        // The completed audio items were not charged again.
        for index in [0, 2] {
            let asset = h
                .ledger
                .asset(&id, AssetKey::new(GenerationStep::Audio, index))
                .unwrap();
            assert_eq!(asset.attempt_count, 1);
            assert_eq!(asset.cost_cents, 8);
        }
        let redone = h
            .ledger
            .asset(&id, AssetKey::new(GenerationStep::Audio, 1))
            .unwrap();
        assert_eq!(redone.status, AssetStatus::Completed);
        assert_eq!(redone.provider_used, Some(ProviderId::from("sonata-hd")));
        assert_eq!(redone.attempt_count, 3);
        assert_eq!(redone.cost_cents, 8);

        // 4 calls on the first pass, 1 on retry.
        assert_eq!(h.gateway.calls_for(Capability::AudioSynthesis), 5);
        assert_eq!(generation.total_cost_cents, 499);
    }

    #[tokio::test]
    async fn test_retry_rejected_for_completed_or_unknown_runs() {
        let h = harness();
        let (id, job) = start_job(PlanTier::Creator);
        h.runner.execute(&job, no_cancel()).await.unwrap();

        let retry = RunJob::RetryRun(RetryRunJob::new(id.clone(), "u1"));
        let err = h.runner.execute(&retry, no_cancel()).await.unwrap_err();
        assert!(matches!(err, EngineError::RetryRejected(_)));
        assert_eq!(
            h.ledger.generation(&id).unwrap().status,
            GenerationStatus::Completed
        );

        let unknown = RunJob::RetryRun(RetryRunJob::new(GenerationId::new(), "u1"));
        let err = h.runner.execute(&unknown, no_cancel()).await.unwrap_err();
        assert!(matches!(err, EngineError::RetryRejected(_)));
    }

    #[tokio::test]
    async fn test_retry_from_unreached_step_rejected() {
        let gateway = FakeGateway::new();
        gateway.push(
            Capability::AudioSynthesis,
            "sonata-hd",
            Err(ProviderError::transport("down")),
        );
        gateway.push(
            Capability::AudioSynthesis,
            "sonata-lite",
            Err(ProviderError::transport("down")),
        );

        let h = harness_with(gateway, FakeMerger::new(), 1);
        let (id, job) = start_job(PlanTier::Creator);
        h.runner.execute(&job, no_cancel()).await.unwrap_err();

        // The run failed in audio; scene video never ran, so it is not a
        // valid re-entry point.
        let retry = RunJob::RetryRun(
            RetryRunJob::new(id.clone(), "u1").with_from_step(GenerationStep::SceneVideo),
        );
        let err = h.runner.execute(&retry, no_cancel()).await.unwrap_err();
        assert!(matches!(err, EngineError::RetryRejected(_)));
        assert_eq!(
            h.ledger.generation(&id).unwrap().status,
            GenerationStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_redelivered_start_job_is_idempotent() {
        let h = harness();
        let (id, job) = start_job(PlanTier::Creator);
        h.runner.execute(&job, no_cancel()).await.unwrap();

        let calls_before = h.gateway.total_calls();
        let cost_before = h.ledger.generation(&id).unwrap().total_cost_cents;

        h.runner.execute(&job, no_cancel()).await.unwrap();

        assert_eq!(h.gateway.total_calls(), calls_before);
        let generation = h.ledger.generation(&id).unwrap();
        assert_eq!(generation.status, GenerationStatus::Completed);
        assert_eq!(generation.total_cost_cents, cost_before);
        assert_eq!(h.merger.call_count(), 1);
    }

    #[tokio::test]
    async fn test_merge_failure_fails_run_then_retry_completes() {
        // Three failures exhaust the first run's merge attempts; the
        // fourth call, on retry, succeeds.
        let h = harness_with(FakeGateway::new(), FakeMerger::failing(3), 1);
        let (id, job) = start_job(PlanTier::Creator);

        let err = h.runner.execute(&job, no_cancel()).await.unwrap_err();
        assert!(matches!(err, EngineError::Merge(_)));
        assert_eq!(h.merger.call_count(), 3);

        let generation = h.ledger.generation(&id).unwrap();
        assert_eq!(generation.status, GenerationStatus::Failed);
        assert_eq!(generation.current_step, Some(GenerationStep::Merge));
        assert_eq!(
            generation.error.as_ref().map(|e| e.kind),
            Some(fable_models::ErrorKind::Merge)
        );
        // All provider work settled before the merge failed.
        assert_eq!(generation.total_cost_cents, 499);
        for index in 0..3 {
            assert_eq!(
                asset_status(&h, &id, GenerationStep::LipSync, index),
                AssetStatus::Completed
            );
        }

        let calls_before = h.gateway.total_calls();
        let retry = RunJob::RetryRun(RetryRunJob::new(id.clone(), "u1"));
        h.runner.execute(&retry, no_cancel()).await.unwrap();

        let generation = h.ledger.generation(&id).unwrap();
        assert_eq!(generation.status, GenerationStatus::Completed);
        assert_eq!(h.merger.call_count(), 4);
        // Only the merge re-ran; no provider was touched.
        assert_eq!(h.gateway.total_calls(), calls_before);

        let merged = h
            .ledger
            .asset(&id, AssetKey::new(GenerationStep::Merge, 0))
            .unwrap();
        assert_eq!(merged.status, AssetStatus::Completed);
        assert_eq!(merged.cost_cents, 0);
    }

    #[tokio::test]
    async fn test_stage_parallelism_is_bounded() {
        let gateway = FakeGateway::with_latency(Duration::from_millis(10));
        let h = harness_with(gateway, FakeMerger::new(), 2);
        let (_, job) = start_job(PlanTier::Creator);

        h.runner.execute(&job, no_cancel()).await.unwrap();

        assert_eq!(h.gateway.max_in_flight.load(Ordering::SeqCst), 2);
    }
}
