//! Run executor.
//!
//! Consumes run jobs from the Redis stream, holds the per-run execution
//! lock while the pipeline runs, and applies the ack policy: terminal
//! outcomes (completed, failed, cancelled, rejected retry) consume the
//! job; infrastructure errors leave it for redelivery until the retry
//! budget moves it to the dead letter queue.
//!
//! Cancellation reaches an executing run two ways: the control channel
//! broadcast is forwarded to the run's watch channel immediately, and a
//! per-run monitor polls the durable cancel flag so a missed broadcast
//! still lands at the next checkpoint. The same monitor republishes the
//! status snapshot so its TTL survives long provider calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use fable_models::GenerationId;
use fable_queue::{ControlChannel, ControlMessage, RunJob, RunQueue};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::ledger::GenerationLedger;
use crate::metrics;
use crate::pipeline::PipelineRunner;
use crate::retry::FailureTracker;
use crate::status::StatusReporter;

/// Shared state handed to spawned job tasks.
struct EngineContext {
    config: EngineConfig,
    queue: Arc<RunQueue>,
    control: ControlChannel,
    runner: Arc<PipelineRunner>,
    ledger: Arc<GenerationLedger>,
    reporter: Arc<StatusReporter>,
    /// Cancel senders for runs currently executing on this engine.
    cancels: Mutex<HashMap<GenerationId, watch::Sender<bool>>>,
}

/// Run executor that drains the run queue.
pub struct RunExecutor {
    ctx: Arc<EngineContext>,
    run_semaphore: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    consumer_name: String,
}

impl RunExecutor {
    pub fn new(
        config: EngineConfig,
        queue: Arc<RunQueue>,
        control: ControlChannel,
        runner: Arc<PipelineRunner>,
        ledger: Arc<GenerationLedger>,
        reporter: Arc<StatusReporter>,
    ) -> Self {
        let run_semaphore = Arc::new(Semaphore::new(config.max_concurrent_runs));
        let (shutdown, _) = watch::channel(false);
        let consumer_name = format!("engine-{}", Uuid::new_v4());

        Self {
            ctx: Arc::new(EngineContext {
                config,
                queue,
                control,
                runner,
                ledger,
                reporter,
                cancels: Mutex::new(HashMap::new()),
            }),
            run_semaphore,
            shutdown,
            consumer_name,
        }
    }

    /// Start the executor. Returns once shutdown is signalled and the
    /// in-flight runs have drained (or the drain timeout elapsed).
    pub async fn run(&self) -> EngineResult<()> {
        info!(
            consumer = %self.consumer_name,
            max_concurrent_runs = self.ctx.config.max_concurrent_runs,
            "Starting run executor"
        );

        self.ctx.queue.init().await?;

        let mut shutdown_rx = self.shutdown.subscribe();
        let claim_task = self.spawn_claim_task();
        let listener_task = self.spawn_cancel_listener();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping executor");
                        break;
                    }
                }
                result = self.consume_jobs() => {
                    if let Err(e) = result {
                        error!(error = %e, "Error consuming run jobs");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }

        claim_task.abort();
        listener_task.abort();

        info!("Waiting for in-flight runs to complete...");
        let _ = tokio::time::timeout(self.ctx.config.shutdown_timeout, self.wait_for_runs()).await;

        info!("Run executor stopped");
        Ok(())
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Consume a batch of jobs and spawn an execution per job.
    async fn consume_jobs(&self) -> EngineResult<()> {
        let available = self.run_semaphore.available_permits();
        if available == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Ok(());
        }

        let jobs = self
            .ctx
            .queue
            .consume(&self.consumer_name, 1000, available.min(5))
            .await?;
        if jobs.is_empty() {
            return Ok(());
        }

        debug!(count = jobs.len(), "Consumed run jobs from queue");

        for (message_id, job) in jobs {
            let ctx = Arc::clone(&self.ctx);
            let permit = self
                .run_semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| EngineError::internal("Run semaphore closed"))?;

            tokio::spawn(async move {
                let _permit = permit;
                Self::execute_job(ctx, message_id, job).await;
            });
        }

        Ok(())
    }

    /// Periodically claim jobs left pending by crashed engines.
    fn spawn_claim_task(&self) -> tokio::task::JoinHandle<()> {
        let ctx = Arc::clone(&self.ctx);
        let consumer_name = self.consumer_name.clone();
        let semaphore = Arc::clone(&self.run_semaphore);
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ctx.config.claim_interval);
            let min_idle_ms = ctx.config.claim_min_idle.as_millis() as u64;
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        match ctx.queue.claim_pending(&consumer_name, min_idle_ms, 5).await {
                            Ok(jobs) if !jobs.is_empty() => {
                                info!(count = jobs.len(), "Claimed pending run jobs");
                                for (message_id, job) in jobs {
                                    let ctx = Arc::clone(&ctx);
                                    let permit = match semaphore.clone().acquire_owned().await {
                                        Ok(permit) => permit,
                                        Err(_) => break,
                                    };
                                    tokio::spawn(async move {
                                        let _permit = permit;
                                        Self::execute_job(ctx, message_id, job).await;
                                    });
                                }
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!(error = %e, "Failed to claim pending run jobs");
                            }
                        }
                    }
                }
            }
        })
    }

    /// Forward cancel broadcasts to the executing run's watch channel.
    fn spawn_cancel_listener(&self) -> tokio::task::JoinHandle<()> {
        let ctx = Arc::clone(&self.ctx);
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                let mut stream = match ctx.control.subscribe().await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(error = %e, "Control channel subscribe failed, retrying");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                };
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                return;
                            }
                        }
                        message = stream.next() => {
                            match message {
                                Some(ControlMessage::Cancel { generation_id }) => {
                                    let sender = ctx
                                        .cancels
                                        .lock()
                                        .unwrap()
                                        .get(&generation_id)
                                        .cloned();
                                    if let Some(tx) = sender {
                                        info!(
                                            generation_id = %generation_id,
                                            "Cancel broadcast received for executing run"
                                        );
                                        let _ = tx.send(true);
                                    }
                                }
                                None => break,
                            }
                        }
                    }
                }
                warn!("Control channel stream closed, resubscribing");
            }
        })
    }

    /// Execute a single delivered job and apply the ack policy.
    async fn execute_job(ctx: Arc<EngineContext>, message_id: String, job: RunJob) {
        let id = job.generation_id().clone();

        // One execution per run. A duplicate delivery (claimed mid-run or
        // redelivered) stays unacked; the owning execution acks it when it
        // finishes, and a crashed owner leaves it claimable.
        let _run_guard = match ctx.ledger.lock_run(&id) {
            Ok(guard) => guard,
            Err(e) => {
                debug!(
                    generation_id = %id,
                    error = %e,
                    "Run already executing, leaving job for redelivery"
                );
                return;
            }
        };

        let job_type = if job.is_retry() { "retry_run" } else { "start_run" };
        info!(generation_id = %id, job_type, "Executing run job");
        metrics::record_run_started(job_type);
        metrics::adjust_runs_in_flight(1.0);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        if job.is_retry() {
            // A retry supersedes any cancel flag left over from the failed
            // execution it is reopening.
            if let Err(e) = ctx.control.clear(&id).await {
                warn!(generation_id = %id, error = %e, "Failed to clear stale cancel flag");
            }
        } else {
            match ctx.control.is_cancel_requested(&id).await {
                Ok(true) => {
                    info!(generation_id = %id, "Run was cancelled before execution began");
                    let _ = cancel_tx.send(true);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(generation_id = %id, error = %e, "Could not read cancel flag");
                }
            }
        }
        ctx.cancels
            .lock()
            .unwrap()
            .insert(id.clone(), cancel_tx.clone());

        let monitor = tokio::spawn(Self::monitor_run(Arc::clone(&ctx), id.clone(), cancel_tx));

        let result = ctx.runner.execute(&job, cancel_rx).await;

        monitor.abort();
        ctx.cancels.lock().unwrap().remove(&id);
        metrics::adjust_runs_in_flight(-1.0);

        match result {
            Ok(()) => {
                info!(generation_id = %id, "Run job completed");
                Self::consume_message(&ctx, &id, &message_id, &job).await;
            }
            Err(EngineError::Cancelled) => {
                Self::consume_message(&ctx, &id, &message_id, &job).await;
                if let Err(e) = ctx.control.clear(&id).await {
                    warn!(generation_id = %id, error = %e, "Failed to clear cancel flag");
                }
            }
            Err(e) if e.is_semantic() => {
                // The runner already recorded the terminal failure (or the
                // retry rejection); nothing is gained by redelivering.
                warn!(generation_id = %id, error = %e, "Run job finished with recorded failure");
                Self::consume_message(&ctx, &id, &message_id, &job).await;
            }
            Err(e) => {
                error!(generation_id = %id, error = %e, "Run job hit an infrastructure error");
                let retry_count = ctx
                    .queue
                    .increment_retry(&message_id)
                    .await
                    .unwrap_or(u32::MAX);
                let max_retries = ctx.queue.max_retries();
                if retry_count >= max_retries {
                    warn!(
                        generation_id = %id,
                        retry_count,
                        max_retries,
                        "Run job exceeded max retries, moving to DLQ"
                    );
                    if let Err(dlq_err) = ctx.queue.dlq(&message_id, &job, &e.to_string()).await {
                        error!(generation_id = %id, error = %dlq_err, "Failed to move job to DLQ");
                    }
                    if let Err(e) = ctx.queue.clear_dedup(&job).await {
                        warn!(generation_id = %id, error = %e, "Failed to clear dedup key");
                    }
                } else {
                    info!(
                        generation_id = %id,
                        attempt = retry_count,
                        max_retries,
                        "Run job will be redelivered"
                    );
                }
            }
        }
    }

    /// Ack a finished job and release its dedup key.
    async fn consume_message(
        ctx: &Arc<EngineContext>,
        id: &GenerationId,
        message_id: &str,
        job: &RunJob,
    ) {
        if let Err(e) = ctx.queue.ack(message_id).await {
            error!(generation_id = %id, error = %e, "Failed to ack run job");
        }
        if let Err(e) = ctx.queue.clear_dedup(job).await {
            warn!(generation_id = %id, error = %e, "Failed to clear dedup key");
        }
    }

    /// Sidecar for one executing run: keeps the cached snapshot fresh and
    /// polls the durable cancel flag in case the broadcast was missed.
    async fn monitor_run(
        ctx: Arc<EngineContext>,
        id: GenerationId,
        cancel_tx: watch::Sender<bool>,
    ) {
        let mut interval = tokio::time::interval(ctx.config.heartbeat_interval);
        let mut poll_failures = FailureTracker::new(3);
        loop {
            interval.tick().await;

            if let Some(generation) = ctx.ledger.generation(&id) {
                let assets = ctx.ledger.assets(&id);
                ctx.reporter.publish(&generation, &assets).await;
            }

            match ctx.control.is_cancel_requested(&id).await {
                Ok(true) => {
                    if !*cancel_tx.borrow() {
                        info!(generation_id = %id, "Cancel flag observed for executing run");
                    }
                    let _ = cancel_tx.send(true);
                    poll_failures.record_success();
                }
                Ok(false) => poll_failures.record_success(),
                Err(e) => {
                    if poll_failures.record_failure() {
                        warn!(generation_id = %id, error = %e, "Cancel flag poll failed");
                    }
                }
            }
        }
    }

    /// Wait for all in-flight runs to complete.
    async fn wait_for_runs(&self) {
        loop {
            if self.run_semaphore.available_permits() == self.ctx.config.max_concurrent_runs {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
