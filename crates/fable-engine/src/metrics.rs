//! Prometheus metrics for the engine.

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder.
///
/// When `ENGINE_METRICS_ADDR` is set, an HTTP listener scrapeable at
/// `/metrics` is spawned on that address; otherwise metrics are recorded
/// but not exported.
pub fn init_metrics() {
    match std::env::var("ENGINE_METRICS_ADDR")
        .ok()
        .and_then(|s| s.parse::<SocketAddr>().ok())
    {
        Some(addr) => {
            PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .expect("Failed to install Prometheus exporter");
        }
        None => {
            let _ = PrometheusBuilder::new().install_recorder();
        }
    }
}

/// Metric names as constants for consistency.
pub mod names {
    // Run metrics
    pub const RUNS_STARTED_TOTAL: &str = "fable_runs_started_total";
    pub const RUNS_COMPLETED_TOTAL: &str = "fable_runs_completed_total";
    pub const RUNS_FAILED_TOTAL: &str = "fable_runs_failed_total";
    pub const RUNS_CANCELLED_TOTAL: &str = "fable_runs_cancelled_total";
    pub const RUNS_IN_FLIGHT: &str = "fable_runs_in_flight";
    pub const RUN_DURATION_SECONDS: &str = "fable_run_duration_seconds";

    // Stage metrics
    pub const STAGE_DURATION_SECONDS: &str = "fable_stage_duration_seconds";
    pub const STAGE_ITEMS_TOTAL: &str = "fable_stage_items_total";
    pub const PROVIDER_FALLBACKS_TOTAL: &str = "fable_provider_fallbacks_total";

    // Budget metrics
    pub const BUDGET_DENIALS_TOTAL: &str = "fable_budget_denials_total";
    pub const BUDGET_SETTLED_CENTS_TOTAL: &str = "fable_budget_settled_cents_total";

    // Merge metrics
    pub const MERGE_DURATION_SECONDS: &str = "fable_merge_duration_seconds";
}

/// Record a run picked up for execution.
pub fn record_run_started(job_type: &str) {
    let labels = [("type", job_type.to_string())];
    counter!(names::RUNS_STARTED_TOTAL, &labels).increment(1);
}

/// Record a run that reached `completed`.
pub fn record_run_completed(duration_secs: f64) {
    counter!(names::RUNS_COMPLETED_TOTAL).increment(1);
    histogram!(names::RUN_DURATION_SECONDS).record(duration_secs);
}

/// Record a run that reached `failed`.
pub fn record_run_failed(kind: &str) {
    let labels = [("kind", kind.to_string())];
    counter!(names::RUNS_FAILED_TOTAL, &labels).increment(1);
}

/// Record a run that reached `cancelled`.
pub fn record_run_cancelled() {
    counter!(names::RUNS_CANCELLED_TOTAL).increment(1);
}

/// Update the in-flight run gauge by `delta`.
pub fn adjust_runs_in_flight(delta: f64) {
    gauge!(names::RUNS_IN_FLIGHT).increment(delta);
}

/// Record how long one stage of a run took.
pub fn record_stage_duration(step: &str, duration_secs: f64) {
    let labels = [("step", step.to_string())];
    histogram!(names::STAGE_DURATION_SECONDS, &labels).record(duration_secs);
}

/// Record one item finishing a stage, by outcome.
pub fn record_stage_item(step: &str, outcome: &str) {
    let labels = [("step", step.to_string()), ("outcome", outcome.to_string())];
    counter!(names::STAGE_ITEMS_TOTAL, &labels).increment(1);
}

/// Record an item succeeding on a non-primary provider.
pub fn record_provider_fallback(step: &str) {
    let labels = [("step", step.to_string())];
    counter!(names::PROVIDER_FALLBACKS_TOTAL, &labels).increment(1);
}

/// Record a budget denial.
pub fn record_budget_denial(tier: &str) {
    let labels = [("tier", tier.to_string())];
    counter!(names::BUDGET_DENIALS_TOTAL, &labels).increment(1);
}

/// Record settled spend in cents.
pub fn record_budget_settled(cents: u64) {
    counter!(names::BUDGET_SETTLED_CENTS_TOTAL).increment(cents);
}

/// Record how long a merge took.
pub fn record_merge_duration(duration_secs: f64) {
    histogram!(names::MERGE_DURATION_SECONDS).record(duration_secs);
}
