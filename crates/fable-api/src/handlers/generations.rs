//! Generation run handlers.
//!
//! The API is a thin frontend over the run queue: submissions become queue
//! jobs, status reads come from the Redis snapshot cache, retries re-enqueue,
//! and cancels go over the control channel to whichever engine holds the run.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use fable_models::{
    monthly_budget_cents, CostBreakdown, GenerationError, GenerationId, GenerationRequest,
    GenerationSnapshot, GenerationStatus, GenerationStep, StepSnapshot,
};
use fable_queue::{RetryRunJob, StartRunJob, STALE_GRACE_PERIOD_SECS, STALE_THRESHOLD_SECS};

use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::state::AppState;

// ============================================================================
// Types
// ============================================================================

/// Scene/character counts assumed for the pre-script estimate when the
/// caller gives no scene-count hint. The script stage settles real counts.
const DEFAULT_ESTIMATE_SCENES: u32 = 6;
const DEFAULT_ESTIMATE_CHARACTERS: u32 = 2;

/// Response to a run submission.
#[derive(Debug, Serialize)]
pub struct CreateGenerationResponse {
    /// Assigned generation ID, used for all later calls
    pub generation_id: String,
    /// Initial status (always "pending")
    pub status: String,
    /// Up-front cost estimate at base prices
    pub estimate: CostBreakdown,
    /// Human-readable estimate summary
    pub estimate_summary: String,
}

/// Generation status response.
#[derive(Debug, Serialize)]
pub struct GenerationStatusResponse {
    /// Generation ID
    pub generation_id: String,
    /// Current status: pending, a step name, completed, failed, cancelled,
    /// or stale when the executing engine stopped heartbeating
    pub status: String,
    /// Progress percentage (0-100)
    pub progress: u8,
    /// Step currently executing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<GenerationStep>,
    /// Last fully completed step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_completed_step: Option<GenerationStep>,
    /// Per-step rollups, in pipeline order
    pub steps: Vec<StepSnapshot>,
    /// Scene count (0 until the script stage completes)
    pub total_scenes: u32,
    /// Scenes with all per-scene items completed
    pub completed_scenes: u32,
    /// Accumulated spend in cents
    pub total_cost_cents: u64,
    /// Structured error if the run failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<GenerationError>,
    /// Final video URL once completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    /// When the run was accepted (RFC3339)
    pub created_at: String,
    /// When the status was last written (RFC3339)
    pub updated_at: String,
    /// Last heartbeat from the executing engine (RFC3339)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<String>,
    /// Whether the run appears stale (engine may have crashed)
    pub is_stale: bool,
    /// Snapshot sequence number for client synchronization
    pub event_seq: u64,
}

/// Retry options.
#[derive(Debug, Default, Deserialize)]
pub struct RetryGenerationRequest {
    /// Stage to restart from; omitted means resume after the last
    /// completed stage
    #[serde(default)]
    pub from_step: Option<GenerationStep>,
    /// Only re-run items that failed, keep completed ones
    #[serde(default)]
    pub failed_only: bool,
}

/// Response to a retry submission.
#[derive(Debug, Serialize)]
pub struct RetryGenerationResponse {
    pub generation_id: String,
    pub status: String,
}

/// Response to a cancel request.
#[derive(Debug, Serialize)]
pub struct CancelGenerationResponse {
    pub generation_id: String,
    pub status: String,
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/generations
///
/// Submit a new generation run.
///
/// Validates the request shape, rejects runs whose estimate cannot fit the
/// tier's monthly budget, seeds the status cache, and enqueues a start job.
///
/// Returns:
/// - 202: Run accepted, body carries the generation ID and cost estimate
/// - 400: Invalid request or estimate exceeds the tier budget
pub async fn create_generation(
    State(state): State<AppState>,
    Json(request): Json<GenerationRequest>,
) -> ApiResult<(StatusCode, Json<CreateGenerationResponse>)> {
    request
        .validate()
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let scenes = request
        .target_scene_count
        .unwrap_or(DEFAULT_ESTIMATE_SCENES);
    let estimate = CostBreakdown::estimate(scenes, DEFAULT_ESTIMATE_CHARACTERS);

    // A run that cannot fit a fresh monthly budget can never complete, so
    // reject it before any provider spend happens.
    if !estimate.fits_within(request.tier) {
        return Err(ApiError::Validation(format!(
            "Estimated cost {} cents exceeds the {} tier monthly budget of {} cents",
            estimate.total_cents(),
            request.tier.as_str(),
            monthly_budget_cents(request.tier),
        )));
    }

    let generation_id = GenerationId::new();

    // Seed the status cache before enqueueing so a poll issued right after
    // the 202 finds the run.
    let snapshot = GenerationSnapshot::pending(generation_id.clone(), request.user_id.clone());
    state.status.put(&snapshot).await?;

    let tier = request.tier;
    let user_id = request.user_id.clone();
    let job = StartRunJob::new(generation_id.clone(), request);
    state.queue.enqueue_start(job).await?;

    metrics::record_run_submitted(tier.as_str());
    info!(
        generation_id = %generation_id,
        user_id = %user_id,
        tier = %tier.as_str(),
        "Run submitted"
    );

    let estimate_summary = estimate.to_description();
    Ok((
        StatusCode::ACCEPTED,
        Json(CreateGenerationResponse {
            generation_id: generation_id.to_string(),
            status: GenerationStatus::Pending.as_str().to_string(),
            estimate,
            estimate_summary,
        }),
    ))
}

/// GET /api/generations/:generation_id
///
/// Get the current status of a generation run from the snapshot cache.
///
/// Returns:
/// - 200: Current status with per-step rollups
/// - 400: Malformed generation ID
/// - 404: Unknown generation
pub async fn get_generation_status(
    State(state): State<AppState>,
    Path(generation_id): Path<String>,
) -> ApiResult<Json<GenerationStatusResponse>> {
    let id = parse_generation_id(&generation_id)?;

    let snapshot = state
        .status
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("Generation not found"))?;

    // Stale when the engine stopped heartbeating mid-run
    let is_stale = !snapshot.status.is_terminal()
        && snapshot.is_stale(STALE_THRESHOLD_SECS, STALE_GRACE_PERIOD_SECS);

    let status = if is_stale {
        "stale".to_string()
    } else {
        snapshot.status.as_str().to_string()
    };

    Ok(Json(GenerationStatusResponse {
        generation_id: snapshot.generation_id.to_string(),
        status,
        progress: snapshot.progress,
        current_step: snapshot.current_step,
        last_completed_step: snapshot.last_completed_step,
        steps: snapshot.steps,
        total_scenes: snapshot.total_scenes,
        completed_scenes: snapshot.completed_scenes,
        total_cost_cents: snapshot.total_cost_cents,
        error: snapshot.error,
        preview_url: snapshot.preview_url,
        created_at: snapshot.created_at.to_rfc3339(),
        updated_at: snapshot.updated_at.to_rfc3339(),
        last_heartbeat: snapshot.last_heartbeat.map(|h| h.to_rfc3339()),
        is_stale,
        event_seq: snapshot.event_seq,
    }))
}

/// POST /api/generations/:generation_id/retry
///
/// Re-enqueue a failed run. Completed work is kept; the engine resumes from
/// the last completed stage unless `from_step` forces an earlier one.
///
/// Returns:
/// - 202: Retry accepted
/// - 400: Malformed generation ID
/// - 404: Unknown generation
/// - 409: Run is not in a failed state
pub async fn retry_generation(
    State(state): State<AppState>,
    Path(generation_id): Path<String>,
    body: Option<Json<RetryGenerationRequest>>,
) -> ApiResult<(StatusCode, Json<RetryGenerationResponse>)> {
    let id = parse_generation_id(&generation_id)?;
    let options = body.map(|Json(b)| b).unwrap_or_default();

    let snapshot = state
        .status
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("Generation not found"))?;

    if snapshot.status != GenerationStatus::Failed {
        return Err(ApiError::conflict(format!(
            "Run is {}, only failed runs can be retried",
            snapshot.status
        )));
    }

    let mut job = RetryRunJob::new(id.clone(), snapshot.user_id.clone());
    if let Some(step) = options.from_step {
        job = job.with_from_step(step);
    }
    job = job.with_failed_only(options.failed_only);

    state.queue.enqueue_retry(job).await?;

    metrics::record_retry_requested();
    info!(
        generation_id = %id,
        from_step = ?options.from_step,
        failed_only = options.failed_only,
        "Retry submitted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(RetryGenerationResponse {
            generation_id: id.to_string(),
            status: "retry_queued".to_string(),
        }),
    ))
}

/// POST /api/generations/:generation_id/cancel
///
/// Request cancellation of an active run. The engine stops at the next
/// checkpoint; already dispatched provider calls are allowed to finish.
///
/// Returns:
/// - 202: Cancel requested
/// - 400: Malformed generation ID
/// - 404: Unknown generation
/// - 409: Run already finished
pub async fn cancel_generation(
    State(state): State<AppState>,
    Path(generation_id): Path<String>,
) -> ApiResult<(StatusCode, Json<CancelGenerationResponse>)> {
    let id = parse_generation_id(&generation_id)?;

    let snapshot = state
        .status
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("Generation not found"))?;

    if snapshot.status.is_terminal() {
        return Err(ApiError::conflict(format!(
            "Run already {}",
            snapshot.status
        )));
    }

    state.control.request_cancel(&id).await?;

    metrics::record_cancel_requested();
    info!(generation_id = %id, "Cancel requested");

    Ok((
        StatusCode::ACCEPTED,
        Json(CancelGenerationResponse {
            generation_id: id.to_string(),
            status: "cancel_requested".to_string(),
        }),
    ))
}

// ============================================================================
// Helpers
// ============================================================================

/// Validate a generation ID path parameter.
///
/// Valid format: alphanumeric characters and hyphens only, 8-64 chars.
fn parse_generation_id(id: &str) -> ApiResult<GenerationId> {
    if id.len() < 8 || id.len() > 64 {
        return Err(ApiError::bad_request("Invalid generation ID format"));
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(ApiError::bad_request("Invalid generation ID format"));
    }
    Ok(GenerationId::from_string(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_generation_ids() {
        assert!(parse_generation_id("12345678").is_ok());
        assert!(parse_generation_id("550e8400-e29b-41d4-a716-446655440000").is_ok());
        assert!(parse_generation_id("abc-1234-def").is_ok());
    }

    #[test]
    fn test_invalid_generation_ids() {
        assert!(parse_generation_id("").is_err());
        assert!(parse_generation_id("short").is_err());
        assert!(parse_generation_id("has space123").is_err());
        assert!(parse_generation_id("has_underscore").is_err());
        assert!(parse_generation_id(&"a".repeat(65)).is_err());
    }

    #[test]
    fn test_estimate_gate_rejects_oversized_free_run() {
        let estimate = CostBreakdown::estimate(24, DEFAULT_ESTIMATE_CHARACTERS);
        assert!(!estimate.fits_within(fable_models::PlanTier::Free));

        let estimate = CostBreakdown::estimate(DEFAULT_ESTIMATE_SCENES, DEFAULT_ESTIMATE_CHARACTERS);
        assert!(estimate.fits_within(fable_models::PlanTier::Free));
    }

    #[test]
    fn test_retry_options_default_to_resume() {
        let options: RetryGenerationRequest = serde_json::from_str("{}").unwrap();
        assert!(options.from_step.is_none());
        assert!(!options.failed_only);

        let options: RetryGenerationRequest =
            serde_json::from_str(r#"{"from_step": "audio", "failed_only": true}"#).unwrap();
        assert_eq!(options.from_step, Some(GenerationStep::Audio));
        assert!(options.failed_only);
    }
}
