//! Engine configuration.

use std::time::Duration;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum runs executing concurrently on this engine
    pub max_concurrent_runs: usize,
    /// Maximum items dispatched in parallel within one stage
    pub max_stage_parallel: usize,
    /// Per-call provider timeout; an elapsed call counts as a provider failure
    pub provider_timeout: Duration,
    /// Consecutive failures before a provider's circuit opens
    pub circuit_failure_threshold: u32,
    /// How long an open circuit rejects before allowing a trial call
    pub circuit_cooldown: Duration,
    /// Total merge attempts, including the first
    pub merge_max_attempts: u32,
    /// Timeout for one ffmpeg invocation
    pub ffmpeg_timeout: Duration,
    /// Work directory for downloaded clips and merge output
    pub work_dir: String,
    /// Public base URL the final video is served under
    pub output_base_url: String,
    /// How often the engine scans for orphaned pending run jobs
    pub claim_interval: Duration,
    /// Minimum idle time before a pending run job can be claimed (crash recovery)
    pub claim_min_idle: Duration,
    /// Interval for refreshing run heartbeats while executing
    pub heartbeat_interval: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 2,
            max_stage_parallel: 4,
            provider_timeout: Duration::from_secs(120),
            circuit_failure_threshold: 3,
            circuit_cooldown: Duration::from_secs(30),
            merge_max_attempts: 3,
            ffmpeg_timeout: Duration::from_secs(300),
            work_dir: "/tmp/fable".to_string(),
            output_base_url: "http://localhost:9000/media".to_string(),
            claim_interval: Duration::from_secs(30),
            claim_min_idle: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            max_concurrent_runs: std::env::var("ENGINE_MAX_RUNS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(2),
            max_stage_parallel: std::env::var("ENGINE_MAX_STAGE_PARALLEL")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(4),
            provider_timeout: Duration::from_secs(
                std::env::var("ENGINE_PROVIDER_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(120),
            ),
            circuit_failure_threshold: std::env::var("ENGINE_CIRCUIT_FAILURES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
            circuit_cooldown: Duration::from_secs(
                std::env::var("ENGINE_CIRCUIT_COOLDOWN_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            merge_max_attempts: std::env::var("ENGINE_MERGE_MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
            ffmpeg_timeout: Duration::from_secs(
                std::env::var("ENGINE_FFMPEG_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
            ),
            work_dir: std::env::var("ENGINE_WORK_DIR").unwrap_or_else(|_| "/tmp/fable".to_string()),
            output_base_url: std::env::var("ENGINE_OUTPUT_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:9000/media".to_string()),
            claim_interval: Duration::from_secs(
                std::env::var("ENGINE_CLAIM_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            claim_min_idle: Duration::from_secs(
                std::env::var("ENGINE_CLAIM_MIN_IDLE_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
            ),
            heartbeat_interval: Duration::from_secs(
                std::env::var("ENGINE_HEARTBEAT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            shutdown_timeout: Duration::from_secs(
                std::env::var("ENGINE_SHUTDOWN_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
        }
    }
}
