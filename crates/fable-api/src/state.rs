//! Application state.

use std::sync::Arc;

use fable_queue::{ControlChannel, ProgressChannel, RunQueue, StatusStore};

use crate::config::ApiConfig;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub queue: Arc<RunQueue>,
    pub status: Arc<StatusStore>,
    pub control: Arc<ControlChannel>,
    pub progress: Arc<ProgressChannel>,
}

impl AppState {
    /// Create new application state.
    pub async fn new(config: ApiConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let queue = RunQueue::from_env()?;

        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let status = StatusStore::new(&redis_url)?;
        let control = ControlChannel::new(&redis_url)?;
        let progress = ProgressChannel::new(&redis_url)?;

        Ok(Self {
            config,
            queue: Arc::new(queue),
            status: Arc::new(status),
            control: Arc::new(control),
            progress: Arc::new(progress),
        })
    }
}
