//! Generation status cache in Redis.
//!
//! The engine writes a [`GenerationSnapshot`] after every state change;
//! the API reads it to answer status queries without touching the engine.
//! An auxiliary set tracks which generations are currently active so a
//! background sweep can detect runs whose engine died mid-flight.

use redis::AsyncCommands;
use tracing::debug;

use fable_models::{GenerationId, GenerationSnapshot};

use crate::error::QueueResult;

/// TTL for cached snapshots (24 hours).
pub const STATUS_TTL_SECS: u64 = 86_400;

/// Heartbeat age after which a live run is considered stale.
pub const STALE_THRESHOLD_SECS: i64 = 120;

/// Grace period after creation before staleness applies.
pub const STALE_GRACE_PERIOD_SECS: i64 = 300;

/// Redis-backed snapshot store.
#[derive(Clone)]
pub struct StatusStore {
    client: redis::Client,
}

impl StatusStore {
    /// Create a new status store.
    pub fn new(redis_url: &str) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    /// Key for a generation snapshot.
    pub fn status_key(generation_id: &GenerationId) -> String {
        format!("fable:status:{}", generation_id)
    }

    /// Key for the active generations set.
    fn active_set_key() -> &'static str {
        "fable:active-runs"
    }

    /// Write a snapshot, refreshing its TTL.
    pub async fn put(&self, snapshot: &GenerationSnapshot) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let key = Self::status_key(&snapshot.generation_id);
        let payload = serde_json::to_string(snapshot)?;
        conn.set_ex::<_, _, ()>(&key, payload, STATUS_TTL_SECS)
            .await?;

        if snapshot.status.is_terminal() {
            conn.srem::<_, _, ()>(Self::active_set_key(), snapshot.generation_id.as_str())
                .await?;
        } else {
            conn.sadd::<_, _, ()>(Self::active_set_key(), snapshot.generation_id.as_str())
                .await?;
        }

        debug!("Stored snapshot for {}", snapshot.generation_id);
        Ok(())
    }

    /// Read a snapshot, if one is cached.
    pub async fn get(&self, generation_id: &GenerationId) -> QueueResult<Option<GenerationSnapshot>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let key = Self::status_key(generation_id);
        let payload: Option<String> = conn.get(&key).await?;

        match payload {
            Some(json) => Ok(serde_json::from_str(&json).ok()),
            None => Ok(None),
        }
    }

    /// Delete a snapshot and remove it from the active set.
    pub async fn remove(&self, generation_id: &GenerationId) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        conn.del::<_, ()>(Self::status_key(generation_id)).await?;
        conn.srem::<_, _, ()>(Self::active_set_key(), generation_id.as_str())
            .await?;
        Ok(())
    }

    /// List snapshots for all generations currently marked active.
    ///
    /// Entries whose snapshot has expired are pruned from the set.
    pub async fn active_snapshots(&self) -> QueueResult<Vec<GenerationSnapshot>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let ids: Vec<String> = conn.smembers(Self::active_set_key()).await?;
        let mut snapshots = Vec::with_capacity(ids.len());

        for id in ids {
            let generation_id = GenerationId::from_string(id.clone());
            match self.get(&generation_id).await? {
                Some(snapshot) => snapshots.push(snapshot),
                None => {
                    conn.srem::<_, _, ()>(Self::active_set_key(), &id).await?;
                }
            }
        }

        Ok(snapshots)
    }
}
