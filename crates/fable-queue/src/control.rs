//! Cancellation control channel.
//!
//! Cancellation is two-layered: a flag key that survives restarts, and a
//! pub/sub broadcast so an engine holding the run can react immediately.
//! The flag is checked at stage boundaries and between item dispatches,
//! so a cancel lands even if the broadcast was missed.

use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use fable_models::GenerationId;

use crate::error::QueueResult;

/// TTL for cancel flags (24 hours).
const CANCEL_FLAG_TTL_SECS: u64 = 86_400;

/// Pub/sub channel for control messages.
const CONTROL_CHANNEL: &str = "fable:control";

/// Control message broadcast to all engines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Request cancellation of a running generation
    Cancel { generation_id: GenerationId },
}

/// Channel for requesting and observing run cancellation.
#[derive(Clone)]
pub struct ControlChannel {
    client: redis::Client,
}

impl ControlChannel {
    /// Create a new control channel.
    pub fn new(redis_url: &str) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    /// Key for a cancel flag.
    pub fn cancel_key(generation_id: &GenerationId) -> String {
        format!("fable:cancel:{}", generation_id)
    }

    /// Request cancellation of a generation.
    ///
    /// Sets the durable flag first, then broadcasts; an engine that misses
    /// the broadcast still sees the flag at its next checkpoint.
    pub async fn request_cancel(&self, generation_id: &GenerationId) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let key = Self::cancel_key(generation_id);
        conn.set_ex::<_, _, ()>(&key, "1", CANCEL_FLAG_TTL_SECS)
            .await?;

        let message = ControlMessage::Cancel {
            generation_id: generation_id.clone(),
        };
        let payload = serde_json::to_string(&message)?;
        conn.publish::<_, _, ()>(CONTROL_CHANNEL, payload).await?;

        info!("Cancel requested for generation {}", generation_id);
        Ok(())
    }

    /// Check whether cancellation has been requested.
    pub async fn is_cancel_requested(&self, generation_id: &GenerationId) -> QueueResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let exists: bool = conn.exists(Self::cancel_key(generation_id)).await?;
        Ok(exists)
    }

    /// Clear a cancel flag once the run has acknowledged it.
    pub async fn clear(&self, generation_id: &GenerationId) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.del::<_, ()>(Self::cancel_key(generation_id)).await?;
        debug!("Cleared cancel flag for {}", generation_id);
        Ok(())
    }

    /// Subscribe to control messages.
    /// Returns a pinned stream that can be polled with `.next()`.
    pub async fn subscribe(
        &self,
    ) -> QueueResult<std::pin::Pin<Box<dyn futures_util::Stream<Item = ControlMessage> + Send>>>
    {
        use futures_util::StreamExt;

        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(CONTROL_CHANNEL).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            serde_json::from_str(&payload).ok()
        });

        Ok(Box::pin(stream))
    }
}
