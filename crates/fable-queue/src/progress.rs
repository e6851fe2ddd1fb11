//! Run progress events via Redis Pub/Sub.

use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::debug;

use fable_models::{ErrorKind, GenerationId, GenerationStep, ProviderId, RunEvent};

use crate::error::QueueResult;

/// Progress event published to Redis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Generation the event belongs to
    pub generation_id: GenerationId,
    /// Run event payload
    pub event: RunEvent,
}

/// Channel for publishing/subscribing to run progress events.
#[derive(Clone)]
pub struct ProgressChannel {
    client: redis::Client,
}

impl ProgressChannel {
    /// Create a new progress channel.
    pub fn new(redis_url: &str) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    /// Get the channel name for a generation.
    pub fn channel_name(generation_id: &GenerationId) -> String {
        format!("fable:progress:{}", generation_id)
    }

    /// Publish a progress event.
    pub async fn publish(&self, event: &ProgressEvent) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let channel = Self::channel_name(&event.generation_id);
        let payload = serde_json::to_string(event)?;

        debug!("Publishing {} event to {}", event.event.kind(), channel);
        conn.publish::<_, _, ()>(channel, payload).await?;

        Ok(())
    }

    /// Publish a run event for a generation.
    pub async fn emit(&self, generation_id: &GenerationId, event: RunEvent) -> QueueResult<()> {
        self.publish(&ProgressEvent {
            generation_id: generation_id.clone(),
            event,
        })
        .await
    }

    /// Publish a log message.
    pub async fn log(
        &self,
        generation_id: &GenerationId,
        message: impl Into<String>,
    ) -> QueueResult<()> {
        self.emit(generation_id, RunEvent::log(message)).await
    }

    /// Publish a progress update.
    pub async fn progress(&self, generation_id: &GenerationId, value: u8) -> QueueResult<()> {
        self.emit(generation_id, RunEvent::Progress { value }).await
    }

    /// Publish a stage started notification.
    pub async fn step_started(
        &self,
        generation_id: &GenerationId,
        step: GenerationStep,
        total_items: u32,
    ) -> QueueResult<()> {
        self.emit(generation_id, RunEvent::StepStarted { step, total_items })
            .await
    }

    /// Publish an item completed notification.
    pub async fn item_completed(
        &self,
        generation_id: &GenerationId,
        step: GenerationStep,
        index: u32,
        provider: ProviderId,
    ) -> QueueResult<()> {
        self.emit(
            generation_id,
            RunEvent::ItemCompleted {
                step,
                index,
                provider,
            },
        )
        .await
    }

    /// Publish a stage completed notification.
    pub async fn step_completed(
        &self,
        generation_id: &GenerationId,
        step: GenerationStep,
    ) -> QueueResult<()> {
        self.emit(generation_id, RunEvent::StepCompleted { step })
            .await
    }

    /// Publish a provider fallback notification.
    pub async fn fallback(
        &self,
        generation_id: &GenerationId,
        step: GenerationStep,
        index: u32,
        requested: ProviderId,
        used: ProviderId,
    ) -> QueueResult<()> {
        self.emit(
            generation_id,
            RunEvent::Fallback {
                step,
                index,
                requested,
                used,
            },
        )
        .await
    }

    /// Publish run completed with the final video URL.
    pub async fn completed(
        &self,
        generation_id: &GenerationId,
        final_video_url: impl Into<String>,
    ) -> QueueResult<()> {
        self.emit(
            generation_id,
            RunEvent::Completed {
                final_video_url: final_video_url.into(),
            },
        )
        .await
    }

    /// Publish run failed.
    pub async fn failed(
        &self,
        generation_id: &GenerationId,
        step: GenerationStep,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> QueueResult<()> {
        self.emit(
            generation_id,
            RunEvent::Failed {
                step,
                kind,
                message: message.into(),
            },
        )
        .await
    }

    /// Publish run cancelled.
    pub async fn cancelled(&self, generation_id: &GenerationId) -> QueueResult<()> {
        self.emit(generation_id, RunEvent::Cancelled).await
    }

    /// Subscribe to progress events for a generation.
    /// Returns a pinned stream that can be polled with `.next()`.
    pub async fn subscribe(
        &self,
        generation_id: &GenerationId,
    ) -> QueueResult<std::pin::Pin<Box<dyn futures_util::Stream<Item = ProgressEvent> + Send>>>
    {
        use futures_util::StreamExt;

        let mut pubsub = self.client.get_async_pubsub().await?;
        let channel = Self::channel_name(generation_id);

        pubsub.subscribe(&channel).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            serde_json::from_str(&payload).ok()
        });

        Ok(Box::pin(stream))
    }
}
