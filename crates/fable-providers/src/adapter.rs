//! Provider adapter trait and typed request/response payloads.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fable_models::{Capability, ProviderId};

use crate::error::ProviderResult;

/// Typed request to a generative provider, one variant per capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum ProviderRequest {
    /// Turn source text into a structured script breakdown
    Script { prompt: String },
    /// Render one image from a prompt, optionally conditioned on references
    Image {
        prompt: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        reference_urls: Vec<String>,
    },
    /// Synthesize narration audio for one scene
    Audio {
        text: String,
        voice: String,
        speed: f32,
        language: String,
    },
    /// Animate one scene image into a clip
    Video {
        image_url: String,
        motion_prompt: String,
        strength: f32,
        duration_ms: u64,
    },
    /// Align a clip's mouth movement with its narration
    LipSync { video_url: String, audio_url: String },
}

impl ProviderRequest {
    /// Capability this request targets.
    pub fn capability(&self) -> Capability {
        match self {
            ProviderRequest::Script { .. } => Capability::ScriptGeneration,
            ProviderRequest::Image { .. } => Capability::ImageGeneration,
            ProviderRequest::Audio { .. } => Capability::AudioSynthesis,
            ProviderRequest::Video { .. } => Capability::VideoSynthesis,
            ProviderRequest::LipSync { .. } => Capability::LipSync,
        }
    }
}

/// Normalized provider output.
///
/// The gateway returns a flat envelope; which fields are populated depends
/// on the capability. Stage processors decide whether the fields they need
/// are present and reject the response as malformed otherwise.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// Textual content (script generation)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Hosted media URL (image, audio, video, lipsync)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Media duration where the provider reports one (audio)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Actual cost charged by the provider, when reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_cents: Option<u64>,
}

/// A client capable of invoking generative providers.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Invoke `provider` with `request` and return its normalized response.
    async fn invoke(
        &self,
        provider: &ProviderId,
        request: &ProviderRequest,
    ) -> ProviderResult<ProviderResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_capability_mapping() {
        let script = ProviderRequest::Script {
            prompt: "breakdown".to_string(),
        };
        let lipsync = ProviderRequest::LipSync {
            video_url: "https://cdn/scene0.mp4".to_string(),
            audio_url: "https://cdn/scene0.mp3".to_string(),
        };

        assert_eq!(script.capability(), Capability::ScriptGeneration);
        assert_eq!(lipsync.capability(), Capability::LipSync);
    }

    #[test]
    fn test_request_serializes_with_task_tag() {
        let request = ProviderRequest::Audio {
            text: "Once upon a time".to_string(),
            voice: "narrator_f1".to_string(),
            speed: 1.0,
            language: "en-US".to_string(),
        };

        let json = serde_json::to_value(&request).expect("serialize request");
        assert_eq!(json["task"], "audio");
        assert_eq!(json["voice"], "narrator_f1");
    }
}
