//! Stage processors.
//!
//! Each provider-backed step of the pipeline is a [`StageProcessor`]: it
//! plans the step's work items from the script breakdown, builds the
//! provider request for one item, and normalizes the raw provider response
//! into an [`AssetOutput`]. The pipeline drives every stage through the same
//! budget/selector loop, so processors stay declarative.
//!
//! Normalization runs inside the selector's candidate loop: a provider that
//! returns garbage counts as a failed candidate and the chain moves on.

use fable_models::{
    AssetKey, AssetOutput, Generation, GenerationRequest, GenerationStep, ProviderId, SceneAsset,
    ScriptBreakdown,
};
use fable_providers::{ProviderError, ProviderRequest, ProviderResponse};

use crate::error::{EngineError, EngineResult};

/// Read-only view of a run handed to stage processors.
pub struct StageContext<'a> {
    pub generation: &'a Generation,
    pub request: &'a GenerationRequest,
    /// Script breakdown; present for every stage after `script`.
    pub breakdown: Option<&'a ScriptBreakdown>,
    /// All asset rows of the run so far, for cross-stage lookups.
    pub assets: &'a [SceneAsset],
}

impl<'a> StageContext<'a> {
    /// Completed output URL of an upstream item, if present.
    pub fn output_url(&self, step: GenerationStep, index: u32) -> Option<&str> {
        self.assets
            .iter()
            .find(|a| a.key == AssetKey::new(step, index))
            .and_then(|a| a.output.as_ref())
            .and_then(|o| o.url())
    }

    fn require_output_url(&self, step: GenerationStep, index: u32) -> EngineResult<String> {
        self.output_url(step, index)
            .map(|url| url.to_string())
            .ok_or_else(|| {
                EngineError::internal(format!(
                    "Missing upstream output {step}/{index} for run {}",
                    self.generation.id
                ))
            })
    }

    fn require_breakdown(&self) -> EngineResult<&'a ScriptBreakdown> {
        self.breakdown.ok_or_else(|| {
            EngineError::internal(format!(
                "Script breakdown missing for run {}",
                self.generation.id
            ))
        })
    }
}

/// One planned unit of work within a stage.
#[derive(Debug, Clone)]
pub struct StageItem {
    pub index: u32,
    /// Human-readable handle for logs and events, e.g. "scene 3".
    pub label: String,
}

impl StageItem {
    fn new(index: u32, label: impl Into<String>) -> Self {
        Self {
            index,
            label: label.into(),
        }
    }
}

/// Declarative description of one provider-backed pipeline step.
pub trait StageProcessor: Send + Sync {
    /// Step this processor implements.
    fn step(&self) -> GenerationStep;

    /// Work items this stage must produce.
    fn plan(&self, ctx: &StageContext<'_>) -> EngineResult<Vec<StageItem>>;

    /// Provider request for one planned item.
    fn request_for(&self, ctx: &StageContext<'_>, item: &StageItem)
        -> EngineResult<ProviderRequest>;

    /// Validate and convert a raw provider response.
    ///
    /// An `Err` here is a candidate failure: the selector records it and
    /// falls through to the next provider in the chain.
    fn normalize(&self, response: &ProviderResponse) -> Result<AssetOutput, ProviderError>;
}

/// Processor for a provider-backed step; `None` for the local merge.
pub fn processor_for(step: GenerationStep) -> Option<Box<dyn StageProcessor>> {
    match step {
        GenerationStep::Script => Some(Box::new(ScriptStage)),
        GenerationStep::CharacterImages => Some(Box::new(CharacterImagesStage)),
        GenerationStep::SceneImages => Some(Box::new(SceneImagesStage)),
        GenerationStep::Audio => Some(Box::new(AudioStage)),
        GenerationStep::SceneVideo => Some(Box::new(SceneVideoStage)),
        GenerationStep::LipSync => Some(Box::new(LipSyncStage)),
        GenerationStep::Merge => None,
    }
}

fn require_url(response: &ProviderResponse, what: &str) -> Result<String, ProviderError> {
    response
        .url
        .clone()
        .ok_or_else(|| ProviderError::malformed(format!("{what} response carried no url")))
}

// =============================================================================
// Script
// =============================================================================

struct ScriptStage;

impl StageProcessor for ScriptStage {
    fn step(&self) -> GenerationStep {
        GenerationStep::Script
    }

    fn plan(&self, _ctx: &StageContext<'_>) -> EngineResult<Vec<StageItem>> {
        Ok(vec![StageItem::new(0, "script")])
    }

    fn request_for(
        &self,
        ctx: &StageContext<'_>,
        _item: &StageItem,
    ) -> EngineResult<ProviderRequest> {
        Ok(ProviderRequest::Script {
            prompt: build_script_prompt(ctx.request),
        })
    }

    fn normalize(&self, response: &ProviderResponse) -> Result<AssetOutput, ProviderError> {
        let content = response
            .content
            .as_deref()
            .ok_or_else(|| ProviderError::malformed("script response carried no content"))?;
        let breakdown = ScriptBreakdown::from_provider_json(content)
            .map_err(|e| ProviderError::malformed(format!("script payload rejected: {e}")))?;
        Ok(AssetOutput::Script { breakdown })
    }
}

/// Prompt instructing the script provider to return the strict JSON shape
/// [`ScriptBreakdown::from_provider_json`] accepts.
fn build_script_prompt(request: &GenerationRequest) -> String {
    let scene_hint = match request.target_scene_count {
        Some(count) => format!("Break the story into exactly {count} scenes."),
        None => "Break the story into 4-8 scenes, whatever the pacing needs.".to_string(),
    };
    let title_hint = match &request.title {
        Some(title) => format!("Working title: {title}\n"),
        None => String::new(),
    };

    format!(
        "You are a storyboard writer for short narrated videos.\n\
         Convert the source text below into a structured script.\n\
         {title_hint}{scene_hint}\n\n\
         Requirements:\n\
         - Each scene has narration (1-3 spoken sentences) and a visual_prompt describing one still image.\n\
         - Introduce every recurring character once in `characters` with a concrete visual appearance.\n\
         - Scenes reference characters by the exact `name` used in `characters`.\n\
         - Scene `index` starts at 0 and increments by 1.\n\n\
         Return ONLY a JSON object, no markdown fences:\n\
         {{\"title\": \"...\", \"characters\": [{{\"name\": \"...\", \"appearance\": \"...\"}}], \
         \"scenes\": [{{\"index\": 0, \"narration\": \"...\", \"visual_prompt\": \"...\", \"characters\": [\"...\"]}}]}}\n\n\
         Source text:\n{source}",
        title_hint = title_hint,
        scene_hint = scene_hint,
        source = request.source_text,
    )
}

// =============================================================================
// Character images
// =============================================================================

struct CharacterImagesStage;

impl StageProcessor for CharacterImagesStage {
    fn step(&self) -> GenerationStep {
        GenerationStep::CharacterImages
    }

    fn plan(&self, ctx: &StageContext<'_>) -> EngineResult<Vec<StageItem>> {
        let breakdown = ctx.require_breakdown()?;
        Ok(breakdown
            .characters
            .iter()
            .enumerate()
            .map(|(i, c)| StageItem::new(i as u32, c.name.clone()))
            .collect())
    }

    fn request_for(
        &self,
        ctx: &StageContext<'_>,
        item: &StageItem,
    ) -> EngineResult<ProviderRequest> {
        let breakdown = ctx.require_breakdown()?;
        let character = breakdown.characters.get(item.index as usize).ok_or_else(|| {
            EngineError::internal(format!("Character index {} out of range", item.index))
        })?;
        Ok(ProviderRequest::Image {
            prompt: format!(
                "Character reference portrait of {}: {}. Full body, neutral background, \
                 consistent design for reuse across scenes",
                character.name, character.appearance
            ),
            reference_urls: Vec::new(),
        })
    }

    fn normalize(&self, response: &ProviderResponse) -> Result<AssetOutput, ProviderError> {
        Ok(AssetOutput::Image {
            url: require_url(response, "character image")?,
        })
    }
}

// =============================================================================
// Scene images
// =============================================================================

struct SceneImagesStage;

impl StageProcessor for SceneImagesStage {
    fn step(&self) -> GenerationStep {
        GenerationStep::SceneImages
    }

    fn plan(&self, ctx: &StageContext<'_>) -> EngineResult<Vec<StageItem>> {
        let breakdown = ctx.require_breakdown()?;
        Ok(breakdown
            .scenes
            .iter()
            .map(|s| StageItem::new(s.index, format!("scene {}", s.index)))
            .collect())
    }

    fn request_for(
        &self,
        ctx: &StageContext<'_>,
        item: &StageItem,
    ) -> EngineResult<ProviderRequest> {
        let breakdown = ctx.require_breakdown()?;
        let scene = breakdown.scenes.get(item.index as usize).ok_or_else(|| {
            EngineError::internal(format!("Scene index {} out of range", item.index))
        })?;

        // Character reference images keep the cast visually consistent
        let mut reference_urls = Vec::new();
        for name in &scene.characters {
            let position = breakdown
                .characters
                .iter()
                .position(|c| &c.name == name)
                .ok_or_else(|| {
                    EngineError::internal(format!("Scene {} casts unknown character {name}", item.index))
                })?;
            reference_urls.push(
                ctx.require_output_url(GenerationStep::CharacterImages, position as u32)?,
            );
        }

        Ok(ProviderRequest::Image {
            prompt: scene.visual_prompt.clone(),
            reference_urls,
        })
    }

    fn normalize(&self, response: &ProviderResponse) -> Result<AssetOutput, ProviderError> {
        Ok(AssetOutput::Image {
            url: require_url(response, "scene image")?,
        })
    }
}

// =============================================================================
// Audio
// =============================================================================

struct AudioStage;

impl StageProcessor for AudioStage {
    fn step(&self) -> GenerationStep {
        GenerationStep::Audio
    }

    fn plan(&self, ctx: &StageContext<'_>) -> EngineResult<Vec<StageItem>> {
        let breakdown = ctx.require_breakdown()?;
        Ok(breakdown
            .scenes
            .iter()
            .map(|s| StageItem::new(s.index, format!("scene {}", s.index)))
            .collect())
    }

    fn request_for(
        &self,
        ctx: &StageContext<'_>,
        item: &StageItem,
    ) -> EngineResult<ProviderRequest> {
        let breakdown = ctx.require_breakdown()?;
        let scene = breakdown.scenes.get(item.index as usize).ok_or_else(|| {
            EngineError::internal(format!("Scene index {} out of range", item.index))
        })?;
        Ok(ProviderRequest::Audio {
            text: scene.narration.clone(),
            voice: ctx.request.voice.voice.clone(),
            speed: ctx.request.voice.speed,
            language: ctx.request.voice.language.clone(),
        })
    }

    fn normalize(&self, response: &ProviderResponse) -> Result<AssetOutput, ProviderError> {
        Ok(AssetOutput::Audio {
            url: require_url(response, "audio")?,
            duration_ms: response.duration_ms.unwrap_or(0),
        })
    }
}

// =============================================================================
// Scene video
// =============================================================================

struct SceneVideoStage;

impl StageProcessor for SceneVideoStage {
    fn step(&self) -> GenerationStep {
        GenerationStep::SceneVideo
    }

    fn plan(&self, ctx: &StageContext<'_>) -> EngineResult<Vec<StageItem>> {
        let breakdown = ctx.require_breakdown()?;
        Ok(breakdown
            .scenes
            .iter()
            .map(|s| StageItem::new(s.index, format!("scene {}", s.index)))
            .collect())
    }

    fn request_for(
        &self,
        ctx: &StageContext<'_>,
        item: &StageItem,
    ) -> EngineResult<ProviderRequest> {
        let breakdown = ctx.require_breakdown()?;
        let scene = breakdown.scenes.get(item.index as usize).ok_or_else(|| {
            EngineError::internal(format!("Scene index {} out of range", item.index))
        })?;
        Ok(ProviderRequest::Video {
            image_url: ctx.require_output_url(GenerationStep::SceneImages, item.index)?,
            motion_prompt: scene.visual_prompt.clone(),
            strength: ctx.request.motion.strength,
            duration_ms: ctx.request.motion.duration_ms,
        })
    }

    fn normalize(&self, response: &ProviderResponse) -> Result<AssetOutput, ProviderError> {
        Ok(AssetOutput::Video {
            url: require_url(response, "scene video")?,
        })
    }
}

// =============================================================================
// Lip sync
// =============================================================================

struct LipSyncStage;

impl StageProcessor for LipSyncStage {
    fn step(&self) -> GenerationStep {
        GenerationStep::LipSync
    }

    fn plan(&self, ctx: &StageContext<'_>) -> EngineResult<Vec<StageItem>> {
        let breakdown = ctx.require_breakdown()?;
        Ok(breakdown
            .scenes
            .iter()
            .map(|s| StageItem::new(s.index, format!("scene {}", s.index)))
            .collect())
    }

    fn request_for(
        &self,
        ctx: &StageContext<'_>,
        item: &StageItem,
    ) -> EngineResult<ProviderRequest> {
        Ok(ProviderRequest::LipSync {
            video_url: ctx.require_output_url(GenerationStep::SceneVideo, item.index)?,
            audio_url: ctx.require_output_url(GenerationStep::Audio, item.index)?,
        })
    }

    fn normalize(&self, response: &ProviderResponse) -> Result<AssetOutput, ProviderError> {
        Ok(AssetOutput::Video {
            url: require_url(response, "lipsync")?,
        })
    }
}

/// Local provider id recorded on merge assets; there is no remote call.
pub fn local_merge_provider() -> ProviderId {
    ProviderId::new("local-ffmpeg")
}
