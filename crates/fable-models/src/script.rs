//! Normalized script-stage output.
//!
//! Script providers are instructed to return a strict JSON object; this
//! module parses and validates that payload into the breakdown the rest of
//! the pipeline fans out over.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A character the script introduces; keys the character-image work set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CharacterProfile {
    /// Name scenes refer to this character by
    pub name: String,
    /// Visual description fed to the image provider
    pub appearance: String,
}

/// One scene of the breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ScriptScene {
    /// 0-based position in the final video
    pub index: u32,
    /// Narration spoken over this scene
    pub narration: String,
    /// Prompt for the scene's still image
    pub visual_prompt: String,
    /// Names of characters appearing in this scene
    #[serde(default)]
    pub characters: Vec<String>,
}

/// Structured result of the script stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ScriptBreakdown {
    pub title: String,
    #[serde(default)]
    pub characters: Vec<CharacterProfile>,
    pub scenes: Vec<ScriptScene>,
}

impl ScriptBreakdown {
    /// Parse a provider's JSON payload and validate its shape.
    pub fn from_provider_json(text: &str) -> Result<Self, ScriptParseError> {
        let breakdown: ScriptBreakdown = serde_json::from_str(text)?;
        breakdown.validate()?;
        Ok(breakdown)
    }

    /// Shape checks the pipeline relies on: scenes are contiguous from 0,
    /// narration and prompts are non-empty, character references resolve.
    pub fn validate(&self) -> Result<(), ScriptParseError> {
        if self.scenes.is_empty() {
            return Err(ScriptParseError::NoScenes);
        }

        for (position, scene) in self.scenes.iter().enumerate() {
            let expected = position as u32;
            if scene.index != expected {
                return Err(ScriptParseError::SceneIndex {
                    found: scene.index,
                    expected,
                });
            }
            if scene.narration.trim().is_empty() {
                return Err(ScriptParseError::EmptyField {
                    index: scene.index,
                    field: "narration",
                });
            }
            if scene.visual_prompt.trim().is_empty() {
                return Err(ScriptParseError::EmptyField {
                    index: scene.index,
                    field: "visual_prompt",
                });
            }
            for name in &scene.characters {
                if !self.characters.iter().any(|c| &c.name == name) {
                    return Err(ScriptParseError::UnknownCharacter {
                        index: scene.index,
                        name: name.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    pub fn scene_count(&self) -> u32 {
        self.scenes.len() as u32
    }

    pub fn character_count(&self) -> u32 {
        self.characters.len() as u32
    }

    /// Appearance prompt for a named character, if the script defines one.
    pub fn appearance_of(&self, name: &str) -> Option<&str> {
        self.characters
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.appearance.as_str())
    }
}

/// Why a provider's script payload was rejected.
#[derive(Debug, Error)]
pub enum ScriptParseError {
    #[error("script payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("script contains no scenes")]
    NoScenes,

    #[error("scene carries index {found}, expected {expected}")]
    SceneIndex { found: u32, expected: u32 },

    #[error("scene {index} references unknown character \"{name}\"")]
    UnknownCharacter { index: u32, name: String },

    #[error("scene {index} has an empty {field}")]
    EmptyField { index: u32, field: &'static str },
}
