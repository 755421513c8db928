//! Prompt sets for steering experiments

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::chat::{format_question, ChatFormat};

/// Sentence stems completed by a basketball player's name
pub const BASKETBALL_PROMPTS: [&str; 20] = [
    "The ball was passed to ",
    "The final shot was taken by ",
    "With seconds left, the ball was in the hands of ",
    "The MVP of the game was ",
    "The crowd erupted when ",
    "One of the greatest players of all time is ",
    "On the fast break, the ball found ",
    "The star player on the court was ",
    "Leading the team in points was ",
    "All eyes were on ",
    "The player who changed the game was ",
    "Known for his clutch performances ",
    "The announcer shouted the name ",
    "He pulled up from three, it's ",
    "She handed the ball off to ",
    "The highlight reel featured ",
    "No one could guard ",
    "In the fourth quarter, they gave the ball to ",
    "At the top of the key stood ",
    "The jersey with number 6 belongs to ",
];

/// Raw JSON structure for loading
#[derive(Debug, Serialize, Deserialize)]
struct PromptFile {
    prompts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<serde_json::Value>,
}

/// Collection of prompt stems
#[derive(Debug, Clone, PartialEq)]
pub struct PromptSet {
    prompts: Vec<String>,
    metadata: Option<serde_json::Value>,
}

impl PromptSet {
    pub fn new(prompts: Vec<String>) -> Self {
        Self {
            prompts,
            metadata: None,
        }
    }

    /// The built-in basketball prompts
    pub fn basketball() -> Self {
        Self::new(BASKETBALL_PROMPTS.iter().map(|p| p.to_string()).collect())
    }

    /// Load from a JSON file (`{"prompts": [...], "metadata": ...}`)
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read prompt file {}", path.display()))?;
        let file: PromptFile = serde_json::from_str(&content)
            .with_context(|| format!("Invalid prompt file {}", path.display()))?;
        Ok(Self {
            prompts: file.prompts,
            metadata: file.metadata,
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = PromptFile {
            prompts: self.prompts.clone(),
            metadata: self.metadata.clone(),
        };
        std::fs::write(path.as_ref(), serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    pub fn prompts(&self) -> &[String] {
        &self.prompts
    }

    pub fn metadata(&self) -> Option<&serde_json::Value> {
        self.metadata.as_ref()
    }

    /// Every prompt in the question/answer chat framing
    pub fn formatted(&self, format: ChatFormat) -> Vec<String> {
        self.prompts
            .iter()
            .map(|p| format_question(format, p))
            .collect()
    }
}
