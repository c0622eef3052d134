//! Declarative conversation datasets.
//!
//! An `LLMDataset` document holds labeled conversations with an optional
//! shared system prompt. Datasets export to fine-tuning JSONL (one
//! `{"messages": […]}` object per line, optionally split into train and
//! validation sets by a deterministic seed) and to batch-API JSONL (one
//! request object per conversation).

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, DataObject};
use crate::llm::{LlmMessage, LlmMessageRole};

/// The `kind` declared by dataset documents.
pub const KIND: &str = "LLMDataset";

/// One conversation with optional labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConversation {
    /// The conversation turns.
    pub messages: Vec<LlmMessage>,
    /// Free-form labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl DatasetConversation {
    /// Create an unlabeled conversation.
    #[must_use]
    pub fn new(messages: Vec<LlmMessage>) -> Self {
        Self {
            messages,
            labels: BTreeMap::new(),
        }
    }

    /// Create a single user/assistant exchange.
    #[must_use]
    pub fn exchange(user: impl Into<String>, assistant: impl Into<String>) -> Self {
        Self::new(vec![
            LlmMessage::user(user),
            LlmMessage::assistant(assistant),
        ])
    }
}

/// Payload of an `LLMDataset` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSpec {
    /// System prompt shared by every conversation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// The conversations.
    pub conversations: Vec<DatasetConversation>,
}

/// A parsed `LLMDataset` document.
pub type DatasetObject = DataObject<DatasetSpec>;

#[derive(Serialize)]
struct FinetuneLine<'a> {
    messages: Vec<&'a LlmMessage>,
}

#[derive(Serialize)]
struct BatchBody<'a> {
    model: &'a str,
    messages: Vec<&'a LlmMessage>,
}

#[derive(Serialize)]
struct BatchLine<'a> {
    custom_id: String,
    method: &'static str,
    url: &'a str,
    body: BatchBody<'a>,
}

impl DatasetObject {
    /// Parse an `LLMDataset` document from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let mut object = Self::from_yaml_str(text, KIND)?;
        if object.spec.conversations.is_empty() {
            return Err(ConfigError::InvalidValue(
                "dataset must contain at least one conversation".to_string(),
            ));
        }
        if let Some(prompt) = &object.spec.system_prompt {
            object.spec.system_prompt = Some(prompt.trim().to_string());
        }
        Ok(object)
    }

    /// The shared system prompt, if any.
    #[must_use]
    pub fn system_prompt(&self) -> Option<&str> {
        self.spec.system_prompt.as_deref()
    }

    /// The dataset's conversations.
    #[must_use]
    pub fn conversations(&self) -> &[DatasetConversation] {
        &self.spec.conversations
    }

    /// Count occurrences of each label value, grouped by label key.
    #[must_use]
    pub fn count_labels(&self) -> BTreeMap<String, BTreeMap<String, usize>> {
        let mut counters: BTreeMap<String, BTreeMap<String, usize>> = BTreeMap::new();
        for conversation in &self.spec.conversations {
            for (key, value) in &conversation.labels {
                *counters
                    .entry(key.clone())
                    .or_default()
                    .entry(value.clone())
                    .or_default() += 1;
            }
        }
        counters
    }

    fn validate_finetune(&self) -> Result<(), ConfigError> {
        for (index, conversation) in self.spec.conversations.iter().enumerate() {
            if conversation.messages.len() % 2 != 0 {
                return Err(ConfigError::InvalidValue(format!(
                    "fine-tuning conversation #{index} must have an even number of messages"
                )));
            }
            for (turn, message) in conversation.messages.iter().enumerate() {
                let expected = if turn % 2 == 0 {
                    LlmMessageRole::User
                } else {
                    LlmMessageRole::Assistant
                };
                if message.role != expected {
                    return Err(ConfigError::InvalidValue(format!(
                        "fine-tuning conversation #{index} must alternate user and assistant messages"
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_batch(&self) -> Result<(), ConfigError> {
        for (index, conversation) in self.spec.conversations.iter().enumerate() {
            let ends_with_user = conversation
                .messages
                .last()
                .is_some_and(|message| message.role == LlmMessageRole::User);
            if !ends_with_user {
                return Err(ConfigError::InvalidValue(format!(
                    "batch conversation #{index} must end with a user message"
                )));
            }
        }
        Ok(())
    }

    fn message_lines(&self) -> Result<Vec<String>, ConfigError> {
        let system = self.spec.system_prompt.as_ref().map(|prompt| LlmMessage::system(prompt));
        let mut lines = Vec::with_capacity(self.spec.conversations.len());
        for conversation in &self.spec.conversations {
            let mut messages: Vec<&LlmMessage> = Vec::new();
            if let Some(system) = &system {
                messages.push(system);
            }
            messages.extend(conversation.messages.iter());
            lines.push(serde_json::to_string(&FinetuneLine { messages })?);
        }
        Ok(lines)
    }

    /// Export the dataset as fine-tuning JSONL lines.
    pub fn to_finetune_lines(&self) -> Result<Vec<String>, ConfigError> {
        self.validate_finetune()?;
        self.message_lines()
    }

    /// Export the dataset as fine-tuning JSONL, deterministically shuffled
    /// and split into train and validation sets.
    pub fn to_finetune_split(
        &self,
        seed: u64,
        val_split: f64,
    ) -> Result<(Vec<String>, Vec<String>), ConfigError> {
        if !(0.0..=1.0).contains(&val_split) {
            return Err(ConfigError::InvalidValue(
                "val_split must be in [0, 1]".to_string(),
            ));
        }
        let mut lines = self.to_finetune_lines()?;
        let mut rng = fastrand::Rng::with_seed(seed);
        rng.shuffle(&mut lines);

        let split_index = (lines.len() as f64 * (1.0 - val_split)) as usize;
        let val = lines.split_off(split_index);
        Ok((lines, val))
    }

    /// Write the fine-tuning JSONL export to a file.
    pub async fn save_finetune(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let lines = self.to_finetune_lines()?;
        tokio::fs::write(path, lines.join("\n") + "\n").await?;
        Ok(())
    }

    /// Export the dataset as batch-API JSONL lines.
    pub fn to_batch_lines(&self, model: &str, url: &str) -> Result<Vec<String>, ConfigError> {
        self.validate_batch()?;
        let system = self.spec.system_prompt.as_ref().map(|prompt| LlmMessage::system(prompt));
        let mut lines = Vec::with_capacity(self.spec.conversations.len());
        for (index, conversation) in self.spec.conversations.iter().enumerate() {
            let mut messages: Vec<&LlmMessage> = Vec::new();
            if let Some(system) = &system {
                messages.push(system);
            }
            messages.extend(conversation.messages.iter());
            let line = BatchLine {
                custom_id: format!("request-{index}"),
                method: "POST",
                url,
                body: BatchBody { model, messages },
            };
            lines.push(serde_json::to_string(&line)?);
        }
        Ok(lines)
    }

    /// Write the batch-API JSONL export to a file.
    pub async fn save_batch(
        &self,
        path: impl AsRef<Path>,
        model: &str,
        url: &str,
    ) -> Result<(), ConfigError> {
        let lines = self.to_batch_lines(model, url)?;
        tokio::fs::write(path, lines.join("\n") + "\n").await?;
        Ok(())
    }
}
