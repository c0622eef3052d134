//! Provider-agnostic chat LLM abstraction.
//!
//! An [`Llm`] exposes a single chat operation. Concrete transports live
//! outside the engine; the engine provides the middleware chain wrapping
//! calls ([`middleware`]), a fallback combinator ([`fallback`]), typed
//! functions with self-correction ([`function`]), response parsers
//! ([`parser`]), the YAML configuration object ([`config`]) and a scripted
//! mock ([`mock`]).

pub mod config;
pub mod fallback;
pub mod function;
pub mod middleware;
pub mod mock;
pub mod parser;

pub use config::{LlmConfigObject, LlmConfiguration, LlmParameters};
pub use fallback::LlmFallback;
pub use function::{LlmFunction, ParallelExecutor};
pub use middleware::{
    LlmCachingMiddleware, LlmConfigurationModifierMiddleware, LlmFileLoggingMiddleware,
    LlmLoggingMiddleware, LlmLoggingStrategy, LlmMiddleware, LlmMiddlewareChain, LlmRequest,
    LlmResponse, LlmRetryMiddleware, Next,
};
pub use mock::MockLlm;
pub use parser::{
    CodeBlocksResponseParser, FieldDescriptor, FieldKind, JsonResponseParser, ResponseParser,
    StringResponseParser, YamlResponseParser,
};

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::budget::Consumption;
use crate::context::LlmContext;
use crate::error::LlmError;
use crate::message::{ChatMessage, ChatMessageKind};

/// Extra provider options attached to one chat request.
pub type LlmCallOptions = BTreeMap<String, serde_json::Value>;

/// Role of a message in an LLM chat payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmMessageRole {
    /// A system instruction.
    System,
    /// A message from the user.
    User,
    /// A message from the model.
    Assistant,
}

impl LlmMessageRole {
    /// Get the string representation of the role.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// An attachment carried by an LLM message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmMessageAttachment {
    /// Media type of the attachment.
    pub mime: String,
    /// Attachment payload, encoded as the provider expects it.
    pub data: String,
}

/// A message in an LLM chat payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmMessage {
    /// The role the message is attributed to.
    pub role: LlmMessageRole,
    /// The message content.
    pub content: String,
    /// Optional participant name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Attachments, if any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<LlmMessageAttachment>,
}

impl LlmMessage {
    /// Create a message with the given role.
    #[must_use]
    pub fn new(role: LlmMessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            data: Vec::new(),
        }
    }

    /// Create a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(LlmMessageRole::System, content)
    }

    /// Create a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(LlmMessageRole::User, content)
    }

    /// Create an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(LlmMessageRole::Assistant, content)
    }

    /// Whether the message has the given role.
    #[must_use]
    pub fn is_of_role(&self, role: LlmMessageRole) -> bool {
        self.role == role
    }

    /// Stable representation used for cache keys.
    #[must_use]
    pub fn normalized(&self) -> String {
        format!(
            "{}|{}|{}",
            self.role.as_str(),
            self.name.as_deref().unwrap_or_default(),
            self.content
        )
    }

    /// Convert a conversation message, when it maps onto a chat role.
    ///
    /// User messages become user turns, agent messages assistant turns;
    /// skill messages carry no chat role and yield nothing.
    #[must_use]
    pub fn from_chat_message(message: &ChatMessage) -> Option<Self> {
        match message.kind {
            ChatMessageKind::User => Some(Self::user(message.content.clone())),
            ChatMessageKind::Agent => Some(Self::assistant(message.content.clone())),
            ChatMessageKind::Skill => None,
        }
    }

    /// Convert every mappable conversation message, preserving order.
    #[must_use]
    pub fn from_chat_messages<'a>(
        messages: impl IntoIterator<Item = &'a ChatMessage>,
    ) -> Vec<Self> {
        messages
            .into_iter()
            .filter_map(Self::from_chat_message)
            .collect()
    }

    /// Render the message for verbose logging.
    #[must_use]
    pub fn format(&self) -> String {
        format!("[{}] {}", self.role.as_str(), self.content)
    }
}

/// The result of one chat call.
#[derive(Debug, Clone)]
pub struct LlmResult {
    choices: Vec<String>,
    consumptions: Vec<Consumption>,
    raw_response: serde_json::Value,
}

impl LlmResult {
    /// Create a result from the model's choices.
    #[must_use]
    pub fn new(choices: Vec<String>) -> Self {
        Self {
            choices,
            consumptions: Vec::new(),
            raw_response: serde_json::Value::Null,
        }
    }

    /// Attach consumption records.
    #[must_use]
    pub fn with_consumptions(mut self, consumptions: Vec<Consumption>) -> Self {
        self.consumptions = consumptions;
        self
    }

    /// Attach the provider's raw response.
    #[must_use]
    pub fn with_raw_response(mut self, raw_response: serde_json::Value) -> Self {
        self.raw_response = raw_response;
        self
    }

    /// The first choice, or an empty string when the model returned none.
    #[must_use]
    pub fn first_choice(&self) -> &str {
        self.choices.first().map_or("", String::as_str)
    }

    /// All choices returned by the model.
    #[must_use]
    pub fn choices(&self) -> &[String] {
        &self.choices
    }

    /// The consumptions associated with the call.
    #[must_use]
    pub fn consumptions(&self) -> &[Consumption] {
        &self.consumptions
    }

    /// The provider's raw response.
    #[must_use]
    pub const fn raw_response(&self) -> &serde_json::Value {
        &self.raw_response
    }

    /// Rebuild this result with every consumption in `cached_` units.
    #[must_use]
    pub fn to_cached(&self) -> Self {
        Self {
            choices: self.choices.clone(),
            consumptions: self.consumptions.iter().map(Consumption::to_cached).collect(),
            raw_response: self.raw_response.clone(),
        }
    }
}

/// Build the standard consumption set of one chat call.
///
/// Every provider reports at least one call, the wall duration and the
/// prompt/completion/total token counts; token kinds are reported without
/// double counting.
#[must_use]
pub fn standard_consumptions(
    name: &str,
    duration_secs: f64,
    prompt_tokens: f64,
    completion_tokens: f64,
) -> Vec<Consumption> {
    vec![
        Consumption::call(1.0, name),
        Consumption::duration(duration_secs, name),
        Consumption::token(prompt_tokens, format!("{name}:prompt_tokens")),
        Consumption::token(completion_tokens, format!("{name}:completion_tokens")),
        Consumption::token(
            prompt_tokens + completion_tokens,
            format!("{name}:total_tokens"),
        ),
    ]
}

/// A chat language model.
#[async_trait]
pub trait Llm: Send + Sync {
    /// The model wrapper's stable name.
    fn name(&self) -> &str;

    /// Snapshot of the wrapper's configuration.
    fn configuration(&self) -> LlmConfiguration;

    /// The configured model identifier.
    fn model_name(&self) -> String {
        self.configuration().model
    }

    /// Apply a persistent mutation to the wrapper's configuration.
    ///
    /// Wrappers without mutable configuration ignore the call.
    fn update_configuration(&self, _mutator: &(dyn Fn(&mut LlmConfiguration) + Send + Sync)) {}

    /// Perform the raw chat call.
    async fn chat(
        &self,
        context: &LlmContext,
        messages: &[LlmMessage],
        options: &LlmCallOptions,
    ) -> Result<LlmResult, LlmError>;

    /// Send a chat request, charging its consumptions to the context budget.
    async fn post_chat_request(
        &self,
        context: &LlmContext,
        messages: &[LlmMessage],
        options: &LlmCallOptions,
    ) -> Result<LlmResult, LlmError> {
        debug!(llm = self.name(), "starting execution of llm request");
        let result = self.chat(context, messages, options).await;
        match &result {
            Ok(result) => {
                context
                    .budget()
                    .add_consumptions(result.consumptions().to_vec(), self.name());
                debug!(llm = self.name(), "done execution of llm request");
            }
            Err(error) => {
                debug!(llm = self.name(), error = %error, "failed execution of llm request");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_message_conversion_skips_skill_messages() {
        let messages = vec![
            ChatMessage::user("question"),
            ChatMessage::skill_success("intermediate", None, "search"),
            ChatMessage::agent("answer"),
        ];
        let converted = LlmMessage::from_chat_messages(&messages);
        assert_eq!(converted.len(), 2);
        assert!(converted[0].is_of_role(LlmMessageRole::User));
        assert!(converted[1].is_of_role(LlmMessageRole::Assistant));
    }

    #[test]
    fn test_standard_consumptions_avoid_double_counting() {
        let consumptions = standard_consumptions("llm", 0.5, 100.0, 40.0);
        assert_eq!(consumptions.len(), 5);
        let total = consumptions
            .iter()
            .find(|c| c.kind.ends_with("total_tokens"))
            .expect("total present");
        assert_eq!(total.value, 140.0);
    }

    #[test]
    fn test_first_choice_of_empty_result() {
        let result = LlmResult::new(Vec::new());
        assert_eq!(result.first_choice(), "");
    }

    #[test]
    fn test_cached_result_rewrites_units() {
        let result = LlmResult::new(vec!["answer".to_string()])
            .with_consumptions(standard_consumptions("llm", 0.1, 10.0, 5.0));
        let cached = result.to_cached();
        assert!(cached.consumptions().iter().all(|c| c.unit.starts_with("cached_")));
        assert_eq!(cached.first_choice(), "answer");
    }
}
