//! Conversation message types.
//!
//! A [`ChatMessage`] is an immutable record of one turn in a conversation.
//! Messages are partitioned into three kinds: user input, agent answers and
//! skill output produced while a chain executes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMessageKind {
    /// A message written by the user.
    User,
    /// A message produced by the agent as an answer.
    Agent,
    /// A message produced by a skill during chain execution.
    Skill,
}

impl ChatMessageKind {
    /// Get the string representation of the kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
            Self::Skill => "skill",
        }
    }
}

impl std::fmt::Display for ChatMessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One turn in a conversation.
///
/// Messages compare structurally; two messages are equal when all their
/// fields are equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The kind of the message.
    pub kind: ChatMessageKind,
    /// The text content.
    pub content: String,
    /// Optional opaque payload attached by the producer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Name of the skill that produced the message, for skill messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Whether the message reports a failure.
    #[serde(default)]
    pub is_error: bool,
}

impl ChatMessage {
    /// Create a new user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            kind: ChatMessageKind::User,
            content: content.into(),
            data: None,
            source: None,
            is_error: false,
        }
    }

    /// Create a new agent message.
    #[must_use]
    pub fn agent(content: impl Into<String>) -> Self {
        Self {
            kind: ChatMessageKind::Agent,
            content: content.into(),
            data: None,
            source: None,
            is_error: false,
        }
    }

    /// Create a new agent message carrying a data payload.
    #[must_use]
    pub fn agent_with_data(content: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            kind: ChatMessageKind::Agent,
            content: content.into(),
            data,
            source: None,
            is_error: false,
        }
    }

    /// Create a new skill message.
    #[must_use]
    pub fn skill(
        content: impl Into<String>,
        data: Option<Value>,
        source: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            kind: ChatMessageKind::Skill,
            content: content.into(),
            data,
            source: Some(source.into()),
            is_error,
        }
    }

    /// Create a successful skill message.
    #[must_use]
    pub fn skill_success(
        content: impl Into<String>,
        data: Option<Value>,
        source: impl Into<String>,
    ) -> Self {
        Self::skill(content, data, source, false)
    }

    /// Create a failed skill message.
    #[must_use]
    pub fn skill_error(content: impl Into<String>, source: impl Into<String>) -> Self {
        Self::skill(content, None, source, true)
    }

    /// Whether the message is of the given kind.
    #[must_use]
    pub fn is_of_kind(&self, kind: ChatMessageKind) -> bool {
        self.kind == kind
    }

    /// Whether this is a skill message produced by the given skill.
    #[must_use]
    pub fn is_from_source(&self, source: &str) -> bool {
        self.kind == ChatMessageKind::Skill && self.source.as_deref() == Some(source)
    }

    /// Whether the message reports success.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        !self.is_error
    }
}

impl std::fmt::Display for ChatMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.content)
    }
}

/// A chat message together with the score assigned by an evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChatMessage {
    /// The scored message.
    pub message: ChatMessage,
    /// The score, higher is better.
    pub score: f64,
}

impl ScoredChatMessage {
    /// Create a new scored message.
    #[must_use]
    pub const fn new(message: ChatMessage, score: f64) -> Self {
        Self { message, score }
    }
}

impl std::fmt::Display for ScoredChatMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (score: {})", self.message, self.score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factories_set_kind_and_source() {
        let user = ChatMessage::user("hello");
        assert_eq!(user.kind, ChatMessageKind::User);
        assert!(user.source.is_none());

        let skill = ChatMessage::skill_success("done", None, "search");
        assert_eq!(skill.kind, ChatMessageKind::Skill);
        assert!(skill.is_from_source("search"));
        assert!(!skill.is_from_source("other"));
        assert!(skill.is_ok());

        let error = ChatMessage::skill_error("failed", "search");
        assert!(error.is_error);
    }

    #[test]
    fn test_structural_equality() {
        let a = ChatMessage::skill_success("x", Some(serde_json::json!({"k": 1})), "s");
        let b = ChatMessage::skill_success("x", Some(serde_json::json!({"k": 1})), "s");
        let c = ChatMessage::skill_success("x", Some(serde_json::json!({"k": 2})), "s");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
