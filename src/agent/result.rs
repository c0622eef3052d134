//! The outcome of an agent execution.

use crate::message::{ChatMessage, ScoredChatMessage};

/// The scored messages an agent execution selected.
///
/// An empty result means the agent stopped without a satisfactory answer:
/// the budget expired, a controller produced an empty plan, or nothing
/// passed the filter.
#[derive(Debug, Clone, Default)]
pub struct AgentResult {
    messages: Vec<ScoredChatMessage>,
}

impl AgentResult {
    /// Create a result from selected messages.
    #[must_use]
    pub fn new(messages: Vec<ScoredChatMessage>) -> Self {
        Self { messages }
    }

    /// Create an empty result.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// The selected messages with their scores.
    #[must_use]
    pub fn messages(&self) -> &[ScoredChatMessage] {
        &self.messages
    }

    /// Whether the execution produced no answer.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The message with the highest score; ties go to the earliest one.
    #[must_use]
    pub fn best_message(&self) -> Option<&ChatMessage> {
        let mut best: Option<&ScoredChatMessage> = None;
        for scored in &self.messages {
            if best.is_none_or(|current| scored.score > current.score) {
                best = Some(scored);
            }
        }
        best.map(|scored| &scored.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_message_prefers_highest_score_first_on_tie() {
        let result = AgentResult::new(vec![
            ScoredChatMessage::new(ChatMessage::agent("first"), 0.8),
            ScoredChatMessage::new(ChatMessage::agent("second"), 0.9),
            ScoredChatMessage::new(ChatMessage::agent("third"), 0.9),
        ]);
        assert_eq!(result.best_message().map(|m| m.content.as_str()), Some("second"));
    }

    #[test]
    fn test_empty_result() {
        let result = AgentResult::empty();
        assert!(result.is_empty());
        assert!(result.best_message().is_none());
    }
}
