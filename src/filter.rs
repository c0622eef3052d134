//! Selection of the iteration's final responses.
//!
//! A [`Filter`] reads the evaluation recorded on the agent context and
//! returns the subset of scored messages the agent may answer with. An
//! empty selection makes the agent iterate again.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::context::{AgentContext, LlmContext};
use crate::error::AgentError;
use crate::llm::{Llm, LlmCallOptions, LlmMessage};
use crate::message::ScoredChatMessage;

/// Selects responses from the latest evaluation.
#[async_trait]
pub trait Filter: Send + Sync {
    /// Produce the selected subset of the evaluation.
    async fn execute(&self, context: &AgentContext) -> Result<Vec<ScoredChatMessage>, AgentError>;
}

/// Filter applying an optional score threshold and top-k cut.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicFilter {
    score_threshold: Option<f64>,
    top_k: Option<usize>,
}

impl BasicFilter {
    /// Create a filter keeping every evaluated message.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            score_threshold: None,
            top_k: None,
        }
    }

    /// Keep only messages scoring at least `threshold`.
    #[must_use]
    pub const fn with_score_threshold(mut self, threshold: f64) -> Self {
        self.score_threshold = Some(threshold);
        self
    }

    /// Keep at most `top_k` messages.
    #[must_use]
    pub const fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }
}

#[async_trait]
impl Filter for BasicFilter {
    async fn execute(&self, context: &AgentContext) -> Result<Vec<ScoredChatMessage>, AgentError> {
        let Some(evaluation) = context.evaluation() else {
            return Ok(Vec::new());
        };

        let mut selected: Vec<ScoredChatMessage> = evaluation
            .iter()
            .filter(|scored| {
                self.score_threshold
                    .is_none_or(|threshold| scored.score >= threshold)
            })
            .cloned()
            .collect();
        if let Some(top_k) = self.top_k {
            selected.truncate(top_k);
        }
        Ok(selected)
    }
}

/// Filter consulting a model against a list of criteria.
///
/// The model must return one verdict per candidate under a rigid format;
/// missing or malformed verdicts trigger a correction turn and a retry.
pub struct LlmFilter {
    llm: Arc<dyn Llm>,
    criteria: Vec<String>,
    retries: usize,
}

impl std::fmt::Debug for LlmFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmFilter")
            .field("llm", &self.llm.name())
            .field("criteria", &self.criteria.len())
            .field("retries", &self.retries)
            .finish()
    }
}

impl LlmFilter {
    /// Create a filter judging candidates against the given criteria.
    #[must_use]
    pub fn new(llm: Arc<dyn Llm>, criteria: Vec<String>) -> Self {
        Self {
            llm,
            criteria,
            retries: 3,
        }
    }

    /// Set the number of correction retries.
    #[must_use]
    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries.max(1);
        self
    }

    fn system_message(&self) -> LlmMessage {
        let criteria: Vec<String> = self
            .criteria
            .iter()
            .map(|criterion| format!("- {criterion}"))
            .collect();
        let criteria = criteria.join("\n");
        let task_description = [
            "# ROLE",
            "You are a judge, with a large breadth of knowledge.",
            "You are deciding with objectivity if some answers from different specialists need to be filtered out.",
            "# CRITERIA",
            "An answer must be filtered out when it violates any of:",
            criteria.as_str(),
            "# INSTRUCTIONS",
            "1. Evaluate carefully and fairly every proposed answer.",
            "2. Identical answers must have the same verdict.",
            "3. Consider only the answer's content, never its index.",
            "# FORMATTING",
            "1. The list of given answers is formatted precisely as:",
            "- answer #{index} is: {answer or EMPTY if no answer}",
            "2. For each given answer, format your response precisely as:",
            "filter #{index}: {true if the answer must be removed, else false} - {short justification}",
        ];
        LlmMessage::system(task_description.join("\n"))
    }

    fn user_message(candidates: &[ScoredChatMessage]) -> LlmMessage {
        let answers: Vec<String> = candidates
            .iter()
            .enumerate()
            .map(|(index, scored)| {
                let content = if scored.message.content.is_empty() {
                    "EMPTY"
                } else {
                    scored.message.content.as_str()
                };
                format!("- answer #{} is: {content}", index + 1)
            })
            .collect();
        LlmMessage::user(format!(
            "Please filter or not the following answers according to your instructions:\n{}",
            answers.join("\n")
        ))
    }

    /// Parse one verdict per candidate, keyed by its 1-based index.
    fn parse_verdicts(response: &str, expected: usize) -> Result<BTreeMap<usize, bool>, String> {
        let mut verdicts = BTreeMap::new();
        for line in response.lines() {
            let trimmed = line.trim();
            let Some(rest) = trimmed.strip_prefix("filter #") else {
                continue;
            };
            let Some((index_text, verdict_text)) = rest.split_once(':') else {
                return Err(format!("verdict line is missing a colon: `{trimmed}`"));
            };
            let index: usize = index_text
                .trim()
                .parse()
                .map_err(|_| format!("could not parse verdict index: `{trimmed}`"))?;
            let flag_text = verdict_text
                .split('-')
                .next()
                .unwrap_or_default()
                .trim()
                .to_lowercase();
            let flag = match flag_text.as_str() {
                "true" => true,
                "false" => false,
                _ => return Err(format!("verdict must be true or false: `{trimmed}`")),
            };
            verdicts.insert(index, flag);
        }

        if verdicts.is_empty() {
            return Err(
                "none of your answers could be parsed. Follow exactly the formatting instructions."
                    .to_string(),
            );
        }
        let missing: Vec<usize> = (1..=expected)
            .filter(|index| !verdicts.contains_key(index))
            .collect();
        if !missing.is_empty() {
            return Err(format!(
                "please evaluate ALL {expected} answers. Missing verdicts for answers {missing:?}."
            ));
        }
        Ok(verdicts)
    }
}

#[async_trait]
impl Filter for LlmFilter {
    async fn execute(&self, context: &AgentContext) -> Result<Vec<ScoredChatMessage>, AgentError> {
        let Some(evaluation) = context.evaluation() else {
            return Ok(Vec::new());
        };
        if self.criteria.is_empty() || evaluation.is_empty() {
            return Ok(evaluation.to_vec());
        }

        let mut messages = vec![self.system_message(), Self::user_message(evaluation)];
        let llm_context = LlmContext::empty();

        for attempt in 1..=self.retries {
            let result = self
                .llm
                .post_chat_request(&llm_context, &messages, &LlmCallOptions::new())
                .await?;
            let response = result.first_choice().to_string();
            debug!(attempt, response = %response, "filter llm response");

            match Self::parse_verdicts(&response, evaluation.len()) {
                Ok(verdicts) => {
                    return Ok(evaluation
                        .iter()
                        .enumerate()
                        .filter(|(index, _)| !verdicts.get(&(index + 1)).copied().unwrap_or(false))
                        .map(|(_, scored)| scored.clone())
                        .collect());
                }
                Err(problem) => {
                    warn!(attempt, problem = %problem, "filter response rejected");
                    messages.push(LlmMessage::assistant(response));
                    messages.push(LlmMessage::user(format!(
                        "Your response was malformed. Fix: {problem}"
                    )));
                }
            }
        }

        Err(AgentError::filter(format!(
            "failed to filter responses after {} attempts",
            self.retries
        )))
    }
}
