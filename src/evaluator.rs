//! Scoring of candidate chain responses.
//!
//! After the iteration's chains ran, an [`Evaluator`] turns each chain's
//! final message into a scored agent message for the filter to select
//! from.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::budget::Budget;
use crate::context::{AgentStageContext, LlmContext};
use crate::error::AgentError;
use crate::llm::{Llm, LlmCallOptions, LlmMessage};
use crate::message::{ChatMessage, ScoredChatMessage};

/// Scores the candidate responses of one iteration.
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Produce one scored message per candidate, charging `budget` for any
    /// model calls.
    async fn execute(
        &self,
        context: &AgentStageContext<'_>,
        budget: &Budget,
    ) -> Result<Vec<ScoredChatMessage>, AgentError>;
}

/// Evaluator scoring candidates by success or failure.
///
/// The last message of each chain's latest history becomes an agent
/// message scored 1 when it reports success and 0 when it reports an
/// error.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicEvaluator;

#[async_trait]
impl Evaluator for BasicEvaluator {
    async fn execute(
        &self,
        context: &AgentStageContext<'_>,
        _budget: &Budget,
    ) -> Result<Vec<ScoredChatMessage>, AgentError> {
        let mut result = Vec::new();
        for chain_name in context.chain_names() {
            let Some(message) = context
                .last_chain_history(chain_name)
                .and_then(|history| history.last_message())
            else {
                continue;
            };
            let score = if message.is_ok() { 1.0 } else { 0.0 };
            result.push(ScoredChatMessage::new(
                ChatMessage::agent_with_data(message.content.clone(), message.data.clone()),
                score,
            ));
        }
        Ok(result)
    }
}

/// Evaluator grading candidates with a model.
///
/// Candidates are submitted together with the user query under a strict
/// output grammar. Malformed responses are corrected by appending the
/// model's answer and a fix request, up to a bounded number of retries.
pub struct LlmEvaluator {
    llm: Arc<dyn Llm>,
    retries: usize,
}

impl std::fmt::Debug for LlmEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmEvaluator")
            .field("llm", &self.llm.name())
            .field("retries", &self.retries)
            .finish()
    }
}

impl LlmEvaluator {
    /// Create an evaluator grading with the given model.
    #[must_use]
    pub fn new(llm: Arc<dyn Llm>) -> Self {
        Self { llm, retries: 3 }
    }

    /// Set the number of correction retries.
    #[must_use]
    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries.max(1);
        self
    }

    fn system_prompt(multiple: bool) -> String {
        if multiple {
            [
                "# You are a grading expert, grading how accurate and relevant multiple answers are to a given question.",
                "# Your grade will only be based on the given answer.",
                "# The list of given answers is formatted precisely as:",
                "Answer #{index} is:",
                "{answer}",
                "# INSTRUCTIONS:",
                "# Give a grade from 0.0 to 10.0",
                "# Same answers must have the same grade.",
                "# Irrelevant or empty answer must be graded 0.0",
                "# For each given answer, your grade will be formatted precisely as:",
                "grade #{index}: {grade as float} - short justification",
            ]
            .join("\n")
        } else {
            [
                "# You are a grading expert, grading how accurate and relevant an answer is to a given question.",
                "# INSTRUCTIONS:",
                "# Give a grade from 0.0 to 10.0",
                "# Irrelevant or empty answer must be graded 0.0",
                "# Your grade will be formatted precisely as:",
                "grade: {grade as float} - short justification",
            ]
            .join("\n")
        }
    }

    fn user_prompt(query: &str, answers: &[&ChatMessage]) -> String {
        if answers.len() == 1 {
            [
                "# The question to grade is:",
                query,
                "# The given answer is:",
                answers[0].content.as_str(),
                "# Please grade.",
            ]
            .join("\n")
        } else {
            let listed: Vec<String> = answers
                .iter()
                .enumerate()
                .map(|(index, answer)| format!("Answer #{} is:\n{}", index + 1, answer.content))
                .collect();
            let listed = listed.join("\n");
            [
                "# The question to grade is:",
                query,
                "# The given answers are:",
                listed.as_str(),
                "# Please grade.",
            ]
            .join("\n")
        }
    }

    fn parse_scores(response: &str, expected: usize) -> Result<Vec<f64>, String> {
        let mut scores = Vec::new();
        for line in response.lines() {
            let trimmed = line.trim();
            if !trimmed.to_lowercase().starts_with("grade") {
                continue;
            }
            let Some((_, value)) = trimmed.split_once(':') else {
                return Err(format!("grade line is missing a colon: `{trimmed}`"));
            };
            let value = value.split('-').next().unwrap_or_default().trim();
            let score: f64 = value
                .parse()
                .map_err(|_| format!("could not parse grade as float: `{trimmed}`"))?;
            scores.push(score);
        }

        if scores.len() != expected {
            return Err(format!(
                "expected {expected} grade(s), found {}. Grade every answer exactly once.",
                scores.len()
            ));
        }
        Ok(scores)
    }
}

#[async_trait]
impl Evaluator for LlmEvaluator {
    async fn execute(
        &self,
        context: &AgentStageContext<'_>,
        budget: &Budget,
    ) -> Result<Vec<ScoredChatMessage>, AgentError> {
        let query = context
            .chat_history()
            .last_user_message()
            .map(|message| message.content.clone())
            .unwrap_or_default();

        let candidates: Vec<&ChatMessage> = context
            .chain_names()
            .collect::<Vec<_>>()
            .into_iter()
            .filter_map(|name| {
                context
                    .last_chain_history(name)
                    .and_then(|history| history.last_message())
            })
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let mut messages = vec![
            LlmMessage::system(Self::system_prompt(candidates.len() > 1)),
            LlmMessage::user(Self::user_prompt(&query, &candidates)),
        ];

        let llm_context = LlmContext::new(budget.remaining());
        for attempt in 1..=self.retries {
            let result = self
                .llm
                .post_chat_request(&llm_context, &messages, &LlmCallOptions::new())
                .await?;
            let response = result.first_choice().to_string();
            debug!(attempt, response = %response, "evaluator llm response");

            match Self::parse_scores(&response, candidates.len()) {
                Ok(scores) => {
                    return Ok(candidates
                        .iter()
                        .zip(scores)
                        .map(|(message, score)| {
                            ScoredChatMessage::new(
                                ChatMessage::agent_with_data(
                                    message.content.clone(),
                                    message.data.clone(),
                                ),
                                score,
                            )
                        })
                        .collect());
                }
                Err(problem) => {
                    warn!(attempt, problem = %problem, "evaluator response rejected");
                    messages.push(LlmMessage::assistant(response));
                    messages.push(LlmMessage::user(format!(
                        "Your response was malformed. Fix: {problem}"
                    )));
                }
            }
        }

        Err(AgentError::evaluator(format!(
            "failed to grade responses after {} attempts",
            self.retries
        )))
    }
}
