//! Per-iteration planning of chain executions.
//!
//! A [`Controller`] turns the current agent context into a ranked list of
//! [`ExecutionUnit`]s. Units of the same rank run concurrently; ranks run
//! in ascending order, and negative ranks run sequentially in plan order.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::budget::Budget;
use crate::chain::Chain;
use crate::context::AgentStageContext;
use crate::error::AgentError;
use crate::llm::{Llm, LlmCallOptions, LlmMessage};
use crate::message::ChatMessage;

/// Rank marking a unit as sequential, executed in plan order.
pub const SEQUENTIAL_RANK: i64 = -1;

/// One chain execution planned by a controller.
#[derive(Debug, Clone)]
pub struct ExecutionUnit {
    chain: Arc<Chain>,
    budget: Budget,
    initial_state: Option<ChatMessage>,
    name: String,
    rank: i64,
}

impl ExecutionUnit {
    /// Create a unit executing `chain` under `budget`.
    #[must_use]
    pub fn new(chain: Arc<Chain>, budget: Budget) -> Self {
        let name = chain.name().to_string();
        Self {
            chain,
            budget,
            initial_state: None,
            name,
            rank: SEQUENTIAL_RANK,
        }
    }

    /// Seed the chain context with a message before execution.
    #[must_use]
    pub fn with_initial_state(mut self, message: ChatMessage) -> Self {
        self.initial_state = Some(message);
        self
    }

    /// Override the unit's display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the unit's rank.
    #[must_use]
    pub const fn with_rank(mut self, rank: i64) -> Self {
        self.rank = rank;
        self
    }

    /// The chain to execute.
    #[must_use]
    pub fn chain(&self) -> &Arc<Chain> {
        &self.chain
    }

    /// The budget granted to this execution.
    #[must_use]
    pub fn budget(&self) -> &Budget {
        &self.budget
    }

    /// The optional seed message.
    #[must_use]
    pub const fn initial_state(&self) -> Option<&ChatMessage> {
        self.initial_state.as_ref()
    }

    /// The unit's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The unit's rank.
    #[must_use]
    pub const fn rank(&self) -> i64 {
        self.rank
    }
}

/// Plans which chains run in one agent iteration.
#[async_trait]
pub trait Controller: Send + Sync {
    /// The chains this controller may dispatch.
    fn chains(&self) -> &[Arc<Chain>];

    /// Produce the iteration's execution plan.
    ///
    /// The stage view carries the budget granted to the planned units.
    async fn execute(
        &self,
        context: &AgentStageContext<'_>,
    ) -> Result<Vec<ExecutionUnit>, AgentError>;
}

/// Controller dispatching every registered chain.
#[derive(Debug)]
pub struct BasicController {
    chains: Vec<Arc<Chain>>,
    parallelism: bool,
}

impl BasicController {
    /// Create a controller running its chains sequentially.
    #[must_use]
    pub fn new(chains: Vec<Arc<Chain>>) -> Self {
        Self {
            chains,
            parallelism: false,
        }
    }

    /// Run every chain concurrently within an iteration.
    #[must_use]
    pub const fn with_parallelism(mut self, parallelism: bool) -> Self {
        self.parallelism = parallelism;
        self
    }
}

#[async_trait]
impl Controller for BasicController {
    fn chains(&self) -> &[Arc<Chain>] {
        &self.chains
    }

    async fn execute(
        &self,
        context: &AgentStageContext<'_>,
    ) -> Result<Vec<ExecutionUnit>, AgentError> {
        let rank = if self.parallelism { 1 } else { SEQUENTIAL_RANK };
        Ok(self
            .chains
            .iter()
            .map(|chain| {
                ExecutionUnit::new(Arc::clone(chain), context.budget().remaining()).with_rank(rank)
            })
            .collect())
    }
}

/// A chain scored by the planning model.
#[derive(Debug)]
struct ScoredChain {
    chain: Arc<Chain>,
    score: i64,
    instructions: Option<String>,
}

/// Controller asking a model to score each chain against the query.
///
/// Chains scored at or below the threshold are discarded; the rest are
/// sorted by descending score and truncated to the top-k. When a chain
/// supports instructions, the model's instructions seed the unit's initial
/// state.
pub struct LlmController {
    chains: Vec<Arc<Chain>>,
    llm: Arc<dyn Llm>,
    response_threshold: i64,
    top_k: Option<usize>,
    system_message: LlmMessage,
}

impl std::fmt::Debug for LlmController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmController")
            .field("chains", &self.chains.len())
            .field("response_threshold", &self.response_threshold)
            .field("top_k", &self.top_k)
            .finish_non_exhaustive()
    }
}

impl LlmController {
    /// Create a controller scoring chains with the given model.
    #[must_use]
    pub fn new(chains: Vec<Arc<Chain>>, llm: Arc<dyn Llm>) -> Self {
        let system_message = Self::build_system_message(&chains);
        Self {
            chains,
            llm,
            response_threshold: 0,
            top_k: None,
            system_message,
        }
    }

    /// Discard chains scored at or below the threshold.
    #[must_use]
    pub const fn with_response_threshold(mut self, threshold: i64) -> Self {
        self.response_threshold = threshold;
        self
    }

    /// Keep at most `top_k` units.
    #[must_use]
    pub const fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    fn build_system_message(chains: &[Arc<Chain>]) -> LlmMessage {
        let answer_choices: Vec<String> = chains
            .iter()
            .map(|chain| format!("name: {}, description: {}", chain.name(), chain.description()))
            .collect();
        let answer_choices = answer_choices.join("\n");
        let task_description = [
            "# Role:",
            "You are an assistant responsible to identify the intent of the user against a list of categories.",
            "Categories are given as a name and a description formatted precisely as:",
            "name: {name}, description: {description}",
            answer_choices.as_str(),
            "# INSTRUCTIONS:",
            "# Score how relevant a category is from 0 to 10 using their description",
            "# For each category, your scores will be formatted precisely as:",
            "Name: {name};Score: {score as int};Instructions: {instructions for the category};Justification: {short justification}",
            "# When no category is relevant, you will answer exactly with 'unknown'",
        ];
        LlmMessage::system(task_description.join("\n"))
    }

    fn parse_line(&self, line: &str) -> Option<ScoredChain> {
        let rest = strip_prefix_ignore_case(line.trim(), "name:")?;
        let mut parts = rest.split(';');

        let name = parts.next()?.trim().to_lowercase();
        let chain = self
            .chains
            .iter()
            .find(|chain| chain.name().to_lowercase() == name)?;

        let score_part = parts.next()?.trim();
        let score: i64 = strip_prefix_ignore_case(score_part, "score:")?
            .trim()
            .parse()
            .ok()?;

        let instructions = parts
            .next()
            .and_then(|part| strip_prefix_ignore_case(part.trim(), "instructions:"))
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty());

        Some(ScoredChain {
            chain: Arc::clone(chain),
            score,
            instructions,
        })
    }
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&text[prefix.len()..])
    } else {
        None
    }
}

#[async_trait]
impl Controller for LlmController {
    fn chains(&self) -> &[Arc<Chain>] {
        &self.chains
    }

    async fn execute(
        &self,
        context: &AgentStageContext<'_>,
    ) -> Result<Vec<ExecutionUnit>, AgentError> {
        let query = context
            .chat_history()
            .last_user_message()
            .map(|message| message.content.clone())
            .unwrap_or_default();
        let messages = vec![
            self.system_message.clone(),
            LlmMessage::user(format!("What are most relevant categories for:\n{query}")),
        ];

        let llm_context = context.llm_context();
        let result = self
            .llm
            .post_chat_request(&llm_context, &messages, &LlmCallOptions::new())
            .await?;
        let response = result.first_choice();
        debug!(response, "controller llm response");

        let mut scored: Vec<ScoredChain> = response
            .lines()
            .filter_map(|line| self.parse_line(line))
            .filter(|entry| entry.score > self.response_threshold)
            .collect();
        if scored.is_empty() {
            warn!("controller selected no chain");
            return Ok(Vec::new());
        }

        scored.sort_by_key(|entry| std::cmp::Reverse(entry.score));
        if let Some(top_k) = self.top_k {
            scored.truncate(top_k);
        }

        Ok(scored
            .into_iter()
            .map(|entry| {
                let mut unit =
                    ExecutionUnit::new(Arc::clone(&entry.chain), context.budget().remaining())
                        .with_name(format!("{};{}", entry.chain.name(), entry.score));
                if entry.chain.is_supporting_instructions() {
                    if let Some(instructions) = entry.instructions {
                        unit = unit.with_initial_state(ChatMessage::skill_success(
                            instructions,
                            None,
                            "controller",
                        ));
                    }
                }
                unit
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AgentContext;
    use crate::llm::MockLlm;
    use crate::runner::skill::{FnSkill, SkillRunner};
    use std::time::Duration;

    fn chain(name: &str, description: &str) -> Arc<Chain> {
        Arc::new(Chain::new(
            name,
            description,
            vec![SkillRunner::wrap(FnSkill::from_content(name, "done"))],
        ))
    }

    fn budget() -> Budget {
        Budget::new(Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_basic_controller_plans_every_chain() {
        let controller = BasicController::new(vec![chain("a", "first"), chain("b", "second")]);
        let context = AgentContext::from_user_message("question");

        let plan = controller
            .execute(&context.fork_for("controller", budget()))
            .await
            .expect("plans");
        assert_eq!(plan.len(), 2);
        assert!(plan.iter().all(|unit| unit.rank() == SEQUENTIAL_RANK));
    }

    #[tokio::test]
    async fn test_basic_controller_parallel_mode_shares_rank() {
        let controller = BasicController::new(vec![chain("a", "first"), chain("b", "second")])
            .with_parallelism(true);
        let context = AgentContext::from_user_message("question");

        let plan = controller
            .execute(&context.fork_for("controller", budget()))
            .await
            .expect("plans");
        assert!(plan.iter().all(|unit| unit.rank() == 1));
    }

    #[tokio::test]
    async fn test_llm_controller_scores_sorts_and_seeds() {
        let response = "\
Name: math;Score: 9;Instructions: compute the sum;Justification: arithmetic question
Name: search;Score: 4;Instructions: ;Justification: not needed
Name: poetry;Score: 0;Instructions: ;Justification: irrelevant";
        let math = Chain::new(
            "math",
            "arithmetic",
            vec![SkillRunner::wrap(FnSkill::from_content("math", "done"))],
        )
        .support_instructions(true);
        let chains = vec![
            chain("search", "web search"),
            Arc::new(math),
            chain("poetry", "verses"),
        ];
        let controller = LlmController::new(chains, Arc::new(MockLlm::from_response(response)))
            .with_response_threshold(0)
            .with_top_k(2);
        let context = AgentContext::from_user_message("what is 2 + 2?");

        let plan = controller
            .execute(&context.fork_for("controller", budget()))
            .await
            .expect("plans");
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].chain().name(), "math");
        assert_eq!(plan[0].name(), "math;9");
        let seed = plan[0].initial_state().expect("instructions seeded");
        assert_eq!(seed.content, "compute the sum");
        // `search` does not support instructions, so no seed even if scored.
        assert!(plan[1].initial_state().is_none());
    }

    #[tokio::test]
    async fn test_llm_controller_unknown_response_yields_empty_plan() {
        let controller = LlmController::new(
            vec![chain("search", "web search")],
            Arc::new(MockLlm::from_response("unknown")),
        );
        let context = AgentContext::from_user_message("question");

        let plan = controller
            .execute(&context.fork_for("controller", budget()))
            .await
            .expect("plans");
        assert!(plan.is_empty());
    }
}
