//! The agent control loop.
//!
//! An [`Agent`] owns a controller, an evaluator and a filter. Each
//! iteration runs controller → chains → evaluator → filter: the
//! controller plans which chains execute, units of the same rank run
//! concurrently on independent forks, the evaluator scores the candidate
//! answers and the filter selects the final subset. The loop ends when a
//! selection is produced, the plan is empty or the budget expires.

mod result;

pub use result::AgentResult;

use std::sync::Arc;

use tracing::{debug, info};

use crate::budget::Budget;
use crate::chain::Chain;
use crate::context::AgentContext;
use crate::controller::{BasicController, Controller, ExecutionUnit};
use crate::error::{AgentError, RunnerError};
use crate::evaluator::{BasicEvaluator, Evaluator};
use crate::filter::{BasicFilter, Filter};
use crate::monitor::Monitor;
use crate::runner::RunnerExecutor;
use crate::runner::skill::{Skill, SkillRunner};

/// Orchestrates iterations of plan, execute, evaluate and select.
pub struct Agent {
    controller: Arc<dyn Controller>,
    evaluator: Arc<dyn Evaluator>,
    filter: Arc<dyn Filter>,
    monitor: Monitor,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("chains", &self.controller.chains().len())
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Create an agent from its three stages.
    #[must_use]
    pub fn new(
        controller: Arc<dyn Controller>,
        evaluator: Arc<dyn Evaluator>,
        filter: Arc<dyn Filter>,
    ) -> Self {
        let mut monitor = Monitor::new("agent", "agent");
        monitor.register_child("controller", Arc::new(Monitor::new("controller", "controller")));
        monitor.register_children(
            "chains",
            controller
                .chains()
                .iter()
                .map(|chain| Arc::new(chain.monitor().clone())),
        );
        monitor.register_child("evaluator", Arc::new(Monitor::new("evaluator", "evaluator")));
        monitor.register_child("filter", Arc::new(Monitor::new("filter", "filter")));
        Self {
            controller,
            evaluator,
            filter,
            monitor,
        }
    }

    /// Create an agent over a single chain with the basic stages.
    #[must_use]
    pub fn from_chain(chain: Chain) -> Self {
        Self::new(
            Arc::new(BasicController::new(vec![Arc::new(chain)])),
            Arc::new(BasicEvaluator),
            Arc::new(BasicFilter::new()),
        )
    }

    /// Create an agent over a single skill with the basic stages.
    #[must_use]
    pub fn from_skill(skill: impl Skill + 'static) -> Self {
        let chain = Chain::new("BasicChain", "basic chain", vec![SkillRunner::wrap(skill)]);
        Self::from_chain(chain)
    }

    /// The agent's monitor node.
    #[must_use]
    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    /// Run iterations until a selection is produced or the budget expires.
    pub async fn execute(
        &self,
        context: &mut AgentContext,
        budget: Budget,
    ) -> Result<AgentResult, AgentError> {
        let executor = RunnerExecutor::default();
        info!("agent execution started");
        let outcome = self.run_iterations(context, &budget, &executor).await;
        info!("agent execution ended");
        outcome
    }

    /// Helper executing the agent against a fresh single-message context.
    pub async fn execute_from_user_message(
        &self,
        message: impl Into<String>,
        budget: Budget,
    ) -> Result<AgentResult, AgentError> {
        let mut context = AgentContext::from_user_message(message);
        self.execute(&mut context, budget).await
    }

    async fn run_iterations(
        &self,
        context: &mut AgentContext,
        budget: &Budget,
        executor: &RunnerExecutor,
    ) -> Result<AgentResult, AgentError> {
        while !budget.is_expired() {
            context.new_iteration();
            let iteration = context.iteration_count();
            info!(iteration, "agent iteration started");
            let _scope = context
                .execution_log()
                .scope(format!("agent/iterations[{}]", iteration - 1));

            let plan = {
                let stage = context.fork_for("controller", budget.remaining());
                let _scope = stage.scope();
                self.controller.execute(&stage).await?
            };
            debug!(units = plan.len(), "controller returned execution plan");
            if plan.is_empty() {
                return Ok(AgentResult::empty());
            }

            for group in group_units(plan) {
                self.execute_group(context, group, executor).await?;
            }

            let scored = {
                let stage = context.fork_for("evaluator", budget.remaining());
                let _scope = stage.scope();
                self.evaluator.execute(&stage, stage.budget()).await?
            };
            context.set_evaluation(scored);

            let selected = self.filter.execute(context).await?;
            debug!(selected = selected.len(), "filter selected responses");
            if !selected.is_empty() {
                return Ok(AgentResult::new(selected));
            }
        }
        Ok(AgentResult::empty())
    }

    /// Run every unit of one rank group concurrently and commit their
    /// histories in plan order.
    async fn execute_group(
        &self,
        context: &mut AgentContext,
        group: Vec<ExecutionUnit>,
        executor: &RunnerExecutor,
    ) -> Result<(), AgentError> {
        let mut names = Vec::with_capacity(group.len());
        let mut handles = Vec::with_capacity(group.len());
        for unit in group {
            info!(chain = unit.chain().name(), unit = unit.name(), "chain execution started");
            let chain_context = context.begin_chain(
                unit.chain().name(),
                unit.budget().remaining(),
                unit.initial_state().cloned(),
            );
            let chain = Arc::clone(unit.chain());
            let task_executor = executor.clone();
            names.push(unit.chain().name().to_string());
            handles.push(tokio::spawn(async move {
                let mut chain_context = chain_context;
                let result = chain.execute(&mut chain_context, &task_executor).await;
                (result, chain_context)
            }));
        }

        let mut first_error: Option<AgentError> = None;
        for (name, handle) in names.into_iter().zip(handles) {
            match handle.await {
                Ok((result, chain_context)) => {
                    context.end_chain(&name, chain_context);
                    info!(chain = %name, "chain execution ended");
                    if let Err(error) = result {
                        if first_error.is_none() {
                            first_error = Some(error.into());
                        }
                    }
                }
                Err(join_error) => {
                    if first_error.is_none() {
                        first_error = Some(
                            RunnerError::Skill {
                                skill: name,
                                source: Box::new(join_error),
                            }
                            .into(),
                        );
                    }
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Split a plan into execution groups.
///
/// Units with a non-negative rank are grouped with their equals and groups
/// run in ascending rank order; units with a negative rank each form their
/// own group, keeping the plan's order.
fn group_units(mut plan: Vec<ExecutionUnit>) -> Vec<Vec<ExecutionUnit>> {
    plan.sort_by_key(ExecutionUnit::rank);
    let mut groups: Vec<Vec<ExecutionUnit>> = Vec::new();
    for unit in plan {
        match groups.last_mut() {
            Some(group) if unit.rank() >= 0 && group[0].rank() == unit.rank() => {
                group.push(unit);
            }
            _ => groups.push(vec![unit]),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::Consumption;
    use crate::controller::SEQUENTIAL_RANK;
    use crate::message::ChatMessage;
    use crate::runner::skill::FnSkill;
    use std::time::Duration;

    fn chain_of(name: &str, content: &str) -> Arc<Chain> {
        Arc::new(Chain::new(
            name,
            format!("chain {name}"),
            vec![SkillRunner::wrap(FnSkill::from_content(name, content))],
        ))
    }

    #[tokio::test]
    async fn test_single_skill_agent_returns_best_message() {
        let agent = Agent::from_skill(FnSkill::from_content("echo", "the answer"));
        let result = agent
            .execute_from_user_message("question", Budget::new(Duration::from_secs(5)))
            .await
            .expect("agent succeeds");

        assert!(!result.is_empty());
        assert_eq!(result.best_message().map(|m| m.content.as_str()), Some("the answer"));
    }

    #[tokio::test]
    async fn test_two_chains_produce_two_candidates() {
        let controller = BasicController::new(vec![chain_of("a", "alpha"), chain_of("b", "beta")]);
        let agent = Agent::new(
            Arc::new(controller),
            Arc::new(BasicEvaluator),
            Arc::new(BasicFilter::new()),
        );

        let result = agent
            .execute_from_user_message("question", Budget::new(Duration::from_secs(5)))
            .await
            .expect("agent succeeds");
        assert_eq!(result.messages().len(), 2);
    }

    #[tokio::test]
    async fn test_expired_budget_returns_empty_result() {
        let agent = Agent::from_skill(FnSkill::from_content("echo", "late"));
        let budget = Budget::new(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let result = agent
            .execute_from_user_message("question", budget)
            .await
            .expect("agent returns");
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_unselected_iterations_consume_budget_until_expiry() {
        // The filter's threshold rejects everything, so the agent iterates
        // until the iteration ledger is overdrawn.
        let skill = FnSkill::new("spender", |ctx| {
            ctx.budget()
                .add_consumption(Consumption::new(1.0, "unit", "iteration"), "spender");
            Ok(ChatMessage::skill_success("tick", None, "spender"))
        });
        let chain = Chain::new("spend", "spends budget", vec![SkillRunner::wrap(skill)]);
        let agent = Agent::new(
            Arc::new(BasicController::new(vec![Arc::new(chain)])),
            Arc::new(BasicEvaluator),
            Arc::new(BasicFilter::new().with_score_threshold(5.0)),
        );

        let budget = Budget::with_limits(
            Duration::from_secs(10),
            vec![Consumption::new(2.0, "unit", "iteration")],
        );
        let mut context = AgentContext::from_user_message("question");
        let result = agent.execute(&mut context, budget).await.expect("agent returns");

        assert!(result.is_empty());
        assert_eq!(context.iteration_count(), 3);
    }

    #[tokio::test]
    async fn test_group_units_ranks_and_sequential_mix() {
        let chain = chain_of("c", "x");
        let budget = Budget::new(Duration::from_secs(5));
        let plan = vec![
            ExecutionUnit::new(Arc::clone(&chain), budget.remaining()).with_rank(2),
            ExecutionUnit::new(Arc::clone(&chain), budget.remaining()).with_rank(1),
            ExecutionUnit::new(Arc::clone(&chain), budget.remaining()).with_rank(1),
            ExecutionUnit::new(Arc::clone(&chain), budget.remaining()).with_rank(SEQUENTIAL_RANK),
            ExecutionUnit::new(Arc::clone(&chain), budget.remaining()).with_rank(SEQUENTIAL_RANK),
        ];

        let groups = group_units(plan);
        let shapes: Vec<(i64, usize)> = groups
            .iter()
            .map(|group| (group[0].rank(), group.len()))
            .collect();
        assert_eq!(shapes, [(SEQUENTIAL_RANK, 1), (SEQUENTIAL_RANK, 1), (1, 2), (2, 1)]);
    }

    #[tokio::test]
    async fn test_failing_chain_propagates_to_caller() {
        let agent = Agent::from_skill(FnSkill::failing("broken", "boom"));
        let error = agent
            .execute_from_user_message("question", Budget::new(Duration::from_secs(5)))
            .await
            .expect_err("agent fails");
        assert!(matches!(error, AgentError::Runner(RunnerError::Skill { .. })));
    }
}
