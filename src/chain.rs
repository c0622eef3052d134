//! Named compositions of skills.

use std::sync::Arc;

use tracing::debug;

use crate::context::ChainContext;
use crate::error::RunnerError;
use crate::monitor::Monitor;
use crate::runner::{Runner, RunnerExecutor, Sequential, fork_run_merge};

/// A named, described composition of skills executed by a runner tree.
pub struct Chain {
    name: String,
    description: String,
    instructions: bool,
    runner: Arc<dyn Runner>,
    monitor: Monitor,
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

impl Chain {
    /// Create a chain running the given runners in sequence.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        runners: Vec<Arc<dyn Runner>>,
    ) -> Self {
        Self::with_runner(name, description, Sequential::from_runners(runners))
    }

    /// Create a chain over an explicit runner tree.
    #[must_use]
    pub fn with_runner(
        name: impl Into<String>,
        description: impl Into<String>,
        runner: Arc<dyn Runner>,
    ) -> Self {
        let name = name.into();
        let mut monitor = Monitor::new(name.clone(), "chain");
        monitor.register_child("runner", Arc::new(runner.monitor().clone()));
        Self {
            name,
            description: description.into(),
            instructions: false,
            runner,
            monitor,
        }
    }

    /// Let controllers seed this chain with an instruction message.
    #[must_use]
    pub const fn support_instructions(mut self, support: bool) -> Self {
        self.instructions = support;
        self
    }

    /// The chain's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The chain's description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Whether controllers may seed this chain with instructions.
    #[must_use]
    pub const fn is_supporting_instructions(&self) -> bool {
        self.instructions
    }

    /// The chain's runner tree.
    #[must_use]
    pub fn runner(&self) -> &Arc<dyn Runner> {
        &self.runner
    }

    /// The chain's monitor node.
    #[must_use]
    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    /// Execute the chain's runner tree against the given context.
    pub async fn execute(
        &self,
        context: &mut ChainContext,
        executor: &RunnerExecutor,
    ) -> Result<(), RunnerError> {
        debug!(chain = %self.name, "chain execution started");
        let scope = context.scope(&self.name);
        let result = fork_run_merge(&self.runner, context, executor).await;
        drop(scope);
        debug!(chain = %self.name, "chain execution ended");
        result
    }
}

impl std::fmt::Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Chain {}, description: {}", self.name, self.description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::Budget;
    use crate::runner::skill::{FnSkill, SkillRunner};
    use std::time::Duration;

    #[tokio::test]
    async fn test_chain_runs_its_skills_in_order() {
        let chain = Chain::new(
            "greeter",
            "greets twice",
            vec![
                SkillRunner::wrap(FnSkill::from_content("hello", "hello")),
                SkillRunner::wrap(FnSkill::from_content("bye", "bye")),
            ],
        );
        let executor = RunnerExecutor::default();
        let mut ctx =
            ChainContext::from_user_message("question", Budget::new(Duration::from_secs(1)));

        chain.execute(&mut ctx, &executor).await.expect("chain succeeds");
        let contents: Vec<&str> = ctx
            .current_messages()
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(contents, ["hello", "bye"]);
    }

    #[test]
    fn test_chain_exposes_identity() {
        let chain = Chain::new(
            "search",
            "finds things",
            vec![SkillRunner::wrap(FnSkill::from_content("s", "x"))],
        )
        .support_instructions(true);
        assert_eq!(chain.name(), "search");
        assert_eq!(chain.description(), "finds things");
        assert!(chain.is_supporting_instructions());
        assert_eq!(chain.monitor().kind(), "chain");
    }
}
