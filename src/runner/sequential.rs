//! Runner executing its children one after another.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::ChainContext;
use crate::error::RunnerError;
use crate::monitor::Monitor;

use super::{Runner, RunnerExecutor, fork_run_merge};

/// Runs a list of runners in order.
///
/// Each child runs on a fork that is merged before the next child starts,
/// so later children observe the output of earlier ones. Execution stops
/// early once the context wants to stop.
pub struct Sequential {
    children: Vec<Arc<dyn Runner>>,
    monitor: Monitor,
}

impl std::fmt::Debug for Sequential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequential")
            .field("children", &self.children.len())
            .finish_non_exhaustive()
    }
}

impl Sequential {
    /// Create a sequential runner over the given children.
    #[must_use]
    pub fn new(children: Vec<Arc<dyn Runner>>) -> Self {
        let mut monitor = Monitor::new("sequenceRunner", "sequenceRunner");
        monitor.register_children(
            "sequence",
            children.iter().map(|child| Arc::new(child.monitor().clone())),
        );
        Self { children, monitor }
    }

    /// Build a runner from a list, avoiding a wrapper around a single child.
    #[must_use]
    pub fn from_runners(mut runners: Vec<Arc<dyn Runner>>) -> Arc<dyn Runner> {
        if runners.len() == 1 {
            return runners.remove(0);
        }
        Arc::new(Self::new(runners))
    }
}

#[async_trait]
impl Runner for Sequential {
    fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    async fn run_inner(
        &self,
        context: &mut ChainContext,
        executor: &RunnerExecutor,
    ) -> Result<(), RunnerError> {
        for child in &self.children {
            if context.should_stop() {
                return Ok(());
            }
            fork_run_merge(child, context, executor).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::Budget;
    use crate::runner::skill::{FnSkill, SkillRunner};
    use std::time::Duration;

    fn skill(name: &str, content: &str) -> Arc<dyn Runner> {
        SkillRunner::wrap(FnSkill::from_content(name, content))
    }

    #[tokio::test]
    async fn test_children_run_in_order() {
        let runner = Sequential::new(vec![skill("a", "first"), skill("b", "second")]);
        let executor = RunnerExecutor::default();
        let mut ctx =
            ChainContext::from_user_message("question", Budget::new(Duration::from_secs(1)));

        runner.run(&mut ctx, &executor).await.expect("sequence succeeds");
        let contents: Vec<&str> = ctx
            .current_messages()
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(contents, ["first", "second"]);
        assert!(!ctx.cancellation_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_later_children_see_earlier_output() {
        let observer = FnSkill::new("observer", |ctx| {
            let seen = ctx
                .last_message_from_source("a")
                .map(|m| m.content.clone())
                .unwrap_or_default();
            Ok(crate::message::ChatMessage::skill_success(seen, None, "observer"))
        });
        let runner = Sequential::new(vec![skill("a", "payload"), SkillRunner::wrap(observer)]);
        let executor = RunnerExecutor::default();
        let mut ctx =
            ChainContext::from_user_message("question", Budget::new(Duration::from_secs(1)));

        runner.run(&mut ctx, &executor).await.expect("sequence succeeds");
        assert_eq!(ctx.current_messages()[1].content, "payload");
    }

    #[tokio::test]
    async fn test_failure_stops_the_sequence() {
        let runner = Sequential::new(vec![
            SkillRunner::wrap(FnSkill::failing("broken", "boom")),
            skill("after", "never"),
        ]);
        let executor = RunnerExecutor::default();
        let mut ctx =
            ChainContext::from_user_message("question", Budget::new(Duration::from_secs(1)));

        runner.run(&mut ctx, &executor).await.expect_err("sequence fails");
        let contents: Vec<&str> = ctx
            .current_messages()
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(contents.len(), 1);
        assert!(ctx.current_messages()[0].is_error);
    }

    #[tokio::test]
    async fn test_single_child_is_not_wrapped() {
        let runner = Sequential::from_runners(vec![skill("only", "x")]);
        assert_eq!(runner.monitor().kind(), "skill");
    }
}
