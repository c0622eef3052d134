//! Runner guarded by a predicate.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::ChainContext;
use crate::error::RunnerError;
use crate::message::ChatMessage;
use crate::monitor::Monitor;

use super::{Runner, RunnerExecutor, RunnerPredicate, fork_run_merge};

/// Runs one of two runners depending on a predicate.
///
/// A failing predicate appends an error skill message named after the
/// runner and raises a predicate error.
pub struct If {
    predicate: RunnerPredicate,
    then_runner: Arc<dyn Runner>,
    else_runner: Option<Arc<dyn Runner>>,
    monitor: Monitor,
}

impl std::fmt::Debug for If {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("If")
            .field("has_else", &self.else_runner.is_some())
            .finish_non_exhaustive()
    }
}

impl If {
    /// Create a conditional runner without an else branch.
    #[must_use]
    pub fn new(predicate: RunnerPredicate, then_runner: Arc<dyn Runner>) -> Self {
        Self::build(predicate, then_runner, None)
    }

    /// Create a conditional runner with an else branch.
    #[must_use]
    pub fn with_else(
        predicate: RunnerPredicate,
        then_runner: Arc<dyn Runner>,
        else_runner: Arc<dyn Runner>,
    ) -> Self {
        Self::build(predicate, then_runner, Some(else_runner))
    }

    fn build(
        predicate: RunnerPredicate,
        then_runner: Arc<dyn Runner>,
        else_runner: Option<Arc<dyn Runner>>,
    ) -> Self {
        let mut monitor = Monitor::new("ifRunner", "ifRunner");
        monitor.register_child("then", Arc::new(then_runner.monitor().clone()));
        if let Some(else_runner) = &else_runner {
            monitor.register_child("else", Arc::new(else_runner.monitor().clone()));
        }
        Self {
            predicate,
            then_runner,
            else_runner,
            monitor,
        }
    }
}

#[async_trait]
impl Runner for If {
    fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    async fn run_inner(
        &self,
        context: &mut ChainContext,
        executor: &RunnerExecutor,
    ) -> Result<(), RunnerError> {
        let name = self.monitor.name();
        let outcome = match (self.predicate)(context) {
            Ok(outcome) => outcome,
            Err(source) => {
                context.append(ChatMessage::skill_error(
                    format!("predicate raised exception: {source}"),
                    name,
                ));
                return Err(RunnerError::Predicate {
                    runner: name.to_string(),
                    source,
                });
            }
        };

        if outcome {
            fork_run_merge(&self.then_runner, context, executor).await
        } else if let Some(else_runner) = &self.else_runner {
            fork_run_merge(else_runner, context, executor).await
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::Budget;
    use crate::runner::skill::{FnSkill, SkillRunner};
    use std::time::Duration;

    fn context() -> ChainContext {
        ChainContext::from_user_message("question", Budget::new(Duration::from_secs(1)))
    }

    fn skill(name: &str, content: &str) -> Arc<dyn Runner> {
        SkillRunner::wrap(FnSkill::from_content(name, content))
    }

    #[tokio::test]
    async fn test_then_branch_runs_when_predicate_holds() {
        let runner = If::with_else(
            Box::new(|_| Ok(true)),
            skill("then", "yes"),
            skill("else", "no"),
        );
        let executor = RunnerExecutor::default();
        let mut ctx = context();

        runner.run(&mut ctx, &executor).await.expect("if succeeds");
        assert_eq!(ctx.current_messages()[0].content, "yes");
    }

    #[tokio::test]
    async fn test_else_branch_runs_when_predicate_fails() {
        let runner = If::with_else(
            Box::new(|_| Ok(false)),
            skill("then", "yes"),
            skill("else", "no"),
        );
        let executor = RunnerExecutor::default();
        let mut ctx = context();

        runner.run(&mut ctx, &executor).await.expect("if succeeds");
        assert_eq!(ctx.current_messages()[0].content, "no");
    }

    #[tokio::test]
    async fn test_missing_else_is_a_no_op() {
        let runner = If::new(Box::new(|_| Ok(false)), skill("then", "yes"));
        let executor = RunnerExecutor::default();
        let mut ctx = context();

        runner.run(&mut ctx, &executor).await.expect("if succeeds");
        assert!(ctx.current_messages().is_empty());
    }

    #[tokio::test]
    async fn test_predicate_error_appends_message_and_raises() {
        let runner = If::new(Box::new(|_| Err("bad input".into())), skill("then", "yes"));
        let executor = RunnerExecutor::default();
        let mut ctx = context();

        let error = runner.run(&mut ctx, &executor).await.expect_err("if fails");
        assert!(matches!(error, RunnerError::Predicate { .. }));
        let message = &ctx.current_messages()[0];
        assert!(message.is_error);
        assert!(message.content.contains("predicate raised exception"));
        assert!(ctx.cancellation_token().is_cancelled());
    }
}
