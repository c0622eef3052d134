//! Loop runners.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::ChainContext;
use crate::error::RunnerError;
use crate::message::ChatMessage;
use crate::monitor::Monitor;

use super::{Runner, RunnerExecutor, RunnerPredicate, fork_run_merge};

fn check_predicate(
    predicate: &RunnerPredicate,
    context: &mut ChainContext,
    name: &str,
) -> Result<bool, RunnerError> {
    match predicate(context) {
        Ok(outcome) => Ok(outcome),
        Err(source) => {
            context.append(ChatMessage::skill_error(
                format!("predicate raised exception: {source}"),
                name,
            ));
            Err(RunnerError::Predicate {
                runner: name.to_string(),
                source,
            })
        }
    }
}

/// Runs its body while the predicate returns true.
///
/// The predicate is evaluated before each turn; predicate failures are
/// fatal.
pub struct While {
    predicate: RunnerPredicate,
    body: Arc<dyn Runner>,
    monitor: Monitor,
}

impl std::fmt::Debug for While {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("While").finish_non_exhaustive()
    }
}

impl While {
    /// Create a while runner.
    #[must_use]
    pub fn new(predicate: RunnerPredicate, body: Arc<dyn Runner>) -> Self {
        let mut monitor = Monitor::new("whileRunner", "whileRunner");
        monitor.register_child("whileBody", Arc::new(body.monitor().clone()));
        Self {
            predicate,
            body,
            monitor,
        }
    }
}

#[async_trait]
impl Runner for While {
    fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    async fn run_inner(
        &self,
        context: &mut ChainContext,
        executor: &RunnerExecutor,
    ) -> Result<(), RunnerError> {
        while check_predicate(&self.predicate, context, self.monitor.name())? {
            fork_run_merge(&self.body, context, executor).await?;
        }
        Ok(())
    }
}

/// Runs its body, then repeats while the predicate returns true.
///
/// The predicate is evaluated after each turn, so the body executes at
/// least once.
pub struct DoWhile {
    predicate: RunnerPredicate,
    body: Arc<dyn Runner>,
    monitor: Monitor,
}

impl std::fmt::Debug for DoWhile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoWhile").finish_non_exhaustive()
    }
}

impl DoWhile {
    /// Create a do-while runner.
    #[must_use]
    pub fn new(predicate: RunnerPredicate, body: Arc<dyn Runner>) -> Self {
        let mut monitor = Monitor::new("doWhileRunner", "doWhileRunner");
        monitor.register_child("doWhileBody", Arc::new(body.monitor().clone()));
        Self {
            predicate,
            body,
            monitor,
        }
    }
}

#[async_trait]
impl Runner for DoWhile {
    fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    async fn run_inner(
        &self,
        context: &mut ChainContext,
        executor: &RunnerExecutor,
    ) -> Result<(), RunnerError> {
        loop {
            fork_run_merge(&self.body, context, executor).await?;
            if !check_predicate(&self.predicate, context, self.monitor.name())? {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{Budget, Consumption};
    use crate::runner::skill::{FnSkill, SkillRunner};
    use std::time::Duration;

    fn counting_skill() -> Arc<dyn Runner> {
        SkillRunner::wrap(FnSkill::new("counter", |ctx| {
            ctx.budget()
                .add_consumption(Consumption::new(1.0, "unit", "turn"), "counter");
            Ok(crate::message::ChatMessage::skill_success("tick", None, "counter"))
        }))
    }

    #[tokio::test]
    async fn test_while_runs_until_predicate_fails() {
        let runner = While::new(
            Box::new(|ctx| Ok(ctx.current_messages().len() < 3)),
            counting_skill(),
        );
        let executor = RunnerExecutor::default();
        let mut ctx =
            ChainContext::from_user_message("question", Budget::new(Duration::from_secs(5)));

        runner.run(&mut ctx, &executor).await.expect("while succeeds");
        assert_eq!(ctx.current_messages().len(), 3);
    }

    #[tokio::test]
    async fn test_while_may_not_run_at_all() {
        let runner = While::new(Box::new(|_| Ok(false)), counting_skill());
        let executor = RunnerExecutor::default();
        let mut ctx =
            ChainContext::from_user_message("question", Budget::new(Duration::from_secs(5)));

        runner.run(&mut ctx, &executor).await.expect("while succeeds");
        assert!(ctx.current_messages().is_empty());
    }

    #[tokio::test]
    async fn test_do_while_runs_at_least_once() {
        let runner = DoWhile::new(Box::new(|_| Ok(false)), counting_skill());
        let executor = RunnerExecutor::default();
        let mut ctx =
            ChainContext::from_user_message("question", Budget::new(Duration::from_secs(5)));

        runner.run(&mut ctx, &executor).await.expect("do-while succeeds");
        assert_eq!(ctx.current_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_do_while_consumes_budget_until_overdrawn() {
        // Each turn consumes one "turn" unit; a limit of 3 admits four body
        // executions before the ledger is overdrawn and the budget expires.
        let runner = DoWhile::new(
            Box::new(|ctx| Ok(!ctx.budget().is_expired())),
            counting_skill(),
        );
        let executor = RunnerExecutor::default();
        let budget = Budget::with_limits(
            Duration::from_secs(5),
            vec![Consumption::new(3.0, "unit", "turn")],
        );
        let mut ctx = ChainContext::from_user_message("question", budget);

        runner.run(&mut ctx, &executor).await.expect("do-while succeeds");
        assert_eq!(ctx.current_messages().len(), 4);
    }

    #[tokio::test]
    async fn test_predicate_error_is_fatal() {
        let runner = While::new(Box::new(|_| Err("broken".into())), counting_skill());
        let executor = RunnerExecutor::default();
        let mut ctx =
            ChainContext::from_user_message("question", Budget::new(Duration::from_secs(5)));

        let error = runner.run(&mut ctx, &executor).await.expect_err("while fails");
        assert!(matches!(error, RunnerError::Predicate { .. }));
        assert!(ctx.current_messages()[0].is_error);
    }
}
