//! Skills and the leaf runner executing them.
//!
//! A [`Skill`] is user code producing exactly one [`ChatMessage`] per
//! invocation. Failures are preferably reported as error-kind messages;
//! returned errors are tolerated and turned into an error message appended
//! on the skill's behalf before the failure propagates.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::context::{ChainContext, IterationContext, SkillContext};
use crate::error::{RunnerError, SkillError};
use crate::message::ChatMessage;
use crate::monitor::Monitor;

use super::{Runner, RunnerExecutor, join_failure};

/// A leaf unit of work producing a single chat message.
#[async_trait]
pub trait Skill: Send + Sync {
    /// The skill's stable name, used as the message source.
    fn name(&self) -> &str;

    /// Execute the skill against the given context.
    async fn execute(&self, context: &SkillContext) -> Result<ChatMessage, SkillError>;

    /// Build a successful skill message attributed to this skill.
    fn success_message(&self, content: impl Into<String>, data: Option<Value>) -> ChatMessage
    where
        Self: Sized,
    {
        ChatMessage::skill_success(content, data, self.name())
    }

    /// Build an error skill message attributed to this skill.
    fn error_message(&self, content: impl Into<String>) -> ChatMessage
    where
        Self: Sized,
    {
        ChatMessage::skill_error(content, self.name())
    }
}

/// Leaf runner executing a [`Skill`] on the worker pool.
///
/// The skill's completion is awaited with a timeout equal to the budget's
/// remaining duration; exceeding it cancels the context and raises a
/// timeout error.
pub struct SkillRunner {
    skill: Arc<dyn Skill>,
    monitor: Monitor,
}

impl std::fmt::Debug for SkillRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkillRunner")
            .field("skill", &self.monitor.name())
            .finish_non_exhaustive()
    }
}

impl SkillRunner {
    /// Create a runner for the given skill.
    #[must_use]
    pub fn new(skill: Arc<dyn Skill>) -> Self {
        let monitor = Monitor::new(skill.name(), "skill");
        Self { skill, monitor }
    }

    /// Create a runner, wrapping the skill behind an `Arc`.
    #[must_use]
    pub fn wrap(skill: impl Skill + 'static) -> Arc<dyn Runner> {
        Arc::new(Self::new(Arc::new(skill)))
    }

    /// The wrapped skill.
    #[must_use]
    pub fn skill(&self) -> &Arc<dyn Skill> {
        &self.skill
    }

    /// Execute the skill in the current task and record its outcome.
    ///
    /// On success the produced message is appended to `context`, unless the
    /// context wants to stop. On failure an error-kind message is appended
    /// on the skill's behalf and the failure propagates.
    pub(crate) async fn execute_skill(
        skill: &Arc<dyn Skill>,
        context: &mut ChainContext,
        iteration: Option<IterationContext>,
    ) -> Result<(), RunnerError> {
        let skill_context = context.to_skill_context(iteration);
        match skill.execute(&skill_context).await {
            Ok(message) => {
                context.append(message);
                Ok(())
            }
            Err(error) => {
                let content = format!("skill '{}' raised exception: {error}", skill.name());
                context.append(ChatMessage::skill_error(content, skill.name()));
                Err(RunnerError::Skill {
                    skill: skill.name().to_string(),
                    source: error,
                })
            }
        }
    }
}

#[async_trait]
impl Runner for SkillRunner {
    fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    async fn run_inner(
        &self,
        context: &mut ChainContext,
        executor: &RunnerExecutor,
    ) -> Result<(), RunnerError> {
        let timeout = context.budget().remaining_duration();
        let name = self.monitor.name().to_string();
        let mut child = context.fork_for(&name);
        let skill = Arc::clone(&self.skill);

        debug!(skill = %name, "submitting skill to pool");
        let mut handle = executor.submit(async move {
            let result = Self::execute_skill(&skill, &mut child, None).await;
            (result, child)
        });

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok((result, child))) => {
                context.merge(vec![child]);
                result
            }
            Ok(Err(join_error)) => Err(join_failure(&name, join_error)),
            Err(_) => {
                handle.abort();
                Err(RunnerError::Timeout { runner: name })
            }
        }
    }
}

/// A skill backed by a closure, with an optional artificial delay.
///
/// Useful for assembling chains out of plain functions and as a scripted
/// skill in tests.
pub struct FnSkill {
    name: String,
    delay: Option<Duration>,
    action: Box<dyn Fn(&SkillContext) -> Result<ChatMessage, SkillError> + Send + Sync>,
}

impl std::fmt::Debug for FnSkill {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnSkill")
            .field("name", &self.name)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

impl FnSkill {
    /// Create a skill from a closure.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        action: impl Fn(&SkillContext) -> Result<ChatMessage, SkillError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            delay: None,
            action: Box::new(action),
        }
    }

    /// Create a skill that always succeeds with a fixed message.
    #[must_use]
    pub fn from_content(name: impl Into<String>, content: impl Into<String>) -> Self {
        let name = name.into();
        let content = content.into();
        let source = name.clone();
        Self::new(name, move |_| {
            Ok(ChatMessage::skill_success(content.clone(), None, source.clone()))
        })
    }

    /// Create a skill that always fails with the given error message.
    #[must_use]
    pub fn failing(name: impl Into<String>, error: impl Into<String>) -> Self {
        let error = error.into();
        Self::new(name, move |_| Err(error.clone().into()))
    }

    /// Sleep for the given duration before executing the closure.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl Skill for FnSkill {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, context: &SkillContext) -> Result<ChatMessage, SkillError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.action)(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::Budget;

    fn context() -> ChainContext {
        ChainContext::from_user_message("question", Budget::new(Duration::from_secs(5)))
    }

    #[tokio::test]
    async fn test_skill_appends_exactly_one_message() {
        let runner = SkillRunner::new(Arc::new(FnSkill::from_content("echo", "hello")));
        let executor = RunnerExecutor::default();
        let mut ctx = context();

        runner.run(&mut ctx, &executor).await.expect("skill succeeds");
        assert_eq!(ctx.current_messages().len(), 1);
        let message = &ctx.current_messages()[0];
        assert_eq!(message.content, "hello");
        assert!(message.is_from_source("echo"));
    }

    #[tokio::test]
    async fn test_failing_skill_appends_error_message_and_cancels() {
        let runner = SkillRunner::new(Arc::new(FnSkill::failing("broken", "boom")));
        let executor = RunnerExecutor::default();
        let mut ctx = context();

        let error = runner.run(&mut ctx, &executor).await.expect_err("skill fails");
        assert!(matches!(error, RunnerError::Skill { .. }));
        assert!(ctx.cancellation_token().is_cancelled());

        let message = &ctx.current_messages()[0];
        assert!(message.is_error);
        assert!(message.content.contains("skill 'broken' raised exception"));
    }

    #[tokio::test]
    async fn test_slow_skill_times_out() {
        let runner = SkillRunner::new(Arc::new(
            FnSkill::from_content("slow", "late").with_delay(Duration::from_secs(2)),
        ));
        let executor = RunnerExecutor::default();
        let mut ctx =
            ChainContext::from_user_message("question", Budget::new(Duration::from_millis(50)));

        let error = runner.run(&mut ctx, &executor).await.expect_err("skill times out");
        assert!(matches!(error, RunnerError::Timeout { .. }));
        assert!(ctx.cancellation_token().is_cancelled());
        assert!(ctx.current_messages().is_empty());
    }

    #[tokio::test]
    async fn test_skill_skipped_after_cancellation() {
        let runner = SkillRunner::new(Arc::new(FnSkill::from_content("echo", "hello")));
        let executor = RunnerExecutor::default();
        let mut ctx = context();
        ctx.cancel();

        runner.run(&mut ctx, &executor).await.expect("no-op");
        assert!(ctx.current_messages().is_empty());
    }
}
