//! Composable execution runners.
//!
//! A [`Runner`] is a node of the execution tree of a chain: either a leaf
//! [`SkillRunner`](crate::runner::skill::SkillRunner) or a composite
//! ([`Sequential`], [`Parallel`], [`If`], [`While`], [`DoWhile`],
//! [`ParallelFor`]). Runners execute against a [`ChainContext`] under the
//! fork/merge discipline and cooperate through the context's budget and
//! cancellation token.

mod conditional;
mod loops;
mod parallel;
mod parallel_for;
mod sequential;
pub mod skill;

pub use conditional::If;
pub use loops::{DoWhile, While};
pub use parallel::Parallel;
pub use parallel_for::{ParallelFor, RunnerGenerator};
pub use sequential::Sequential;
pub use skill::{Skill, SkillRunner};

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::context::ChainContext;
use crate::error::RunnerError;
use crate::monitor::Monitor;

/// Default width of a runner worker pool.
pub const DEFAULT_POOL_WIDTH: usize = 10;

/// Predicate deciding whether a conditional or loop runner proceeds.
pub type RunnerPredicate =
    Box<dyn Fn(&ChainContext) -> Result<bool, crate::error::SkillError> + Send + Sync>;

/// Bounded worker pool shared by the runners of an execution.
///
/// Tasks are admitted by a semaphore: any number may be submitted, at most
/// the pool's width execute at a time, and no task is pinned to a worker.
#[derive(Debug, Clone)]
pub struct RunnerExecutor {
    semaphore: Arc<Semaphore>,
}

impl RunnerExecutor {
    /// Create a pool admitting `width` concurrent tasks.
    #[must_use]
    pub fn new(width: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(width.max(1))),
        }
    }

    /// Submit a task to the pool.
    ///
    /// The task starts once a pool slot frees up; the returned handle
    /// resolves with the task's output.
    pub fn submit<F, T>(&self, future: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("runner pool semaphore closed");
            future.await
        })
    }
}

impl Default for RunnerExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_WIDTH)
    }
}

/// A composable execution node.
///
/// Implementations provide [`Runner::run_inner`]; callers go through
/// [`Runner::run`], which skips execution once the context wants to stop,
/// records the execution in the log, and cancels the context's token before
/// propagating any failure so sibling branches stop promptly.
#[async_trait]
pub trait Runner: Send + Sync {
    /// The runner's monitor node.
    fn monitor(&self) -> &Monitor;

    /// Execute the runner's own logic.
    async fn run_inner(
        &self,
        context: &mut ChainContext,
        executor: &RunnerExecutor,
    ) -> Result<(), RunnerError>;

    /// Execute the runner under the base discipline.
    async fn run(
        &self,
        context: &mut ChainContext,
        executor: &RunnerExecutor,
    ) -> Result<(), RunnerError> {
        if context.should_stop() {
            return Ok(());
        }
        let name = self.monitor().name().to_string();
        debug!(runner = %name, "start running");
        let mut scope = context.scope(&name);
        let result = self.run_inner(context, executor).await;
        match result {
            Ok(()) => {
                debug!(runner = %name, "done running");
                Ok(())
            }
            Err(error) => {
                warn!(runner = %name, error = %error, "runner failed");
                scope.fail(&error);
                context.cancel();
                Err(error)
            }
        }
    }
}

/// Run a child runner on a fork of `context` and merge the fork back.
///
/// The fork is merged on every exit path, so messages produced before a
/// failure stay visible to the parent.
pub(crate) async fn fork_run_merge(
    child: &Arc<dyn Runner>,
    context: &mut ChainContext,
    executor: &RunnerExecutor,
) -> Result<(), RunnerError> {
    let mut inner = context.fork_for(child.monitor().name());
    let result = child.run(&mut inner, executor).await;
    context.merge(vec![inner]);
    result
}

/// Translate a task join failure into a runner error.
pub(crate) fn join_failure(name: &str, error: tokio::task::JoinError) -> RunnerError {
    if error.is_cancelled() {
        RunnerError::Cancelled
    } else {
        RunnerError::Skill {
            skill: name.to_string(),
            source: Box::new(error),
        }
    }
}
