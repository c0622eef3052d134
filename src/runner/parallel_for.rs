//! Runner applying a skill to every item of a generator, with bounded
//! fan-out.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tracing::debug;

use crate::context::{ChainContext, IterationContext};
use crate::error::{RunnerError, SkillError};
use crate::message::ChatMessage;
use crate::monitor::Monitor;

use super::skill::{Skill, SkillRunner};
use super::{Runner, RunnerExecutor, join_failure};

/// Default number of iterations running concurrently.
pub const DEFAULT_PARALLELISM: usize = 5;

/// Produces the items a [`ParallelFor`] iterates over.
///
/// The generator observes the context it runs in and returns a lazy
/// sequence; item failures surface as generator errors.
pub type RunnerGenerator = Box<
    dyn Fn(&ChainContext) -> Box<dyn Iterator<Item = Result<serde_json::Value, SkillError>> + Send>
        + Send
        + Sync,
>;

/// Invokes a skill once per generated item, `parallelism` items at a time.
///
/// Items are consumed in generator order and dispatched in batches; the
/// next batch starts only after every task of the current batch settled.
/// Each iteration executes in a fresh fork carrying its own
/// [`IterationContext`], and forks are merged in submission order, so the
/// message sequence is deterministic even though completion order within a
/// batch is not.
pub struct ParallelFor {
    generator: RunnerGenerator,
    skill: Arc<dyn Skill>,
    parallelism: usize,
    monitor: Monitor,
}

impl std::fmt::Debug for ParallelFor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelFor")
            .field("skill", &self.skill.name())
            .field("parallelism", &self.parallelism)
            .finish_non_exhaustive()
    }
}

impl ParallelFor {
    /// Create a parallel-for runner with the default parallelism.
    #[must_use]
    pub fn new(generator: RunnerGenerator, skill: Arc<dyn Skill>) -> Self {
        Self::with_parallelism(generator, skill, DEFAULT_PARALLELISM)
    }

    /// Create a parallel-for runner with an explicit batch size.
    #[must_use]
    pub fn with_parallelism(
        generator: RunnerGenerator,
        skill: Arc<dyn Skill>,
        parallelism: usize,
    ) -> Self {
        let mut monitor = Monitor::new("parallelForRunner", "parallelForRunner");
        monitor.register_child("skill", Arc::new(Monitor::new(skill.name(), "skill")));
        Self {
            generator,
            skill,
            parallelism: parallelism.max(1),
            monitor,
        }
    }

    async fn run_batch(
        &self,
        batch: Vec<(usize, serde_json::Value)>,
        context: &ChainContext,
        executor: &RunnerExecutor,
        produced: &mut Vec<ChainContext>,
    ) -> Result<(), RunnerError> {
        let timeout = context.budget().remaining_duration();
        let token = context.cancellation_token().clone();

        let mut handles = FuturesUnordered::new();
        for (slot, (index, value)) in batch.into_iter().enumerate() {
            let mut fork = context.fork_for(&format!("iterations[{index}]"));
            let skill = Arc::clone(&self.skill);
            handles.push(executor.submit(async move {
                debug!(index, "start iteration");
                let iteration = IterationContext::new(index, value);
                let result = SkillRunner::execute_skill(&skill, &mut fork, Some(iteration)).await;
                debug!(index, "end iteration");
                (slot, result, fork)
            }));
        }

        let mut slots: Vec<Option<ChainContext>> = Vec::new();
        slots.resize_with(handles.len(), || None);
        let mut first_error: Option<RunnerError> = None;

        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = handles.next().await {
                match joined {
                    Ok((slot, result, fork)) => {
                        slots[slot] = Some(fork);
                        if let Err(error) = result {
                            token.cancel();
                            if first_error.is_none() {
                                first_error = Some(error);
                            }
                        }
                    }
                    Err(join_error) => {
                        token.cancel();
                        if first_error.is_none() {
                            first_error = Some(join_failure(self.skill.name(), join_error));
                        }
                    }
                }
            }
        })
        .await;

        for slot in slots {
            if let Some(fork) = slot {
                produced.push(fork);
            }
        }

        if drained.is_err() {
            token.cancel();
            return Err(RunnerError::Timeout {
                runner: self.monitor.name().to_string(),
            });
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Runner for ParallelFor {
    fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    async fn run_inner(
        &self,
        context: &mut ChainContext,
        executor: &RunnerExecutor,
    ) -> Result<(), RunnerError> {
        let mut produced: Vec<ChainContext> = Vec::new();
        let mut items = (self.generator)(context);
        let mut next_index = 0usize;
        let mut outcome = Ok(());

        'outer: loop {
            if context.should_stop() {
                break;
            }

            // Consume the next batch from the generator, in generator order.
            let mut batch = Vec::with_capacity(self.parallelism);
            while batch.len() < self.parallelism {
                match items.next() {
                    Some(Ok(value)) => {
                        batch.push((next_index, value));
                        next_index += 1;
                    }
                    Some(Err(source)) => {
                        context.append(ChatMessage::skill_error(
                            format!("generator raised exception: {source}"),
                            self.monitor.name(),
                        ));
                        outcome = Err(RunnerError::Generator {
                            runner: self.monitor.name().to_string(),
                            source,
                        });
                        break 'outer;
                    }
                    None => break,
                }
            }
            if batch.is_empty() {
                break;
            }

            if let Err(error) = self.run_batch(batch, context, executor, &mut produced).await {
                outcome = Err(error);
                break;
            }
        }

        context.merge(produced);
        outcome
    }
}
