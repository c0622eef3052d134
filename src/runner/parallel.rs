//! Runner executing its children concurrently.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tracing::debug;

use crate::context::ChainContext;
use crate::error::RunnerError;
use crate::monitor::Monitor;

use super::{Runner, RunnerExecutor, join_failure};

/// Runs a list of runners concurrently on the worker pool.
///
/// Every child receives its own fork of the parent context. The aggregate
/// wait is bounded by the budget's remaining duration; the first child
/// failure cancels the shared token so siblings stop promptly, and the
/// failure is re-raised once the wait settles. Children are merged in
/// declared order regardless of completion order, so the observable message
/// sequence is deterministic across runs.
pub struct Parallel {
    children: Vec<Arc<dyn Runner>>,
    monitor: Monitor,
}

impl std::fmt::Debug for Parallel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parallel")
            .field("children", &self.children.len())
            .finish_non_exhaustive()
    }
}

impl Parallel {
    /// Create a parallel runner over the given children.
    #[must_use]
    pub fn new(children: Vec<Arc<dyn Runner>>) -> Self {
        let mut monitor = Monitor::new("parallelRunner", "parallelRunner");
        monitor.register_children(
            "parallel",
            children.iter().map(|child| Arc::new(child.monitor().clone())),
        );
        Self { children, monitor }
    }
}

#[async_trait]
impl Runner for Parallel {
    fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    async fn run_inner(
        &self,
        context: &mut ChainContext,
        executor: &RunnerExecutor,
    ) -> Result<(), RunnerError> {
        let timeout = context.budget().remaining_duration();
        let token = context.cancellation_token().clone();

        let mut handles = FuturesUnordered::new();
        for (index, child) in self.children.iter().enumerate() {
            let mut fork = context.fork_for(child.monitor().name());
            let child = Arc::clone(child);
            let task_executor = executor.clone();
            handles.push(executor.submit(async move {
                let result = child.run(&mut fork, &task_executor).await;
                (index, result, fork)
            }));
        }

        let mut slots: Vec<Option<ChainContext>> = Vec::new();
        slots.resize_with(self.children.len(), || None);
        let mut first_error: Option<RunnerError> = None;

        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = handles.next().await {
                match joined {
                    Ok((index, result, fork)) => {
                        slots[index] = Some(fork);
                        if let Err(error) = result {
                            debug!(child = index, error = %error, "parallel child failed");
                            token.cancel();
                            if first_error.is_none() {
                                first_error = Some(error);
                            }
                        }
                    }
                    Err(join_error) => {
                        token.cancel();
                        if first_error.is_none() {
                            first_error = Some(join_failure("parallel", join_error));
                        }
                    }
                }
            }
        })
        .await;

        let timed_out = drained.is_err();
        if timed_out {
            token.cancel();
        }

        // Merge in declared order whatever the children produced.
        let mut produced = Vec::new();
        for slot in slots {
            if let Some(fork) = slot {
                produced.push(fork);
            }
        }
        context.merge(produced);

        if timed_out {
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
