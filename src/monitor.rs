//! Monitoring of composable components.
//!
//! Every composable component (agent, controller, evaluator, chain, runner,
//! skill, LLM wrapper) carries a [`Monitor`]: a stable name, a type tag and
//! a map of named children. Monitors form a tree built bottom-up; parents
//! own their children and children hold no parent pointers.
//!
//! Execution is recorded separately in an [`ExecutionLog`]: a flat list of
//! [`ExecutionLogEntry`] values whose `path` strings locate the component in
//! the monitor tree.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::budget::Consumption;

/// Identity of a composable component and its children.
#[derive(Debug, Clone)]
pub struct Monitor {
    name: String,
    kind: &'static str,
    children: BTreeMap<String, Arc<Monitor>>,
}

impl Monitor {
    /// Create a monitor with no children.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: &'static str) -> Self {
        Self {
            name: name.into(),
            kind,
            children: BTreeMap::new(),
        }
    }

    /// The component's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The component's type tag, e.g. `"chain"` or `"skill"`.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        self.kind
    }

    /// Register a single named child.
    pub fn register_child(&mut self, name: impl Into<String>, child: Arc<Monitor>) {
        self.children.insert(name.into(), child);
    }

    /// Register an ordered collection of children under indexed names,
    /// `base[0]`, `base[1]`, and so on.
    pub fn register_children<I>(&mut self, base: &str, children: I)
    where
        I: IntoIterator<Item = Arc<Monitor>>,
    {
        for (index, child) in children.into_iter().enumerate() {
            self.children.insert(format!("{base}[{index}]"), child);
        }
    }

    /// The named children of this component.
    #[must_use]
    pub const fn children(&self) -> &BTreeMap<String, Arc<Monitor>> {
        &self.children
    }
}

impl std::fmt::Display for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.kind, self.name)
    }
}

/// One recorded execution of a component.
#[derive(Debug, Clone)]
pub struct ExecutionLogEntry {
    /// Slash-separated path of the component in the monitor tree.
    pub path: String,
    /// When the execution started, relative to the log's creation.
    pub start: Duration,
    /// How long the execution took.
    pub duration: Duration,
    /// The error message if the execution failed.
    pub error: Option<String>,
    /// Consumptions charged during the execution.
    pub consumptions: Vec<Consumption>,
}

#[derive(Debug)]
struct ExecutionLogInner {
    origin: Instant,
    entries: Mutex<Vec<ExecutionLogEntry>>,
}

/// Shared, append-only record of component executions.
#[derive(Debug, Clone)]
pub struct ExecutionLog {
    inner: Arc<ExecutionLogInner>,
}

impl ExecutionLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ExecutionLogInner {
                origin: Instant::now(),
                entries: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Open a scope recording one execution under the given path.
    ///
    /// The entry is recorded when the scope is dropped, on every exit path.
    #[must_use]
    pub fn scope(&self, path: impl Into<String>) -> ExecutionScope {
        ExecutionScope {
            log: self.clone(),
            path: path.into(),
            started: Instant::now(),
            error: None,
            consumptions: Vec::new(),
        }
    }

    /// Snapshot of all recorded entries.
    #[must_use]
    pub fn entries(&self) -> Vec<ExecutionLogEntry> {
        self.inner
            .entries
            .lock()
            .expect("execution log lock poisoned")
            .clone()
    }

    fn record(&self, path: String, started: Instant, error: Option<String>, consumptions: Vec<Consumption>) {
        let entry = ExecutionLogEntry {
            path,
            start: started.saturating_duration_since(self.inner.origin),
            duration: started.elapsed(),
            error,
            consumptions,
        };
        self.inner
            .entries
            .lock()
            .expect("execution log lock poisoned")
            .push(entry);
    }
}

impl Default for ExecutionLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard recording one execution into an [`ExecutionLog`] on drop.
#[derive(Debug)]
pub struct ExecutionScope {
    log: ExecutionLog,
    path: String,
    started: Instant,
    error: Option<String>,
    consumptions: Vec<Consumption>,
}

impl ExecutionScope {
    /// The path this scope records under.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Mark the execution as failed.
    pub fn fail(&mut self, error: impl std::fmt::Display) {
        self.error = Some(error.to_string());
    }

    /// Attach a consumption charged during the execution.
    pub fn add_consumption(&mut self, consumption: Consumption) {
        self.consumptions.push(consumption);
    }
}

impl Drop for ExecutionScope {
    fn drop(&mut self) {
        self.log.record(
            std::mem::take(&mut self.path),
            self.started,
            self.error.take(),
            std::mem::take(&mut self.consumptions),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_children_are_named_and_indexed() {
        let first = Arc::new(Monitor::new("a", "skill"));
        let second = Arc::new(Monitor::new("b", "skill"));
        let mut parent = Monitor::new("seq", "sequenceRunner");
        parent.register_children("sequence", [first, second]);
        parent.register_child("extra", Arc::new(Monitor::new("c", "skill")));

        let names: Vec<&String> = parent.children().keys().collect();
        assert_eq!(names, ["extra", "sequence[0]", "sequence[1]"]);
        assert_eq!(parent.children()["sequence[0]"].name(), "a");
    }

    #[test]
    fn test_scope_records_on_drop_including_failure() {
        let log = ExecutionLog::new();
        {
            let _scope = log.scope("agent/chains[0]");
        }
        {
            let mut scope = log.scope("agent/chains[1]");
            scope.fail("boom");
            scope.add_consumption(Consumption::call(1.0, "llm"));
        }

        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "agent/chains[0]");
        assert!(entries[0].error.is_none());
        assert_eq!(entries[1].error.as_deref(), Some("boom"));
        assert_eq!(entries[1].consumptions.len(), 1);
    }
}
