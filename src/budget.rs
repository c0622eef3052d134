//! Execution budgets and consumption accounting.
//!
//! A [`Budget`] combines a wall-clock deadline with a ledger of typed
//! [`Consumption`] limits. Components charge consumptions as they execute;
//! the budget expires when the deadline passes or any limit is overdrawn.
//!
//! Budgets are cheap handles: cloning one (or calling [`Budget::remaining`])
//! yields a view over the same ledger, so consumptions charged by a forked
//! branch are visible to every holder.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Sentinel remaining duration reported by an infinite budget.
const INFINITE_DURATION: Duration = Duration::from_secs(10_000);

/// A typed amount of a consumed resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consumption {
    /// The consumed amount.
    pub value: f64,
    /// The unit of the amount, e.g. `"token"`, `"second"`, `"call"`.
    pub unit: String,
    /// The kind of resource, e.g. `"prompt_tokens"` or a model name.
    pub kind: String,
}

impl Consumption {
    /// Create a new consumption.
    #[must_use]
    pub fn new(value: f64, unit: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            value,
            unit: unit.into(),
            kind: kind.into(),
        }
    }

    /// Create a consumption counting calls of the given kind.
    #[must_use]
    pub fn call(value: f64, kind: impl Into<String>) -> Self {
        Self::new(value, "call", kind)
    }

    /// Create a consumption of seconds of the given kind.
    #[must_use]
    pub fn duration(value: f64, kind: impl Into<String>) -> Self {
        Self::new(value, "second", kind)
    }

    /// Create a consumption of tokens of the given kind.
    #[must_use]
    pub fn token(value: f64, kind: impl Into<String>) -> Self {
        Self::new(value, "token", kind)
    }

    /// Rebuild this consumption with its unit prefixed by `cached_`.
    ///
    /// Used by the caching middleware so replayed responses remain visible
    /// in the ledger without double counting live usage.
    #[must_use]
    pub fn to_cached(&self) -> Self {
        Self::new(self.value, format!("cached_{}", self.unit), self.kind.clone())
    }

    fn matches(&self, unit: &str, kind: &str) -> bool {
        self.unit == unit && self.kind == kind
    }
}

impl std::fmt::Display for Consumption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} consumption: {} {}", self.kind, self.value, self.unit)
    }
}

/// A consumption recorded in the budget's ledger, with its origin.
#[derive(Debug, Clone)]
pub struct ConsumptionEvent {
    /// The charged consumption.
    pub consumption: Consumption,
    /// Name of the component that charged it.
    pub source: String,
    /// When the consumption was charged.
    pub timestamp: Instant,
}

impl std::fmt::Display for ConsumptionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} from {}", self.consumption, self.source)
    }
}

#[derive(Debug)]
struct BudgetInner {
    duration: Duration,
    deadline: Instant,
    infinite: bool,
    limits: Vec<Consumption>,
    remaining: Mutex<Vec<Consumption>>,
    events: Mutex<Vec<ConsumptionEvent>>,
}

/// The budget available for an execution.
///
/// Expiry on consumptions triggers once a remaining counter has been
/// overdrawn (strictly below zero): a limit of 10 admits exactly 10 unit
/// consumptions before [`Budget::is_expired`] reports true.
#[derive(Debug, Clone)]
pub struct Budget {
    inner: Arc<BudgetInner>,
}

impl Budget {
    /// Create a budget with a deadline and no consumption limits.
    #[must_use]
    pub fn new(duration: Duration) -> Self {
        Self::with_limits(duration, Vec::new())
    }

    /// Create a budget with a deadline measured in whole seconds.
    #[must_use]
    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Create a budget with a deadline and consumption limits.
    #[must_use]
    pub fn with_limits(duration: Duration, limits: Vec<Consumption>) -> Self {
        Self {
            inner: Arc::new(BudgetInner {
                duration,
                deadline: Instant::now() + duration,
                infinite: false,
                remaining: Mutex::new(limits.clone()),
                limits,
                events: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a budget that never expires.
    ///
    /// [`Budget::remaining_duration`] reports a sentinel value.
    #[must_use]
    pub fn infinite() -> Self {
        Self {
            inner: Arc::new(BudgetInner {
                duration: INFINITE_DURATION,
                deadline: Instant::now() + INFINITE_DURATION,
                infinite: true,
                limits: Vec::new(),
                remaining: Mutex::new(Vec::new()),
                events: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The duration this budget was created with.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.inner.duration
    }

    /// The configured consumption limits.
    #[must_use]
    pub fn limits(&self) -> &[Consumption] {
        &self.inner.limits
    }

    /// Time left until the deadline, zero once it passed.
    #[must_use]
    pub fn remaining_duration(&self) -> Duration {
        if self.inner.infinite {
            return INFINITE_DURATION;
        }
        self.inner.deadline.saturating_duration_since(Instant::now())
    }

    /// Whether the deadline passed or any remaining counter is overdrawn.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        if self.inner.infinite {
            return false;
        }
        if self.inner.deadline < Instant::now() {
            return true;
        }
        let remaining = self.inner.remaining.lock().expect("budget lock poisoned");
        remaining.iter().any(|limit| limit.value < 0.0)
    }

    /// Whether `value` of the given unit and kind can still be consumed.
    #[must_use]
    pub fn can_consume(&self, value: f64, unit: &str, kind: &str) -> bool {
        let remaining = self.inner.remaining.lock().expect("budget lock poisoned");
        remaining
            .iter()
            .filter(|limit| limit.matches(unit, kind))
            .all(|limit| limit.value >= value)
    }

    /// Charge a consumption against every matching remaining counter.
    pub fn add_consumption(&self, consumption: Consumption, source: impl Into<String>) {
        {
            let mut remaining = self.inner.remaining.lock().expect("budget lock poisoned");
            for limit in remaining
                .iter_mut()
                .filter(|limit| limit.matches(&consumption.unit, &consumption.kind))
            {
                limit.value -= consumption.value;
            }
        }
        let mut events = self.inner.events.lock().expect("budget lock poisoned");
        events.push(ConsumptionEvent {
            consumption,
            source: source.into(),
            timestamp: Instant::now(),
        });
    }

    /// Charge several consumptions from the same source.
    pub fn add_consumptions(
        &self,
        consumptions: impl IntoIterator<Item = Consumption>,
        source: impl Into<String>,
    ) {
        let source = source.into();
        for consumption in consumptions {
            self.add_consumption(consumption, source.clone());
        }
    }

    /// A budget handle carrying what is left of this one.
    ///
    /// The handle shares the deadline, the remaining counters and the
    /// consumption log with its parent.
    #[must_use]
    pub fn remaining(&self) -> Self {
        self.clone()
    }

    /// Snapshot of the remaining consumption counters.
    #[must_use]
    pub fn remaining_consumptions(&self) -> Vec<Consumption> {
        self.inner
            .remaining
            .lock()
            .expect("budget lock poisoned")
            .clone()
    }

    /// Snapshot of all consumption events recorded so far.
    #[must_use]
    pub fn consumption_events(&self) -> Vec<ConsumptionEvent> {
        self.inner
            .events
            .lock()
            .expect("budget lock poisoned")
            .clone()
    }
}
