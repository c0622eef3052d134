//! Error types for the council engine.
//!
//! Errors are grouped by the layer that raises them: [`RunnerError`] for the
//! execution tree, [`LlmError`] for model calls and response parsing,
//! [`FunctionError`] for typed LLM functions, and [`AgentError`] for the
//! agent loop stages.

use thiserror::Error;

/// Application-level failure raised by a skill, predicate or generator.
pub type SkillError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while executing a runner tree.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The execution was cancelled through the shared token.
    #[error("execution cancelled")]
    Cancelled,

    /// A runner or skill did not complete within the remaining budget duration.
    #[error("runner '{runner}' timed out")]
    Timeout {
        /// Name of the runner that exceeded its deadline.
        runner: String,
    },

    /// A predicate of an `If`, `While` or `DoWhile` runner failed.
    #[error("predicate raised an error in '{runner}'")]
    Predicate {
        /// Name of the runner owning the predicate.
        runner: String,
        /// The underlying failure.
        #[source]
        source: SkillError,
    },

    /// A `ParallelFor` generator failed while producing items.
    #[error("generator raised an error in '{runner}'")]
    Generator {
        /// Name of the runner owning the generator.
        runner: String,
        /// The underlying failure.
        #[source]
        source: SkillError,
    },

    /// A skill execution failed.
    #[error("an unexpected error occurred in skill '{skill}'")]
    Skill {
        /// Name of the failing skill.
        skill: String,
        /// The underlying failure.
        #[source]
        source: SkillError,
    },
}

impl RunnerError {
    /// Whether this error is a cancellation observed after the token was set.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Errors raised by LLM transports, middlewares and response parsers.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The call to the model did not complete in time.
    #[error("call to LLM '{name}' timed out after {timeout_secs} seconds")]
    CallTimeout {
        /// Name of the model wrapper.
        name: String,
        /// The timeout that was exceeded.
        timeout_secs: f64,
    },

    /// The provider returned an error status.
    #[error("LLM '{name}' returned status {code}: {message}")]
    Call {
        /// Name of the model wrapper.
        name: String,
        /// HTTP-style status code.
        code: u16,
        /// Provider error message.
        message: String,
    },

    /// The request exceeds the model's token limit.
    #[error("token count {token_count} exceeds model '{model}' limit of {limit}")]
    TokenLimit {
        /// Name of the model wrapper.
        name: String,
        /// Number of tokens in the request.
        token_count: usize,
        /// The model's limit.
        limit: usize,
        /// The model identifier.
        model: String,
    },

    /// The retry middleware exhausted its attempts.
    #[error("LLM '{name}' out of retries after {attempts} attempts")]
    OutOfRetries {
        /// Name of the model wrapper.
        name: String,
        /// Number of attempts made.
        attempts: usize,
        /// The errors observed on each attempt.
        errors: Vec<LlmError>,
    },

    /// A response could not be parsed into the expected shape.
    ///
    /// The message is written so it can be sent back to the model verbatim
    /// during self-correction.
    #[error("{message}")]
    Parsing {
        /// A model-friendly description of the parse failure.
        message: String,
    },

    /// Both the primary model and its fallback failed.
    #[error("{fallback}")]
    FallbackFailed {
        /// The fallback's failure, reported as the call's outcome.
        fallback: Box<LlmError>,
        /// The primary's failure that triggered the fallback.
        #[source]
        primary: Box<LlmError>,
    },
}

impl LlmError {
    /// Create a parsing error from a model-friendly message.
    #[must_use]
    pub fn parsing(message: impl Into<String>) -> Self {
        Self::Parsing {
            message: message.into(),
        }
    }

    /// HTTP-style status codes worth retrying before giving up on a provider.
    #[must_use]
    pub const fn is_retryable_status(code: u16) -> bool {
        matches!(code, 408 | 429 | 503 | 504)
    }
}

/// Errors raised by [`LlmFunction`](crate::llm::LlmFunction).
#[derive(Debug, Error)]
pub enum FunctionError {
    /// An underlying LLM call or parse failed.
    #[error(transparent)]
    Llm(#[from] LlmError),

    /// An application-level failure raised by a response validator.
    #[error("{message}")]
    Application {
        /// Description of the failure.
        message: String,
        /// Whether the self-correction loop may retry.
        retryable: bool,
    },

    /// The self-correction loop exhausted its attempts.
    #[error("exceeded maximum retries after {attempts} attempts")]
    OutOfRetry {
        /// Number of attempts made.
        attempts: usize,
        /// All errors observed during the attempts.
        errors: Vec<FunctionError>,
    },
}

impl FunctionError {
    /// Create a retryable application error.
    #[must_use]
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Application {
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable application error.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Application {
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether the self-correction loop may retry after this error.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Llm(LlmError::Parsing { .. }) => true,
            Self::Application { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

/// Errors raised by the agent loop and its stages.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The controller failed to produce an execution plan.
    #[error("controller error: {message}")]
    Controller {
        /// Description of the failure.
        message: String,
    },

    /// The evaluator failed to score the candidate responses.
    #[error("evaluator error: {message}")]
    Evaluator {
        /// Description of the failure.
        message: String,
    },

    /// The filter failed to select responses.
    #[error("filter error: {message}")]
    Filter {
        /// Description of the failure.
        message: String,
    },

    /// A chain's runner tree failed.
    #[error(transparent)]
    Runner(#[from] RunnerError),

    /// An LLM call made by a stage failed.
    #[error(transparent)]
    Llm(#[from] LlmError),
}

impl AgentError {
    /// Create a controller error.
    #[must_use]
    pub fn controller(message: impl Into<String>) -> Self {
        Self::Controller {
            message: message.into(),
        }
    }

    /// Create an evaluator error.
    #[must_use]
    pub fn evaluator(message: impl Into<String>) -> Self {
        Self::Evaluator {
            message: message.into(),
        }
    }

    /// Create a filter error.
    #[must_use]
    pub fn filter(message: impl Into<String>) -> Self {
        Self::Filter {
            message: message.into(),
        }
    }
}
