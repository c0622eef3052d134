//! Typed LLM calls with bounded self-correction.
//!
//! An [`LlmFunction`] sends a prompt through a middleware chain, parses
//! the response into a typed record, and on parse or validation failures
//! shows the model its own answer together with a correction request, up
//! to a bounded number of retries.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::task::JoinSet;
use tracing::warn;

use crate::context::LlmContext;
use crate::error::FunctionError;
use crate::llm::middleware::{LlmMiddleware, LlmMiddlewareChain, LlmRequest, LlmResponse};
use crate::llm::parser::ResponseParser;
use crate::llm::{Llm, LlmCallOptions, LlmMessage};

/// A function from a prompt to a typed, validated record.
pub struct LlmFunction<T> {
    chain: LlmMiddlewareChain,
    parser: Box<dyn ResponseParser<T>>,
    system_message: LlmMessage,
    max_retries: usize,
    context: LlmContext,
}

impl<T> std::fmt::Debug for LlmFunction<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmFunction")
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl<T> LlmFunction<T> {
    /// Default number of self-correction retries.
    pub const DEFAULT_MAX_RETRIES: usize = 3;

    /// Create a function over a bare model.
    #[must_use]
    pub fn new(
        llm: Arc<dyn Llm>,
        parser: impl ResponseParser<T> + 'static,
        system_message: impl Into<String>,
    ) -> Self {
        Self::with_chain(LlmMiddlewareChain::new(llm), parser, system_message)
    }

    /// Create a function over an existing middleware chain.
    #[must_use]
    pub fn with_chain(
        chain: LlmMiddlewareChain,
        parser: impl ResponseParser<T> + 'static,
        system_message: impl Into<String>,
    ) -> Self {
        Self {
            chain,
            parser: Box::new(parser),
            system_message: LlmMessage::system(system_message),
            max_retries: Self::DEFAULT_MAX_RETRIES,
            context: LlmContext::empty(),
        }
    }

    /// Set the number of self-correction retries.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Charge calls to the given context instead of an unconstrained one.
    #[must_use]
    pub fn with_context(mut self, context: LlmContext) -> Self {
        self.context = context;
        self
    }

    /// Append a middleware to the function's chain.
    pub fn add_middleware(&mut self, middleware: Arc<dyn LlmMiddleware>) {
        self.chain.add_middleware(middleware);
    }

    /// Execute with a single user message.
    pub async fn execute(&self, user_message: impl Into<String>) -> Result<T, FunctionError> {
        self.execute_with_messages(Some(LlmMessage::user(user_message)), Vec::new(), LlmCallOptions::new())
            .await
    }

    /// Execute with an optional user message and extra conversation turns.
    pub async fn execute_with_messages(
        &self,
        user_message: Option<LlmMessage>,
        messages: Vec<LlmMessage>,
        options: LlmCallOptions,
    ) -> Result<T, FunctionError> {
        let mut payload = vec![self.system_message.clone()];
        if let Some(user_message) = user_message {
            payload.push(user_message);
        }
        payload.extend(messages);

        let mut errors: Vec<FunctionError> = Vec::new();

        for _attempt in 0..=self.max_retries {
            let request = LlmRequest::new(self.context.clone(), payload.clone(), options.clone());
            let response = self.chain.execute(request).await.map_err(FunctionError::Llm)?;

            match self.parser.parse(&response) {
                Ok(record) => return Ok(record),
                Err(error) if error.is_retryable() => {
                    warn!(error = %error, "llm response rejected, requesting a fix");
                    payload.extend(correction_turn(&error, &response));
                    errors.push(error);
                }
                Err(error) => return Err(error),
            }
        }

        Err(FunctionError::OutOfRetry {
            attempts: self.max_retries + 1,
            errors,
        })
    }

    /// The response template expected by the function's parser, if any.
    #[must_use]
    pub fn response_template(&self) -> Option<String> {
        self.parser.response_template()
    }
}

/// Build the assistant/user turns appended after a rejected response.
fn correction_turn(error: &FunctionError, response: &LlmResponse) -> Vec<LlmMessage> {
    let answer = response.first_choice();
    if answer.is_empty() {
        return vec![
            LlmMessage::assistant("No response"),
            LlmMessage::user("Please retry."),
        ];
    }
    vec![
        LlmMessage::assistant(answer),
        LlmMessage::user(format!("Your response was malformed. Fix: {error}")),
    ]
}

/// Runs a fallible async operation several times concurrently and reduces
/// the results.
pub struct ParallelExecutor<T> {
    execute: Arc<dyn Fn() -> BoxFuture<'static, Result<T, FunctionError>> + Send + Sync>,
    reduce: Arc<dyn Fn(Vec<T>) -> T + Send + Sync>,
    n: usize,
}

impl<T> std::fmt::Debug for ParallelExecutor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelExecutor")
            .field("n", &self.n)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> ParallelExecutor<T> {
    /// Create an executor running `execute` `n` times per call.
    #[must_use]
    pub fn new<F, Fut>(n: usize, execute: F, reduce: impl Fn(Vec<T>) -> T + Send + Sync + 'static) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, FunctionError>> + Send + 'static,
    {
        Self {
            execute: Arc::new(move || Box::pin(execute())),
            reduce: Arc::new(reduce),
            n: n.max(1),
        }
    }

    /// Run all executions and return every result.
    ///
    /// The first failure aborts the remaining executions and propagates.
    pub async fn execute_all(&self) -> Result<Vec<T>, FunctionError> {
        let mut set = JoinSet::new();
        for _ in 0..self.n {
            let execute = Arc::clone(&self.execute);
            set.spawn(async move { execute().await });
        }

        let mut results = Vec::with_capacity(self.n);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(result)) => results.push(result),
                Ok(Err(error)) => {
                    set.abort_all();
                    return Err(error);
                }
                Err(join_error) => {
                    set.abort_all();
                    return Err(FunctionError::fatal(format!(
                        "parallel execution failed: {join_error}"
                    )));
                }
            }
        }
        Ok(results)
    }

    /// Run all executions and reduce their results into one.
    pub async fn execute(&self) -> Result<T, FunctionError> {
        let results = self.execute_all().await?;
        Ok((self.reduce)(results))
    }
}
