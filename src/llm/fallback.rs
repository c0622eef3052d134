//! Primary/fallback model combinator.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::context::LlmContext;
use crate::error::LlmError;
use crate::llm::{Llm, LlmCallOptions, LlmConfiguration, LlmMessage, LlmResult};

/// Combines two models, switching to the fallback once the primary fails.
///
/// Retryable provider statuses (408, 429, 503, 504) are retried against
/// the primary with exponential backoff before falling back. When both
/// models fail, the fallback's error is reported with the primary's as its
/// cause.
pub struct LlmFallback {
    llm: Arc<dyn Llm>,
    fallback: Arc<dyn Llm>,
    retry_before_fallback: usize,
}

impl std::fmt::Debug for LlmFallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmFallback")
            .field("primary", &self.llm.name())
            .field("fallback", &self.fallback.name())
            .field("retry_before_fallback", &self.retry_before_fallback)
            .finish()
    }
}

impl LlmFallback {
    /// Create a fallback combinator with the default retry count.
    #[must_use]
    pub fn new(llm: Arc<dyn Llm>, fallback: Arc<dyn Llm>) -> Self {
        Self::with_retries(llm, fallback, 2)
    }

    /// Create a fallback combinator retrying the primary `retry_before_fallback`
    /// times.
    #[must_use]
    pub fn with_retries(
        llm: Arc<dyn Llm>,
        fallback: Arc<dyn Llm>,
        retry_before_fallback: usize,
    ) -> Self {
        Self {
            llm,
            fallback,
            retry_before_fallback: retry_before_fallback.max(1),
        }
    }

    /// The primary model.
    #[must_use]
    pub fn llm(&self) -> &Arc<dyn Llm> {
        &self.llm
    }

    /// The fallback model.
    #[must_use]
    pub fn fallback(&self) -> &Arc<dyn Llm> {
        &self.fallback
    }

    async fn call_primary_with_retry(
        &self,
        context: &LlmContext,
        messages: &[LlmMessage],
        options: &LlmCallOptions,
    ) -> Result<LlmResult, LlmError> {
        let mut attempt = 0usize;
        loop {
            match self.llm.post_chat_request(context, messages, options).await {
                Ok(result) => return Ok(result),
                Err(error) => {
                    attempt += 1;
                    let retryable = matches!(
                        &error,
                        LlmError::Call { code, .. } if LlmError::is_retryable_status(*code)
                    );
                    if !retryable || attempt >= self.retry_before_fallback {
                        return Err(error);
                    }
                    let backoff = Duration::from_secs_f64(1.25_f64.powi(attempt as i32));
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

#[async_trait]
impl Llm for LlmFallback {
    fn name(&self) -> &str {
        self.llm.name()
    }

    fn configuration(&self) -> LlmConfiguration {
        self.llm.configuration()
    }

    /// Delegates without re-charging: the selected inner model already
    /// charges its consumptions to the context budget.
    async fn post_chat_request(
        &self,
        context: &LlmContext,
        messages: &[LlmMessage],
        options: &LlmCallOptions,
    ) -> Result<LlmResult, LlmError> {
        self.chat(context, messages, options).await
    }

    async fn chat(
        &self,
        context: &LlmContext,
        messages: &[LlmMessage],
        options: &LlmCallOptions,
    ) -> Result<LlmResult, LlmError> {
        let primary_error = match self.call_primary_with_retry(context, messages, options).await {
            Ok(result) => return Ok(result),
            Err(error) => error,
        };

        warn!(
            primary = self.llm.name(),
            fallback = self.fallback.name(),
            error = %primary_error,
            "primary llm failed, switching to fallback"
        );
        match self
            .fallback
            .post_chat_request(context, messages, options)
            .await
        {
            Ok(result) => Ok(result),
            Err(fallback_error) => Err(LlmError::FallbackFailed {
                fallback: Box::new(fallback_error),
                primary: Box::new(primary_error),
            }),
        }
    }
}
