//! Interceptors around LLM chat calls.
//!
//! A [`LlmMiddlewareChain`] composes middlewares outside-in around an
//! [`Llm`]: the first middleware added observes the request first and the
//! response last. The innermost handler performs the actual chat call and
//! measures its wall duration.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::context::LlmContext;
use crate::error::LlmError;
use crate::llm::{Llm, LlmCallOptions, LlmConfiguration, LlmMessage, LlmResult};

/// One chat request travelling through a middleware chain.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// The context charged for the call.
    pub context: LlmContext,
    /// The chat payload.
    pub messages: Vec<LlmMessage>,
    /// Extra provider options.
    pub options: LlmCallOptions,
}

impl LlmRequest {
    /// Create a request.
    #[must_use]
    pub const fn new(
        context: LlmContext,
        messages: Vec<LlmMessage>,
        options: LlmCallOptions,
    ) -> Self {
        Self {
            context,
            messages,
            options,
        }
    }

    /// Create a request with an unconstrained context and no options.
    #[must_use]
    pub fn from_messages(messages: Vec<LlmMessage>) -> Self {
        Self::new(LlmContext::empty(), messages, LlmCallOptions::new())
    }
}

/// The response observed by a middleware chain.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    result: LlmResult,
    duration: Duration,
}

impl LlmResponse {
    /// Create a response.
    #[must_use]
    pub const fn new(result: LlmResult, duration: Duration) -> Self {
        Self { result, duration }
    }

    /// The call's result.
    #[must_use]
    pub const fn result(&self) -> &LlmResult {
        &self.result
    }

    /// The first choice of the result.
    #[must_use]
    pub fn first_choice(&self) -> &str {
        self.result.first_choice()
    }

    /// How long the call took. Zero for replayed cache entries.
    #[must_use]
    pub const fn duration(&self) -> Duration {
        self.duration
    }
}

/// An interceptor around LLM chat calls.
#[async_trait]
pub trait LlmMiddleware: Send + Sync {
    /// Handle the request, delegating to `next` to continue the chain.
    async fn handle(
        &self,
        llm: &dyn Llm,
        next: Next<'_>,
        request: LlmRequest,
    ) -> Result<LlmResponse, LlmError>;
}

/// The remainder of a middleware chain.
pub struct Next<'a> {
    llm: &'a dyn Llm,
    middlewares: &'a [Arc<dyn LlmMiddleware>],
}

impl std::fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &self.middlewares.len())
            .finish()
    }
}

impl Next<'_> {
    /// Run the rest of the chain.
    ///
    /// When no middleware remains, performs the chat call and measures its
    /// wall duration.
    pub async fn run(self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        match self.middlewares.split_first() {
            Some((first, rest)) => {
                let next = Next {
                    llm: self.llm,
                    middlewares: rest,
                };
                first.handle(self.llm, next, request).await
            }
            None => {
                let start = Instant::now();
                let result = self
                    .llm
                    .post_chat_request(&request.context, &request.messages, &request.options)
                    .await?;
                Ok(LlmResponse::new(result, start.elapsed()))
            }
        }
    }
}

/// An [`Llm`] wrapped by an ordered list of middlewares.
pub struct LlmMiddlewareChain {
    llm: Arc<dyn Llm>,
    middlewares: Vec<Arc<dyn LlmMiddleware>>,
}

impl std::fmt::Debug for LlmMiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmMiddlewareChain")
            .field("llm", &self.llm.name())
            .field("middlewares", &self.middlewares.len())
            .finish()
    }
}

impl LlmMiddlewareChain {
    /// Create a chain with no middlewares.
    #[must_use]
    pub fn new(llm: Arc<dyn Llm>) -> Self {
        Self {
            llm,
            middlewares: Vec::new(),
        }
    }

    /// Append a middleware. Middlewares added first wrap the others.
    pub fn add_middleware(&mut self, middleware: Arc<dyn LlmMiddleware>) {
        self.middlewares.push(middleware);
    }

    /// Append a middleware, builder-style.
    #[must_use]
    pub fn with_middleware(mut self, middleware: Arc<dyn LlmMiddleware>) -> Self {
        self.add_middleware(middleware);
        self
    }

    /// The wrapped model.
    #[must_use]
    pub fn llm(&self) -> &Arc<dyn Llm> {
        &self.llm
    }

    /// Execute a request through the chain.
    pub async fn execute(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        let next = Next {
            llm: self.llm.as_ref(),
            middlewares: &self.middlewares,
        };
        next.run(request).await
    }
}

/// Retries failed calls a fixed number of times with a fixed delay.
pub struct LlmRetryMiddleware {
    retries: usize,
    delay: Duration,
    filter: Option<Box<dyn Fn(&LlmError) -> bool + Send + Sync>>,
}

impl std::fmt::Debug for LlmRetryMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmRetryMiddleware")
            .field("retries", &self.retries)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

impl LlmRetryMiddleware {
    /// Create a retry middleware attempting at most `retries` calls.
    #[must_use]
    pub const fn new(retries: usize, delay: Duration) -> Self {
        Self {
            retries,
            delay,
            filter: None,
        }
    }

    /// Retry only errors accepted by the filter; others propagate
    /// immediately.
    #[must_use]
    pub fn with_filter(
        mut self,
        filter: impl Fn(&LlmError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }
}

#[async_trait]
impl LlmMiddleware for LlmRetryMiddleware {
    async fn handle(
        &self,
        llm: &dyn Llm,
        next: Next<'_>,
        request: LlmRequest,
    ) -> Result<LlmResponse, LlmError> {
        let Next { llm: inner, middlewares } = next;
        let mut errors = Vec::new();

        for attempt in 1..=self.retries.max(1) {
            let next = Next {
                llm: inner,
                middlewares,
            };
            match next.run(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    if let Some(filter) = &self.filter {
                        if !filter(&error) {
                            return Err(error);
                        }
                    }
                    warn!(llm = llm.name(), attempt, error = %error, "llm call failed");
                    errors.push(error);
                    if attempt < self.retries {
                        tokio::time::sleep(self.delay).await;
                    }
                }
            }
        }

        Err(LlmError::OutOfRetries {
            name: llm.name().to_string(),
            attempts: errors.len(),
            errors,
        })
    }
}

/// How much a logging middleware writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmLoggingStrategy {
    /// Basic request/response info without content.
    Minimal,
    /// Basic info plus consumption details.
    MinimalWithConsumptions,
    /// Full request/response content.
    Verbose,
    /// Full content plus consumption details.
    VerboseWithConsumptions,
}

impl LlmLoggingStrategy {
    /// Whether the strategy writes full message content.
    #[must_use]
    pub const fn is_verbose(&self) -> bool {
        matches!(self, Self::Verbose | Self::VerboseWithConsumptions)
    }

    /// Whether the strategy writes consumption details.
    #[must_use]
    pub const fn has_consumptions(&self) -> bool {
        matches!(
            self,
            Self::MinimalWithConsumptions | Self::VerboseWithConsumptions
        )
    }
}

fn format_request(strategy: LlmLoggingStrategy, name: &str, request: &LlmRequest) -> String {
    if strategy.is_verbose() {
        let body: Vec<String> = request.messages.iter().map(LlmMessage::format).collect();
        format!("LLM input for {name}:\n{}", body.join("\n\n"))
    } else {
        format!("LLM input for {name}: {} message(s)", request.messages.len())
    }
}

fn format_response(strategy: LlmLoggingStrategy, name: &str, response: &LlmResponse) -> String {
    let header = format!(
        "LLM output for {name} received in {:.4} seconds, {} choice(s) returned",
        response.duration().as_secs_f64(),
        response.result().choices().len()
    );
    if strategy.is_verbose() {
        format!("{header}:\n{}", response.first_choice())
    } else {
        header
    }
}

fn format_consumptions(name: &str, response: &LlmResponse) -> Vec<String> {
    response
        .result()
        .consumptions()
        .iter()
        .map(|consumption| format!("Consumption for {name}: {consumption}"))
        .collect()
}

/// Logs requests and responses through `tracing`.
#[derive(Debug)]
pub struct LlmLoggingMiddleware {
    strategy: LlmLoggingStrategy,
    component_name: Option<String>,
}

impl LlmLoggingMiddleware {
    /// Create a logging middleware with the given strategy.
    #[must_use]
    pub const fn new(strategy: LlmLoggingStrategy) -> Self {
        Self {
            strategy,
            component_name: None,
        }
    }

    /// Log under an explicit component name instead of the model name.
    #[must_use]
    pub fn with_component_name(mut self, name: impl Into<String>) -> Self {
        self.component_name = Some(name.into());
        self
    }

    fn name<'a>(&'a self, llm: &'a dyn Llm) -> &'a str {
        self.component_name.as_deref().unwrap_or_else(|| llm.name())
    }
}

#[async_trait]
impl LlmMiddleware for LlmLoggingMiddleware {
    async fn handle(
        &self,
        llm: &dyn Llm,
        next: Next<'_>,
        request: LlmRequest,
    ) -> Result<LlmResponse, LlmError> {
        let name = self.name(llm).to_string();
        info!("{}", format_request(self.strategy, &name, &request));
        let response = next.run(request).await?;
        info!("{}", format_response(self.strategy, &name, &response));
        if self.strategy.has_consumptions() {
            for line in format_consumptions(&name, &response) {
                info!("{line}");
            }
        }
        Ok(response)
    }
}

enum FileSink {
    /// Append everything to one file.
    Single(PathBuf),
    /// One file per request, named after the request's timestamp.
    PerRequest {
        directory: PathBuf,
        prefix: String,
        sequence: AtomicU64,
    },
}

/// Logs requests and responses by appending to a log file.
///
/// Writes are serialized by a mutex so concurrent requests append whole
/// records.
pub struct LlmFileLoggingMiddleware {
    strategy: LlmLoggingStrategy,
    component_name: Option<String>,
    sink: FileSink,
    lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for LlmFileLoggingMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmFileLoggingMiddleware")
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

impl LlmFileLoggingMiddleware {
    /// Log every request into the given file.
    #[must_use]
    pub fn new(log_file: impl Into<PathBuf>, strategy: LlmLoggingStrategy) -> Self {
        Self {
            strategy,
            component_name: None,
            sink: FileSink::Single(log_file.into()),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Log each request into its own file under `directory`.
    #[must_use]
    pub fn per_request(
        directory: impl Into<PathBuf>,
        prefix: impl Into<String>,
        strategy: LlmLoggingStrategy,
    ) -> Self {
        Self {
            strategy,
            component_name: None,
            sink: FileSink::PerRequest {
                directory: directory.into(),
                prefix: prefix.into(),
                sequence: AtomicU64::new(0),
            },
            lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Log under an explicit component name instead of the model name.
    #[must_use]
    pub fn with_component_name(mut self, name: impl Into<String>) -> Self {
        self.component_name = Some(name.into());
        self
    }

    fn target_file(&self) -> PathBuf {
        match &self.sink {
            FileSink::Single(path) => path.clone(),
            FileSink::PerRequest {
                directory,
                prefix,
                sequence,
            } => {
                let epoch = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                let index = sequence.fetch_add(1, Ordering::SeqCst);
                directory.join(format!("{prefix}{epoch}_{index}.log"))
            }
        }
    }

    async fn append(&self, path: &std::path::Path, content: &str) -> Result<(), std::io::Error> {
        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .await?;
        file.write_all(format!("\n{content}").as_bytes()).await?;
        file.flush().await
    }
}

#[async_trait]
impl LlmMiddleware for LlmFileLoggingMiddleware {
    async fn handle(
        &self,
        llm: &dyn Llm,
        next: Next<'_>,
        request: LlmRequest,
    ) -> Result<LlmResponse, LlmError> {
        let name = self
            .component_name
            .clone()
            .unwrap_or_else(|| llm.name().to_string());
        let path = self.target_file();

        let mut content = format_request(self.strategy, &name, &request);
        let response = next.run(request).await?;
        content.push('\n');
        content.push_str(&format_response(self.strategy, &name, &response));
        if self.strategy.has_consumptions() {
            for line in format_consumptions(&name, &response) {
                content.push('\n');
                content.push_str(&line);
            }
        }

        if let Err(error) = self.append(&path, &content).await {
            warn!(path = %path.display(), error = %error, "failed to append llm log");
        }
        Ok(response)
    }
}

struct CacheEntry {
    response: LlmResponse,
    timestamp: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn new(response: &LlmResponse, ttl: Duration) -> Self {
        // Replayed responses report zero duration and `cached_` units.
        Self {
            response: LlmResponse::new(response.result().to_cached(), Duration::ZERO),
            timestamp: Instant::now(),
            ttl,
        }
    }

    fn is_expired(&self) -> bool {
        self.timestamp.elapsed() >= self.ttl
    }

    fn renew(&mut self) {
        self.timestamp = Instant::now();
    }
}

/// Caches responses keyed by configuration, messages and options.
///
/// Entries live in a sliding-window TTL: a hit renews the entry and moves
/// it to the most-recently-used position. The cache never holds more than
/// its configured number of entries; inserting beyond that evicts the
/// least-recently-used one. Expired entries are removed lazily at the
/// start of each call.
pub struct LlmCachingMiddleware {
    ttl: Duration,
    cache: Mutex<LruCache<String, CacheEntry>>,
}

impl std::fmt::Debug for LlmCachingMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmCachingMiddleware")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl LlmCachingMiddleware {
    /// Create a caching middleware.
    #[must_use]
    pub fn new(ttl: Duration, cache_limit_size: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_limit_size.max(1)).expect("positive cache size");
        Self {
            ttl,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Compute the stable cache key of a request against a configuration.
    #[must_use]
    pub fn request_hash(request: &LlmRequest, configuration: &LlmConfiguration) -> String {
        let normalized: Vec<String> =
            request.messages.iter().map(LlmMessage::normalized).collect();
        let payload = serde_json::json!({
            "configuration": configuration.as_string_map(),
            "messages": normalized,
            "options": request.options,
        });
        let digest = Sha256::digest(payload.to_string().as_bytes());
        hex::encode(digest)
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.lock().expect("cache lock poisoned").len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached entry.
    pub fn clear(&self) {
        self.cache.lock().expect("cache lock poisoned").clear();
    }

    fn remove_expired(cache: &mut LruCache<String, CacheEntry>) {
        let expired: Vec<String> = cache
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            cache.pop(&key);
        }
    }

    fn lookup(&self, key: &str) -> Option<LlmResponse> {
        let mut cache = self.cache.lock().expect("cache lock poisoned");
        Self::remove_expired(&mut cache);
        // A hit renews the sliding window and promotes the entry to MRU.
        cache.get_mut(key).map(|entry| {
            entry.renew();
            entry.response.clone()
        })
    }

    fn insert(&self, key: String, response: &LlmResponse) {
        let mut cache = self.cache.lock().expect("cache lock poisoned");
        cache.put(key, CacheEntry::new(response, self.ttl));
    }
}

#[async_trait]
impl LlmMiddleware for LlmCachingMiddleware {
    async fn handle(
        &self,
        llm: &dyn Llm,
        next: Next<'_>,
        request: LlmRequest,
    ) -> Result<LlmResponse, LlmError> {
        let key = Self::request_hash(&request, &llm.configuration());
        if let Some(response) = self.lookup(&key) {
            debug!(llm = llm.name(), "llm cache hit");
            return Ok(response);
        }

        let response = next.run(request).await?;
        self.insert(key, &response);
        Ok(response)
    }
}

/// Applies a persistent mutation to the model's configuration before each
/// call.
pub struct LlmConfigurationModifierMiddleware {
    mutator: Box<dyn Fn(&mut LlmConfiguration) + Send + Sync>,
}

impl std::fmt::Debug for LlmConfigurationModifierMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfigurationModifierMiddleware")
            .finish_non_exhaustive()
    }
}

impl LlmConfigurationModifierMiddleware {
    /// Create a configuration-modifier middleware.
    #[must_use]
    pub fn new(mutator: impl Fn(&mut LlmConfiguration) + Send + Sync + 'static) -> Self {
        Self {
            mutator: Box::new(mutator),
        }
    }
}

#[async_trait]
impl LlmMiddleware for LlmConfigurationModifierMiddleware {
    async fn handle(
        &self,
        llm: &dyn Llm,
        next: Next<'_>,
        request: LlmRequest,
    ) -> Result<LlmResponse, LlmError> {
        llm.update_configuration(self.mutator.as_ref());
        next.run(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::MockLlm;

    fn request(content: &str) -> LlmRequest {
        LlmRequest::from_messages(vec![LlmMessage::user(content)])
    }

    #[tokio::test]
    async fn test_innermost_handler_performs_the_call() {
        let chain = LlmMiddlewareChain::new(Arc::new(MockLlm::from_response("pong")));
        let response = chain.execute(request("ping")).await.expect("call succeeds");
        assert_eq!(response.first_choice(), "pong");
        assert!(!response.result().consumptions().is_empty());
    }

    #[tokio::test]
    async fn test_retry_middleware_exhausts_attempts() {
        let llm = MockLlm::failing(|| LlmError::Call {
            name: "mock".to_string(),
            code: 503,
            message: "unavailable".to_string(),
        });
        let chain = LlmMiddlewareChain::new(Arc::new(llm)).with_middleware(Arc::new(
            LlmRetryMiddleware::new(3, Duration::from_millis(1)),
        ));

        let error = chain.execute(request("ping")).await.expect_err("out of retries");
        match error {
            LlmError::OutOfRetries { attempts, errors, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(errors.len(), 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_retry_filter_propagates_unmatched_errors() {
        let llm = MockLlm::failing(|| LlmError::Call {
            name: "mock".to_string(),
            code: 401,
            message: "unauthorized".to_string(),
        });
        let chain = LlmMiddlewareChain::new(Arc::new(llm)).with_middleware(Arc::new(
            LlmRetryMiddleware::new(5, Duration::from_millis(1)).with_filter(|error| {
                matches!(error, LlmError::Call { code, .. } if LlmError::is_retryable_status(*code))
            }),
        ));

        let error = chain.execute(request("ping")).await.expect_err("fails fast");
        assert!(matches!(error, LlmError::Call { code: 401, .. }));
    }

    #[tokio::test]
    async fn test_cache_hit_replays_with_zero_duration_and_cached_units() {
        let chain = LlmMiddlewareChain::new(Arc::new(MockLlm::from_response("answer")))
            .with_middleware(Arc::new(LlmCachingMiddleware::new(
                Duration::from_secs(60),
                10,
            )));

        let first = chain.execute(request("same")).await.expect("first call");
        let second = chain.execute(request("same")).await.expect("second call");

        assert_eq!(first.first_choice(), second.first_choice());
        assert_eq!(second.duration(), Duration::ZERO);
        assert!(!second.result().consumptions().is_empty());
        assert!(
            second
                .result()
                .consumptions()
                .iter()
                .all(|c| c.unit.starts_with("cached_"))
        );
    }

    #[tokio::test]
    async fn test_cache_misses_on_different_messages() {
        let llm = Arc::new(MockLlm::from_responses(vec![
            "first".to_string(),
            "second".to_string(),
        ]));
        let chain = LlmMiddlewareChain::new(llm).with_middleware(Arc::new(
            LlmCachingMiddleware::new(Duration::from_secs(60), 10),
        ));

        let first = chain.execute(request("a")).await.expect("first call");
        let second = chain.execute(request("b")).await.expect("second call");
        assert_eq!(first.first_choice(), "first");
        assert_eq!(second.first_choice(), "second");
    }

    #[tokio::test]
    async fn test_cache_respects_size_bound() {
        let cache = Arc::new(LlmCachingMiddleware::new(Duration::from_secs(60), 3));
        let chain = LlmMiddlewareChain::new(Arc::new(MockLlm::from_response("x")))
            .with_middleware(Arc::clone(&cache) as Arc<dyn LlmMiddleware>);

        for index in 0..8 {
            chain
                .execute(request(&format!("prompt {index}")))
                .await
                .expect("call succeeds");
            assert!(cache.len() <= 3);
        }
        assert_eq!(cache.len(), 3);
    }

    #[tokio::test]
    async fn test_cache_entries_expire() {
        let cache = Arc::new(LlmCachingMiddleware::new(Duration::from_millis(30), 10));
        let llm = Arc::new(MockLlm::from_responses(vec![
            "first".to_string(),
            "second".to_string(),
        ]));
        let chain = LlmMiddlewareChain::new(llm)
            .with_middleware(Arc::clone(&cache) as Arc<dyn LlmMiddleware>);

        let first = chain.execute(request("same")).await.expect("first call");
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = chain.execute(request("same")).await.expect("second call");
        assert_eq!(first.first_choice(), "first");
        assert_eq!(second.first_choice(), "second");
    }

    #[tokio::test]
    async fn test_file_logging_appends_request_and_response() {
        use assert_fs::prelude::*;

        let dir = assert_fs::TempDir::new().expect("temp dir");
        let log_file = dir.child("llm.log");
        let chain = LlmMiddlewareChain::new(Arc::new(MockLlm::from_response("logged answer")))
            .with_middleware(Arc::new(LlmFileLoggingMiddleware::new(
                log_file.path(),
                LlmLoggingStrategy::VerboseWithConsumptions,
            )));

        chain.execute(request("log me")).await.expect("call succeeds");

        let content = std::fs::read_to_string(log_file.path()).expect("log written");
        assert!(content.contains("LLM input for mock"));
        assert!(content.contains("logged answer"));
        assert!(content.contains("Consumption for mock"));
    }

    #[tokio::test]
    async fn test_configuration_modifier_is_persistent() {
        let llm = Arc::new(MockLlm::from_response("ok"));
        let chain = LlmMiddlewareChain::new(Arc::clone(&llm) as Arc<dyn Llm>).with_middleware(
            Arc::new(LlmConfigurationModifierMiddleware::new(|configuration| {
                configuration.parameters.temperature = 1.5;
            })),
        );

        chain.execute(request("ping")).await.expect("call succeeds");
        assert_eq!(llm.configuration().parameters.temperature, 1.5);
    }
}
