//! Scripted model implementation for testing.
//!
//! [`MockLlm`] returns predefined responses without any network call,
//! cycling through them in sequence, and reports the standard consumption
//! set so budget accounting and caching behave as with a real provider.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::context::LlmContext;
use crate::error::LlmError;
use crate::llm::{
    Llm, LlmCallOptions, LlmConfiguration, LlmMessage, LlmResult, standard_consumptions,
};

type MockAction = Box<dyn Fn(&[LlmMessage]) -> Result<String, LlmError> + Send + Sync>;

/// A scripted chat model.
pub struct MockLlm {
    name: String,
    configuration: Mutex<LlmConfiguration>,
    action: MockAction,
    calls: AtomicUsize,
}

impl std::fmt::Debug for MockLlm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockLlm")
            .field("name", &self.name)
            .field("calls", &self.calls.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl MockLlm {
    /// Create a mock computing each response from the request messages.
    #[must_use]
    pub fn new(action: impl Fn(&[LlmMessage]) -> Result<String, LlmError> + Send + Sync + 'static) -> Self {
        Self {
            name: "mock".to_string(),
            configuration: Mutex::new(LlmConfiguration::new("mockSpec", "mock-model")),
            action: Box::new(action),
            calls: AtomicUsize::new(0),
        }
    }

    /// Create a mock always returning the same response.
    #[must_use]
    pub fn from_response(response: impl Into<String>) -> Self {
        let response = response.into();
        Self::new(move |_| Ok(response.clone()))
    }

    /// Create a mock cycling through the given responses.
    #[must_use]
    pub fn from_responses(responses: Vec<String>) -> Self {
        let index = AtomicUsize::new(0);
        Self::new(move |_| {
            let turn = index.fetch_add(1, Ordering::SeqCst);
            Ok(responses
                .get(turn % responses.len().max(1))
                .cloned()
                .unwrap_or_default())
        })
    }

    /// Create a mock failing every call with the produced error.
    #[must_use]
    pub fn failing(error: impl Fn() -> LlmError + Send + Sync + 'static) -> Self {
        Self::new(move |_| Err(error()))
    }

    /// Override the mock's name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Override the mock's model identifier.
    #[must_use]
    pub fn with_model(self, model: impl Into<String>) -> Self {
        self.configuration
            .lock()
            .expect("mock configuration lock poisoned")
            .model = model.into();
        self
    }

    /// Number of chat calls performed so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn approximate_tokens(text: &str) -> f64 {
    text.split_whitespace().count() as f64
}

#[async_trait]
impl Llm for MockLlm {
    fn name(&self) -> &str {
        &self.name
    }

    fn configuration(&self) -> LlmConfiguration {
        self.configuration
            .lock()
            .expect("mock configuration lock poisoned")
            .clone()
    }

    fn update_configuration(&self, mutator: &(dyn Fn(&mut LlmConfiguration) + Send + Sync)) {
        let mut configuration = self
            .configuration
            .lock()
            .expect("mock configuration lock poisoned");
        mutator(&mut configuration);
    }

    async fn chat(
        &self,
        _context: &LlmContext,
        messages: &[LlmMessage],
        _options: &LlmCallOptions,
    ) -> Result<LlmResult, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let choice = (self.action)(messages)?;

        let prompt_tokens: f64 = messages
            .iter()
            .map(|message| approximate_tokens(&message.content))
            .sum();
        let completion_tokens = approximate_tokens(&choice);
        let consumptions =
            standard_consumptions(&self.name, 0.001, prompt_tokens, completion_tokens);

        Ok(LlmResult::new(vec![choice]).with_consumptions(consumptions))
    }
}
