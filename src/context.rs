//! Hierarchical execution contexts.
//!
//! Conversation state flows through a tree of contexts. The
//! [`AgentContext`] owns the conversation history and the per-chain,
//! per-iteration chain histories. Each chain execution works on a
//! [`ChainContext`], which sees a snapshot of previously visible messages
//! and collects the messages it produces itself. Composite runners fork a
//! child context per branch and merge the children back; merging is the
//! only path by which child-produced messages become visible to a parent,
//! which keeps parallel branches race-free without locks on the histories.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tracing::debug;

use crate::budget::Budget;
use crate::message::{ChatMessage, ChatMessageKind, ScoredChatMessage};
use crate::monitor::{ExecutionLog, ExecutionScope};

/// Sticky cancellation flag shared by a context subtree.
///
/// The only transition is from not-cancelled to cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a token in the not-cancelled state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the token. Cancellation is sticky and cannot be undone.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether the token has been set.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

fn last_matching<'a, I, P>(messages: I, predicate: P) -> Option<&'a ChatMessage>
where
    I: IntoIterator<Item = &'a ChatMessage>,
    P: Fn(&ChatMessage) -> bool,
{
    let mut result = None;
    for message in messages {
        if predicate(message) {
            result = Some(message);
        }
    }
    result
}

/// Ordered history of messages exchanged between the user and the agent.
#[derive(Debug, Clone, Default)]
pub struct ChatHistory {
    messages: Vec<ChatMessage>,
}

impl ChatHistory {
    /// Create an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a history holding a single user message.
    #[must_use]
    pub fn from_user_message(content: impl Into<String>) -> Self {
        let mut history = Self::new();
        history.add_user_message(content);
        history
    }

    /// Append a user message.
    pub fn add_user_message(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::user(content));
    }

    /// Append an agent message.
    pub fn add_agent_message(&mut self, content: impl Into<String>, data: Option<Value>) {
        self.messages.push(ChatMessage::agent_with_data(content, data));
    }

    /// All messages, oldest first.
    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// The most recent message, if any.
    #[must_use]
    pub fn last_message(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    /// The most recent user message, if any.
    #[must_use]
    pub fn last_user_message(&self) -> Option<&ChatMessage> {
        last_matching(&self.messages, |m| m.is_of_kind(ChatMessageKind::User))
    }

    /// The most recent agent message, if any.
    #[must_use]
    pub fn last_agent_message(&self) -> Option<&ChatMessage> {
        last_matching(&self.messages, |m| m.is_of_kind(ChatMessageKind::Agent))
    }
}

/// Messages produced during one execution of a chain within one iteration.
#[derive(Debug, Clone, Default)]
pub struct ChainHistory {
    messages: Vec<ChatMessage>,
}

impl ChainHistory {
    /// Create an empty chain history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a history from collected messages.
    #[must_use]
    pub fn from_messages(messages: Vec<ChatMessage>) -> Self {
        Self { messages }
    }

    /// All messages, oldest first.
    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// The most recent message, if any.
    #[must_use]
    pub fn last_message(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }
}

/// Execution context of a chain and of every runner beneath it.
///
/// A context sees the messages that were visible when it was forked and
/// appends the messages it produces to its own buffer. Children created
/// with [`ChainContext::fork_for`] share the budget, cancellation token and
/// execution log by reference; messages are never shared.
#[derive(Debug)]
pub struct ChainContext {
    previous: Vec<ChatMessage>,
    current: Vec<ChatMessage>,
    budget: Budget,
    cancellation: CancellationToken,
    log: ExecutionLog,
    path: String,
}

impl ChainContext {
    /// Create a root context over a chat history.
    #[must_use]
    pub fn new(history: &ChatHistory, budget: Budget, path: impl Into<String>) -> Self {
        Self {
            previous: history.messages().to_vec(),
            current: Vec::new(),
            budget,
            cancellation: CancellationToken::new(),
            log: ExecutionLog::new(),
            path: path.into(),
        }
    }

    /// Create a root context holding a single user message.
    #[must_use]
    pub fn from_user_message(content: impl Into<String>, budget: Budget) -> Self {
        Self::new(&ChatHistory::from_user_message(content), budget, "chain")
    }

    pub(crate) fn with_parts(
        previous: Vec<ChatMessage>,
        budget: Budget,
        cancellation: CancellationToken,
        log: ExecutionLog,
        path: String,
    ) -> Self {
        Self {
            previous,
            current: Vec::new(),
            budget,
            cancellation,
            log,
            path,
        }
    }

    /// The budget governing this execution.
    #[must_use]
    pub fn budget(&self) -> &Budget {
        &self.budget
    }

    /// The cancellation token shared by this context subtree.
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Set the cancellation token.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// The shared execution log.
    #[must_use]
    pub fn execution_log(&self) -> &ExecutionLog {
        &self.log
    }

    /// The monitor-tree path of the component owning this context.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Open an execution-log scope for a component nested under this context.
    #[must_use]
    pub fn scope(&self, name: &str) -> ExecutionScope {
        self.log.scope(format!("{}/{}", self.path, name))
    }

    /// Whether execution should stop: the budget expired or the token is set.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        if self.budget.is_expired() {
            debug!(reason = "budget expired", "stopping");
            return true;
        }
        if self.cancellation.is_cancelled() {
            debug!(reason = "cancellation token is set", "stopping");
            return true;
        }
        false
    }

    /// Append a message produced by this branch.
    ///
    /// The message is dropped once the cancellation token is set. Budget
    /// expiry stops runners from starting new work but does not discard the
    /// output of work already in flight, so the turn that overdraws a
    /// consumption limit still records its message.
    pub fn append(&mut self, message: ChatMessage) {
        if !self.cancellation.is_cancelled() {
            self.current.push(message);
        }
    }

    /// Messages produced by this branch so far.
    #[must_use]
    pub fn current_messages(&self) -> &[ChatMessage] {
        &self.current
    }

    /// All messages visible to this branch: the fork-time snapshot followed
    /// by the messages produced here.
    pub fn messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.previous.iter().chain(self.current.iter())
    }

    /// The most recent visible message, if any.
    #[must_use]
    pub fn last_message(&self) -> Option<&ChatMessage> {
        self.current.last().or_else(|| self.previous.last())
    }

    /// The most recent visible user message, if any.
    #[must_use]
    pub fn last_user_message(&self) -> Option<&ChatMessage> {
        last_matching(self.messages(), |m| m.is_of_kind(ChatMessageKind::User))
    }

    /// The most recent visible message from the given skill, if any.
    #[must_use]
    pub fn last_message_from_source(&self, source: &str) -> Option<&ChatMessage> {
        last_matching(self.messages(), |m| m.is_from_source(source))
    }

    /// Fork a child context for the named component.
    ///
    /// The child sees every message visible here and starts with an empty
    /// buffer; budget, cancellation token and log are shared by reference.
    #[must_use]
    pub fn fork_for(&self, name: &str) -> Self {
        self.fork_for_with_budget(name, self.budget.remaining())
    }

    /// Fork a child context, granting it an explicit budget.
    #[must_use]
    pub fn fork_for_with_budget(&self, name: &str, budget: Budget) -> Self {
        Self {
            previous: self.messages().cloned().collect(),
            current: Vec::new(),
            budget,
            cancellation: self.cancellation.clone(),
            log: self.log.clone(),
            path: format!("{}/{}", self.path, name),
        }
    }

    /// Merge child contexts back, appending each child's produced messages
    /// to this context's buffer in the order given.
    pub fn merge(&mut self, children: Vec<ChainContext>) {
        for child in children {
            self.current.extend(child.current);
        }
    }

    /// Build the read-only view handed to a skill.
    #[must_use]
    pub fn to_skill_context(&self, iteration: Option<IterationContext>) -> SkillContext {
        SkillContext {
            messages: self.messages().cloned().collect(),
            budget: self.budget.remaining(),
            cancellation: self.cancellation.clone(),
            iteration,
        }
    }
}

/// Index and value of one iteration of a `ParallelFor` runner.
#[derive(Debug, Clone)]
pub struct IterationContext {
    index: usize,
    value: Value,
}

impl IterationContext {
    /// Create a new iteration context.
    #[must_use]
    pub const fn new(index: usize, value: Value) -> Self {
        Self { index, value }
    }

    /// The zero-based index of the iteration.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// The value produced by the generator for this iteration.
    #[must_use]
    pub const fn value(&self) -> &Value {
        &self.value
    }
}

/// Read-only view of a [`ChainContext`] handed to a skill.
#[derive(Debug)]
pub struct SkillContext {
    messages: Vec<ChatMessage>,
    budget: Budget,
    cancellation: CancellationToken,
    iteration: Option<IterationContext>,
}

impl SkillContext {
    /// All messages visible to the skill, oldest first.
    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// The most recent visible user message, if any.
    #[must_use]
    pub fn last_user_message(&self) -> Option<&ChatMessage> {
        last_matching(&self.messages, |m| m.is_of_kind(ChatMessageKind::User))
    }

    /// The most recent visible message, if any.
    #[must_use]
    pub fn last_message(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    /// The most recent visible message from the given skill, if any.
    #[must_use]
    pub fn last_message_from_source(&self, source: &str) -> Option<&ChatMessage> {
        last_matching(&self.messages, |m| m.is_from_source(source))
    }

    /// The budget governing this execution.
    #[must_use]
    pub fn budget(&self) -> &Budget {
        &self.budget
    }

    /// Whether execution should stop.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.budget.is_expired() || self.cancellation.is_cancelled()
    }

    /// The iteration context, when running inside a `ParallelFor`.
    #[must_use]
    pub const fn iteration(&self) -> Option<&IterationContext> {
        self.iteration.as_ref()
    }
}

/// Execution context of an agent.
///
/// Owns the conversation history, a stack of chain histories per chain
/// (one per iteration in which the chain executed) and the most recent
/// evaluation.
#[derive(Debug)]
pub struct AgentContext {
    chat_history: ChatHistory,
    chain_histories: BTreeMap<String, Vec<ChainHistory>>,
    evaluation_history: Vec<Vec<ScoredChatMessage>>,
    log: ExecutionLog,
    iteration: usize,
}

impl AgentContext {
    /// Create a context over an existing chat history.
    #[must_use]
    pub fn new(chat_history: ChatHistory) -> Self {
        Self {
            chat_history,
            chain_histories: BTreeMap::new(),
            evaluation_history: Vec::new(),
            log: ExecutionLog::new(),
            iteration: 0,
        }
    }

    /// Create a context holding a single user message.
    #[must_use]
    pub fn from_user_message(content: impl Into<String>) -> Self {
        Self::new(ChatHistory::from_user_message(content))
    }

    /// The conversation history.
    #[must_use]
    pub fn chat_history(&self) -> &ChatHistory {
        &self.chat_history
    }

    /// Mutable access to the conversation history, for appending turns
    /// between agent executions.
    pub fn chat_history_mut(&mut self) -> &mut ChatHistory {
        &mut self.chat_history
    }

    /// The shared execution log.
    #[must_use]
    pub fn execution_log(&self) -> &ExecutionLog {
        &self.log
    }

    /// Number of iterations started so far.
    #[must_use]
    pub const fn iteration_count(&self) -> usize {
        self.iteration
    }

    /// Start a new iteration.
    pub fn new_iteration(&mut self) {
        self.iteration += 1;
    }

    /// Create the chain context for one execution of the named chain.
    ///
    /// The context sees the conversation history followed by the chain's
    /// previous iterations, carries a fresh cancellation token and the given
    /// budget, and starts collecting into an empty buffer. An optional
    /// initial state message is placed in the buffer so downstream runners
    /// observe it as produced output.
    #[must_use]
    pub fn begin_chain(
        &self,
        chain_name: &str,
        budget: Budget,
        initial_state: Option<ChatMessage>,
    ) -> ChainContext {
        let mut previous = self.chat_history.messages().to_vec();
        if let Some(histories) = self.chain_histories.get(chain_name) {
            for history in histories {
                previous.extend(history.messages().iter().cloned());
            }
        }
        let mut context = ChainContext::with_parts(
            previous,
            budget,
            CancellationToken::new(),
            self.log.clone(),
            format!("agent/iterations[{}]/{chain_name}", self.iteration.saturating_sub(1)),
        );
        if let Some(message) = initial_state {
            context.append(message);
        }
        context
    }

    /// Commit the messages a chain execution produced, appending a new
    /// history for the chain.
    pub fn end_chain(&mut self, chain_name: &str, context: ChainContext) {
        self.chain_histories
            .entry(chain_name.to_string())
            .or_default()
            .push(ChainHistory::from_messages(context.current));
    }

    /// Names of the chains that have executed at least once.
    pub fn chain_names(&self) -> impl Iterator<Item = &str> {
        self.chain_histories.keys().map(String::as_str)
    }

    /// All histories recorded for the named chain.
    #[must_use]
    pub fn chain_histories(&self, chain_name: &str) -> &[ChainHistory] {
        self.chain_histories
            .get(chain_name)
            .map_or(&[], Vec::as_slice)
    }

    /// The most recent history recorded for the named chain, if any.
    #[must_use]
    pub fn last_chain_history(&self, chain_name: &str) -> Option<&ChainHistory> {
        self.chain_histories
            .get(chain_name)
            .and_then(|histories| histories.last())
    }

    /// Fork a read-only view of this context for one stage of the agent
    /// loop, scoped under the stage's name in the execution log.
    ///
    /// Histories and the log are shared by reference; the borrow keeps the
    /// stage from mutating them. The granted budget is a view over the
    /// shared ledger, so consumptions charged by the stage bubble into the
    /// agent's budget.
    #[must_use]
    pub fn fork_for(&self, name: &str, budget: Budget) -> AgentStageContext<'_> {
        AgentStageContext {
            context: self,
            budget,
            path: format!(
                "agent/iterations[{}]/{name}",
                self.iteration.saturating_sub(1)
            ),
        }
    }

    /// Record the evaluation produced in the current iteration.
    pub fn set_evaluation(&mut self, scored: Vec<ScoredChatMessage>) {
        self.evaluation_history.push(scored);
    }

    /// The most recent evaluation, if any.
    #[must_use]
    pub fn evaluation(&self) -> Option<&[ScoredChatMessage]> {
        self.evaluation_history.last().map(Vec::as_slice)
    }

    /// Evaluations of every iteration so far.
    #[must_use]
    pub fn evaluation_history(&self) -> &[Vec<ScoredChatMessage>] {
        &self.evaluation_history
    }
}

/// Scoped, read-only view of an [`AgentContext`] handed to one stage of
/// the agent loop (controller or evaluator).
///
/// Created by [`AgentContext::fork_for`]. The view carries the stage's
/// budget and its path in the monitor tree; conversation and chain
/// histories are read through the shared context.
#[derive(Debug)]
pub struct AgentStageContext<'a> {
    context: &'a AgentContext,
    budget: Budget,
    path: String,
}

impl AgentStageContext<'_> {
    /// The conversation history.
    #[must_use]
    pub fn chat_history(&self) -> &ChatHistory {
        self.context.chat_history()
    }

    /// Names of the chains that have executed at least once.
    pub fn chain_names(&self) -> impl Iterator<Item = &str> {
        self.context.chain_names()
    }

    /// All histories recorded for the named chain.
    #[must_use]
    pub fn chain_histories(&self, chain_name: &str) -> &[ChainHistory] {
        self.context.chain_histories(chain_name)
    }

    /// The most recent history recorded for the named chain, if any.
    #[must_use]
    pub fn last_chain_history(&self, chain_name: &str) -> Option<&ChainHistory> {
        self.context.last_chain_history(chain_name)
    }

    /// The most recent evaluation, if any.
    #[must_use]
    pub fn evaluation(&self) -> Option<&[ScoredChatMessage]> {
        self.context.evaluation()
    }

    /// The budget granted to this stage.
    #[must_use]
    pub fn budget(&self) -> &Budget {
        &self.budget
    }

    /// The stage's path in the monitor tree.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Open an execution-log scope recording this stage's execution.
    #[must_use]
    pub fn scope(&self) -> ExecutionScope {
        self.context.execution_log().scope(self.path.clone())
    }

    /// Build the context charging this stage's LLM calls to its budget.
    #[must_use]
    pub fn llm_context(&self) -> LlmContext {
        LlmContext::new(self.budget.remaining())
    }
}

/// Context handed to an LLM call to track its resource usage.
#[derive(Debug, Clone)]
pub struct LlmContext {
    budget: Budget,
}

impl LlmContext {
    /// Create a context charging the given budget.
    #[must_use]
    pub const fn new(budget: Budget) -> Self {
        Self { budget }
    }

    /// Create a context with an unconstrained budget.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(Budget::infinite())
    }

    /// Create a context charging a chain context's budget.
    #[must_use]
    pub fn from_chain(context: &ChainContext) -> Self {
        Self::new(context.budget().remaining())
    }

    /// Create a context charging a skill context's budget.
    #[must_use]
    pub fn from_skill(context: &SkillContext) -> Self {
        Self::new(context.budget().remaining())
    }

    /// The budget charged by the call.
    #[must_use]
    pub fn budget(&self) -> &Budget {
        &self.budget
    }
}
