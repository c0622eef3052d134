#![cfg_attr(docsrs, feature(doc_cfg))]
//! Council is an engine for composing multi-step LLM-backed agents.
//!
//! An [`Agent`](agent::Agent) iterates over a set of named
//! [`Chain`](chain::Chain)s: a controller plans which chains run, each
//! chain executes a tree of [`Runner`](runner::Runner)s under budget,
//! timeout and cancellation constraints, an evaluator scores the candidate
//! answers and a filter selects the final subset. Model access goes
//! through a provider-agnostic [`Llm`](llm::Llm) wrapped by a middleware
//! chain with retry, caching and logging, and responses can be parsed into
//! typed records with bounded self-correction.

// Execution primitives
pub mod budget;
pub mod context;
pub mod message;
pub mod monitor;

// Runner tree and chains
pub mod chain;
pub mod runner;
pub mod skills;

// Model access
pub mod llm;

// Agent loop stages
pub mod agent;
pub mod controller;
pub mod evaluator;
pub mod filter;

// Configuration objects
pub mod config;
pub mod dataset;
pub mod prompt;

pub mod error;
pub mod prelude;

// Re-export commonly used types
pub use agent::{Agent, AgentResult};
pub use budget::{Budget, Consumption};
pub use chain::Chain;
pub use context::{AgentContext, AgentStageContext, ChainContext, ChatHistory, SkillContext};
pub use error::{AgentError, FunctionError, LlmError, RunnerError, SkillError};
pub use message::{ChatMessage, ChatMessageKind, ScoredChatMessage};
