//! Convenient imports for building agents.
//!
//! ```rust,ignore
//! use council::prelude::*;
//! ```

pub use crate::agent::{Agent, AgentResult};
pub use crate::budget::{Budget, Consumption};
pub use crate::chain::Chain;
pub use crate::config::EngineConfig;
pub use crate::context::{
    AgentContext, AgentStageContext, CancellationToken, ChainContext, ChatHistory,
    IterationContext, LlmContext, SkillContext,
};
pub use crate::controller::{BasicController, Controller, ExecutionUnit, LlmController};
pub use crate::error::{AgentError, FunctionError, LlmError, RunnerError, SkillError};
pub use crate::evaluator::{BasicEvaluator, Evaluator, LlmEvaluator};
pub use crate::filter::{BasicFilter, Filter, LlmFilter};
pub use crate::llm::{
    Llm, LlmCallOptions, LlmFallback, LlmFunction, LlmMessage, LlmMessageRole,
    LlmMiddlewareChain, LlmResult, MockLlm,
};
pub use crate::message::{ChatMessage, ChatMessageKind, ScoredChatMessage};
pub use crate::runner::skill::{FnSkill, Skill, SkillRunner};
pub use crate::runner::{
    DoWhile, If, Parallel, ParallelFor, Runner, RunnerExecutor, Sequential, While,
};
pub use crate::skills::LlmSkill;
