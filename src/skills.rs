//! Generic skills shipped with the engine.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::{LlmContext, SkillContext};
use crate::error::SkillError;
use crate::llm::middleware::{LlmMiddlewareChain, LlmRequest};
use crate::llm::{Llm, LlmCallOptions, LlmMessage};
use crate::message::ChatMessage;
use crate::runner::skill::Skill;

/// A skill forwarding the conversation to a model.
///
/// The skill renders its system prompt, converts the visible conversation
/// into chat turns and sends them through its middleware chain, producing
/// one skill message with the model's answer.
pub struct LlmSkill {
    name: String,
    system_prompt: String,
    chain: LlmMiddlewareChain,
    options: LlmCallOptions,
}

impl std::fmt::Debug for LlmSkill {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmSkill")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl LlmSkill {
    /// Create a skill over a bare model.
    #[must_use]
    pub fn new(llm: Arc<dyn Llm>, system_prompt: impl Into<String>) -> Self {
        Self::with_chain(LlmMiddlewareChain::new(llm), system_prompt)
    }

    /// Create a skill over an existing middleware chain.
    #[must_use]
    pub fn with_chain(chain: LlmMiddlewareChain, system_prompt: impl Into<String>) -> Self {
        Self {
            name: "llm".to_string(),
            system_prompt: system_prompt.into(),
            chain,
            options: LlmCallOptions::new(),
        }
    }

    /// Override the skill's name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Attach provider options sent with every call.
    #[must_use]
    pub fn with_options(mut self, options: LlmCallOptions) -> Self {
        self.options = options;
        self
    }
}

#[async_trait]
impl Skill for LlmSkill {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, context: &SkillContext) -> Result<ChatMessage, SkillError> {
        let mut messages = vec![LlmMessage::system(self.system_prompt.clone())];
        messages.extend(LlmMessage::from_chat_messages(context.messages()));

        let request = LlmRequest::new(
            LlmContext::from_skill(context),
            messages,
            self.options.clone(),
        );
        let response = self.chain.execute(request).await?;
        Ok(ChatMessage::skill_success(
            response.first_choice(),
            None,
            self.name.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::Budget;
    use crate::context::ChainContext;
    use crate::llm::{LlmMessageRole, MockLlm};
    use crate::runner::skill::SkillRunner;
    use crate::runner::{Runner, RunnerExecutor};
    use std::time::Duration;

    #[tokio::test]
    async fn test_llm_skill_produces_model_answer() {
        let skill = LlmSkill::new(Arc::new(MockLlm::from_response("model answer")), "be useful")
            .with_name("answerer");
        let runner = SkillRunner::new(Arc::new(skill));
        let executor = RunnerExecutor::default();
        let mut ctx =
            ChainContext::from_user_message("question", Budget::new(Duration::from_secs(5)));

        runner.run(&mut ctx, &executor).await.expect("skill succeeds");
        let message = &ctx.current_messages()[0];
        assert_eq!(message.content, "model answer");
        assert!(message.is_from_source("answerer"));
    }

    #[tokio::test]
    async fn test_llm_skill_forwards_conversation() {
        let llm = Arc::new(MockLlm::new(|messages| {
            assert!(messages[0].is_of_role(LlmMessageRole::System));
            assert_eq!(messages[1].content, "question");
            Ok("seen".to_string())
        }));
        let skill = LlmSkill::new(llm, "system prompt");
        let ctx = ChainContext::from_user_message("question", Budget::new(Duration::from_secs(5)));

        let message = skill
            .execute(&ctx.to_skill_context(None))
            .await
            .expect("skill succeeds");
        assert_eq!(message.content, "seen");
    }

    #[tokio::test]
    async fn test_llm_skill_charges_budget() {
        let budget = Budget::new(Duration::from_secs(5));
        let skill = LlmSkill::new(Arc::new(MockLlm::from_response("ok")), "prompt");
        let ctx = ChainContext::from_user_message("question", budget.remaining());

        skill
            .execute(&ctx.to_skill_context(None))
            .await
            .expect("skill succeeds");
        assert!(!budget.consumption_events().is_empty());
    }
}
