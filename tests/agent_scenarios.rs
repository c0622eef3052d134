//! End-to-end scenarios for the council engine.

#![allow(clippy::unwrap_used, clippy::panic)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use council::budget::{Budget, Consumption};
use council::chain::Chain;
use council::context::ChainContext;
use council::controller::BasicController;
use council::error::{FunctionError, RunnerError};
use council::evaluator::BasicEvaluator;
use council::filter::BasicFilter;
use council::llm::parser::{CodeBlocksResponseParser, FieldDescriptor, FieldKind};
use council::llm::{
    Llm, LlmCachingMiddleware, LlmFunction, LlmMessage, LlmMiddleware, LlmMiddlewareChain,
    LlmRequest, MockLlm,
};
use council::message::ChatMessage;
use council::runner::skill::{FnSkill, SkillRunner};
use council::runner::{DoWhile, Parallel, ParallelFor, Runner, RunnerExecutor, Sequential};
use council::{Agent, AgentContext};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn delayed_skill(name: &str, millis: u64) -> Arc<dyn Runner> {
    SkillRunner::wrap(FnSkill::from_content(name, name).with_delay(Duration::from_millis(millis)))
}

fn chain_context(budget: Budget) -> ChainContext {
    ChainContext::from_user_message("run the scenario", budget)
}

/// S1: sequential skills produce their messages in declared order.
#[tokio::test]
async fn test_sequential_scenario() {
    init_tracing();
    let runner = Sequential::new(vec![delayed_skill("A", 50), delayed_skill("B", 50)]);
    let executor = RunnerExecutor::default();
    let mut ctx = chain_context(Budget::new(Duration::from_secs(1)));

    runner.run(&mut ctx, &executor).await.expect("sequence succeeds");

    let contents: Vec<&str> = ctx
        .current_messages()
        .iter()
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(contents, ["A", "B"]);
    assert!(!ctx.cancellation_token().is_cancelled());
}

/// S2: a failing parallel child cancels the token and re-raises, while its
/// error message stays visible.
#[tokio::test]
async fn test_parallel_failure_scenario() {
    let runner = Parallel::new(vec![
        delayed_skill("first", 300),
        SkillRunner::wrap(FnSkill::failing("second", "scripted failure")),
        delayed_skill("third", 100),
    ]);
    let executor = RunnerExecutor::default();
    let mut ctx = chain_context(Budget::new(Duration::from_secs(1)));

    let error = runner.run(&mut ctx, &executor).await.expect_err("parallel fails");
    assert!(matches!(error, RunnerError::Skill { .. }));
    assert!(ctx.cancellation_token().is_cancelled());

    let second = ctx
        .current_messages()
        .iter()
        .filter(|m| m.is_from_source("second"))
        .next_back()
        .expect("error message from the failing skill");
    assert!(second.is_error);
}

/// S3: a do-while loop driven by a consumption limit of 10 executes its
/// body 11 times, the last turn being the one that overdraws the ledger.
#[tokio::test]
async fn test_do_while_until_budget_scenario() {
    let skill = FnSkill::new("retrying", |ctx| {
        ctx.budget()
            .add_consumption(Consumption::new(1.0, "unit", "retry"), "retrying");
        Ok(ChatMessage::skill_success("attempt", None, "retrying"))
    });
    let runner = DoWhile::new(
        Box::new(|ctx| Ok(!ctx.budget().is_expired())),
        SkillRunner::wrap(skill),
    );
    let executor = RunnerExecutor::default();
    let budget = Budget::with_limits(
        Duration::from_secs(10),
        vec![Consumption::new(10.0, "unit", "retry")],
    );
    let mut ctx = chain_context(budget);

    runner.run(&mut ctx, &executor).await.expect("loop completes");
    assert_eq!(ctx.current_messages().len(), 11);
}

fn int_generator(count: i64) -> council::runner::RunnerGenerator {
    Box::new(move |_| Box::new((0..count).map(|value| Ok(serde_json::json!(value)))))
}

/// S4: a parallel-for over 100 items covers every index exactly once.
#[tokio::test]
async fn test_parallel_for_scenario() {
    let generator = int_generator(100);
    let skill = Arc::new(FnSkill::new("indexer", |ctx| {
        let iteration = ctx.iteration().expect("iteration context");
        Ok(ChatMessage::skill_success(
            format!("index {}", iteration.index()),
            Some(iteration.value().clone()),
            "indexer",
        ))
    }));
    let runner = ParallelFor::with_parallelism(generator, skill, 10);
    let executor = RunnerExecutor::default();
    let mut ctx = chain_context(Budget::new(Duration::from_secs(10)));

    runner.run(&mut ctx, &executor).await.expect("parallel-for succeeds");
    assert_eq!(ctx.current_messages().len(), 100);

    let indices: BTreeSet<i64> = ctx
        .current_messages()
        .iter()
        .map(|m| m.data.as_ref().and_then(serde_json::Value::as_i64).unwrap())
        .collect();
    assert_eq!(indices, (0..100).collect::<BTreeSet<i64>>());
    assert!(ctx.current_messages().iter().all(|m| !m.is_error));
}

/// S5: an identical request within the TTL is served from the cache with
/// zero duration and `cached_` units; the cache never exceeds its size.
#[tokio::test]
async fn test_llm_caching_scenario() -> anyhow::Result<()> {
    init_tracing();
    let llm = Arc::new(MockLlm::from_response("```answer\ncached\n```"));
    let cache = Arc::new(LlmCachingMiddleware::new(Duration::from_secs(60), 10));
    let chain = LlmMiddlewareChain::new(Arc::clone(&llm) as Arc<dyn Llm>)
        .with_middleware(Arc::clone(&cache) as Arc<dyn LlmMiddleware>);

    let request = LlmRequest::from_messages(vec![LlmMessage::user("identical input")]);
    let first = chain.execute(request.clone()).await?;
    let second = chain.execute(request).await?;

    assert_eq!(llm.call_count(), 1);
    assert_eq!(first.first_choice(), second.first_choice());
    assert_eq!(second.duration(), Duration::ZERO);
    assert!(
        second
            .result()
            .consumptions()
            .iter()
            .all(|c| c.unit.starts_with("cached_"))
    );

    // Expanding beyond the cache size evicts the least recently used entry.
    for index in 0..12 {
        let request =
            LlmRequest::from_messages(vec![LlmMessage::user(format!("distinct input {index}"))]);
        chain.execute(request).await.expect("call succeeds");
        assert!(cache.len() <= 10);
    }

    // A typed function over the cached chain observes the same answer.
    let parser = CodeBlocksResponseParser::new(
        vec![FieldDescriptor::new("answer", "the answer", FieldKind::String)],
        |fields| Ok(fields.get_str("answer")?.to_string()),
    )
    .expect("primitive schema");
    let cached_chain = LlmMiddlewareChain::new(Arc::clone(&llm) as Arc<dyn Llm>)
        .with_middleware(Arc::clone(&cache) as Arc<dyn LlmMiddleware>);
    let function = LlmFunction::with_chain(cached_chain, parser, "answer the question");
    let answer = function.execute("identical input").await?;
    assert_eq!(answer, "cached");
    Ok(())
}

/// S6: a malformed response is fixed after one self-correction turn, and
/// fails immediately when retries are disabled.
#[tokio::test]
async fn test_parser_self_correction_scenario() {
    fn parser() -> CodeBlocksResponseParser<(String, String)> {
        CodeBlocksResponseParser::new(
            vec![
                FieldDescriptor::new("title", "a short title", FieldKind::String),
                FieldDescriptor::new("summary", "a one line summary", FieldKind::String),
            ],
            |fields| {
                Ok((
                    fields.get_str("title")?.to_string(),
                    fields.get_str("summary")?.to_string(),
                ))
            },
        )
        .expect("primitive schema")
    }

    let scripted = vec![
        "```title\nonly a title\n```".to_string(),
        "```title\nfixed\n```\n```summary\nnow complete\n```".to_string(),
    ];

    let llm = Arc::new(MockLlm::from_responses(scripted.clone()));
    let function = LlmFunction::new(Arc::clone(&llm) as Arc<dyn Llm>, parser(), "summarize");
    let (title, summary) = function.execute("write a summary").await.expect("retry succeeds");
    assert_eq!(title, "fixed");
    assert_eq!(summary, "now complete");
    assert_eq!(llm.call_count(), 2);

    let strict = LlmFunction::new(
        Arc::new(MockLlm::from_responses(scripted)),
        parser(),
        "summarize",
    )
    .with_max_retries(0);
    let error = strict.execute("write a summary").await.expect_err("no retries");
    assert!(matches!(error, FunctionError::OutOfRetry { attempts: 1, .. }));
}

/// The agent loop terminates within the order of its budget duration even
/// when no iteration produces a selection.
#[tokio::test]
async fn test_agent_terminates_with_budget() {
    let chain = Chain::new(
        "quick",
        "answers fast",
        vec![SkillRunner::wrap(FnSkill::from_content("quick", "tick"))],
    );
    let agent = Agent::new(
        Arc::new(BasicController::new(vec![Arc::new(chain)])),
        Arc::new(BasicEvaluator),
        // Nothing ever passes the filter, forcing iteration until expiry.
        Arc::new(BasicFilter::new().with_score_threshold(100.0)),
    );

    let start = Instant::now();
    let mut context = AgentContext::from_user_message("loop forever?");
    let result = agent
        .execute(&mut context, Budget::new(Duration::from_millis(250)))
        .await
        .expect("agent returns");

    assert!(result.is_empty());
    assert!(start.elapsed() < Duration::from_secs(3));
    assert!(context.iteration_count() >= 1);
}

/// A multi-chain agent evaluates every chain's answer and picks the best.
#[tokio::test]
async fn test_multi_chain_agent_selects_successful_answer() {
    let good = Chain::new(
        "good",
        "produces an answer",
        vec![SkillRunner::wrap(FnSkill::from_content("good", "a real answer"))],
    );
    let bad = Chain::new(
        "bad",
        "reports a failure",
        vec![SkillRunner::wrap(FnSkill::new("bad", |_| {
            Ok(ChatMessage::skill_error("nothing found", "bad"))
        }))],
    );
    let agent = Agent::new(
        Arc::new(BasicController::new(vec![Arc::new(good), Arc::new(bad)])),
        Arc::new(BasicEvaluator),
        Arc::new(BasicFilter::new().with_score_threshold(0.5)),
    );

    let result = agent
        .execute_from_user_message("find me an answer", Budget::new(Duration::from_secs(5)))
        .await
        .expect("agent succeeds");

    assert_eq!(result.messages().len(), 1);
    assert_eq!(
        result.best_message().map(|m| m.content.as_str()),
        Some("a real answer")
    );
}
