//! Agent 端到端场景：脚本化 Mock LLM + 内存文档库

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use docquery::core::{
    AgentRunner, BackoffPolicy, ExecutionErrorKind, GenerationError, QueryRequest, ReasoningEffort,
    RecoveryEngine, Stage, StageFailure, Verbosity,
};
use docquery::llm::{LlmClient, LlmError, MockLlmClient, ModelRouter, ModelTier, RequestOptions};
use docquery::memory::Message;
use docquery::pipeline::{IssueReason, Pipeline, PipelineGenerator};
use docquery::schema::purchase_orders;
use docquery::store::{Document, DocumentStore, InMemoryStore, QueryExecutor, StoreError};
use docquery::summarizer::AnswerSummarizer;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn purchase_docs(n: usize) -> Vec<Document> {
    (0..n)
        .filter_map(|i| {
            json!({
                "_id": format!("po-{}", i),
                "department": {"name": "Health Care Services"},
                "acquisition": {"type": if i % 2 == 0 { "IT Goods" } else { "NON-IT Services" }},
                "item": {"total_price": 100.25 * (i as f64 + 1.0)},
                "dates": {"creation": "2013-08-27T00:00:00Z"}
            })
            .as_object()
            .cloned()
        })
        .collect()
}

struct Harness {
    generation_timeout: Duration,
    query_timeout: Duration,
    store: Arc<dyn DocumentStore>,
    client: Arc<dyn LlmClient>,
}

impl Harness {
    fn new(client: Arc<dyn LlmClient>, docs: Vec<Document>) -> Self {
        Self {
            generation_timeout: Duration::from_secs(2),
            query_timeout: Duration::from_secs(2),
            store: Arc::new(InMemoryStore::new("purchase_orders", docs)),
            client,
        }
    }

    fn with_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = store;
        self
    }

    fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout = timeout;
        self
    }

    fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    fn runner(&self) -> AgentRunner {
        let router = Arc::new(ModelRouter::single(self.client.clone()));
        let generator = Arc::new(PipelineGenerator::new(
            router.clone(),
            Arc::new(purchase_orders()),
            self.generation_timeout,
            5,
        ));
        let executor = Arc::new(QueryExecutor::new(self.store.clone(), self.query_timeout));
        let summarizer = Arc::new(AnswerSummarizer::new(router, Duration::from_secs(2)));
        AgentRunner::new(generator, executor, summarizer).with_recovery(RecoveryEngine::new(
            BackoffPolicy {
                base: Duration::from_millis(10),
                max: Duration::from_millis(200),
            },
        ))
    }
}

fn ask(question: &str) -> QueryRequest {
    QueryRequest::new(question, ModelTier::Full).unwrap()
}

/// 前 `slow_calls` 次调用挂起 `delay`，之后返回固定文本
struct SlowThenReply {
    slow_calls: usize,
    delay: Duration,
    reply: String,
    calls: AtomicUsize,
}

impl SlowThenReply {
    fn new(slow_calls: usize, delay: Duration, reply: &str) -> Self {
        Self {
            slow_calls,
            delay,
            reply: reply.to_string(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LlmClient for SlowThenReply {
    async fn complete(&self, _messages: &[Message], _options: &RequestOptions) -> Result<String, LlmError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.slow_calls {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.reply.clone())
    }

    fn model_name(&self) -> &str {
        "slow"
    }
}

/// 第一次聚合挂起 `stall`，之后委托给内存库
struct StallsOnceStore {
    inner: InMemoryStore,
    stall: Duration,
    calls: AtomicUsize,
}

#[async_trait]
impl DocumentStore for StallsOnceStore {
    fn collection_name(&self) -> &str {
        self.inner.collection_name()
    }

    async fn aggregate(&self, pipeline: &Pipeline) -> Result<Vec<Document>, StoreError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(self.stall).await;
        }
        self.inner.aggregate(pipeline).await
    }

    async fn count_documents(&self) -> Result<u64, StoreError> {
        self.inner.count_documents().await
    }
}

struct UnreachableStore;

#[async_trait]
impl DocumentStore for UnreachableStore {
    fn collection_name(&self) -> &str {
        "purchase_orders"
    }

    async fn aggregate(&self, _pipeline: &Pipeline) -> Result<Vec<Document>, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn count_documents(&self) -> Result<u64, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
}

#[tokio::test]
async fn scenario_a_single_count_stage() {
    let mock = Arc::new(MockLlmClient::scripted(vec![
        Ok(r#"[{"$count": "total"}]"#.to_string()),
        Ok("There are 12 purchase order records.".to_string()),
    ]));
    let runner = Harness::new(mock.clone(), purchase_docs(12)).runner();
    let (response, state) = runner
        .run_with_state(ask("How many total records are there?"), CancellationToken::new())
        .await;

    assert!(response.success);
    assert_eq!(response.result_count, Some(1));
    assert_eq!(response.results.as_ref().unwrap()[0]["total"], 12);
    assert_eq!(response.pipeline.as_ref().unwrap().operators(), vec!["$count"]);
    assert!(response.error.is_none());
    assert!(response.execution_time_seconds.is_some());
    assert_eq!(state.attempt, 1);
    assert_eq!(state.stage, Stage::Done);
    assert_eq!(mock.call_count(), 2);
    // 推理强度随生成调用下发，详细程度随总结调用下发
    assert_eq!(
        mock.options(),
        vec![
            RequestOptions::generation(ReasoningEffort::Medium),
            RequestOptions::summary(Verbosity::Medium),
        ]
    );
}

#[tokio::test]
async fn scenario_b_unknown_field_is_fed_back() {
    let mock = Arc::new(MockLlmClient::scripted(vec![
        Ok(r#"[{"$match": {"department.nmae": "Health Care Services"}}, {"$count": "n"}]"#.to_string()),
        Ok(r#"[{"$match": {"department.name": "Health Care Services"}}, {"$count": "n"}]"#.to_string()),
        Ok("Health Care Services has 8 orders.".to_string()),
    ]));
    let runner = Harness::new(mock.clone(), purchase_docs(8)).runner();
    let (response, state) = runner
        .run_with_state(ask("How many orders did Health Care Services place?"), CancellationToken::new())
        .await;

    assert!(response.success);
    assert_eq!(response.results.as_ref().unwrap()[0]["n"], 8);
    assert_eq!(state.feedback.len(), 1);
    assert_eq!(state.feedback[0].attempt, 1);
    let StageFailure::Validation(issues) = &state.feedback[0].failure else {
        panic!("expected a validation failure, got {:?}", state.feedback[0].failure);
    };
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].stage_index, 0);
    assert_eq!(
        issues[0].reason,
        IssueReason::UnknownField {
            path: "department.nmae".to_string()
        }
    );
    assert_eq!(state.attempt, 2);
    assert_eq!(state.generation_rounds(), 2);

    let calls = mock.calls();
    let first_prompt = &calls[0].last().unwrap().content;
    let second_prompt = &calls[1].last().unwrap().content;
    assert!(!first_prompt.contains("PREVIOUS ATTEMPTS FAILED"));
    assert!(second_prompt.contains("PREVIOUS ATTEMPTS FAILED"));
    assert!(second_prompt.contains("department.nmae"));
}

#[tokio::test]
async fn scenario_c_executor_timeout_then_success() {
    let mock = Arc::new(MockLlmClient::scripted(vec![
        Ok(r#"[{"$count": "count"}]"#.to_string()),
        Ok(r#"[{"$count": "count"}]"#.to_string()),
        Ok("There are 3 records.".to_string()),
    ]));
    let store = Arc::new(StallsOnceStore {
        inner: InMemoryStore::new("purchase_orders", purchase_docs(3)),
        stall: Duration::from_secs(5),
        calls: AtomicUsize::new(0),
    });
    let runner = Harness::new(mock.clone(), Vec::new())
        .with_store(store)
        .with_query_timeout(Duration::from_millis(50))
        .runner();
    let (response, state) = runner
        .run_with_state(ask("How many records?"), CancellationToken::new())
        .await;

    assert!(response.success);
    assert_eq!(response.results.as_ref().unwrap()[0]["count"], 3);
    assert_eq!(state.attempt, 2);
    assert_eq!(state.stage, Stage::Done);
    assert_eq!(state.feedback.len(), 1);
    let StageFailure::Execution(err) = &state.feedback[0].failure else {
        panic!("expected an execution failure, got {:?}", state.feedback[0].failure);
    };
    assert_eq!(err.kind, ExecutionErrorKind::Timeout);
    // 超时的候选管道随反馈一起保留
    assert!(state.feedback[0].pipeline.is_some());
    assert_eq!(mock.call_count(), 3);
}

#[tokio::test]
async fn generation_timeout_then_success() {
    let client = Arc::new(SlowThenReply::new(
        1,
        Duration::from_secs(5),
        r#"[{"$count": "count"}]"#,
    ));
    let runner = Harness::new(client, purchase_docs(3))
        .with_generation_timeout(Duration::from_millis(50))
        .runner();
    let (response, state) = runner
        .run_with_state(ask("How many records?"), CancellationToken::new())
        .await;

    assert!(response.success);
    assert_eq!(state.attempt, 2);
    assert!(matches!(
        state.feedback[0].failure,
        StageFailure::Generation(GenerationError::Timeout)
    ));
    assert!(state.feedback[0].pipeline.is_none());
}

#[tokio::test]
async fn scenario_d_results_capped_at_max_results() {
    let mock = Arc::new(MockLlmClient::scripted(vec![
        Ok(r#"[{"$match": {"department.name": "Health Care Services"}}]"#.to_string()),
        Ok("Here are the first five orders.".to_string()),
    ]));
    let runner = Harness::new(mock, purchase_docs(50)).runner();
    let request = ask("List Health Care Services orders").with_max_results(5).unwrap();
    let response = runner.run(request).await;

    assert!(response.success);
    assert_eq!(response.result_count, Some(5));
    assert_eq!(response.results.as_ref().unwrap().len(), 5);
    // 调用方看到的是生成的管道本身，执行时追加的 $limit 不回写
    assert_eq!(response.pipeline.as_ref().unwrap().operators(), vec!["$match"]);
}

#[tokio::test]
async fn exhausted_retries_report_last_error() {
    let bad = r#"[{"$match": {"no_such_field": 1}}]"#;
    let mock = Arc::new(MockLlmClient::scripted(vec![
        Ok(bad.to_string()),
        Ok(bad.to_string()),
        Ok(r#"[{"$out": "copy"}]"#.to_string()),
    ]));
    let runner = Harness::new(mock.clone(), purchase_docs(3)).runner().with_max_attempts(3);
    let (response, state) = runner
        .run_with_state(ask("Anything?"), CancellationToken::new())
        .await;

    assert!(!response.success);
    assert!(response.answer.is_none());
    assert!(response.results.is_none());
    let error = response.error.unwrap();
    assert!(error.starts_with("Could not produce a working query after 3 attempts"));
    assert!(error.contains("$out"));
    assert_eq!(state.attempt, 3);
    assert!(state.attempt <= runner.max_attempts());
    assert_eq!(state.stage, Stage::Failed);
    assert_eq!(mock.call_count(), 3);
}

#[tokio::test]
async fn zero_rows_still_answer() {
    let mock = Arc::new(MockLlmClient::scripted(vec![Ok(
        r#"[{"$match": {"department.name": "Nobody"}}]"#.to_string(),
    )]));
    let runner = Harness::new(mock.clone(), purchase_docs(4)).runner();
    let response = runner.run(ask("Orders from Nobody?")).await;

    assert!(response.success);
    assert_eq!(response.result_count, Some(0));
    assert!(!response.answer.unwrap().is_empty());
    // 空结果不调用总结
    assert_eq!(mock.call_count(), 1);
}

#[tokio::test]
async fn throttling_backs_off_before_regenerating() {
    let mock = Arc::new(MockLlmClient::scripted(vec![
        Err(LlmError::RateLimited {
            retry_after_ms: Some(60),
        }),
        Ok(r#"[{"$count": "count"}]"#.to_string()),
        Ok("3 records.".to_string()),
    ]));
    let runner = Harness::new(mock, purchase_docs(3)).runner();
    let started = Instant::now();
    let (response, state) = runner
        .run_with_state(ask("How many?"), CancellationToken::new())
        .await;

    assert!(response.success);
    assert_eq!(state.attempt, 2);
    assert!(started.elapsed() >= Duration::from_millis(60));
    assert!(matches!(
        state.feedback[0].failure,
        StageFailure::Generation(GenerationError::Throttled { .. })
    ));
}

#[tokio::test]
async fn unreachable_store_aborts_without_retry() {
    let mock = Arc::new(MockLlmClient::scripted(vec![
        Ok(r#"[{"$count": "count"}]"#.to_string()),
        Ok(r#"[{"$count": "count"}]"#.to_string()),
    ]));
    let runner = Harness::new(mock.clone(), Vec::new())
        .with_store(Arc::new(UnreachableStore))
        .runner();
    let (response, state) = runner
        .run_with_state(ask("How many?"), CancellationToken::new())
        .await;

    assert!(!response.success);
    assert!(response.error.unwrap().starts_with("Data store unavailable"));
    assert_eq!(state.attempt, 1);
    assert_eq!(mock.call_count(), 1);
}

#[tokio::test]
async fn cancellation_stops_the_run() {
    let client = Arc::new(SlowThenReply::new(10, Duration::from_secs(10), "[]"));
    let runner = Harness::new(client, purchase_docs(3)).runner();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let (response, state) = runner.run_with_state(ask("How many?"), cancel).await;
    assert!(!response.success);
    assert_eq!(response.error.as_deref(), Some("Request cancelled"));
    assert_eq!(state.stage, Stage::Failed);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn run_budget_bounds_latency() {
    let client = Arc::new(SlowThenReply::new(10, Duration::from_secs(10), "[]"));
    let runner = Harness::new(client, purchase_docs(3))
        .with_generation_timeout(Duration::from_secs(30))
        .runner()
        .with_run_budget(Duration::from_millis(80));

    let started = Instant::now();
    let response = runner.run(ask("How many?")).await;
    assert!(!response.success);
    assert!(response.error.unwrap().contains("longer than the allowed"));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn concurrent_runs_are_independent() {
    // 未配置脚本的 Mock：生成请求得到计数管道，总结降级为模板回答
    let runner = Harness::new(Arc::new(MockLlmClient::new()), purchase_docs(7)).runner();
    let mut set = tokio::task::JoinSet::new();
    for i in 0..8 {
        let runner = runner.clone();
        set.spawn(async move {
            runner
                .run_with_state(ask(&format!("How many records? #{}", i)), CancellationToken::new())
                .await
        });
    }
    let mut finished = 0;
    while let Some(joined) = set.join_next().await {
        let (response, state) = joined.unwrap();
        assert!(response.success);
        assert_eq!(response.results.unwrap()[0]["count"], 7);
        assert_eq!(state.attempt, 1);
        assert!(state.feedback.is_empty());
        finished += 1;
    }
    assert_eq!(finished, 8);
}
