//! Headless Agent 运行时
//!
//! 供 CLI、HTTP 与评测入口共用的装配逻辑：配置 → Schema 参考 → 文档库 → LLM 路由 → AgentRunner。
//! 各入口只持有一个 AgentRuntime（可 Clone），每个请求调用 `process` 或直接使用 runner。
//! 另外提供 HTTP 辅助接口用到的健康检查、集合概况与直接聚合。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::AppConfig;
use crate::core::{
    AgentError, AgentResponse, AgentRunner, BackoffPolicy, ExecutionError, QueryRequest,
    QueryRequestBody, ReasoningEffort, RecoveryEngine, MAX_RESULTS_LIMIT,
};
use crate::llm::{create_router_from_config, ModelRouter, ModelTier, TokenCounts};
use crate::memory::{ConversationStore, ConversationTurn};
use crate::pipeline::{validate, Pipeline, PipelineGenerator, ValidationIssue};
use crate::schema::{purchase_orders, SchemaReference};
use crate::store::loader::normalize_date_fields;
use crate::store::{
    load_documents, Document, DocumentStore, ExecutionResult, InMemoryStore, QueryExecutor,
};
use crate::summarizer::AnswerSummarizer;

/// 统计接口里分组列表的行数上限
const STATS_TOP_N: usize = 10;

/// 健康检查用的试探问题
const HEALTH_QUESTION: &str = "How many total records are there?";

/// 装配完成的运行时：共享只读组件 + 可并发使用的 runner + 按会话保存的历史
#[derive(Clone)]
pub struct AgentRuntime {
    pub runner: AgentRunner,
    pub schema: Arc<SchemaReference>,
    pub store: Arc<dyn DocumentStore>,
    pub default_tier: ModelTier,
    pub model_name: String,
    pub conversations: ConversationStore,
}

/// 直接聚合接口被拒绝的原因
#[derive(Error, Debug)]
pub enum AggregateRejection {
    #[error("Invalid pipeline: {0}")]
    Shape(String),

    #[error("Pipeline failed validation with {} issue(s)", .0.len())]
    Invalid(Vec<ValidationIssue>),

    #[error("Aggregation failed: {0}")]
    Execution(#[from] ExecutionError),
}

/// 健康检查结果
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub agent_initialized: bool,
    pub database_connected: bool,
    pub llm_reachable: bool,
    pub collection: String,
    pub model: String,
    pub store_documents: Option<u64>,
    pub token_usage: TokenCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: String,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.database_connected && self.llm_reachable
    }
}

/// 集合概况
#[derive(Debug, Clone, Serialize)]
pub struct CollectionStats {
    pub collection: String,
    pub total_documents: u64,
    pub fiscal_years: Vec<Value>,
    pub acquisition_types: Vec<Value>,
    pub top_departments: Vec<Document>,
    pub top_suppliers: Vec<Document>,
    pub price_statistics: Option<Document>,
}

impl AgentRuntime {
    /// 用给定组件组装运行时；默认档位与模型名取自路由器
    pub fn assemble(
        cfg: &AppConfig,
        router: Arc<ModelRouter>,
        schema: Arc<SchemaReference>,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        let default_tier = router.default_tier();
        let model_name = router.route(default_tier).model_name().to_string();
        let runner = build_runner(cfg, router, schema.clone(), store.clone());
        Self {
            runner,
            schema,
            store,
            default_tier,
            model_name,
            conversations: ConversationStore::new(cfg.agent.history_turns),
        }
    }

    /// 校验请求体；带 conversation_id 且未显式给出历史时，用服务端保存的历史补上
    pub fn prepare(&self, body: QueryRequestBody) -> Result<QueryRequest, AgentError> {
        let explicit_history = body.conversation_history.is_some();
        let request = body.into_request(self.default_tier)?;
        match request.conversation_id() {
            Some(id) if !explicit_history => {
                let history = self.conversations.history(id);
                Ok(request.with_history(history))
            }
            _ => Ok(request),
        }
    }

    /// 运行已校验的请求；成功时把本轮问答记入会话
    pub async fn execute(&self, request: QueryRequest) -> AgentResponse {
        let conversation = request.conversation_id().map(String::from);
        let question = request.question().to_string();
        let response = self.runner.run(request).await;
        if let (Some(id), Some(answer)) = (&conversation, &response.answer) {
            self.conversations
                .record(id, ConversationTurn::new(question, answer.clone()));
        }
        response
    }

    /// 处理一条线上请求；非法输入同样返回 success=false 的结构化响应
    pub async fn process(&self, body: QueryRequestBody) -> AgentResponse {
        match self.prepare(body) {
            Ok(request) => self.execute(request).await,
            Err(e) => AgentResponse::failure(&e, None, None),
        }
    }

    pub fn token_usage(&self) -> TokenCounts {
        self.runner.token_usage()
    }

    /// 检查文档库连通性、用一次最小推理强度的生成确认模型可用，并汇报累计 token 用量
    pub async fn health(&self) -> HealthReport {
        let ping = self.store.ping().await;
        let documents = match &ping {
            Ok(()) => self.store.count_documents().await.ok(),
            Err(_) => None,
        };
        if let Err(e) = &ping {
            tracing::warn!(error = %e, "health check: store unreachable");
        }
        let generation = self.check_generation().await;
        if let Err(e) = &generation {
            tracing::warn!(error = %e, "health check: generation failed");
        }

        let database_connected = ping.is_ok();
        let llm_reachable = generation.is_ok();
        let error = match (ping, generation) {
            (Err(e), _) => Some(e.to_string()),
            (Ok(()), Err(e)) => Some(e),
            _ => None,
        };
        HealthReport {
            status: if database_connected && llm_reachable { "healthy" } else { "unhealthy" },
            agent_initialized: true,
            database_connected,
            llm_reachable,
            collection: self.store.collection_name().to_string(),
            model: self.model_name.clone(),
            store_documents: documents,
            token_usage: self.token_usage(),
            error,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// 生成一条试探管道并通过校验即视为可用
    async fn check_generation(&self) -> Result<(), String> {
        let request = QueryRequest::new(HEALTH_QUESTION, self.default_tier)
            .map_err(|e| e.to_string())?
            .with_reasoning_effort(ReasoningEffort::Minimal);
        let generator = self.runner.generator();
        let ctx = generator.plan(&request);
        let pipeline = generator
            .generate(&ctx, &[])
            .await
            .map_err(|e| e.to_string())?;
        let verdict = validate(&pipeline, &self.schema, request.max_results());
        if verdict.ok {
            Ok(())
        } else {
            Err(format!(
                "generated pipeline failed validation with {} issue(s)",
                verdict.errors.len()
            ))
        }
    }

    /// 直接执行调用方给出的管道：与生成的管道走同一套校验与执行器
    pub async fn aggregate(
        &self,
        raw: &Value,
        max_results: Option<usize>,
    ) -> Result<ExecutionResult, AggregateRejection> {
        let pipeline =
            Pipeline::from_value(raw).map_err(|e| AggregateRejection::Shape(e.to_string()))?;
        let max_results = max_results.unwrap_or(MAX_RESULTS_LIMIT);
        if max_results == 0 || max_results > MAX_RESULTS_LIMIT {
            return Err(AggregateRejection::Shape(format!(
                "max_results must be between 1 and {}, got {}",
                MAX_RESULTS_LIMIT, max_results
            )));
        }
        let verdict = validate(&pipeline, &self.schema, max_results);
        if !verdict.ok {
            return Err(AggregateRejection::Invalid(verdict.errors));
        }
        Ok(self.runner.executor().execute(&pipeline, max_results).await?)
    }

    /// 集合概况；schema 中没有的字段对应项为空
    pub async fn stats(&self) -> Result<CollectionStats, AgentError> {
        let total_documents = self
            .store
            .count_documents()
            .await
            .map_err(|e| AgentError::Infrastructure(e.to_string()))?;

        let fiscal_years = self.distinct("dates.fiscal_year").await?;
        let acquisition_types = self.distinct("acquisition.type").await?;
        let top_departments = self
            .top_by("department.name", json!({"purchase_count": -1}))
            .await?;
        let top_suppliers = self
            .top_by("supplier.name", json!({"total_spend": -1}))
            .await?;

        let price_statistics = if self.schema.has_path("item.total_price") {
            let mut rows = self
                .run_internal(json!([{"$group": {
                    "_id": null,
                    "min_price": {"$min": "$item.total_price"},
                    "max_price": {"$max": "$item.total_price"},
                    "avg_price": {"$avg": "$item.total_price"},
                    "total_spend": {"$sum": "$item.total_price"},
                }}]), 1)
                .await?;
            rows.pop().map(|mut row| {
                row.remove("_id");
                row
            })
        } else {
            None
        };

        Ok(CollectionStats {
            collection: self.store.collection_name().to_string(),
            total_documents,
            fiscal_years,
            acquisition_types,
            top_departments,
            top_suppliers,
            price_statistics,
        })
    }

    async fn distinct(&self, path: &str) -> Result<Vec<Value>, AgentError> {
        if !self.schema.has_path(path) {
            return Ok(Vec::new());
        }
        let rows = self
            .run_internal(
                json!([{"$group": {"_id": format!("${}", path)}}, {"$sort": {"_id": 1}}]),
                MAX_RESULTS_LIMIT,
            )
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|mut row| row.remove("_id"))
            .filter(|v| !v.is_null() && v.as_str() != Some(""))
            .collect())
    }

    async fn top_by(&self, path: &str, sort: Value) -> Result<Vec<Document>, AgentError> {
        if !self.schema.has_path(path) {
            return Ok(Vec::new());
        }
        let total = if self.schema.has_path("item.total_price") {
            json!({"$sum": "$item.total_price"})
        } else {
            json!({"$sum": 0})
        };
        self.run_internal(
            json!([
                {"$group": {"_id": format!("${}", path), "purchase_count": {"$sum": 1}, "total_spend": total}},
                {"$sort": sort},
                {"$limit": STATS_TOP_N},
            ]),
            STATS_TOP_N,
        )
        .await
    }

    async fn run_internal(&self, raw: Value, max_results: usize) -> Result<Vec<Document>, AgentError> {
        let pipeline = Pipeline::from_value(&raw).map_err(|e| AgentError::Config(e.to_string()))?;
        self.runner
            .executor()
            .execute(&pipeline, max_results)
            .await
            .map(|r| r.rows)
            .map_err(|e| AgentError::Infrastructure(e.to_string()))
    }
}

/// 加载 Schema 参考：配置了路径则读 TOML，否则使用内置采购单 schema
pub fn load_schema(cfg: &AppConfig) -> Result<SchemaReference, AgentError> {
    match &cfg.schema.path {
        Some(path) => {
            let schema = SchemaReference::load(path)
                .map_err(|e| AgentError::Config(format!("{}: {}", path.display(), e)))?;
            tracing::info!(path = %path.display(), version = %schema.version, "schema reference loaded");
            Ok(schema)
        }
        None => Ok(purchase_orders()),
    }
}

/// 构建内存文档库；未配置数据文件时为空集合
pub async fn load_store(
    cfg: &AppConfig,
    schema: &SchemaReference,
) -> Result<InMemoryStore, AgentError> {
    let collection = cfg.store.collection.clone();
    let Some(path) = &cfg.store.data_path else {
        tracing::warn!("store.data_path not set, starting with an empty collection");
        return Ok(InMemoryStore::new(collection, Vec::new()));
    };
    let mut docs = load_documents(path)
        .await
        .map_err(|e| AgentError::Config(format!("failed to load {}: {}", path.display(), e)))?;
    normalize_date_fields(&mut docs, schema);
    Ok(InMemoryStore::new(collection, docs))
}

/// 按 `[store] backend` 打开文档库
pub async fn open_store(
    cfg: &AppConfig,
    schema: &SchemaReference,
) -> Result<Arc<dyn DocumentStore>, AgentError> {
    match cfg.store.backend.as_str() {
        "memory" => Ok(Arc::new(load_store(cfg, schema).await?)),
        "mongodb" => open_mongo(cfg).await,
        other => Err(AgentError::Config(format!(
            "unknown store backend '{}', expected memory or mongodb",
            other
        ))),
    }
}

#[cfg(feature = "mongo")]
async fn open_mongo(cfg: &AppConfig) -> Result<Arc<dyn DocumentStore>, AgentError> {
    let uri = cfg
        .store
        .uri
        .clone()
        .or_else(|| std::env::var("MONGODB_URI").ok())
        .ok_or_else(|| AgentError::Config("store.uri or MONGODB_URI must be set".to_string()))?;
    let store = crate::store::MongoStore::connect(
        &uri,
        &cfg.store.database,
        &cfg.store.collection,
        Duration::from_secs(cfg.store.query_timeout_secs),
    )
    .await
    .map_err(|e| AgentError::Infrastructure(e.to_string()))?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "mongo"))]
async fn open_mongo(_cfg: &AppConfig) -> Result<Arc<dyn DocumentStore>, AgentError> {
    Err(AgentError::Config(
        "store backend 'mongodb' requires building with --features mongo".to_string(),
    ))
}

/// 用给定的路由器、schema 与文档库组装 runner（测试与评测可注入 Mock）
pub fn build_runner(
    cfg: &AppConfig,
    router: Arc<ModelRouter>,
    schema: Arc<SchemaReference>,
    store: Arc<dyn DocumentStore>,
) -> AgentRunner {
    let generator = Arc::new(PipelineGenerator::new(
        router.clone(),
        schema,
        Duration::from_secs(cfg.llm.timeouts.request),
        cfg.agent.history_turns,
    ));
    let executor = Arc::new(QueryExecutor::new(
        store,
        Duration::from_secs(cfg.store.query_timeout_secs),
    ));
    let summarizer = Arc::new(AnswerSummarizer::new(
        router,
        Duration::from_secs(cfg.llm.timeouts.summarize),
    ));
    AgentRunner::new(generator, executor, summarizer)
        .with_max_attempts(cfg.agent.max_attempts)
        .with_run_budget(Duration::from_secs(cfg.agent.run_budget_secs))
        .with_recovery(RecoveryEngine::new(BackoffPolicy::from(&cfg.agent.backoff)))
}

/// 从配置装配完整运行时
pub async fn build_runtime(cfg: &AppConfig) -> Result<AgentRuntime, AgentError> {
    let schema = Arc::new(load_schema(cfg)?);
    let store = open_store(cfg, &schema).await?;
    let router = Arc::new(create_router_from_config(cfg));
    Ok(AgentRuntime::assemble(cfg, router, schema, store))
}

/// 一组示例问题及建议的推理强度
#[derive(Debug, Clone, Serialize)]
pub struct ExampleGroup {
    pub name: &'static str,
    pub reasoning_effort: ReasoningEffort,
    pub description: &'static str,
    pub examples: &'static [&'static str],
}

pub fn example_questions() -> Vec<ExampleGroup> {
    vec![
        ExampleGroup {
            name: "simple",
            reasoning_effort: ReasoningEffort::Minimal,
            description: "Single filter or count; fastest",
            examples: &[
                "What was the total spending in 2014?",
                "How many purchase orders were there?",
                "Show me the top 5 departments by spending",
                "Count IT vs Non-IT purchases",
            ],
        },
        ExampleGroup {
            name: "moderate",
            reasoning_effort: ReasoningEffort::Medium,
            description: "Grouping with date ranges; recommended default",
            examples: &[
                "Which quarter had the highest spending in 2013?",
                "Compare spending across fiscal years",
                "Show me the top 10 suppliers by contract value",
                "What was the average order value by department?",
            ],
        },
        ExampleGroup {
            name: "complex",
            reasoning_effort: ReasoningEffort::High,
            description: "Multi-step breakdowns",
            examples: &[
                "Compare IT vs Non-IT spending by quarter, broken down by department",
                "Find departments with increasing spending year over year",
                "Analyze supplier concentration in IT services vs goods",
            ],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use std::io::Write;

    fn runtime_with(mock: Arc<MockLlmClient>, docs: Vec<Value>) -> AgentRuntime {
        let cfg = AppConfig::default();
        let docs = docs.into_iter().filter_map(|d| d.as_object().cloned()).collect();
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryStore::new("purchase_orders", docs));
        let router = Arc::new(ModelRouter::single(mock));
        AgentRuntime::assemble(&cfg, router, Arc::new(purchase_orders()), store)
    }

    fn orders() -> Vec<Value> {
        vec![
            json!({"department": {"name": "Health"}, "acquisition": {"type": "IT Goods"}, "dates": {"fiscal_year": "2013-2014"}, "item": {"total_price": 100.0}}),
            json!({"department": {"name": "Health"}, "acquisition": {"type": "NON-IT Goods"}, "dates": {"fiscal_year": "2014-2015"}, "item": {"total_price": 50.0}}),
            json!({"department": {"name": "Parks"}, "acquisition": {"type": "IT Goods"}, "dates": {"fiscal_year": "2013-2014"}, "item": {"total_price": 25.0}}),
        ]
    }

    #[tokio::test]
    async fn test_runtime_from_empty_config_uses_builtin_schema() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "mock".to_string();
        let runtime = build_runtime(&cfg).await.unwrap();
        assert_eq!(runtime.schema.collection, "purchase_orders");
        assert_eq!(runtime.store.count_documents().await.unwrap(), 0);
        assert_eq!(runtime.runner.max_attempts(), 3);
    }

    #[tokio::test]
    async fn test_load_store_normalizes_dates() {
        let mut file = tempfile::Builder::new().suffix(".jsonl").tempfile().unwrap();
        writeln!(file, r#"{{"dates": {{"creation": "07/01/2013"}}}}"#).unwrap();
        let mut cfg = AppConfig::default();
        cfg.store.data_path = Some(file.path().to_path_buf());
        let schema = purchase_orders();
        let store = load_store(&cfg, &schema).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_backend_is_a_config_error() {
        let mut cfg = AppConfig::default();
        cfg.store.backend = "postgres".to_string();
        let err = open_store(&cfg, &purchase_orders()).await.err().unwrap();
        assert!(matches!(err, AgentError::Config(ref m) if m.contains("postgres")));
    }

    #[cfg(not(feature = "mongo"))]
    #[tokio::test]
    async fn test_mongodb_backend_needs_feature() {
        let mut cfg = AppConfig::default();
        cfg.store.backend = "mongodb".to_string();
        let err = open_store(&cfg, &purchase_orders()).await.err().unwrap();
        assert!(matches!(err, AgentError::Config(ref m) if m.contains("--features mongo")));
    }

    #[tokio::test]
    async fn test_process_rejects_blank_question() {
        let runtime = runtime_with(Arc::new(MockLlmClient::new()), Vec::new());
        let body: QueryRequestBody = serde_json::from_str(r#"{"question": "   "}"#).unwrap();
        let response = runtime.process(body).await;
        assert!(!response.success);
        assert!(response.error.unwrap_or_default().starts_with("Invalid request"));
    }

    #[tokio::test]
    async fn test_conversation_history_carried_between_requests() {
        let mock = Arc::new(MockLlmClient::scripted(vec![
            Ok(r#"[{"$count": "count"}]"#.to_string()),
            Ok("There are 3 purchase orders.".to_string()),
            Ok(r#"[{"$count": "count"}]"#.to_string()),
            Ok("Still 3.".to_string()),
        ]));
        let runtime = runtime_with(mock.clone(), orders());
        let first: QueryRequestBody =
            serde_json::from_str(r#"{"question": "How many orders?", "conversation_id": "c-1"}"#).unwrap();
        assert!(runtime.process(first).await.success);
        assert_eq!(runtime.conversations.history("c-1").len(), 1);

        let second: QueryRequestBody =
            serde_json::from_str(r#"{"question": "And now?", "conversation_id": "c-1"}"#).unwrap();
        let request = runtime.prepare(second).unwrap();
        assert_eq!(request.history()[0].answer, "There are 3 purchase orders.");
        assert!(runtime.execute(request).await.success);

        let calls = mock.calls();
        let third_prompt: String = calls[2].iter().map(|m| m.content.as_str()).collect();
        assert!(third_prompt.contains("There are 3 purchase orders."));

        assert_eq!(runtime.conversations.reset(Some("c-1")), 1);
        assert!(runtime.conversations.history("c-1").is_empty());
    }

    #[tokio::test]
    async fn test_aggregate_validates_before_executing() {
        let runtime = runtime_with(Arc::new(MockLlmClient::new()), orders());

        let ok = runtime
            .aggregate(&json!([{"$group": {"_id": "$department.name", "n": {"$sum": 1}}}, {"$sort": {"n": -1}}]), None)
            .await
            .unwrap();
        assert_eq!(ok.count, 2);
        assert_eq!(ok.rows[0]["_id"], "Health");

        let err = runtime
            .aggregate(&json!([{"$match": {"department.nmae": "Health"}}]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AggregateRejection::Invalid(ref issues) if issues.len() == 1));

        let err = runtime.aggregate(&json!({"$match": {}}), None).await.unwrap_err();
        assert!(matches!(err, AggregateRejection::Shape(_)));

        let err = runtime
            .aggregate(&json!([{"$out": "copy"}]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AggregateRejection::Invalid(_)));
    }

    #[tokio::test]
    async fn test_stats_summarize_collection() {
        let runtime = runtime_with(Arc::new(MockLlmClient::new()), orders());
        let stats = runtime.stats().await.unwrap();
        assert_eq!(stats.total_documents, 3);
        assert_eq!(stats.fiscal_years, vec![json!("2013-2014"), json!("2014-2015")]);
        assert_eq!(stats.acquisition_types.len(), 2);
        assert_eq!(stats.top_departments[0]["_id"], "Health");
        assert_eq!(stats.top_departments[0]["purchase_count"], 2);
        let prices = stats.price_statistics.unwrap();
        assert_eq!(prices["max_price"], 100.0);
        assert_eq!(prices["total_spend"], 175.0);
        assert!(!prices.contains_key("_id"));
    }

    #[tokio::test]
    async fn test_health_reports_store_and_usage() {
        let runtime = runtime_with(Arc::new(MockLlmClient::new()), orders());
        let report = runtime.health().await;
        assert!(report.is_healthy());
        assert!(report.llm_reachable);
        assert_eq!(report.store_documents, Some(3));
        assert_eq!(report.model, "mock");
        assert_eq!(report.token_usage, TokenCounts::default());
    }

    #[tokio::test]
    async fn test_health_flags_unreachable_model() {
        let mock = Arc::new(MockLlmClient::scripted(vec![Err(crate::llm::LlmError::Api(
            "connection refused".to_string(),
        ))]));
        let runtime = runtime_with(mock.clone(), orders());
        let report = runtime.health().await;
        assert!(report.database_connected);
        assert!(!report.llm_reachable);
        assert!(!report.is_healthy());
        assert!(report.error.unwrap_or_default().contains("connection refused"));
        assert_eq!(mock.options()[0].reasoning_effort, Some(ReasoningEffort::Minimal));
    }

    #[test]
    fn test_example_groups_cover_efforts() {
        let groups = example_questions();
        assert_eq!(groups.len(), 3);
        assert!(groups.iter().all(|g| !g.examples.is_empty()));
    }
}
