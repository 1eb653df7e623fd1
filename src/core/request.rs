//! 请求与响应
//!
//! QueryRequestBody 是服务层收到的线上格式（带默认值）；QueryRequest 是校验后的不可变请求，
//! 只能通过 QueryRequest::new / QueryRequestBody::into_request 构造。AgentResponse 即线上响应格式。

use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::llm::ModelTier;
use crate::memory::ConversationTurn;
use crate::pipeline::Pipeline;
use crate::store::Document;

pub const MAX_RESULTS_LIMIT: usize = 1000;
pub const DEFAULT_MAX_RESULTS: usize = 10;

/// 推理强度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Minimal,
    Low,
    #[default]
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningEffort::Minimal => "minimal",
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
        }
    }
}

/// 回答详细程度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Low,
    #[default]
    Medium,
    High,
}

impl Verbosity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verbosity::Low => "low",
            Verbosity::Medium => "medium",
            Verbosity::High => "high",
        }
    }
}

/// 校验后的查询请求
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    question: String,
    conversation_id: Option<String>,
    conversation_history: Vec<ConversationTurn>,
    max_results: usize,
    reasoning_effort: ReasoningEffort,
    verbosity: Verbosity,
    model_tier: ModelTier,
}

impl QueryRequest {
    /// 最小请求：其余字段取默认值
    pub fn new(question: impl Into<String>, model_tier: ModelTier) -> Result<Self, AgentError> {
        let question = question.into();
        if question.trim().is_empty() {
            return Err(AgentError::InvalidRequest("question must not be empty".to_string()));
        }
        Ok(Self {
            question: question.trim().to_string(),
            conversation_id: None,
            conversation_history: Vec::new(),
            max_results: DEFAULT_MAX_RESULTS,
            reasoning_effort: ReasoningEffort::default(),
            verbosity: Verbosity::default(),
            model_tier,
        })
    }

    pub fn with_history(mut self, history: Vec<ConversationTurn>) -> Self {
        self.conversation_history = history;
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Result<Self, AgentError> {
        if max_results == 0 || max_results > MAX_RESULTS_LIMIT {
            return Err(AgentError::InvalidRequest(format!(
                "max_results must be between 1 and {}, got {}",
                MAX_RESULTS_LIMIT, max_results
            )));
        }
        self.max_results = max_results;
        Ok(self)
    }

    pub fn with_reasoning_effort(mut self, effort: ReasoningEffort) -> Self {
        self.reasoning_effort = effort;
        self
    }

    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn with_conversation_id(mut self, id: Option<String>) -> Self {
        self.conversation_id = id;
        self
    }

    pub fn question(&self) -> &str {
        &self.question
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn history(&self) -> &[ConversationTurn] {
        &self.conversation_history
    }

    pub fn max_results(&self) -> usize {
        self.max_results
    }

    pub fn reasoning_effort(&self) -> ReasoningEffort {
        self.reasoning_effort
    }

    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    pub fn model_tier(&self) -> ModelTier {
        self.model_tier
    }
}

fn default_max_results() -> usize {
    DEFAULT_MAX_RESULTS
}

/// 线上请求体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequestBody {
    pub question: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub conversation_history: Option<Vec<ConversationTurn>>,
    #[serde(default)]
    pub reasoning_effort: ReasoningEffort,
    #[serde(default)]
    pub verbosity: Verbosity,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// 缺省时用配置的默认档位
    #[serde(default)]
    pub model: Option<ModelTier>,
}

impl QueryRequestBody {
    pub fn into_request(self, default_tier: ModelTier) -> Result<QueryRequest, AgentError> {
        QueryRequest::new(self.question, self.model.unwrap_or(default_tier))?
            .with_max_results(self.max_results)
            .map(|r| {
                r.with_history(self.conversation_history.unwrap_or_default())
                    .with_reasoning_effort(self.reasoning_effort)
                    .with_verbosity(self.verbosity)
                    .with_conversation_id(self.conversation_id)
            })
    }
}

/// 终态响应（线上格式）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub success: bool,
    pub answer: Option<String>,
    pub pipeline: Option<Pipeline>,
    pub results: Option<Vec<Document>>,
    pub result_count: Option<usize>,
    pub execution_time_seconds: Option<f64>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl AgentResponse {
    pub fn success(
        answer: String,
        pipeline: Pipeline,
        rows: Vec<Document>,
        execution_time_seconds: f64,
    ) -> Self {
        Self {
            success: true,
            answer: Some(answer),
            pipeline: Some(pipeline),
            result_count: Some(rows.len()),
            results: Some(rows),
            execution_time_seconds: Some(execution_time_seconds),
            error: None,
            timestamp: now_iso8601(),
        }
    }

    /// 失败响应：只带最后一次尝试的管道（若有），不带结果
    pub fn failure(
        error: &AgentError,
        attempted: Option<Pipeline>,
        execution_time_seconds: Option<f64>,
    ) -> Self {
        Self {
            success: false,
            answer: None,
            pipeline: attempted,
            results: None,
            result_count: None,
            execution_time_seconds,
            error: Some(error.to_string()),
            timestamp: now_iso8601(),
        }
    }
}

fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_defaults() {
        let body: QueryRequestBody =
            serde_json::from_str(r#"{"question": "How many total records are there?"}"#).unwrap();
        assert_eq!(body.max_results, 10);
        assert_eq!(body.reasoning_effort, ReasoningEffort::Medium);
        assert_eq!(body.verbosity, Verbosity::Medium);

        let request = body.into_request(ModelTier::Mini).unwrap();
        assert_eq!(request.model_tier(), ModelTier::Mini);
        assert!(request.history().is_empty());
    }

    #[test]
    fn test_body_full_fields() {
        let body: QueryRequestBody = serde_json::from_str(
            r#"{
                "question": "And for that department?",
                "conversation_id": "c-1",
                "conversation_history": [{"question": "Top department?", "answer": "Health Care Services"}],
                "reasoning_effort": "high",
                "verbosity": "low",
                "max_results": 50,
                "model": "gpt-5-nano"
            }"#,
        )
        .unwrap();
        let request = body.into_request(ModelTier::Full).unwrap();
        assert_eq!(request.reasoning_effort(), ReasoningEffort::High);
        assert_eq!(request.verbosity(), Verbosity::Low);
        assert_eq!(request.max_results(), 50);
        assert_eq!(request.model_tier(), ModelTier::Nano);
        assert_eq!(request.conversation_id(), Some("c-1"));
        assert_eq!(request.history()[0].answer, "Health Care Services");
    }

    #[test]
    fn test_request_rejects_bad_input() {
        assert!(matches!(
            QueryRequest::new("   ", ModelTier::Full),
            Err(AgentError::InvalidRequest(_))
        ));
        let req = QueryRequest::new("q", ModelTier::Full).unwrap();
        assert!(req.clone().with_max_results(0).is_err());
        assert!(req.clone().with_max_results(1001).is_err());
        assert!(req.with_max_results(1000).is_ok());
    }

    #[test]
    fn test_failure_response_shape() {
        let err = AgentError::ExhaustedRetries {
            attempts: 3,
            last_error: "Invalid pipeline".to_string(),
        };
        let response = AgentResponse::failure(&err, None, Some(1.5));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().unwrap().contains("3 attempts"));
        assert!(json["results"].is_null());
        assert!(json["timestamp"].as_str().unwrap().ends_with('Z'));
    }
}
