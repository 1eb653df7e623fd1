//! HTTP 接口（feature = "web"）
//!
//! - `POST /api/ai/query`：自然语言查询，非法输入返回 422 与结构化错误
//! - `GET /api/ai/schema`：集合、schema 版本与阶段白名单
//! - `GET /api/ai/examples`：按推理强度分组的示例问题
//! - `POST /api/ai/health`：文档库连通性、模型与累计 token 用量
//! - `POST /api/ai/reset`：清空一个或全部会话历史
//! - `GET /api/query/stats`：集合概况
//! - `POST /api/query/aggregate`：直接执行管道（同样经过校验）
//! - `GET /api/health`：文档数、默认模型与 token 用量

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::agent::{example_questions, AgentRuntime, AggregateRejection};
use crate::core::{AgentError, AgentResponse, ExecutionErrorKind, QueryRequestBody};
use crate::store::DocumentStore;

pub fn router(runtime: AgentRuntime) -> Router {
    Router::new()
        .route("/api/ai/query", post(api_query))
        .route("/api/ai/schema", get(api_schema))
        .route("/api/ai/examples", get(api_examples))
        .route("/api/ai/health", post(api_agent_health))
        .route("/api/ai/reset", post(api_reset))
        .route("/api/query/stats", get(api_stats))
        .route("/api/query/aggregate", post(api_aggregate))
        .route("/api/health", get(api_health))
        .with_state(runtime)
}

#[derive(Debug, Default, Deserialize)]
struct ResetBody {
    #[serde(default)]
    conversation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AggregateBody {
    pipeline: Value,
    #[serde(default)]
    max_results: Option<usize>,
}

fn unprocessable(err: AgentError) -> Response {
    let body = AgentResponse::failure(&err, None, None);
    (StatusCode::UNPROCESSABLE_ENTITY, Json(body)).into_response()
}

async fn api_query(
    State(runtime): State<AgentRuntime>,
    payload: Result<Json<QueryRequestBody>, JsonRejection>,
) -> Response {
    let body = match payload {
        Ok(Json(body)) => body,
        Err(rejection) => return unprocessable(AgentError::InvalidRequest(rejection.body_text())),
    };
    let request = match runtime.prepare(body) {
        Ok(request) => request,
        Err(e) => return unprocessable(e),
    };
    tracing::info!(
        model = request.model_tier().as_str(),
        effort = request.reasoning_effort().as_str(),
        conversation_id = request.conversation_id().unwrap_or("-"),
        "query received"
    );
    let response = runtime.execute(request).await;
    Json(response).into_response()
}

async fn api_schema(State(runtime): State<AgentRuntime>) -> Json<serde_json::Value> {
    let schema = &runtime.schema;
    Json(json!({
        "collection": schema.collection,
        "version": schema.version,
        "description": schema.description,
        "fields": schema.fields,
        "allowed_stages": schema.allowed_stages,
        "forbidden_stages": schema.forbidden_stages,
    }))
}

async fn api_examples() -> Json<serde_json::Value> {
    Json(json!({ "groups": example_questions() }))
}

async fn api_agent_health(State(runtime): State<AgentRuntime>) -> Response {
    let report = runtime.health().await;
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

/// 请求体可省略；省略或不带 conversation_id 时清空全部会话
async fn api_reset(State(runtime): State<AgentRuntime>, body: Option<Json<ResetBody>>) -> Json<Value> {
    let Json(body) = body.unwrap_or_default();
    let cleared = runtime.conversations.reset(body.conversation_id.as_deref());
    tracing::info!(cleared, conversation_id = body.conversation_id.as_deref().unwrap_or("*"), "conversation reset");
    Json(json!({
        "success": true,
        "message": "Conversation state reset successfully",
        "cleared": cleared,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn api_stats(State(runtime): State<AgentRuntime>) -> Response {
    match runtime.stats().await {
        Ok(stats) => {
            let mut body = serde_json::to_value(&stats).unwrap_or_else(|_| json!({}));
            if let Value::Object(obj) = &mut body {
                obj.insert("success".to_string(), Value::Bool(true));
            }
            Json(body).into_response()
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "success": false, "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn api_aggregate(
    State(runtime): State<AgentRuntime>,
    payload: Result<Json<AggregateBody>, JsonRejection>,
) -> Response {
    let body = match payload {
        Ok(Json(body)) => body,
        Err(rejection) => return unprocessable(AgentError::InvalidRequest(rejection.body_text())),
    };
    match runtime.aggregate(&body.pipeline, body.max_results).await {
        Ok(result) => Json(json!({
            "success": true,
            "count": result.count,
            "data": result.rows,
            "execution_time_ms": result.duration.as_secs_f64() * 1000.0,
        }))
        .into_response(),
        Err(AggregateRejection::Invalid(issues)) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({
                "success": false,
                "error": "Pipeline failed validation",
                "issues": issues,
            })),
        )
            .into_response(),
        Err(AggregateRejection::Shape(detail)) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "success": false, "error": format!("Invalid pipeline: {}", detail) })),
        )
            .into_response(),
        Err(AggregateRejection::Execution(e)) => {
            let status = match e.kind {
                ExecutionErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
                ExecutionErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
                ExecutionErrorKind::StoreRejected => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (
                status,
                Json(json!({ "success": false, "error": format!("Aggregation failed: {}", e.detail) })),
            )
                .into_response()
        }
    }
}

async fn api_health(State(runtime): State<AgentRuntime>) -> Response {
    match runtime.store.count_documents().await {
        Ok(count) => Json(json!({
            "status": "healthy",
            "collection": runtime.store.collection_name(),
            "store_documents": count,
            "model": runtime.model_name,
            "token_usage": runtime.token_usage(),
        }))
        .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "error": e.to_string(),
                "model": runtime.model_name,
            })),
        )
            .into_response(),
    }
}
