//! 管道生成器
//!
//! Planning 阶段把请求整理为 GenerationContext（历史窗口、推理强度、档位）；
//! 每次生成带上累计的失败上下文调用生成能力，并把文本输出解析为 Pipeline。

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde_json::Value;

use crate::core::{FailureFeedback, GenerationError, QueryRequest, ReasoningEffort};
use crate::llm::{ModelRouter, ModelTier, RequestOptions};
use crate::memory::{recent_window, ConversationTurn};
use crate::pipeline::prompts::{build_static_prefix, generation_messages};
use crate::pipeline::Pipeline;
use crate::schema::SchemaReference;

static CODE_FENCE_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// 生成所需的上下文（不可变，整个运行内复用）
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationContext {
    pub question: String,
    pub history: Vec<ConversationTurn>,
    pub effort: ReasoningEffort,
    pub max_results: usize,
    pub tier: ModelTier,
}

pub struct PipelineGenerator {
    router: Arc<ModelRouter>,
    schema: Arc<SchemaReference>,
    static_prefix: String,
    timeout: Duration,
    history_turns: usize,
}

impl PipelineGenerator {
    pub fn new(
        router: Arc<ModelRouter>,
        schema: Arc<SchemaReference>,
        timeout: Duration,
        history_turns: usize,
    ) -> Self {
        let static_prefix = build_static_prefix(&schema);
        Self {
            router,
            schema,
            static_prefix,
            timeout,
            history_turns,
        }
    }

    pub fn schema(&self) -> &SchemaReference {
        &self.schema
    }

    pub fn router(&self) -> &ModelRouter {
        &self.router
    }

    /// Planning：组装生成上下文，不会失败
    pub fn plan(&self, request: &QueryRequest) -> GenerationContext {
        GenerationContext {
            question: request.question().to_string(),
            history: recent_window(request.history(), self.history_turns),
            effort: request.reasoning_effort(),
            max_results: request.max_results(),
            tier: request.model_tier(),
        }
    }

    /// 生成一个候选管道；feedback 为之前失败尝试的纠错上下文
    pub async fn generate(
        &self,
        ctx: &GenerationContext,
        feedback: &[FailureFeedback],
    ) -> Result<Pipeline, GenerationError> {
        let messages = generation_messages(
            &self.static_prefix,
            &ctx.question,
            &ctx.history,
            feedback,
            ctx.effort,
            ctx.max_results,
        );
        let client = self.router.route(ctx.tier);
        tracing::debug!(model = client.model_name(), feedback = feedback.len(), "generating pipeline");

        let options = RequestOptions::generation(ctx.effort);
        let text = match tokio::time::timeout(self.timeout, client.complete(&messages, &options)).await {
            Ok(result) => result?,
            Err(_) => return Err(GenerationError::Timeout),
        };
        parse_pipeline_output(&text)
    }
}

/// 解析生成输出：容忍 markdown 代码块与前后说明文字，取最外层 JSON 数组
pub fn parse_pipeline_output(text: &str) -> Result<Pipeline, GenerationError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(GenerationError::Malformed("empty output".to_string()));
    }

    let fenced = CODE_FENCE_RE
        .get_or_init(|| Regex::new(r"```(?:json|JSON)?\s*([\s\S]*?)```").ok())
        .as_ref()
        .and_then(|re| re.captures(trimmed))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim());
    let body = fenced.unwrap_or(trimmed);

    let value = match serde_json::from_str::<Value>(body) {
        Ok(value) => value,
        Err(err) => first_embedded_array(body).ok_or_else(|| {
            if body.contains('[') {
                GenerationError::Malformed(format!("invalid JSON: {}", err))
            } else {
                GenerationError::Malformed("no JSON array found in output".to_string())
            }
        })?,
    };

    // 兼容 {"pipeline": [...]} 包装
    let value = match value {
        Value::Object(mut obj) if obj.len() == 1 && obj.contains_key("pipeline") => {
            obj.remove("pipeline").unwrap_or(Value::Null)
        }
        other => other,
    };

    Pipeline::from_value(&value).map_err(|e| GenerationError::Malformed(e.to_string()))
}

/// 依次尝试每个 `[` 起点，取第一个能解析为「对象数组」的值（其后的说明文字忽略）
fn first_embedded_array(body: &str) -> Option<Value> {
    body.match_indices('[').find_map(|(start, _)| {
        let mut values = serde_json::Deserializer::from_str(&body[start..]).into_iter::<Value>();
        match values.next() {
            Some(Ok(Value::Array(items))) if items.iter().all(Value::is_object) => Some(Value::Array(items)),
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageFailure;
    use crate::llm::{LlmError, MockLlmClient};
    use crate::schema::procurement;

    #[test]
    fn test_parse_plain_array() {
        let p = parse_pipeline_output(r#"[{"$count": "count"}]"#).unwrap();
        assert_eq!(p.operators(), vec!["$count"]);
    }

    #[test]
    fn test_parse_fenced_with_prose() {
        let text = "Here is the pipeline:\n```json\n[{\"$match\": {\"cal_card\": true}}, {\"$limit\": 5}]\n```\nDone.";
        let p = parse_pipeline_output(text).unwrap();
        assert_eq!(p.operators(), vec!["$match", "$limit"]);
    }

    #[test]
    fn test_parse_array_inside_prose() {
        let text = "Sure! [{\"$sort\": {\"item.total_price\": -1}}] should work.";
        assert_eq!(parse_pipeline_output(text).unwrap().len(), 1);
    }

    #[test]
    fn test_parse_skips_brackets_in_leading_prose() {
        let text = "Using the [schema] fields, here it is: [{\"$count\": \"n\"}]";
        assert_eq!(parse_pipeline_output(text).unwrap().operators(), vec!["$count"]);

        let trailing = "[{\"$limit\": 3}] (see [docs] for details)";
        assert_eq!(parse_pipeline_output(trailing).unwrap().operators(), vec!["$limit"]);
    }

    #[test]
    fn test_parse_wrapped_object() {
        let p = parse_pipeline_output(r#"{"pipeline": [{"$count": "n"}]}"#).unwrap();
        assert_eq!(p.len(), 1);
    }

    #[test]
    fn test_parse_rejects_bad_shapes() {
        for bad in [
            "",
            "I cannot answer that",
            r#"{"$match": {}}"#,
            "[]",
            r#"[{"$match": {}, "$limit": 1}]"#,
            r#"["$match"]"#,
        ] {
            assert!(
                matches!(parse_pipeline_output(bad), Err(GenerationError::Malformed(_))),
                "{:?} should be malformed",
                bad
            );
        }
    }

    fn generator(mock: Arc<MockLlmClient>, timeout: Duration) -> PipelineGenerator {
        PipelineGenerator::new(
            Arc::new(ModelRouter::single(mock)),
            Arc::new(procurement::purchase_orders()),
            timeout,
            2,
        )
    }

    #[test]
    fn test_plan_windows_history() {
        let mock = Arc::new(MockLlmClient::new());
        let gen = generator(mock, Duration::from_secs(1));
        let history = (0..5)
            .map(|i| ConversationTurn::new(format!("q{}", i), format!("a{}", i)))
            .collect();
        let request = QueryRequest::new("next?", ModelTier::Mini)
            .unwrap()
            .with_history(history);
        let ctx = gen.plan(&request);
        assert_eq!(ctx.history.len(), 2);
        assert_eq!(ctx.history[1].question, "q4");
        assert_eq!(ctx.tier, ModelTier::Mini);
    }

    #[tokio::test]
    async fn test_generate_maps_provider_errors() {
        let mock = Arc::new(MockLlmClient::scripted(vec![
            Err(LlmError::RateLimited { retry_after_ms: Some(1500) }),
            Ok("not a pipeline".to_string()),
        ]));
        let gen = generator(mock.clone(), Duration::from_secs(1));
        let request = QueryRequest::new("How many?", ModelTier::Full).unwrap();
        let ctx = gen.plan(&request);

        let first = gen.generate(&ctx, &[]).await;
        assert_eq!(
            first,
            Err(GenerationError::Throttled {
                retry_after: Some(Duration::from_millis(1500))
            })
        );

        let feedback = vec![FailureFeedback {
            attempt: 1,
            failure: StageFailure::Generation(first.unwrap_err()),
            pipeline: None,
        }];
        let second = gen.generate(&ctx, &feedback).await;
        assert!(matches!(second, Err(GenerationError::Malformed(_))));
        assert!(mock.calls()[1][1].content.contains("PREVIOUS ATTEMPTS FAILED"));
    }

    #[tokio::test]
    async fn test_generate_sends_reasoning_effort_to_provider() {
        let mock = Arc::new(MockLlmClient::scripted(vec![Ok(r#"[{"$count": "n"}]"#.to_string())]));
        let gen = generator(mock.clone(), Duration::from_secs(1));
        let request = QueryRequest::new("How many?", ModelTier::Full)
            .unwrap()
            .with_reasoning_effort(ReasoningEffort::High);
        gen.generate(&gen.plan(&request), &[]).await.unwrap();
        assert_eq!(mock.options(), vec![RequestOptions::generation(ReasoningEffort::High)]);
    }

    struct Slow;

    #[async_trait::async_trait]
    impl crate::llm::LlmClient for Slow {
        async fn complete(
            &self,
            _m: &[crate::memory::Message],
            _o: &RequestOptions,
        ) -> Result<String, LlmError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("[]".to_string())
        }

        fn model_name(&self) -> &str {
            "slow"
        }
    }

    #[tokio::test]
    async fn test_generate_times_out() {
        let gen = PipelineGenerator::new(
            Arc::new(ModelRouter::single(Arc::new(Slow))),
            Arc::new(procurement::purchase_orders()),
            Duration::from_millis(20),
            5,
        );
        let request = QueryRequest::new("How many?", ModelTier::Full).unwrap();
        let ctx = gen.plan(&request);
        assert_eq!(gen.generate(&ctx, &[]).await, Err(GenerationError::Timeout));
    }
}
