//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；DeepSeek 以预设 base_url 接入。
//! reasoning_effort / verbosity 只对 gpt-5 系列模型下发，其余模型忽略。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::error::{ApiError, OpenAIError};
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs, ReasoningEffort as ApiReasoningEffort,
    Verbosity as ApiVerbosity,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::core::{ReasoningEffort, Verbosity};
use crate::llm::{LlmClient, LlmError, RequestOptions, TokenCounts};
use crate::memory::{Message, Role};

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";

/// Token 使用统计（累计值，跨并发请求共享）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    prompt_tokens: Arc<AtomicU64>,
    completion_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TokenCounts {
        let prompt_tokens = self.prompt_tokens.load(Ordering::Relaxed);
        let completion_tokens = self.completion_tokens.load(Ordering::Relaxed);
        TokenCounts {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// OpenAI 兼容客户端：持有 Client 与 model 名，complete 时转 Message 为 API 格式并取首条 content
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = match base_url {
            Some(url) => OpenAIConfig::new().with_api_base(url).with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            usage: TokenUsage::default(),
        }
    }

    /// DeepSeek 预设：优先 DEEPSEEK_API_KEY，其次 OPENAI_API_KEY
    pub fn deepseek(model: Option<&str>) -> Self {
        let api_key = std::env::var("DEEPSEEK_API_KEY")
            .ok()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        Self::new(
            Some(DEEPSEEK_BASE_URL),
            model.unwrap_or(DEEPSEEK_CHAT),
            api_key.as_deref(),
        )
    }

    /// 只有 gpt-5 系列接受 reasoning_effort / verbosity
    pub fn supports_reasoning_options(&self) -> bool {
        self.model.to_ascii_lowercase().starts_with("gpt-5")
    }

    fn to_openai_messages(
        &self,
        messages: &[Message],
    ) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        messages
            .iter()
            .map(|m| {
                let built = match m.role {
                    Role::System => ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map(ChatCompletionRequestMessage::System),
                    Role::User => ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map(ChatCompletionRequestMessage::User),
                    Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map(ChatCompletionRequestMessage::Assistant),
                };
                built.map_err(|e| LlmError::Api(e.to_string()))
            })
            .collect()
    }
}

fn api_effort(effort: ReasoningEffort) -> ApiReasoningEffort {
    match effort {
        ReasoningEffort::Minimal => ApiReasoningEffort::Minimal,
        ReasoningEffort::Low => ApiReasoningEffort::Low,
        ReasoningEffort::Medium => ApiReasoningEffort::Medium,
        ReasoningEffort::High => ApiReasoningEffort::High,
    }
}

fn api_verbosity(verbosity: Verbosity) -> ApiVerbosity {
    match verbosity {
        Verbosity::Low => ApiVerbosity::Low,
        Verbosity::Medium => ApiVerbosity::Medium,
        Verbosity::High => ApiVerbosity::High,
    }
}

/// 按 API 错误对象的 code / type 分类；HTTP 层超时单独识别
pub fn classify_api_error(err: &OpenAIError) -> LlmError {
    match err {
        OpenAIError::ApiError(api) if is_rate_limit(api) => LlmError::RateLimited { retry_after_ms: None },
        OpenAIError::Reqwest(e) if e.is_timeout() => LlmError::Timeout,
        OpenAIError::Reqwest(e) if e.status().map(|s| s.as_u16()) == Some(429) => {
            LlmError::RateLimited { retry_after_ms: None }
        }
        other => LlmError::Api(other.to_string()),
    }
}

fn is_rate_limit(api: &ApiError) -> bool {
    api.code.as_deref() == Some("rate_limit_exceeded")
        || api.r#type.as_deref() == Some("rate_limit_exceeded")
        || api.r#type.as_deref() == Some("requests")
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn token_usage(&self) -> TokenCounts {
        self.usage.snapshot()
    }

    async fn complete(&self, messages: &[Message], options: &RequestOptions) -> Result<String, LlmError> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model).messages(self.to_openai_messages(messages)?);
        if self.supports_reasoning_options() {
            if let Some(effort) = options.reasoning_effort {
                args.reasoning_effort(api_effort(effort));
            }
            if let Some(verbosity) = options.verbosity {
                args.verbosity(api_verbosity(verbosity));
            }
        }
        let request = args.build().map_err(|e| LlmError::Api(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| classify_api_error(&e))?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        if content.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(content)
    }
}
