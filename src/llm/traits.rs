//! LLM 客户端抽象
//!
//! 管道生成与结果总结都只依赖这一窄接口：消息列表加请求选项进、文本出。
//! 后端（OpenAI 兼容 / DeepSeek / Mock）各自实现，并把失败归类为 LlmError，
//! 以便编排器区分「限流需退避」与「普通失败立即重试」。

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::core::{ReasoningEffort, Verbosity};
use crate::memory::Message;

/// LLM 调用失败的分类
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("LLM request timed out")]
    Timeout,

    /// provider 侧限流；retry_after_ms 为服务端建议的等待时间（若有）
    #[error("LLM provider throttled the request")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("LLM API error: {0}")]
    Api(String),

    #[error("LLM returned an empty response")]
    EmptyResponse,
}

/// 单次调用的 provider 参数；不支持的后端忽略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    pub reasoning_effort: Option<ReasoningEffort>,
    pub verbosity: Option<Verbosity>,
}

impl RequestOptions {
    pub fn generation(effort: ReasoningEffort) -> Self {
        Self {
            reasoning_effort: Some(effort),
            verbosity: None,
        }
    }

    pub fn summary(verbosity: Verbosity) -> Self {
        Self {
            reasoning_effort: None,
            verbosity: Some(verbosity),
        }
    }
}

/// 累计 token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenCounts {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl std::ops::Add for TokenCounts {
    type Output = TokenCounts;

    fn add(self, other: TokenCounts) -> TokenCounts {
        TokenCounts {
            prompt_tokens: self.prompt_tokens + other.prompt_tokens,
            completion_tokens: self.completion_tokens + other.completion_tokens,
            total_tokens: self.total_tokens + other.total_tokens,
        }
    }
}

impl TokenCounts {
    /// 两次快照之间的增量
    pub fn since(self, earlier: TokenCounts) -> TokenCounts {
        TokenCounts {
            prompt_tokens: self.prompt_tokens.saturating_sub(earlier.prompt_tokens),
            completion_tokens: self.completion_tokens.saturating_sub(earlier.completion_tokens),
            total_tokens: self.total_tokens.saturating_sub(earlier.total_tokens),
        }
    }
}

/// LLM 客户端 trait：非流式完成
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message], options: &RequestOptions) -> Result<String, LlmError>;

    /// 实际调用的模型名（用于日志与健康检查）
    fn model_name(&self) -> &str;

    /// 累计 token 用量；不统计的实现返回零
    fn token_usage(&self) -> TokenCounts {
        TokenCounts::default()
    }
}
