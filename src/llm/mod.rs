//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）、档位路由

pub mod mock;
pub mod openai;
pub mod router;
pub mod traits;

pub use mock::MockLlmClient;
pub use openai::{classify_api_error, OpenAiClient, TokenUsage, DEEPSEEK_BASE_URL, DEEPSEEK_CHAT};
pub use router::{create_router_from_config, ModelRouter, ModelTier};
pub use traits::{LlmClient, LlmError, RequestOptions, TokenCounts};
