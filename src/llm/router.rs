//! 模型分级路由
//!
//! 请求体的 `model` 字段选择生成能力的档位（gpt-5 / gpt-5-mini / gpt-5-nano），
//! 路由器把档位映射到具体客户端；未注册的档位回落到默认档位。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient, TokenCounts};

/// 生成能力档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelTier {
    /// 能力最强，适合复杂多步分析
    #[serde(rename = "gpt-5", alias = "full")]
    Full,
    /// 速度/成本/能力均衡
    #[serde(rename = "gpt-5-mini", alias = "mini")]
    Mini,
    /// 最快，适合简单问题
    #[serde(rename = "gpt-5-nano", alias = "nano")]
    Nano,
}

impl ModelTier {
    pub const ALL: [ModelTier; 3] = [ModelTier::Full, ModelTier::Mini, ModelTier::Nano];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Full => "gpt-5",
            ModelTier::Mini => "gpt-5-mini",
            ModelTier::Nano => "gpt-5-nano",
        }
    }

    /// 解析配置或请求中的档位名，大小写不敏感
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "gpt-5" | "full" => Some(ModelTier::Full),
            "gpt-5-mini" | "mini" => Some(ModelTier::Mini),
            "gpt-5-nano" | "nano" => Some(ModelTier::Nano),
            _ => None,
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 档位 → 客户端
pub struct ModelRouter {
    models: HashMap<ModelTier, Arc<dyn LlmClient>>,
    default_tier: ModelTier,
    fallback: Arc<dyn LlmClient>,
}

impl ModelRouter {
    /// 以一个客户端作为兜底（也注册为默认档位）
    pub fn new(default_tier: ModelTier, fallback: Arc<dyn LlmClient>) -> Self {
        let mut models = HashMap::new();
        models.insert(default_tier, Arc::clone(&fallback));
        Self {
            models,
            default_tier,
            fallback,
        }
    }

    /// 所有档位共用同一个客户端（测试与 mock 运行）
    pub fn single(client: Arc<dyn LlmClient>) -> Self {
        let mut router = Self::new(ModelTier::Full, Arc::clone(&client));
        for tier in ModelTier::ALL {
            router.add_model(tier, Arc::clone(&client));
        }
        router
    }

    pub fn add_model(&mut self, tier: ModelTier, client: Arc<dyn LlmClient>) {
        self.models.insert(tier, client);
    }

    pub fn default_tier(&self) -> ModelTier {
        self.default_tier
    }

    /// 所有档位客户端的累计 token 用量；多个档位共用同一客户端时只计一次
    pub fn token_usage(&self) -> TokenCounts {
        let mut seen: Vec<*const ()> = Vec::new();
        let mut total = TokenCounts::default();
        for client in self.models.values().chain(std::iter::once(&self.fallback)) {
            let ptr = Arc::as_ptr(client) as *const ();
            if !seen.contains(&ptr) {
                seen.push(ptr);
                total = total + client.token_usage();
            }
        }
        total
    }

    /// 取档位对应客户端；未注册时回落到默认档位
    pub fn route(&self, tier: ModelTier) -> Arc<dyn LlmClient> {
        match self.models.get(&tier) {
            Some(client) => Arc::clone(client),
            None => {
                tracing::warn!("No client registered for tier {}, using {}", tier, self.default_tier);
                Arc::clone(&self.fallback)
            }
        }
    }
}

/// 根据配置与环境变量创建路由器（OpenAI 兼容 / DeepSeek / Mock）
pub fn create_router_from_config(cfg: &AppConfig) -> ModelRouter {
    let provider = cfg.llm.provider.to_lowercase();
    let default_tier = ModelTier::parse(&cfg.llm.default_tier).unwrap_or_else(|| {
        tracing::warn!("Unknown default tier '{}', using gpt-5", cfg.llm.default_tier);
        ModelTier::Full
    });

    let has_openai_key = std::env::var("OPENAI_API_KEY").is_ok();
    let has_deepseek_key = std::env::var("DEEPSEEK_API_KEY").is_ok();

    let tiers = cfg.llm.tiers.clone();
    let model_for = move |tier: ModelTier| -> String {
        match tier {
            ModelTier::Full => tiers.full.clone(),
            ModelTier::Mini => tiers.mini.clone(),
            ModelTier::Nano => tiers.nano.clone(),
        }
    };

    let build: Option<Box<dyn Fn(ModelTier) -> Arc<dyn LlmClient>>> =
        if provider == "deepseek" && (has_deepseek_key || has_openai_key) {
            tracing::info!("Using DeepSeek LLM");
            Some(Box::new(move |tier| {
                Arc::new(OpenAiClient::deepseek(Some(&model_for(tier)))) as Arc<dyn LlmClient>
            }))
        } else if provider == "openai" && has_openai_key {
            let base = cfg.llm.base_url.clone();
            tracing::info!("Using OpenAI-compatible LLM ({})", base.as_deref().unwrap_or("api.openai.com"));
            Some(Box::new(move |tier| {
                Arc::new(OpenAiClient::new(base.as_deref(), &model_for(tier), None))
                    as Arc<dyn LlmClient>
            }))
        } else {
            None
        };

    match build {
        Some(build) => {
            let mut router = ModelRouter::new(default_tier, build(default_tier));
            for tier in ModelTier::ALL {
                if tier != default_tier {
                    router.add_model(tier, build(tier));
                }
            }
            router
        }
        None => {
            tracing::warn!("No API key set or provider '{}' unknown, using Mock LLM", provider);
            ModelRouter::single(Arc::new(MockLlmClient::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::llm::RequestOptions;

    struct Named(&'static str);

    #[async_trait::async_trait]
    impl LlmClient for Named {
        async fn complete(
            &self,
            _messages: &[crate::memory::Message],
            _options: &RequestOptions,
        ) -> Result<String, crate::llm::LlmError> {
            Ok(self.0.to_string())
        }

        fn model_name(&self) -> &str {
            self.0
        }

        fn token_usage(&self) -> TokenCounts {
            TokenCounts {
                prompt_tokens: 2,
                completion_tokens: 1,
                total_tokens: 3,
            }
        }
    }

    #[test]
    fn test_tier_wire_names() {
        let tier: ModelTier = serde_json::from_str("\"gpt-5-mini\"").unwrap();
        assert_eq!(tier, ModelTier::Mini);
        let alias: ModelTier = serde_json::from_str("\"nano\"").unwrap();
        assert_eq!(alias, ModelTier::Nano);
        assert_eq!(serde_json::to_string(&ModelTier::Full).unwrap(), "\"gpt-5\"");
        assert!(serde_json::from_str::<ModelTier>("\"gpt-4\"").is_err());
        assert_eq!(ModelTier::parse("GPT-5-NANO"), Some(ModelTier::Nano));
    }

    #[test]
    fn test_route_falls_back_to_default() {
        let mut router = ModelRouter::new(ModelTier::Full, Arc::new(Named("big")));
        router.add_model(ModelTier::Nano, Arc::new(Named("small")));

        assert_eq!(router.route(ModelTier::Nano).model_name(), "small");
        assert_eq!(router.route(ModelTier::Mini).model_name(), "big");
        assert_eq!(router.default_tier(), ModelTier::Full);
    }

    #[test]
    fn test_shared_client_usage_counted_once() {
        let shared = ModelRouter::single(Arc::new(Named("one")));
        assert_eq!(shared.token_usage().total_tokens, 3);

        let mut split = ModelRouter::new(ModelTier::Full, Arc::new(Named("big")));
        split.add_model(ModelTier::Nano, Arc::new(Named("small")));
        assert_eq!(split.token_usage().total_tokens, 6);
    }
}
