//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `DOCQUERY__*` 覆盖（双下划线表示嵌套，如 `DOCQUERY__LLM__PROVIDER=openai`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub agent: AgentSection,
    pub store: StoreSection,
    pub schema: SchemaSection,
    pub evaluation: EvaluationSection,
}

/// [app] 段：应用名、HTTP 监听地址
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    #[serde(default = "default_app_name")]
    pub name: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_app_name() -> String {
    "docquery".to_string()
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

/// [llm] 段：后端选择、分级模型、超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / deepseek / mock；未配置 API Key 时回退 mock
    #[serde(default = "default_provider")]
    pub provider: String,
    pub base_url: Option<String>,
    /// 请求未指定 model 时使用的分级（gpt-5 / gpt-5-mini / gpt-5-nano）
    #[serde(default = "default_tier")]
    pub default_tier: String,
    #[serde(default)]
    pub tiers: LlmTiersSection,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: None,
            default_tier: default_tier(),
            tiers: LlmTiersSection::default(),
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_tier() -> String {
    "gpt-5".to_string()
}

/// [llm.tiers] 段：每个分级实际调用的模型名
#[derive(Debug, Clone, Deserialize)]
pub struct LlmTiersSection {
    #[serde(default = "default_full_model")]
    pub full: String,
    #[serde(default = "default_mini_model")]
    pub mini: String,
    #[serde(default = "default_nano_model")]
    pub nano: String,
}

impl Default for LlmTiersSection {
    fn default() -> Self {
        Self {
            full: default_full_model(),
            mini: default_mini_model(),
            nano: default_nano_model(),
        }
    }
}

fn default_full_model() -> String {
    "gpt-5".to_string()
}

fn default_mini_model() -> String {
    "gpt-5-mini".to_string()
}

fn default_nano_model() -> String {
    "gpt-5-nano".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 管道生成单次调用超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request: u64,
    /// 结果总结单次调用超时（秒）
    #[serde(default = "default_summarize_timeout")]
    pub summarize: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
            summarize: default_summarize_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

fn default_summarize_timeout() -> u64 {
    30
}

/// [agent] 段：重试预算、整次运行的墙钟预算、历史窗口、限流退避
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_run_budget_secs")]
    pub run_budget_secs: u64,
    /// 放入生成 Prompt 的最近对话轮数
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    #[serde(default)]
    pub backoff: BackoffSection,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            run_budget_secs: default_run_budget_secs(),
            history_turns: default_history_turns(),
            backoff: BackoffSection::default(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_run_budget_secs() -> u64 {
    180
}

fn default_history_turns() -> usize {
    5
}

/// [agent.backoff] 段：仅用于 provider 限流后的重试
#[derive(Debug, Clone, Deserialize)]
pub struct BackoffSection {
    #[serde(default = "default_backoff_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
}

impl Default for BackoffSection {
    fn default() -> Self {
        Self {
            base_ms: default_backoff_base_ms(),
            max_ms: default_backoff_max_ms(),
        }
    }
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    8000
}

/// [store] 段：后端选择、数据文件、集合名、查询超时
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    /// memory / mongodb；mongodb 需要以 `mongo` feature 编译
    #[serde(default = "default_store_backend")]
    pub backend: String,
    /// JSON 数组或 JSONL 文件（memory 后端）；未设置时为空集合
    pub data_path: Option<PathBuf>,
    /// MongoDB 连接串；未设置时读 MONGODB_URI
    pub uri: Option<String>,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            data_path: None,
            uri: None,
            database: default_database(),
            collection: default_collection(),
            query_timeout_secs: default_query_timeout_secs(),
        }
    }
}

fn default_store_backend() -> String {
    "memory".to_string()
}

fn default_database() -> String {
    "procurement".to_string()
}

fn default_collection() -> String {
    "purchase_orders".to_string()
}

fn default_query_timeout_secs() -> u64 {
    30
}

/// [schema] 段：自定义 Schema 参考（TOML），未设置时用内置采购单 schema
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SchemaSection {
    pub path: Option<PathBuf>,
}

/// [evaluation] 段：评测用例目录、报告输出目录、默认容差
#[derive(Debug, Clone, Deserialize)]
pub struct EvaluationSection {
    #[serde(default = "default_catalog_path")]
    pub catalog_path: PathBuf,
    #[serde(default = "default_report_dir")]
    pub report_dir: PathBuf,
    #[serde(default = "default_tolerance")]
    pub default_tolerance: f64,
}

impl Default for EvaluationSection {
    fn default() -> Self {
        Self {
            catalog_path: default_catalog_path(),
            report_dir: default_report_dir(),
            default_tolerance: default_tolerance(),
        }
    }
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("config/eval_catalog.toml")
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("reports")
}

fn default_tolerance() -> f64 {
    0.01
}

/// 从 config 目录加载配置，环境变量 DOCQUERY__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 DOCQUERY__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("DOCQUERY")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_sources() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.max_attempts, 3);
        assert_eq!(cfg.llm.default_tier, "gpt-5");
        assert_eq!(cfg.store.collection, "purchase_orders");
        assert_eq!(cfg.store.backend, "memory");
        assert!(cfg.store.uri.is_none());
        assert!(cfg.schema.path.is_none());
    }

    #[test]
    fn test_load_explicit_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[agent]\nmax_attempts = 5\n\n[store]\nbackend = \"mongodb\"\nquery_timeout_secs = 3\n\n[llm.tiers]\nmini = \"my-mini\"\n",
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.agent.max_attempts, 5);
        assert_eq!(cfg.store.query_timeout_secs, 3);
        assert_eq!(cfg.store.backend, "mongodb");
        assert_eq!(cfg.store.database, "procurement");
        assert_eq!(cfg.llm.tiers.mini, "my-mini");
        // 未出现的键仍取默认值
        assert_eq!(cfg.agent.backoff.base_ms, 500);
    }
}
