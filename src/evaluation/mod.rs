//! 离线评测
//!
//! 用例目录（TOML）描述问题、期望结果类型与 ground-truth 管道；
//! 评测时先在文档库上执行 ground-truth 管道，再按 profile 调用 Agent，最后按类型比较并输出 JSON 报告。

pub mod comparator;
pub mod runner;

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::ReasoningEffort;
use crate::llm::ModelTier;
use crate::pipeline::{Pipeline, PipelineShapeError};

pub use comparator::{compare, Comparison};
pub use runner::{EvalReport, EvalResult, EvalRunner, ProfileReport};

#[derive(Error, Debug)]
pub enum EvalError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Catalog parse error: {0}")]
    Catalog(#[from] toml::de::Error),

    #[error("Case '{id}': invalid ground truth pipeline: {reason}")]
    GroundTruth { id: String, reason: String },

    #[error("Report encode error: {0}")]
    Report(#[from] serde_json::Error),
}

/// 结果比较方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpectedType {
    /// 单个计数，整数精确相等
    Count,
    /// 数值聚合，按相对容差比较
    Aggregation,
    /// 分组列表，比较 `_id` 重合度
    List,
    /// 只要求成功并给出非空回答
    Semantic,
}

/// 一次评测使用的模型档位与参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalProfile {
    pub name: String,
    pub model: ModelTier,
    #[serde(default)]
    pub reasoning_effort: ReasoningEffort,
    #[serde(default = "default_profile_max_results")]
    pub max_results: usize,
}

fn default_profile_max_results() -> usize {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub category: String,
    #[serde(default = "default_difficulty")]
    pub difficulty: String,
    pub question: String,
    pub expected_type: ExpectedType,
    #[serde(default)]
    pub description: String,
    /// ground-truth 管道（JSON 文本）
    pub ground_truth: String,
    /// 缺省时使用配置中的默认容差
    pub tolerance: Option<f64>,
}

fn default_difficulty() -> String {
    "medium".to_string()
}

impl TestCase {
    pub fn ground_truth_pipeline(&self) -> Result<Pipeline, EvalError> {
        let invalid = |reason: String| EvalError::GroundTruth {
            id: self.id.clone(),
            reason,
        };
        let value: serde_json::Value =
            serde_json::from_str(&self.ground_truth).map_err(|e| invalid(e.to_string()))?;
        Pipeline::from_value(&value).map_err(|e: PipelineShapeError| invalid(e.to_string()))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalCatalog {
    #[serde(default)]
    pub profiles: Vec<EvalProfile>,
    #[serde(default)]
    pub cases: Vec<TestCase>,
}

impl EvalCatalog {
    pub fn from_toml(raw: &str) -> Result<Self, EvalError> {
        let catalog: EvalCatalog = toml::from_str(raw)?;
        for case in &catalog.cases {
            case.ground_truth_pipeline()?;
        }
        Ok(catalog)
    }

    pub async fn load(path: &Path) -> Result<Self, EvalError> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_toml(&raw)
    }

    /// 只保留指定 id 的用例（为空时不过滤）
    pub fn select(mut self, ids: &[String]) -> Self {
        if !ids.is_empty() {
            self.cases.retain(|c| ids.contains(&c.id));
        }
        self
    }
}
