//! 错误分类与恢复动作
//!
//! 每个阶段返回自己的错误类型；编排器把它们包装为 StageFailure 交给 RecoveryEngine，
//! 由其决定 Regenerate / BackoffThenRegenerate / Abort。只有 AgentError 会出现在最终响应里。

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::llm::LlmError;
use crate::pipeline::ValidationIssue;

/// 管道生成失败：输出无法解析，或 provider 超时/限流/报错
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    #[error("Pipeline generation timed out")]
    Timeout,

    #[error("Generation provider throttled the request")]
    Throttled { retry_after: Option<Duration> },

    #[error("Generation provider error: {0}")]
    Provider(String),

    #[error("Malformed pipeline output: {0}")]
    Malformed(String),
}

impl From<LlmError> for GenerationError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Timeout => GenerationError::Timeout,
            LlmError::RateLimited { retry_after_ms } => GenerationError::Throttled {
                retry_after: retry_after_ms.map(Duration::from_millis),
            },
            LlmError::Api(msg) => GenerationError::Provider(msg),
            LlmError::EmptyResponse => GenerationError::Malformed("empty response".to_string()),
        }
    }
}

/// 执行失败类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionErrorKind {
    /// 超过查询超时
    Timeout,
    /// 存储拒绝了查询（操作符组合、运行期类型错误等）
    StoreRejected,
    /// 存储不可达，与查询是否正确无关
    Unavailable,
}

impl fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionErrorKind::Timeout => "timeout",
            ExecutionErrorKind::StoreRejected => "store rejected",
            ExecutionErrorKind::Unavailable => "store unavailable",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("Query execution failed ({kind}): {detail}")]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub detail: String,
}

impl ExecutionError {
    pub fn timeout(after: Duration) -> Self {
        Self {
            kind: ExecutionErrorKind::Timeout,
            detail: format!("exceeded time limit of {:.1}s", after.as_secs_f64()),
        }
    }

    pub fn rejected(detail: impl Into<String>) -> Self {
        Self {
            kind: ExecutionErrorKind::StoreRejected,
            detail: detail.into(),
        }
    }

    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self {
            kind: ExecutionErrorKind::Unavailable,
            detail: detail.into(),
        }
    }
}

/// 总结失败（非致命，降级为模板回答）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SummarizationError {
    #[error("Summarization timed out")]
    Timeout,

    #[error("Summarization provider error: {0}")]
    Provider(String),

    #[error("Summarization returned no text")]
    Empty,
}

impl From<LlmError> for SummarizationError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Timeout => SummarizationError::Timeout,
            LlmError::EmptyResponse => SummarizationError::Empty,
            other => SummarizationError::Provider(other.to_string()),
        }
    }
}

/// 单次尝试在某一阶段的失败（回灌到下一次生成）
#[derive(Debug, Clone, PartialEq)]
pub enum StageFailure {
    Generation(GenerationError),
    Validation(Vec<ValidationIssue>),
    Execution(ExecutionError),
}

impl StageFailure {
    pub fn stage_label(&self) -> &'static str {
        match self {
            StageFailure::Generation(_) => "generation",
            StageFailure::Validation(_) => "validation",
            StageFailure::Execution(_) => "execution",
        }
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageFailure::Generation(e) => write!(f, "{}", e),
            StageFailure::Validation(issues) => {
                let parts: Vec<String> = issues.iter().map(|i| i.to_string()).collect();
                write!(f, "Invalid pipeline: {}", parts.join("; "))
            }
            StageFailure::Execution(e) => write!(f, "{}", e),
        }
    }
}

/// 运行级错误：唯一会以 success=false 返回给调用方的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Could not produce a working query after {attempts} attempts. Last error: {last_error}")]
    ExhaustedRetries { attempts: u32, last_error: String },

    #[error("Query took longer than the allowed {0:?}")]
    RunBudgetExceeded(Duration),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Data store unavailable: {0}")]
    Infrastructure(String),

    #[error("Config error: {0}")]
    Config(String),
}

/// 恢复引擎根据失败类型给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 携带错误上下文立即重新生成
    Regenerate,
    /// provider 限流：等待后再生成
    BackoffThenRegenerate(Duration),
    /// 基础设施故障，终止本次运行
    Abort(String),
}
