//! 错误恢复引擎
//!
//! 把阶段失败映射为 RecoveryAction：校验/执行/解析失败立即重新生成（错误上下文由编排器回灌），
//! provider 限流则按指数退避 + 抖动等待，存储不可达直接终止。尝试次数预算由状态机把关，不在这里判断。

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffSection;
use crate::core::{ExecutionErrorKind, GenerationError, RecoveryAction, StageFailure};

/// 限流退避参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&BackoffSection::default())
    }
}

impl From<&BackoffSection> for BackoffPolicy {
    fn from(section: &BackoffSection) -> Self {
        Self {
            base: Duration::from_millis(section.base_ms),
            max: Duration::from_millis(section.max_ms.max(section.base_ms)),
        }
    }
}

impl BackoffPolicy {
    /// 第 attempt 次（从 1 开始）失败后的等待：base * 2^(attempt-1) 封顶 max，再加至多一半的随机抖动，总体不超过 max
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = 1u64 << attempt.saturating_sub(1).min(16);
        let base_ms = self.base.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        let without_jitter = base_ms.saturating_mul(exp).min(max_ms);
        let jitter_ms = if without_jitter >= 2 {
            rand::thread_rng().gen_range(0..=without_jitter / 2)
        } else {
            0
        };
        Duration::from_millis(without_jitter.saturating_add(jitter_ms).min(max_ms))
    }
}

/// 语义化错误恢复
#[derive(Debug, Default, Clone)]
pub struct RecoveryEngine {
    backoff: BackoffPolicy,
}

impl RecoveryEngine {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self { backoff }
    }

    /// attempt 为刚失败的那次尝试编号（从 1 开始）
    pub fn handle(&self, failure: &StageFailure, attempt: u32) -> RecoveryAction {
        match failure {
            StageFailure::Generation(GenerationError::Throttled { retry_after }) => {
                let computed = self.backoff.delay(attempt);
                let wait = retry_after
                    .map(|hint| hint.max(computed))
                    .unwrap_or(computed)
                    .min(self.backoff.max);
                RecoveryAction::BackoffThenRegenerate(wait)
            }
            StageFailure::Generation(_) => RecoveryAction::Regenerate,
            StageFailure::Validation(_) => RecoveryAction::Regenerate,
            StageFailure::Execution(e) if e.kind == ExecutionErrorKind::Unavailable => {
                RecoveryAction::Abort(e.detail.clone())
            }
            StageFailure::Execution(_) => RecoveryAction::Regenerate,
        }
    }
}
