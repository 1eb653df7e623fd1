//! 状态机定义：阶段、阶段结果与转移函数，以及单次运行独占的 AgentState
//!
//! 转移函数是纯函数：(当前阶段, 阶段结果, 已用尝试次数, 上限) → 下一阶段。
//! 失败边（生成失败 / 校验不通过 / 执行失败）在预算用尽时进入 Failed，否则回到 Generating。

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::core::{ExecutionError, StageFailure};
use crate::pipeline::{Pipeline, ValidationIssue};
use crate::store::Document;

/// 编排阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Planning,
    Generating,
    Validating,
    Executing,
    Summarizing,
    Done,
    Failed,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Planning => "planning",
            Stage::Generating => "generating",
            Stage::Validating => "validating",
            Stage::Executing => "executing",
            Stage::Summarizing => "summarizing",
            Stage::Done => "done",
            Stage::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 阶段执行结果（只携带决定转移所需的标签）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Planned,
    Generated,
    GenerationFailed,
    Valid,
    Invalid,
    Executed,
    ExecutionFailed,
    Summarized,
    /// 预算耗尽、取消或基础设施故障
    Aborted,
}

/// 状态转移；非法组合一律进入 Failed
pub fn transition(stage: Stage, outcome: Outcome, attempt: u32, max_attempts: u32) -> Stage {
    let retry_or_fail = || {
        if attempt >= max_attempts {
            Stage::Failed
        } else {
            Stage::Generating
        }
    };

    match (stage, outcome) {
        (_, Outcome::Aborted) => Stage::Failed,
        (Stage::Planning, Outcome::Planned) => Stage::Generating,
        (Stage::Generating, Outcome::Generated) => Stage::Validating,
        (Stage::Generating, Outcome::GenerationFailed) => retry_or_fail(),
        (Stage::Validating, Outcome::Valid) => Stage::Executing,
        (Stage::Validating, Outcome::Invalid) => retry_or_fail(),
        (Stage::Executing, Outcome::Executed) => Stage::Summarizing,
        (Stage::Executing, Outcome::ExecutionFailed) => retry_or_fail(),
        (Stage::Summarizing, Outcome::Summarized) => Stage::Done,
        _ => Stage::Failed,
    }
}

/// 各阶段累计耗时
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageTimings {
    pub planning: Duration,
    pub generating: Duration,
    pub validating: Duration,
    pub executing: Duration,
    pub summarizing: Duration,
}

impl StageTimings {
    pub fn record(&mut self, stage: Stage, elapsed: Duration) {
        let slot = match stage {
            Stage::Planning => &mut self.planning,
            Stage::Generating => &mut self.generating,
            Stage::Validating => &mut self.validating,
            Stage::Executing => &mut self.executing,
            Stage::Summarizing => &mut self.summarizing,
            Stage::Done | Stage::Failed => return,
        };
        *slot += elapsed;
    }

    pub fn total(&self) -> Duration {
        self.planning + self.generating + self.validating + self.executing + self.summarizing
    }
}

/// 一次失败尝试的纠错上下文（回灌给下一次生成）
#[derive(Debug, Clone, PartialEq)]
pub struct FailureFeedback {
    pub attempt: u32,
    pub failure: StageFailure,
    /// 失败时的候选管道；生成阶段失败时没有
    pub pipeline: Option<Pipeline>,
}

/// 单次运行的可变状态，只属于一个编排器运行
#[derive(Debug, Clone)]
pub struct AgentState {
    pub stage: Stage,
    /// 已开始的生成轮次（首轮为 1），不超过上限
    pub attempt: u32,
    pub pipeline: Option<Pipeline>,
    /// 最近一次尝试的校验错误
    pub validation_errors: Vec<ValidationIssue>,
    pub execution_error: Option<ExecutionError>,
    pub rows: Option<Vec<Document>>,
    pub elapsed: StageTimings,
    pub last_error: Option<String>,
    pub feedback: Vec<FailureFeedback>,
    /// 经过的阶段序列（含初始 Planning）
    pub trace: Vec<Stage>,
    /// 最近一次被丢弃的候选，失败响应里返回给调用方
    pub last_candidate: Option<Pipeline>,
}

impl Default for AgentState {
    fn default() -> Self {
        Self {
            stage: Stage::Planning,
            attempt: 0,
            pipeline: None,
            validation_errors: Vec::new(),
            execution_error: None,
            rows: None,
            elapsed: StageTimings::default(),
            last_error: None,
            feedback: Vec::new(),
            trace: vec![Stage::Planning],
            last_candidate: None,
        }
    }
}

impl AgentState {
    pub fn new() -> Self {
        Self::default()
    }

    /// 进入下一阶段；进入 Generating 时开始新一轮尝试并清空上一轮的候选与错误
    pub fn advance(&mut self, next: Stage) {
        if next == Stage::Generating {
            self.attempt += 1;
            self.pipeline = None;
            self.validation_errors.clear();
            self.execution_error = None;
            self.rows = None;
        }
        self.stage = next;
        self.trace.push(next);
    }

    /// 记录本轮失败：保存错误上下文，丢弃候选
    pub fn record_failure(&mut self, failure: StageFailure) {
        match &failure {
            StageFailure::Validation(issues) => self.validation_errors = issues.clone(),
            StageFailure::Execution(err) => self.execution_error = Some(err.clone()),
            StageFailure::Generation(_) => {}
        }
        self.last_error = Some(failure.to_string());
        let pipeline = self.pipeline.take();
        if pipeline.is_some() {
            self.last_candidate = pipeline.clone();
        }
        self.feedback.push(FailureFeedback {
            attempt: self.attempt,
            failure,
            pipeline,
        });
    }

    pub fn generation_rounds(&self) -> usize {
        self.trace.iter().filter(|s| **s == Stage::Generating).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::GenerationError;

    #[test]
    fn test_happy_path_order() {
        let mut stage = Stage::Planning;
        let outcomes = [
            Outcome::Planned,
            Outcome::Generated,
            Outcome::Valid,
            Outcome::Executed,
            Outcome::Summarized,
        ];
        let mut seen = vec![stage];
        for outcome in outcomes {
            stage = transition(stage, outcome, 1, 3);
            seen.push(stage);
        }
        assert_eq!(
            seen,
            vec![
                Stage::Planning,
                Stage::Generating,
                Stage::Validating,
                Stage::Executing,
                Stage::Summarizing,
                Stage::Done
            ]
        );
    }

    #[test]
    fn test_failure_edges_respect_budget() {
        assert_eq!(transition(Stage::Validating, Outcome::Invalid, 1, 3), Stage::Generating);
        assert_eq!(transition(Stage::Executing, Outcome::ExecutionFailed, 2, 3), Stage::Generating);
        assert_eq!(transition(Stage::Executing, Outcome::ExecutionFailed, 3, 3), Stage::Failed);
        assert_eq!(transition(Stage::Generating, Outcome::GenerationFailed, 3, 3), Stage::Failed);
    }

    #[test]
    fn test_execution_failure_never_goes_back_to_validating() {
        for attempt in 0..5 {
            let next = transition(Stage::Executing, Outcome::ExecutionFailed, attempt, 3);
            assert_ne!(next, Stage::Validating);
        }
    }

    #[test]
    fn test_illegal_pairs_fail() {
        assert_eq!(transition(Stage::Planning, Outcome::Executed, 0, 3), Stage::Failed);
        assert_eq!(transition(Stage::Done, Outcome::Planned, 1, 3), Stage::Failed);
        assert_eq!(transition(Stage::Summarizing, Outcome::Aborted, 1, 3), Stage::Failed);
    }

    #[test]
    fn test_advance_and_record_failure() {
        let mut state = AgentState::new();
        state.advance(Stage::Generating);
        assert_eq!(state.attempt, 1);

        state.record_failure(StageFailure::Generation(GenerationError::Timeout));
        assert_eq!(state.feedback.len(), 1);
        assert_eq!(state.feedback[0].attempt, 1);
        assert!(state.last_error.as_deref().unwrap().contains("timed out"));

        state.advance(Stage::Generating);
        assert_eq!(state.attempt, 2);
        assert_eq!(state.generation_rounds(), 2);
    }

    #[test]
    fn test_timings_accumulate() {
        let mut timings = StageTimings::default();
        timings.record(Stage::Generating, Duration::from_millis(30));
        timings.record(Stage::Generating, Duration::from_millis(20));
        timings.record(Stage::Done, Duration::from_secs(9));
        assert_eq!(timings.generating, Duration::from_millis(50));
        assert_eq!(timings.total(), Duration::from_millis(50));
    }
}
