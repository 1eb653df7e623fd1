//! Agent 编排器：单次请求的主控循环
//!
//! Planning → Generating → Validating → Executing → Summarizing → Done。
//! 每个阶段的外部调用都在 `tokio::select!` 中与取消令牌、整次运行的截止时间竞争；
//! 阶段失败交给 RecoveryEngine 决定动作，再由 `transition` 决定下一阶段（重试或 Failed）。
//! AgentRunner 可 Clone，多个请求并发运行时各自持有自己的 AgentState。

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::core::{
    transition, AgentError, AgentResponse, AgentState, Outcome, QueryRequest, RecoveryAction,
    RecoveryEngine, Stage, StageFailure,
};
use crate::llm::TokenCounts;
use crate::pipeline::{validate, GenerationContext, PipelineGenerator};
use crate::schema::SchemaReference;
use crate::store::QueryExecutor;
use crate::summarizer::{fallback_answer, AnswerSummarizer};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RUN_BUDGET: Duration = Duration::from_secs(180);

/// 外部调用被打断的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Cancelled,
    Deadline,
}

/// 在取消令牌与截止时间的约束下等待 fut
async fn guarded<F: Future>(
    cancel: &CancellationToken,
    deadline: tokio::time::Instant,
    fut: F,
) -> Result<F::Output, Interrupt> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupt::Cancelled),
        _ = tokio::time::sleep_until(deadline) => Err(Interrupt::Deadline),
        out = fut => Ok(out),
    }
}

#[derive(Clone)]
pub struct AgentRunner {
    generator: Arc<PipelineGenerator>,
    executor: Arc<QueryExecutor>,
    summarizer: Arc<AnswerSummarizer>,
    recovery: RecoveryEngine,
    max_attempts: u32,
    run_budget: Duration,
}

impl AgentRunner {
    pub fn new(
        generator: Arc<PipelineGenerator>,
        executor: Arc<QueryExecutor>,
        summarizer: Arc<AnswerSummarizer>,
    ) -> Self {
        Self {
            generator,
            executor,
            summarizer,
            recovery: RecoveryEngine::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            run_budget: DEFAULT_RUN_BUDGET,
        }
    }

    /// 至少 1 次
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_run_budget(mut self, budget: Duration) -> Self {
        self.run_budget = budget;
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryEngine) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn run_budget(&self) -> Duration {
        self.run_budget
    }

    pub fn schema(&self) -> &SchemaReference {
        self.generator.schema()
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    pub fn generator(&self) -> &PipelineGenerator {
        &self.generator
    }

    /// 生成与总结共用路由器上的累计 token 用量
    pub fn token_usage(&self) -> TokenCounts {
        self.generator.router().token_usage()
    }

    /// Planning 阶段的产物，不调用任何外部能力
    pub fn plan(&self, request: &QueryRequest) -> GenerationContext {
        self.generator.plan(request)
    }

    /// 运行一次请求；总是返回结构化响应
    pub async fn run(&self, request: QueryRequest) -> AgentResponse {
        self.run_with_state(request, CancellationToken::new()).await.0
    }

    pub async fn run_cancellable(
        &self,
        request: QueryRequest,
        cancel: CancellationToken,
    ) -> AgentResponse {
        self.run_with_state(request, cancel).await.0
    }

    /// 运行并返回最终状态（阶段轨迹、反馈、耗时），供评测与测试检查
    pub async fn run_with_state(
        &self,
        request: QueryRequest,
        cancel: CancellationToken,
    ) -> (AgentResponse, AgentState) {
        let request_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            "agent_run",
            request_id = %request_id,
            model = request.model_tier().as_str()
        );
        self.drive(request, cancel).instrument(span).await
    }

    async fn drive(
        &self,
        request: QueryRequest,
        cancel: CancellationToken,
    ) -> (AgentResponse, AgentState) {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.run_budget;
        let mut state = AgentState::new();
        let mut execution_secs: Option<f64> = None;

        tracing::info!(question = request.question(), "run started");

        let t = Instant::now();
        let ctx = self.generator.plan(&request);
        state.elapsed.record(Stage::Planning, t.elapsed());
        self.step(&mut state, Outcome::Planned);

        loop {
            match state.stage {
                Stage::Generating => {
                    let t = Instant::now();
                    let generated =
                        guarded(&cancel, deadline, self.generator.generate(&ctx, &state.feedback)).await;
                    state.elapsed.record(Stage::Generating, t.elapsed());
                    match generated {
                        Err(interrupt) => return self.interrupted(state, interrupt, started),
                        Ok(Ok(pipeline)) => {
                            tracing::debug!(pipeline = %pipeline, "candidate generated");
                            state.pipeline = Some(pipeline);
                            self.step(&mut state, Outcome::Generated);
                        }
                        Ok(Err(e)) => {
                            let failure = StageFailure::Generation(e);
                            if let Err(err) = self
                                .recover(&mut state, failure, Outcome::GenerationFailed, &cancel, deadline)
                                .await
                            {
                                return self.fail(state, err, started);
                            }
                        }
                    }
                }
                Stage::Validating => {
                    let t = Instant::now();
                    let result = match state.pipeline.as_ref() {
                        Some(pipeline) => validate(pipeline, self.generator.schema(), ctx.max_results),
                        None => {
                            let err = AgentError::Infrastructure("no candidate to validate".to_string());
                            return self.fail(state, err, started);
                        }
                    };
                    state.elapsed.record(Stage::Validating, t.elapsed());
                    if result.ok {
                        self.step(&mut state, Outcome::Valid);
                    } else {
                        let failure = StageFailure::Validation(result.errors);
                        if let Err(err) = self
                            .recover(&mut state, failure, Outcome::Invalid, &cancel, deadline)
                            .await
                        {
                            return self.fail(state, err, started);
                        }
                    }
                }
                Stage::Executing => {
                    let Some(pipeline) = state.pipeline.clone() else {
                        let err = AgentError::Infrastructure("no candidate to execute".to_string());
                        return self.fail(state, err, started);
                    };
                    let t = Instant::now();
                    let executed =
                        guarded(&cancel, deadline, self.executor.execute(&pipeline, ctx.max_results)).await;
                    state.elapsed.record(Stage::Executing, t.elapsed());
                    match executed {
                        Err(interrupt) => return self.interrupted(state, interrupt, started),
                        Ok(Ok(result)) => {
                            execution_secs = Some(result.duration_secs());
                            state.rows = Some(result.rows);
                            self.step(&mut state, Outcome::Executed);
                        }
                        Ok(Err(e)) => {
                            let failure = StageFailure::Execution(e);
                            if let Err(err) = self
                                .recover(&mut state, failure, Outcome::ExecutionFailed, &cancel, deadline)
                                .await
                            {
                                return self.fail(state, err, started);
                            }
                        }
                    }
                }
                Stage::Summarizing => {
                    let rows = state.rows.clone().unwrap_or_default();
                    let Some(pipeline) = state.pipeline.clone() else {
                        let err = AgentError::Infrastructure("no executed pipeline".to_string());
                        return self.fail(state, err, started);
                    };
                    let t = Instant::now();
                    let summarized = guarded(
                        &cancel,
                        deadline,
                        self.summarizer.answer(
                            &ctx.question,
                            &rows,
                            &pipeline,
                            request.verbosity(),
                            ctx.tier,
                        ),
                    )
                    .await;
                    state.elapsed.record(Stage::Summarizing, t.elapsed());
                    let answer = match summarized {
                        Ok(answer) => answer,
                        Err(Interrupt::Deadline) => {
                            tracing::warn!("run budget reached while summarizing, using templated answer");
                            fallback_answer(&ctx.question, &rows)
                        }
                        Err(Interrupt::Cancelled) => {
                            return self.fail(state, AgentError::Cancelled, started)
                        }
                    };
                    self.step(&mut state, Outcome::Summarized);
                    tracing::info!(
                        attempts = state.attempt,
                        rows = rows.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "run succeeded"
                    );
                    let secs = execution_secs.unwrap_or_else(|| started.elapsed().as_secs_f64());
                    return (AgentResponse::success(answer, pipeline, rows, secs), state);
                }
                Stage::Planning | Stage::Done | Stage::Failed => {
                    let err = AgentError::Infrastructure(format!("unexpected stage {}", state.stage));
                    return self.fail(state, err, started);
                }
            }
        }
    }

    /// 按转移函数前进一步
    fn step(&self, state: &mut AgentState, outcome: Outcome) {
        let next = transition(state.stage, outcome, state.attempt, self.max_attempts);
        tracing::info!(from = %state.stage, to = %next, attempt = state.attempt, "stage transition");
        state.advance(next);
    }

    /// 处理一次阶段失败：记录反馈、执行恢复动作，并转移到下一次生成；
    /// 预算用尽或需要终止时返回运行级错误
    async fn recover(
        &self,
        state: &mut AgentState,
        failure: StageFailure,
        outcome: Outcome,
        cancel: &CancellationToken,
        deadline: tokio::time::Instant,
    ) -> Result<(), AgentError> {
        tracing::warn!(
            attempt = state.attempt,
            stage = failure.stage_label(),
            error = %failure,
            "attempt failed"
        );
        let action = self.recovery.handle(&failure, state.attempt);
        state.record_failure(failure);

        if let RecoveryAction::Abort(detail) = action {
            return Err(AgentError::Infrastructure(detail));
        }

        let next = transition(state.stage, outcome, state.attempt, self.max_attempts);
        if next == Stage::Failed {
            return Err(AgentError::ExhaustedRetries {
                attempts: state.attempt,
                last_error: state.last_error.clone().unwrap_or_default(),
            });
        }

        if let RecoveryAction::BackoffThenRegenerate(wait) = action {
            tracing::info!(wait_ms = wait.as_millis() as u64, "provider throttled, backing off");
            match guarded(cancel, deadline, tokio::time::sleep(wait)).await {
                Ok(()) => {}
                Err(Interrupt::Cancelled) => return Err(AgentError::Cancelled),
                Err(Interrupt::Deadline) => return Err(AgentError::RunBudgetExceeded(self.run_budget)),
            }
        }

        tracing::info!(from = %state.stage, to = %next, attempt = state.attempt, "retrying");
        state.advance(next);
        Ok(())
    }

    fn interrupted(
        &self,
        state: AgentState,
        interrupt: Interrupt,
        started: Instant,
    ) -> (AgentResponse, AgentState) {
        let err = match interrupt {
            Interrupt::Cancelled => AgentError::Cancelled,
            Interrupt::Deadline => AgentError::RunBudgetExceeded(self.run_budget),
        };
        self.fail(state, err, started)
    }

    fn fail(
        &self,
        mut state: AgentState,
        err: AgentError,
        started: Instant,
    ) -> (AgentResponse, AgentState) {
        if !state.stage.is_terminal() {
            let next = transition(state.stage, Outcome::Aborted, state.attempt, self.max_attempts);
            state.advance(next);
        }
        tracing::error!(attempts = state.attempt, error = %err, "run failed");
        let attempted = state.pipeline.clone().or_else(|| state.last_candidate.clone());
        let response = AgentResponse::failure(&err, attempted, Some(started.elapsed().as_secs_f64()));
        (response, state)
    }
}
