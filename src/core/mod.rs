//! 核心编排层：请求/响应、错误与恢复、状态机、主控循环

pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod request;
pub mod state;

pub use error::{
    AgentError, ExecutionError, ExecutionErrorKind, GenerationError, RecoveryAction, StageFailure,
    SummarizationError,
};
pub use orchestrator::{AgentRunner, DEFAULT_MAX_ATTEMPTS, DEFAULT_RUN_BUDGET};
pub use recovery::{BackoffPolicy, RecoveryEngine};
pub use request::{
    AgentResponse, QueryRequest, QueryRequestBody, ReasoningEffort, Verbosity, DEFAULT_MAX_RESULTS,
    MAX_RESULTS_LIMIT,
};
pub use state::{transition, AgentState, FailureFeedback, Outcome, Stage, StageTimings};
