//! 聚合管道：类型、生成（Prompt + 解析）与静态校验

pub mod generator;
pub mod prompts;
pub mod types;
pub mod validator;

pub use generator::{parse_pipeline_output, GenerationContext, PipelineGenerator};
pub use types::{count_argument, Pipeline, PipelineShapeError, Stage};
pub use validator::{validate, IssueReason, ValidationIssue, ValidationResult};
