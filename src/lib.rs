//! docquery - 自然语言到文档库聚合管道的查询智能体
//!
//! 模块划分：
//! - **agent**: 无头运行时装配（配置 → Store / Schema / LLM 路由 → AgentRunner）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、恢复策略、状态机与编排器
//! - **evaluation**: 基于用例目录的离线评测
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）与模型分级路由
//! - **memory**: 对话消息与历史窗口
//! - **pipeline**: 管道类型、生成器（Prompt + 解析）、静态校验器
//! - **schema**: 字段路径与阶段白名单（Schema 参考）
//! - **store**: 文档库抽象、内存实现、带超时的执行器
//! - **summarizer**: 结果总结（失败时降级为模板回答）
//! - **server**: HTTP 接口（feature = "web"）

pub mod agent;
pub mod config;
pub mod core;
pub mod evaluation;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod pipeline;
pub mod schema;
#[cfg(feature = "web")]
pub mod server;
pub mod store;
pub mod summarizer;

pub use crate::core::{AgentResponse, AgentRunner, QueryRequest};
