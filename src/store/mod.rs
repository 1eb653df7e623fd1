//! 文档库
//!
//! 编排器只依赖 DocumentStore trait（只读聚合）。内存实现用于本地运行、评测与测试；
//! 开启 `mongo` feature 后可接真实 MongoDB。执行器在 trait 之上加超时、截断与审计日志。

pub mod executor;
pub mod expr;
pub mod loader;
pub mod memory;
#[cfg(feature = "mongo")]
pub mod mongo;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::pipeline::Pipeline;

pub use executor::{ExecutionResult, QueryExecutor};
pub use loader::{load_documents, LoaderError};
pub use memory::InMemoryStore;
#[cfg(feature = "mongo")]
pub use mongo::MongoStore;

/// 一条文档：字段 → 值
pub type Document = Map<String, Value>;

/// 存储侧错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// 查询本身有问题（操作符组合、运行期类型错误）
    #[error("{0}")]
    Rejected(String),

    /// 存储不可达，与查询无关
    #[error("{0}")]
    Unavailable(String),

    /// 存储侧的执行时限（max_time）先于执行器超时触发
    #[error("{0}")]
    TimedOut(String),
}

/// 只读文档库；实现必须可被多个运行并发使用
#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn collection_name(&self) -> &str;

    async fn aggregate(&self, pipeline: &Pipeline) -> Result<Vec<Document>, StoreError>;

    async fn count_documents(&self) -> Result<u64, StoreError>;

    /// 连通性检查；默认以一次计数代替
    async fn ping(&self) -> Result<(), StoreError> {
        self.count_documents().await.map(|_| ())
    }
}
