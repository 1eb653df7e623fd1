//! 查询执行器
//!
//! 持有共享的 DocumentStore 与查询超时。execute 在超时内运行已校验的管道：缺少 `$limit` 时在执行副本末尾
//! 追加一个，结果再按 max_results 截断；超时 / 拒绝 / 不可达分别映射为 ExecutionError；每次调用输出 JSON 审计日志。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::core::ExecutionError;
use crate::pipeline::{Pipeline, Stage};
use crate::store::{Document, DocumentStore, StoreError};

/// 成功执行的结果
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub rows: Vec<Document>,
    pub count: usize,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn duration_secs(&self) -> f64 {
        self.duration.as_secs_f64()
    }
}

pub struct QueryExecutor {
    store: Arc<dyn DocumentStore>,
    timeout: Duration,
}

impl QueryExecutor {
    pub fn new(store: Arc<dyn DocumentStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// 执行已通过校验的管道，最多返回 max_results 条
    pub async fn execute(
        &self,
        pipeline: &Pipeline,
        max_results: usize,
    ) -> Result<ExecutionResult, ExecutionError> {
        let effective = if pipeline.has_stage("$limit") {
            pipeline.clone()
        } else {
            pipeline.with_stage(Stage::limit(max_results))
        };

        let start = Instant::now();
        let result = timeout(self.timeout, self.store.aggregate(&effective)).await;
        let duration = start.elapsed();

        let outcome = match &result {
            Ok(Ok(_)) => "ok",
            Ok(Err(StoreError::Rejected(_))) => "rejected",
            Ok(Err(StoreError::Unavailable(_))) => "unavailable",
            Ok(Err(StoreError::TimedOut(_))) | Err(_) => "timeout",
        };
        let audit = serde_json::json!({
            "event": "query_audit",
            "collection": self.store.collection_name(),
            "outcome": outcome,
            "stages": effective.len(),
            "duration_ms": duration.as_millis() as u64,
            "pipeline_preview": preview(&effective),
        });
        tracing::info!(audit = %audit, "query");

        match result {
            Ok(Ok(mut rows)) => {
                rows.truncate(max_results);
                tracing::info!(
                    "Query executed in {:.2}s, returned {} results",
                    duration.as_secs_f64(),
                    rows.len()
                );
                Ok(ExecutionResult {
                    count: rows.len(),
                    rows,
                    duration,
                })
            }
            Ok(Err(StoreError::Rejected(detail))) => Err(ExecutionError::rejected(detail)),
            Ok(Err(StoreError::Unavailable(detail))) => Err(ExecutionError::unavailable(detail)),
            Ok(Err(StoreError::TimedOut(detail))) => {
                tracing::warn!(detail = %detail, "store enforced its time limit");
                Err(ExecutionError::timeout(self.timeout))
            }
            Err(_) => Err(ExecutionError::timeout(self.timeout)),
        }
    }
}

fn preview(pipeline: &Pipeline) -> String {
    let s = pipeline.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
