//! 可观测性：日志初始化
//!
//! 默认级别 info，可用 RUST_LOG 覆盖（如 `RUST_LOG=docquery=debug`）。
//! 审计日志（`query_audit`）与阶段转移都走同一个订阅者。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // 重复初始化（如测试内多次调用）时忽略
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();
}
