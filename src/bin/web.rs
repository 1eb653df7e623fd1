//! docquery HTTP 服务
//!
//! 启动: cargo run --bin docquery-web --features web
//! 监听地址取 `[app] listen_addr`，可用 DOCQUERY__APP__LISTEN_ADDR 覆盖。

#![cfg(feature = "web")]

use anyhow::Context;
use docquery::agent::build_runtime;
use docquery::config::load_config;
use docquery::server::router;
use docquery::store::DocumentStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    docquery::observability::init();

    let cfg = load_config(None).context("Failed to load config")?;
    let runtime = build_runtime(&cfg).await.context("Failed to build agent")?;
    let documents = runtime.store.count_documents().await.unwrap_or(0);

    let app = router(runtime);
    let listener = tokio::net::TcpListener::bind(&cfg.app.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.app.listen_addr))?;
    tracing::info!(documents, "{} listening on http://{}", cfg.app.name, cfg.app.listen_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
