//! 离线评测入口
//!
//! `docquery-eval [--config PATH] [--catalog PATH] [--case ID]...`
//! 用例目录默认取 `[evaluation] catalog_path`，报告写入 `[evaluation] report_dir`。

use std::path::PathBuf;

use anyhow::Context;
use docquery::agent::build_runtime;
use docquery::config::load_config;
use docquery::evaluation::{EvalCatalog, EvalRunner};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    docquery::observability::init();

    let mut config_path = None;
    let mut catalog_path = None;
    let mut case_ids = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config_path = Some(PathBuf::from(args.next().context("--config requires a path")?)),
            "--catalog" => catalog_path = Some(PathBuf::from(args.next().context("--catalog requires a path")?)),
            "--case" => case_ids.push(args.next().context("--case requires an id")?),
            other => anyhow::bail!("unknown argument: {}", other),
        }
    }

    let cfg = load_config(config_path).context("Failed to load config")?;
    let catalog_path = catalog_path.unwrap_or_else(|| cfg.evaluation.catalog_path.clone());
    let catalog = EvalCatalog::load(&catalog_path)
        .await
        .with_context(|| format!("Failed to load catalog {}", catalog_path.display()))?
        .select(&case_ids);
    anyhow::ensure!(!catalog.profiles.is_empty(), "catalog defines no profiles");
    anyhow::ensure!(!catalog.cases.is_empty(), "no test cases selected");

    let runtime = build_runtime(&cfg).await.context("Failed to build agent")?;
    let report = EvalRunner::new(runtime.runner, cfg.evaluation.default_tolerance)
        .run(&catalog)
        .await;

    for profile in &report.profiles {
        println!(
            "{:<20} passed {}/{} ({:.1}%)  avg {:.2}s  tokens {}",
            profile.profile.name,
            profile.passed,
            profile.total,
            profile.pass_rate * 100.0,
            profile.avg_response_time_secs,
            profile.token_usage.total_tokens
        );
    }
    let path = report.write_to(&cfg.evaluation.report_dir).await?;
    println!("Report: {}", path.display());
    Ok(())
}
