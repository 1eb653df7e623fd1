//! 结果总结
//!
//! 空结果直接给出确定的「无结果」回答，不调用模型；否则把问题、管道与前 20 行结果交给生成能力。
//! 生成失败不影响整个请求：降级为模板回答，逐行列出原始数值。

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::core::{SummarizationError, Verbosity};
use crate::llm::{ModelRouter, ModelTier, RequestOptions};
use crate::pipeline::prompts::{summary_messages, SUMMARY_ROW_LIMIT};
use crate::pipeline::Pipeline;
use crate::store::Document;

pub struct AnswerSummarizer {
    router: Arc<ModelRouter>,
    timeout: Duration,
}

impl AnswerSummarizer {
    pub fn new(router: Arc<ModelRouter>, timeout: Duration) -> Self {
        Self { router, timeout }
    }

    /// 调用生成能力总结结果；空结果不调用
    pub async fn summarize(
        &self,
        question: &str,
        rows: &[Document],
        pipeline: &Pipeline,
        verbosity: Verbosity,
        tier: ModelTier,
    ) -> Result<String, SummarizationError> {
        if rows.is_empty() {
            return Ok(no_results_answer(question));
        }

        let shown = &rows[..rows.len().min(SUMMARY_ROW_LIMIT)];
        let rows_json = serde_json::to_string_pretty(shown)
            .map_err(|e| SummarizationError::Provider(format!("failed to encode rows: {}", e)))?;
        let messages = summary_messages(
            question,
            &pipeline.to_pretty_json(),
            &rows_json,
            shown.len(),
            rows.len(),
            verbosity,
        );

        let client = self.router.route(tier);
        let options = RequestOptions::summary(verbosity);
        let text = match tokio::time::timeout(self.timeout, client.complete(&messages, &options)).await {
            Ok(result) => result?,
            Err(_) => return Err(SummarizationError::Timeout),
        };
        let text = text.trim();
        if text.is_empty() {
            return Err(SummarizationError::Empty);
        }
        Ok(text.to_string())
    }

    /// 总结；失败时降级为模板回答
    pub async fn answer(
        &self,
        question: &str,
        rows: &[Document],
        pipeline: &Pipeline,
        verbosity: Verbosity,
        tier: ModelTier,
    ) -> String {
        match self.summarize(question, rows, pipeline, verbosity, tier).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "summarization failed, using templated answer");
                fallback_answer(question, rows)
            }
        }
    }
}

pub fn no_results_answer(question: &str) -> String {
    format!(
        "No results were found for \"{}\". The query ran successfully but matched no records.",
        question
    )
}

/// 值按 JSON 原样渲染，数值不重新格式化
fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render_row(row: &Document) -> String {
    row.iter()
        .map(|(k, v)| format!("{}: {}", k, render_value(v)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// 模板回答：逐行列出结果（最多 SUMMARY_ROW_LIMIT 行）
pub fn fallback_answer(question: &str, rows: &[Document]) -> String {
    if rows.is_empty() {
        return no_results_answer(question);
    }
    let mut out = format!(
        "Found {} result{} for \"{}\":\n",
        rows.len(),
        if rows.len() == 1 { "" } else { "s" },
        question
    );
    for (i, row) in rows.iter().take(SUMMARY_ROW_LIMIT).enumerate() {
        out.push_str(&format!("{}. {}\n", i + 1, render_row(row)));
    }
    if rows.len() > SUMMARY_ROW_LIMIT {
        out.push_str(&format!("... and {} more\n", rows.len() - SUMMARY_ROW_LIMIT));
    }
    out.trim_end().to_string()
}
