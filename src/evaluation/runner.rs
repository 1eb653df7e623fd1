//! 评测执行与报告

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;

use crate::core::{AgentRunner, QueryRequest, MAX_RESULTS_LIMIT};
use crate::evaluation::{compare, EvalCatalog, EvalError, EvalProfile, TestCase};
use crate::llm::TokenCounts;
use crate::store::Document;

#[derive(Debug, Clone, Serialize)]
pub struct EvalResult {
    pub profile: String,
    pub test_id: String,
    pub question: String,
    pub category: String,
    pub difficulty: String,
    pub passed: bool,
    pub similarity: f64,
    pub response_time_secs: f64,
    pub ai_pipeline: Option<Value>,
    pub ground_truth_rows: usize,
    pub error: Option<String>,
    pub details: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CategoryStats {
    pub total: usize,
    pub passed: usize,
    pub pass_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileReport {
    pub profile: EvalProfile,
    pub total: usize,
    pub passed: usize,
    pub pass_rate: f64,
    pub avg_response_time_secs: f64,
    pub by_category: BTreeMap<String, CategoryStats>,
    pub by_difficulty: BTreeMap<String, CategoryStats>,
    /// 本 profile 期间消耗的 token
    pub token_usage: TokenCounts,
    pub results: Vec<EvalResult>,
}

impl ProfileReport {
    fn build(profile: EvalProfile, results: Vec<EvalResult>, token_usage: TokenCounts) -> Self {
        let total = results.len();
        let passed = results.iter().filter(|r| r.passed).count();
        let avg = if total == 0 {
            0.0
        } else {
            results.iter().map(|r| r.response_time_secs).sum::<f64>() / total as f64
        };
        let mut by_category: BTreeMap<String, CategoryStats> = BTreeMap::new();
        let mut by_difficulty: BTreeMap<String, CategoryStats> = BTreeMap::new();
        for r in &results {
            for (map, key) in [(&mut by_category, &r.category), (&mut by_difficulty, &r.difficulty)] {
                let stats = map.entry(key.clone()).or_default();
                stats.total += 1;
                if r.passed {
                    stats.passed += 1;
                }
            }
        }
        for stats in by_category.values_mut().chain(by_difficulty.values_mut()) {
            stats.pass_rate = ratio(stats.passed, stats.total);
        }
        Self {
            profile,
            total,
            passed,
            pass_rate: ratio(passed, total),
            avg_response_time_secs: avg,
            by_category,
            by_difficulty,
            token_usage,
            results,
        }
    }
}

fn ratio(passed: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        passed as f64 / total as f64
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EvalReport {
    pub generated_at: String,
    pub test_case_count: usize,
    pub profiles: Vec<ProfileReport>,
}

impl EvalReport {
    /// 写入 `<dir>/eval_report_<时间戳>.json`，返回文件路径
    pub async fn write_to(&self, dir: &Path) -> Result<PathBuf, EvalError> {
        tokio::fs::create_dir_all(dir).await?;
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let path = dir.join(format!("eval_report_{}.json", stamp));
        let body = serde_json::to_string_pretty(self)?;
        tokio::fs::write(&path, body).await?;
        tracing::info!(path = %path.display(), "evaluation report written");
        Ok(path)
    }
}

pub struct EvalRunner {
    runner: AgentRunner,
    default_tolerance: f64,
}

impl EvalRunner {
    pub fn new(runner: AgentRunner, default_tolerance: f64) -> Self {
        Self {
            runner,
            default_tolerance,
        }
    }

    /// ground truth 直接在文档库上执行
    async fn ground_truth(&self, case: &TestCase) -> Result<Vec<Document>, String> {
        let pipeline = case.ground_truth_pipeline().map_err(|e| e.to_string())?;
        self.runner
            .executor()
            .execute(&pipeline, MAX_RESULTS_LIMIT)
            .await
            .map(|r| r.rows)
            .map_err(|e| format!("ground truth failed: {}", e))
    }

    async fn evaluate(&self, case: &TestCase, profile: &EvalProfile) -> EvalResult {
        let mut result = EvalResult {
            profile: profile.name.clone(),
            test_id: case.id.clone(),
            question: case.question.clone(),
            category: case.category.clone(),
            difficulty: case.difficulty.clone(),
            passed: false,
            similarity: 0.0,
            response_time_secs: 0.0,
            ai_pipeline: None,
            ground_truth_rows: 0,
            error: None,
            details: Value::Null,
        };

        let ground_truth = match self.ground_truth(case).await {
            Ok(rows) => rows,
            Err(e) => {
                result.error = Some(e);
                return result;
            }
        };
        result.ground_truth_rows = ground_truth.len();

        let request = QueryRequest::new(case.question.as_str(), profile.model)
            .and_then(|r| r.with_max_results(profile.max_results))
            .map(|r| r.with_reasoning_effort(profile.reasoning_effort));
        let request = match request {
            Ok(r) => r,
            Err(e) => {
                result.error = Some(e.to_string());
                return result;
            }
        };

        let started = Instant::now();
        let response = self.runner.run(request).await;
        result.response_time_secs = started.elapsed().as_secs_f64();

        let tolerance = case.tolerance.unwrap_or(self.default_tolerance);
        let comparison = compare(case.expected_type, &ground_truth, &response, tolerance);
        result.passed = comparison.passed;
        result.similarity = comparison.similarity;
        result.details = comparison.details;
        result.ai_pipeline = response.pipeline.as_ref().map(|p| p.to_value());
        result.error = response.error;
        result
    }

    /// 依次跑完所有 profile × case
    pub async fn run(&self, catalog: &EvalCatalog) -> EvalReport {
        let mut profiles = Vec::with_capacity(catalog.profiles.len());
        for profile in &catalog.profiles {
            tracing::info!(profile = %profile.name, cases = catalog.cases.len(), "evaluating profile");
            let usage_before = self.runner.token_usage();
            let mut results = Vec::with_capacity(catalog.cases.len());
            for case in &catalog.cases {
                let r = self.evaluate(case, profile).await;
                tracing::info!(
                    case = %r.test_id,
                    passed = r.passed,
                    secs = %format!("{:.2}", r.response_time_secs),
                    "case finished"
                );
                results.push(r);
            }
            let usage = self.runner.token_usage().since(usage_before);
            tracing::info!(profile = %profile.name, total_tokens = usage.total_tokens, "profile finished");
            profiles.push(ProfileReport::build(profile.clone(), results, usage));
        }
        EvalReport {
            generated_at: chrono::Utc::now().to_rfc3339(),
            test_case_count: catalog.cases.len(),
            profiles,
        }
    }
}
