//! 评测结果比较：count 精确、aggregation 相对容差、list 按 `_id` 重合度、semantic 只看是否成功作答

use std::collections::HashSet;

use serde::Serialize;
use serde_json::{json, Value};

use crate::core::AgentResponse;
use crate::evaluation::ExpectedType;
use crate::store::Document;

/// list 比较的最低重合比例
pub const LIST_OVERLAP_THRESHOLD: f64 = 0.8;
/// list 比较只看 ground truth 的前若干项
const LIST_COMPARE_DEPTH: usize = 10;

const COUNT_KEYS: [&str; 5] = ["count", "total", "total_count", "doc_count", "value"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comparison {
    pub passed: bool,
    /// 0.0 ~ 1.0
    pub similarity: f64,
    pub details: Value,
}

impl Comparison {
    fn failed(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            similarity: 0.0,
            details: json!({ "error": reason.into() }),
        }
    }
}

pub fn compare(
    expected: ExpectedType,
    ground_truth: &[Document],
    response: &AgentResponse,
    tolerance: f64,
) -> Comparison {
    if !response.success {
        return Comparison::failed(
            response
                .error
                .clone()
                .unwrap_or_else(|| "agent returned success=false".to_string()),
        );
    }
    let ai_rows: &[Document] = response.results.as_deref().unwrap_or(&[]);
    match expected {
        ExpectedType::Count => compare_count(ground_truth, ai_rows, response.result_count),
        ExpectedType::Aggregation => compare_aggregation(ground_truth, ai_rows, tolerance),
        ExpectedType::List => compare_list(ground_truth, ai_rows),
        ExpectedType::Semantic => compare_semantic(response),
    }
}

fn compare_count(ground_truth: &[Document], ai_rows: &[Document], result_count: Option<usize>) -> Comparison {
    let gt = extract_count(ground_truth).unwrap_or(0.0);
    let ai = extract_count(ai_rows)
        .or_else(|| result_count.map(|c| c as f64))
        .unwrap_or(0.0);
    let passed = gt.fract() == 0.0 && ai == gt;
    let diff = (gt - ai).abs();
    let similarity = if gt == 0.0 {
        if passed {
            1.0
        } else {
            0.0
        }
    } else {
        (1.0 - diff / gt.abs()).max(0.0)
    };
    Comparison {
        passed,
        similarity,
        details: json!({ "ground_truth_count": gt, "ai_count": ai, "difference": diff }),
    }
}

fn compare_aggregation(ground_truth: &[Document], ai_rows: &[Document], tolerance: f64) -> Comparison {
    if ground_truth.is_empty() && ai_rows.is_empty() {
        return Comparison {
            passed: true,
            similarity: 1.0,
            details: json!({ "note": "both results empty" }),
        };
    }
    let gt_values = numeric_values(ground_truth);
    let ai_values = numeric_values(ai_rows);
    if gt_values.is_empty() || ai_values.is_empty() {
        return Comparison::failed("missing numeric values");
    }

    let mut unmatched = ai_values.clone();
    let mut matches = 0usize;
    for gt in &gt_values {
        if let Some(pos) = unmatched.iter().position(|ai| within_tolerance(*gt, *ai, tolerance)) {
            unmatched.swap_remove(pos);
            matches += 1;
        }
    }
    let required = gt_values.len().min(ai_values.len()).max(1);
    Comparison {
        passed: matches >= required,
        similarity: matches as f64 / gt_values.len() as f64,
        details: json!({
            "matches": matches,
            "required_matches": required,
            "ground_truth_values": gt_values.iter().take(5).collect::<Vec<_>>(),
            "ai_values": ai_values.iter().take(5).collect::<Vec<_>>(),
        }),
    }
}

fn compare_list(ground_truth: &[Document], ai_rows: &[Document]) -> Comparison {
    let gt_ids: HashSet<String> = ground_truth
        .iter()
        .take(LIST_COMPARE_DEPTH)
        .map(row_id)
        .collect();
    let ai_ids: HashSet<String> = ai_rows.iter().map(row_id).collect();

    if gt_ids.is_empty() {
        let passed = ai_ids.is_empty();
        return Comparison {
            passed,
            similarity: if passed { 1.0 } else { 0.0 },
            details: json!({ "note": "ground truth empty" }),
        };
    }
    let overlap = gt_ids.intersection(&ai_ids).count();
    let ratio = overlap as f64 / gt_ids.len() as f64;
    Comparison {
        passed: ratio >= LIST_OVERLAP_THRESHOLD,
        similarity: ratio,
        details: json!({ "overlap": overlap, "ground_truth_ids": gt_ids.len(), "ratio": ratio }),
    }
}

fn compare_semantic(response: &AgentResponse) -> Comparison {
    let has_answer = response
        .answer
        .as_deref()
        .map(|a| !a.trim().is_empty())
        .unwrap_or(false);
    Comparison {
        passed: has_answer,
        similarity: if has_answer { 1.0 } else { 0.0 },
        details: json!({ "method": "answer_present" }),
    }
}

fn extract_count(rows: &[Document]) -> Option<f64> {
    let Some(first) = rows.first() else {
        return Some(0.0);
    };
    for key in COUNT_KEYS {
        if let Some(n) = first.get(key).and_then(Value::as_f64) {
            return Some(n);
        }
    }
    first
        .iter()
        .filter(|(k, _)| k.as_str() != "_id")
        .find_map(|(_, v)| v.as_f64())
}

fn numeric_values(rows: &[Document]) -> Vec<f64> {
    fn collect(value: &Value, out: &mut Vec<f64>) {
        match value {
            Value::Number(n) => out.extend(n.as_f64()),
            Value::Array(items) => items.iter().for_each(|v| collect(v, out)),
            Value::Object(map) => map
                .iter()
                .filter(|(k, _)| k.as_str() != "_id")
                .for_each(|(_, v)| collect(v, out)),
            _ => {}
        }
    }
    let mut out = Vec::new();
    for row in rows {
        for (key, value) in row {
            if key != "_id" {
                collect(value, &mut out);
            }
        }
    }
    out
}

fn within_tolerance(a: f64, b: f64, tolerance: f64) -> bool {
    if a == b {
        return true;
    }
    let scale = a.abs().max(b.abs());
    if scale == 0.0 {
        return true;
    }
    (a - b).abs() / scale <= tolerance
}

fn row_id(row: &Document) -> String {
    match row.get("_id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => Value::Object(row.clone()).to_string(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;

    fn rows(v: Value) -> Vec<Document> {
        v.as_array()
            .unwrap()
            .iter()
            .filter_map(|r| r.as_object().cloned())
            .collect()
    }

    fn ok_response(results: Value, answer: &str) -> AgentResponse {
        let pipeline = Pipeline::from_value(&json!([{"$count": "count"}])).unwrap();
        AgentResponse::success(answer.to_string(), pipeline, rows(results), 0.1)
    }

    #[test]
    fn test_count_exact() {
        let gt = rows(json!([{"count": 346018}]));
        let hit = compare(ExpectedType::Count, &gt, &ok_response(json!([{"total": 346018}]), "x"), 0.01);
        assert!(hit.passed);
        let miss = compare(ExpectedType::Count, &gt, &ok_response(json!([{"count": 346017}]), "x"), 0.01);
        assert!(!miss.passed);
        assert!(miss.similarity > 0.99);
    }

    #[test]
    fn test_aggregation_relative_tolerance() {
        let gt = rows(json!([{"_id": null, "total": 1000.0}]));
        let close = ok_response(json!([{"_id": "x", "sum": 1005.0}]), "x");
        assert!(compare(ExpectedType::Aggregation, &gt, &close, 0.01).passed);
        let far = ok_response(json!([{"sum": 1100.0}]), "x");
        assert!(!compare(ExpectedType::Aggregation, &gt, &far, 0.01).passed);
    }

    #[test]
    fn test_list_overlap_threshold() {
        let gt = rows(json!([
            {"_id": "A"}, {"_id": "B"}, {"_id": "C"}, {"_id": "D"}, {"_id": "E"}
        ]));
        let four = ok_response(json!([{"_id": "A"}, {"_id": "B"}, {"_id": "C"}, {"_id": "D"}, {"_id": "Z"}]), "x");
        assert!(compare(ExpectedType::List, &gt, &four, 0.0).passed);
        let three = ok_response(json!([{"_id": "A"}, {"_id": "B"}, {"_id": "C"}]), "x");
        assert!(!compare(ExpectedType::List, &gt, &three, 0.0).passed);
    }

    #[test]
    fn test_semantic_and_failed_runs() {
        assert!(compare(ExpectedType::Semantic, &[], &ok_response(json!([]), "Found it."), 0.0).passed);
        let failed = AgentResponse::failure(&crate::core::AgentError::Cancelled, None, None);
        let result = compare(ExpectedType::Semantic, &[], &failed, 0.0);
        assert!(!result.passed);
        assert_eq!(result.details["error"], "Request cancelled");
    }
}
