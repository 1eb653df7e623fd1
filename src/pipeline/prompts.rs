//! Prompt 组装
//!
//! 生成请求 = 静态指令（schema、允许的阶段、规则、示例，每个 SchemaReference 只构建一次）
//! + 最近的对话历史 + 上次失败的纠错上下文 + 问题 + 推理强度提示。

use crate::core::{FailureFeedback, ReasoningEffort, StageFailure, Verbosity};
use crate::memory::{ConversationTurn, Message};
use crate::schema::SchemaReference;

/// 生成请求中必然出现的任务行（mock 客户端据此识别生成请求）
pub const PIPELINE_TASK_MARKER: &str = "TASK: Generate an aggregation pipeline";

/// 总结 Prompt 中最多展示的行数
pub const SUMMARY_ROW_LIMIT: usize = 20;

const RULES: &str = r#"RULES:
1. Return ONLY a valid JSON array representing the aggregation pipeline
2. Do NOT include explanations, markdown or any other text
3. Every stage is an object with exactly one operator key
4. Only use the allowed stages listed above; never use $out or $merge
5. Only reference field paths listed in the schema, or names created by an earlier stage
6. Include at most one $limit stage, and never exceed the requested maximum number of results
7. For "top N" questions, use $sort and $limit
8. Treat each document as a purchase-order line item; do NOT group by purchase_order_number unless distinct purchase orders are requested
9. For total record counts, use $count directly (no $group) unless distinct values are requested
10. When calculating averages or percentages, include supporting fields such as group counts and the numerator/denominator
11. If conditional logic is needed inside $group, nest $cond inside an accumulator such as $sum
12. If the question refers to previous results ("that department", "those items"), take the names from the CONVERSATION HISTORY"#;

const EXAMPLES: &str = r#"EXAMPLES:
Question: "How many total records are there?"
Answer: [{"$count": "count"}]

Question: "Show me spending by fiscal year"
Answer: [{"$group": {"_id": "$dates.fiscal_year", "total": {"$sum": {"$ifNull": ["$item.total_price", 0]}}}}, {"$sort": {"_id": 1}}, {"$limit": 10}]

Question: "Top 5 departments by spending in 2014"
Answer: [{"$match": {"dates.fiscal_year": "2013-2014"}}, {"$group": {"_id": "$department.normalized_name", "total": {"$sum": {"$ifNull": ["$item.total_price", 0]}}}}, {"$sort": {"total": -1}}, {"$limit": 5}]

Question: "Orders over $100,000"
Answer: [{"$match": {"item.total_price": {"$gt": 100000}}}, {"$limit": 10}]

Question: "How many orders were created in Q3 2013 (July to September)?"
Answer: [{"$match": {"$expr": {"$and": [{"$gte": ["$dates.creation", {"$toDate": "2013-07-01"}]}, {"$lt": ["$dates.creation", {"$toDate": "2013-10-01"}]}]}}}, {"$count": "count"}]

FOLLOW-UP EXAMPLE:
Previous: "Which department spent the most?" -> "Health Care Services"
Current question: "Show me the top 10 items that department spent money on"
Answer: [{"$match": {"department.normalized_name": "Health Care Services"}}, {"$group": {"_id": "$item.name", "total": {"$sum": {"$ifNull": ["$item.total_price", 0]}}}}, {"$sort": {"total": -1}}, {"$limit": 10}]"#;

const ANSWER_INSTRUCTIONS: &str = "You are a helpful assistant that converts database query results into clear, natural language answers.

Instructions:
- If the user asked for a specific number (e.g. \"top 10\"), show ALL of those results
- Format multiple results as a numbered list
- Include all relevant data from each result
- Copy numbers exactly as they appear in the results; never round monetary totals
- Only state values that appear in the results
- Answer the question directly";

/// 生成请求的静态前缀
pub fn build_static_prefix(schema: &SchemaReference) -> String {
    format!(
        "You are an expert aggregation pipeline generator for a procurement database.\n\n\
         DATABASE SCHEMA:\n{}\n\
         ALLOWED STAGES (schema {}): {}\n\n\
         {}\n\n{}\n\n{}",
        schema.prompt_description(),
        schema.version,
        schema.allowed_stages.join(", "),
        PIPELINE_TASK_MARKER,
        RULES,
        EXAMPLES
    )
}

fn effort_hint(effort: ReasoningEffort) -> &'static str {
    match effort {
        ReasoningEffort::Minimal => "Answer immediately with the simplest correct pipeline.",
        ReasoningEffort::Low => "Keep the pipeline short; avoid unnecessary stages.",
        ReasoningEffort::Medium => "Think through the field types before writing the pipeline.",
        ReasoningEffort::High => {
            "Reason carefully about every filter, grouping key, data type and edge case before writing the pipeline."
        }
    }
}

/// 历史区块：最近的问答，最新的在最后
pub fn render_history(history: &[ConversationTurn]) -> Option<String> {
    if history.is_empty() {
        return None;
    }
    let mut out = String::from("CONVERSATION HISTORY:\n");
    for (i, turn) in history.iter().enumerate() {
        out.push_str(&format!("{}. Q: {}\n", i + 1, turn.question));
        if !turn.answer.is_empty() {
            out.push_str(&format!("   A: {}\n", turn.answer));
        }
    }
    Some(out)
}

fn describe_failure(failure: &StageFailure) -> String {
    match failure {
        StageFailure::Validation(issues) => {
            let lines: Vec<String> = issues.iter().map(|i| format!("  - {}", i)).collect();
            format!("The pipeline was rejected by validation:\n{}", lines.join("\n"))
        }
        StageFailure::Execution(e) => format!("The pipeline failed during execution: {}", e),
        StageFailure::Generation(e) => format!("The previous output could not be used: {}", e),
    }
}

/// 纠错区块：列出之前每次失败的候选与原因
pub fn render_feedback(feedback: &[FailureFeedback]) -> Option<String> {
    if feedback.is_empty() {
        return None;
    }
    let mut out = String::from("PREVIOUS ATTEMPTS FAILED. Fix these problems and generate a NEW pipeline:\n");
    for item in feedback {
        out.push_str(&format!("\nAttempt {}:\n", item.attempt));
        if let Some(pipeline) = &item.pipeline {
            out.push_str(&format!("Pipeline: {}\n", pipeline));
        }
        out.push_str(&describe_failure(&item.failure));
        out.push('\n');
    }
    Some(out)
}

/// 组装一次生成请求
pub fn generation_messages(
    static_prefix: &str,
    question: &str,
    history: &[ConversationTurn],
    feedback: &[FailureFeedback],
    effort: ReasoningEffort,
    max_results: usize,
) -> Vec<Message> {
    let mut user = String::new();
    if let Some(block) = render_history(history) {
        user.push_str(&block);
        user.push('\n');
    }
    if let Some(block) = render_feedback(feedback) {
        user.push_str(&block);
        user.push('\n');
    }
    user.push_str(&format!(
        "Maximum results: {}\nReasoning effort: {} - {}\n\nQuestion: {}\n\nPipeline:",
        max_results,
        effort.as_str(),
        effort_hint(effort),
        question
    ));
    vec![Message::system(static_prefix.to_string()), Message::user(user)]
}

fn verbosity_hint(verbosity: Verbosity) -> &'static str {
    match verbosity {
        Verbosity::Low => "Answer in one or two sentences.",
        Verbosity::Medium => "Answer in a short paragraph or list.",
        Verbosity::High => "Give a detailed answer and explain how the results were computed.",
    }
}

/// 组装总结请求；rows_json 为已截断的结果 JSON
pub fn summary_messages(
    question: &str,
    pipeline_json: &str,
    rows_json: &str,
    shown: usize,
    total: usize,
    verbosity: Verbosity,
) -> Vec<Message> {
    let user = format!(
        "Question: {}\n\nPipeline: {}\n\nQuery Results (showing {} of {} total):\n{}\n\n{}\n\nProvide your answer:",
        question,
        pipeline_json,
        shown,
        total,
        rows_json,
        verbosity_hint(verbosity)
    );
    vec![Message::system(ANSWER_INSTRUCTIONS), Message::user(user)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::GenerationError;
    use crate::pipeline::{IssueReason, Pipeline, Stage, ValidationIssue};
    use crate::schema::procurement;
    use serde_json::json;

    #[test]
    fn test_static_prefix_contains_schema_and_marker() {
        let schema = procurement::purchase_orders();
        let prefix = build_static_prefix(&schema);
        assert!(prefix.contains(PIPELINE_TASK_MARKER));
        assert!(prefix.contains("item.total_price"));
        assert!(prefix.contains("$match"));
        assert!(prefix.contains(&schema.version));
    }

    #[test]
    fn test_first_attempt_has_no_feedback_block() {
        let msgs = generation_messages("prefix", "How many?", &[], &[], ReasoningEffort::Low, 10);
        assert_eq!(msgs.len(), 2);
        assert!(!msgs[1].content.contains("PREVIOUS ATTEMPTS"));
        assert!(!msgs[1].content.contains("CONVERSATION HISTORY"));
        assert!(msgs[1].content.contains("Question: How many?"));
        assert!(msgs[1].content.contains("Reasoning effort: low"));
    }

    #[test]
    fn test_feedback_and_history_are_rendered() {
        let history = vec![ConversationTurn::new("Top department?", "Health Care Services")];
        let feedback = vec![
            FailureFeedback {
                attempt: 1,
                failure: StageFailure::Validation(vec![ValidationIssue {
                    stage_index: 0,
                    reason: IssueReason::UnknownField {
                        path: "dept".to_string(),
                    },
                }]),
                pipeline: Some(Pipeline::new(vec![Stage::new("$match", json!({"dept": "x"}))])),
            },
            FailureFeedback {
                attempt: 2,
                failure: StageFailure::Generation(GenerationError::Malformed("not json".into())),
                pipeline: None,
            },
        ];
        let msgs = generation_messages("p", "And that one?", &history, &feedback, ReasoningEffort::High, 5);
        let user = &msgs[1].content;
        assert!(user.contains("1. Q: Top department?"));
        assert!(user.contains("A: Health Care Services"));
        assert!(user.contains("Attempt 1:"));
        assert!(user.contains("unknown field 'dept'"));
        assert!(user.contains("Attempt 2:"));
        assert!(user.contains("not json"));
        assert!(user.find("CONVERSATION HISTORY").unwrap() < user.find("Question:").unwrap());
    }
}
