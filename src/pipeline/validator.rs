//! 管道静态校验
//!
//! 纯函数，不访问存储。按阶段顺序检查：操作符在白名单内、引用的字段路径存在（schema 或前序阶段
//! 产生的别名）、`$limit` 至多一个且不超过 max_results、不含写入阶段。所有问题一次性返回。

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::pipeline::{Pipeline, Stage};
use crate::schema::SchemaReference;

/// 问题类别
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IssueReason {
    EmptyPipeline,
    UnknownOperator { operator: String },
    UnknownField { path: String },
    DuplicateLimit,
    LimitExceeded { limit: u64, max: usize },
    InvalidLimit,
    WriteStage { operator: String },
}

/// 单条校验错误：阶段下标 + 原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub stage_index: usize,
    pub reason: IssueReason,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let i = self.stage_index;
        match &self.reason {
            IssueReason::EmptyPipeline => write!(f, "pipeline cannot be empty"),
            IssueReason::UnknownOperator { operator } => {
                write!(f, "stage {}: operator '{}' is not in the allow-list", i, operator)
            }
            IssueReason::UnknownField { path } => {
                write!(f, "stage {}: unknown field '{}'", i, path)
            }
            IssueReason::DuplicateLimit => {
                write!(f, "stage {}: only one $limit stage is allowed", i)
            }
            IssueReason::LimitExceeded { limit, max } => {
                write!(f, "stage {}: $limit {} exceeds max_results {}", i, limit, max)
            }
            IssueReason::InvalidLimit => {
                write!(f, "stage {}: $limit must be a positive integer", i)
            }
            IssueReason::WriteStage { operator } => {
                write!(f, "stage {}: '{}' writes data and is not permitted", i, operator)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub ok: bool,
    pub errors: Vec<ValidationIssue>,
}

impl ValidationResult {
    fn from_errors(errors: Vec<ValidationIssue>) -> Self {
        Self {
            ok: errors.is_empty(),
            errors,
        }
    }
}

/// 校验过程中的字段作用域：schema + 前序阶段引入的名字
struct Scope<'a> {
    schema: &'a SchemaReference,
    aliases: HashSet<String>,
    /// $replaceRoot 之后文档形状未知，不再检查字段
    opaque: bool,
}

impl<'a> Scope<'a> {
    fn new(schema: &'a SchemaReference) -> Self {
        Self {
            schema,
            aliases: HashSet::new(),
            opaque: false,
        }
    }

    fn knows(&self, path: &str) -> bool {
        if self.opaque || path == "_id" || self.schema.has_path(path) {
            return true;
        }
        let head = path.split('.').next().unwrap_or(path);
        self.aliases.contains(head)
    }

    fn alias(&mut self, name: &str) {
        let head = name.split('.').next().unwrap_or(name);
        if !head.is_empty() {
            self.aliases.insert(head.to_string());
        }
    }
}

/// 校验管道
pub fn validate(pipeline: &Pipeline, schema: &SchemaReference, max_results: usize) -> ValidationResult {
    if pipeline.is_empty() {
        return ValidationResult::from_errors(vec![ValidationIssue {
            stage_index: 0,
            reason: IssueReason::EmptyPipeline,
        }]);
    }

    let mut errors = Vec::new();
    let mut scope = Scope::new(schema);
    let mut seen_limit = false;

    for (index, stage) in pipeline.iter().enumerate() {
        check_stage(index, stage, &mut scope, &mut errors);

        if stage.operator == "$limit" {
            if seen_limit {
                errors.push(ValidationIssue {
                    stage_index: index,
                    reason: IssueReason::DuplicateLimit,
                });
            }
            seen_limit = true;
            match stage.count_argument().filter(|n| *n > 0) {
                None => errors.push(ValidationIssue {
                    stage_index: index,
                    reason: IssueReason::InvalidLimit,
                }),
                Some(limit) if limit > max_results as u64 => errors.push(ValidationIssue {
                    stage_index: index,
                    reason: IssueReason::LimitExceeded {
                        limit,
                        max: max_results,
                    },
                }),
                Some(_) => {}
            }
        }
    }

    ValidationResult::from_errors(errors)
}

/// 操作符检查 + 字段引用检查，并更新作用域
fn check_stage(index: usize, stage: &Stage, scope: &mut Scope<'_>, errors: &mut Vec<ValidationIssue>) {
    let op = stage.operator.as_str();
    if scope.schema.is_forbidden_stage(op) {
        errors.push(ValidationIssue {
            stage_index: index,
            reason: IssueReason::WriteStage {
                operator: op.to_string(),
            },
        });
        return;
    }
    if !scope.schema.is_allowed_stage(op) {
        errors.push(ValidationIssue {
            stage_index: index,
            reason: IssueReason::UnknownOperator {
                operator: op.to_string(),
            },
        });
        return;
    }

    let mut refs = Vec::new();
    collect_stage_refs(stage, scope, &mut refs, index, errors);

    let mut reported = HashSet::new();
    for path in refs {
        if !scope.knows(&path) && reported.insert(path.clone()) {
            errors.push(ValidationIssue {
                stage_index: index,
                reason: IssueReason::UnknownField { path },
            });
        }
    }

    introduce_aliases(stage, scope);
}

/// 提取阶段内引用的字段路径（不含本阶段新引入的名字）
fn collect_stage_refs(
    stage: &Stage,
    scope: &mut Scope<'_>,
    refs: &mut Vec<String>,
    index: usize,
    errors: &mut Vec<ValidationIssue>,
) {
    let body = &stage.body;
    match stage.operator.as_str() {
        "$match" => query_refs(body, refs),
        "$sort" => {
            if let Some(obj) = body.as_object() {
                refs.extend(obj.keys().cloned());
            }
        }
        "$project" => {
            if let Some(obj) = body.as_object() {
                for value in obj.values() {
                    if !is_inclusion_flag(value) {
                        expr_refs(value, refs);
                    }
                }
            }
        }
        "$group" | "$addFields" | "$set" | "$sortByCount" | "$replaceRoot" | "$replaceWith" => {
            expr_refs(body, refs)
        }
        "$unwind" => {
            let path = match body {
                Value::Object(obj) => obj.get("path"),
                other => Some(other),
            };
            if let Some(p) = path.and_then(field_ref) {
                refs.push(p);
            }
        }
        "$lookup" => {
            if let Some(local) = body.get("localField").and_then(Value::as_str) {
                refs.push(local.to_string());
            }
        }
        "$bucket" | "$bucketAuto" => {
            if let Some(group_by) = body.get("groupBy") {
                expr_refs(group_by, refs);
            }
            if let Some(output) = body.get("output") {
                expr_refs(output, refs);
            }
        }
        "$geoNear" => {
            if let Some(query) = body.get("query") {
                query_refs(query, refs);
            }
            if let Some(key) = body.get("key").and_then(Value::as_str) {
                refs.push(key.to_string());
            }
        }
        "$facet" => {
            // 子管道与外层共享前序别名，各自独立推进；问题归到 $facet 所在阶段
            if let Some(obj) = body.as_object() {
                for sub in obj.values() {
                    let Ok(sub_pipeline) = Pipeline::from_value(sub) else {
                        continue;
                    };
                    let mut sub_scope = Scope {
                        schema: scope.schema,
                        aliases: scope.aliases.clone(),
                        opaque: scope.opaque,
                    };
                    for sub_stage in sub_pipeline.iter() {
                        check_stage(index, sub_stage, &mut sub_scope, errors);
                    }
                }
            }
        }
        "$limit" | "$skip" | "$count" | "$sample" | "$unset" => {}
        _ => expr_refs(body, refs),
    }
}

fn introduce_aliases(stage: &Stage, scope: &mut Scope<'_>) {
    let body = &stage.body;
    match stage.operator.as_str() {
        "$group" | "$project" | "$addFields" | "$set" | "$facet" => {
            if let Some(obj) = body.as_object() {
                for key in obj.keys() {
                    scope.alias(key);
                }
            }
        }
        "$count" => {
            if let Some(name) = body.as_str() {
                scope.alias(name);
            }
        }
        "$sortByCount" => scope.alias("count"),
        "$bucket" | "$bucketAuto" => {
            scope.alias("count");
            if let Some(output) = body.get("output").and_then(Value::as_object) {
                for key in output.keys() {
                    scope.alias(key);
                }
            }
        }
        "$unwind" => {
            if let Some(index_field) = body.get("includeArrayIndex").and_then(Value::as_str) {
                scope.alias(index_field);
            }
        }
        "$lookup" => {
            if let Some(name) = body.get("as").and_then(Value::as_str) {
                scope.alias(name);
            }
        }
        "$geoNear" => {
            if let Some(name) = body.get("distanceField").and_then(Value::as_str) {
                scope.alias(name);
            }
        }
        "$replaceRoot" | "$replaceWith" => {
            let new_root = body.get("newRoot").unwrap_or(body);
            match new_root.as_object() {
                Some(obj) if !obj.keys().any(|k| k.starts_with('$')) => {
                    scope.aliases.clear();
                    for key in obj.keys() {
                        scope.alias(key);
                    }
                }
                _ => scope.opaque = true,
            }
        }
        _ => {}
    }
}

fn is_inclusion_flag(value: &Value) -> bool {
    matches!(value, Value::Bool(_)) || value.as_i64().map(|n| n == 0 || n == 1).unwrap_or(false)
}

/// "$a.b" → "a.b"；"$$var" 与普通字符串不是字段引用
fn field_ref(value: &Value) -> Option<String> {
    let s = value.as_str()?;
    if s.len() > 1 && s.starts_with('$') && !s.starts_with("$$") {
        Some(s[1..].to_string())
    } else {
        None
    }
}

/// 表达式中的字段引用：所有 "$path" 字符串；键是操作符或输出名，不算引用
fn expr_refs(value: &Value, refs: &mut Vec<String>) {
    match value {
        Value::String(_) => {
            if let Some(path) = field_ref(value) {
                refs.push(path);
            }
        }
        Value::Array(items) => items.iter().for_each(|v| expr_refs(v, refs)),
        Value::Object(obj) => {
            for (key, v) in obj {
                if key == "$literal" {
                    continue;
                }
                expr_refs(v, refs);
            }
        }
        _ => {}
    }
}

/// 查询文档中的字段引用：非 `$` 开头的键是路径；逻辑操作符递归；`$expr` 按表达式处理
fn query_refs(value: &Value, refs: &mut Vec<String>) {
    match value {
        Value::Object(obj) => {
            for (key, v) in obj {
                if key == "$expr" {
                    expr_refs(v, refs);
                } else if key.starts_with('$') {
                    query_refs(v, refs);
                } else {
                    refs.push(key.clone());
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| query_refs(v, refs)),
        _ => {}
    }
}
