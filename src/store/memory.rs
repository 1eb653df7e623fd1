//! 内存文档库
//!
//! 文档集合在构造后只读，以 Arc 共享给所有并发运行。聚合在阻塞线程池里执行，
//! 这样执行器的超时可以按时返回。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde_json::{Map, Value};

use crate::pipeline::{count_argument, Pipeline, Stage};
use crate::store::expr::{
    compare_values, eval, matches, reject, remove_path, resolve_path, set_path, values_equal,
    EvalResult, Num,
};
use crate::store::{Document, DocumentStore, StoreError};

/// 已知但内存实现不支持的阶段
const UNSUPPORTED_STAGES: [&str; 4] = ["$lookup", "$geoNear", "$bucketAuto", "$graphLookup"];

#[derive(Debug, Clone)]
pub struct InMemoryStore {
    collection: String,
    docs: Arc<Vec<Document>>,
}

impl InMemoryStore {
    pub fn new(collection: impl Into<String>, docs: Vec<Document>) -> Self {
        Self {
            collection: collection.into(),
            docs: Arc::new(docs),
        }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    fn collection_name(&self) -> &str {
        &self.collection
    }

    async fn aggregate(&self, pipeline: &Pipeline) -> Result<Vec<Document>, StoreError> {
        let docs = Arc::clone(&self.docs);
        let pipeline = pipeline.clone();
        tokio::task::spawn_blocking(move || run_pipeline(&docs, &pipeline))
            .await
            .map_err(|e| {
                // 求值 panic 属于查询本身的问题，可以重新生成；只有任务被取消才算存储不可用
                if e.is_panic() {
                    StoreError::Rejected(format!("aggregation failed: {}", e))
                } else {
                    StoreError::Unavailable(format!("aggregation task failed: {}", e))
                }
            })?
    }

    async fn count_documents(&self) -> Result<u64, StoreError> {
        Ok(self.docs.len() as u64)
    }
}

/// 按顺序执行整个管道；首个 $match 直接在借用的集合上过滤，避免整体复制
pub fn run_pipeline(docs: &[Document], pipeline: &Pipeline) -> EvalResult<Vec<Document>> {
    let mut stages = pipeline.iter().peekable();
    let mut current = match stages.peek() {
        Some(first) if first.operator == "$match" => {
            let mut kept = Vec::new();
            for doc in docs {
                if matches(&first.body, doc)? {
                    kept.push(doc.clone());
                }
            }
            stages.next();
            kept
        }
        _ => docs.to_vec(),
    };
    for stage in stages {
        current = apply_stage(current, stage)?;
    }
    Ok(current)
}

fn apply_stage(docs: Vec<Document>, stage: &Stage) -> EvalResult<Vec<Document>> {
    let body = &stage.body;
    match stage.operator.as_str() {
        "$match" => {
            let mut kept = Vec::with_capacity(docs.len());
            for doc in docs {
                if matches(body, &doc)? {
                    kept.push(doc);
                }
            }
            Ok(kept)
        }
        "$limit" => {
            let n = stage
                .count_argument()
                .filter(|n| *n > 0)
                .ok_or_else(|| reject("the limit must be positive"))?;
            Ok(docs.into_iter().take(n as usize).collect())
        }
        "$skip" => {
            let n = stage
                .count_argument()
                .ok_or_else(|| reject("invalid argument to $skip stage: must be a non-negative integer"))?;
            Ok(docs.into_iter().skip(n as usize).collect())
        }
        "$sort" => sort(docs, body),
        "$count" => count(docs, body),
        "$group" => group(docs, body),
        "$project" => {
            let spec = body
                .as_object()
                .ok_or_else(|| reject("$project specification must be an object"))?;
            docs.into_iter().map(|doc| project(doc, spec)).collect()
        }
        "$addFields" | "$set" => {
            let spec = body
                .as_object()
                .ok_or_else(|| reject(format!("{} specification must be an object", stage.operator)))?;
            docs.into_iter()
                .map(|mut doc| -> EvalResult<Document> {
                    let mut computed = Vec::with_capacity(spec.len());
                    for (path, expr) in spec {
                        computed.push((path, eval(expr, &doc)?));
                    }
                    for (path, value) in computed {
                        set_path(&mut doc, path, value);
                    }
                    Ok(doc)
                })
                .collect()
        }
        "$unset" => {
            let paths: Vec<String> = match body {
                Value::String(s) => vec![s.clone()],
                Value::Array(items) => items
                    .iter()
                    .map(|v| {
                        v.as_str()
                            .map(str::to_string)
                            .ok_or_else(|| reject("$unset specification must be a string or array of strings"))
                    })
                    .collect::<EvalResult<_>>()?,
                _ => return Err(reject("$unset specification must be a string or array of strings")),
            };
            Ok(docs
                .into_iter()
                .map(|mut doc| {
                    paths.iter().for_each(|p| remove_path(&mut doc, p));
                    doc
                })
                .collect())
        }
        "$unwind" => unwind(docs, body),
        "$sortByCount" => {
            let mut groups = GroupTable::default();
            let count_spec = [Accumulator::spec("count", "$sum", Value::from(1))];
            for doc in &docs {
                groups.add(eval(body, doc)?, doc, &count_spec)?;
            }
            let mut out = groups.finish();
            out.sort_by(|a, b| compare_values(&b["count"], &a["count"]));
            Ok(out)
        }
        "$replaceRoot" | "$replaceWith" => {
            let new_root = if stage.operator == "$replaceRoot" {
                body.get("newRoot")
                    .ok_or_else(|| reject("no newRoot specified for the $replaceRoot stage"))?
            } else {
                body
            };
            docs.iter()
                .map(|doc| -> EvalResult<Document> {
                    match eval(new_root, doc)? {
                        Value::Object(obj) => Ok(obj),
                        other => Err(reject(format!(
                            "'newRoot' expression must evaluate to an object, but resulting value was: {}",
                            other
                        ))),
                    }
                })
                .collect()
        }
        "$facet" => {
            let spec = body
                .as_object()
                .ok_or_else(|| reject("$facet specification must be an object"))?;
            let mut out = Map::new();
            for (name, sub) in spec {
                let sub_pipeline = Pipeline::from_value(sub)
                    .map_err(|e| reject(format!("$facet '{}': {}", name, e)))?;
                let rows = run_pipeline(&docs, &sub_pipeline)?;
                out.insert(name.clone(), Value::Array(rows.into_iter().map(Value::Object).collect()));
            }
            Ok(vec![out])
        }
        "$sample" => {
            let size = body
                .get("size")
                .and_then(count_argument)
                .ok_or_else(|| reject("size argument to $sample must be a non-negative number"))?;
            let mut rng = rand::thread_rng();
            Ok(docs.choose_multiple(&mut rng, size as usize).cloned().collect())
        }
        "$bucket" => bucket(docs, body),
        op if UNSUPPORTED_STAGES.contains(&op) => {
            Err(reject(format!("{} is not supported by the in-memory store", op)))
        }
        op => Err(reject(format!("Unrecognized pipeline stage name: '{}'", op))),
    }
}

fn sort(mut docs: Vec<Document>, body: &Value) -> EvalResult<Vec<Document>> {
    let spec = body
        .as_object()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| reject("$sort stage must have at least one sort key"))?;
    let mut keys = Vec::with_capacity(spec.len());
    for (path, direction) in spec {
        let descending = match direction.as_i64() {
            Some(1) => false,
            Some(-1) => true,
            _ => {
                return Err(reject(
                    "$sort key ordering must be 1 (for ascending) or -1 (for descending)",
                ))
            }
        };
        keys.push((path.as_str(), descending));
    }
    docs.sort_by(|a, b| {
        for (path, descending) in &keys {
            let left = resolve_path(a, path).unwrap_or(Value::Null);
            let right = resolve_path(b, path).unwrap_or(Value::Null);
            let ord = compare_values(&left, &right);
            let ord = if *descending { ord.reverse() } else { ord };
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        std::cmp::Ordering::Equal
    });
    Ok(docs)
}

fn count(docs: Vec<Document>, body: &Value) -> EvalResult<Vec<Document>> {
    let name = body
        .as_str()
        .filter(|n| !n.is_empty() && !n.starts_with('$') && !n.contains('.'))
        .ok_or_else(|| reject("the count field must be a non-empty string without '$' or '.'"))?;
    if docs.is_empty() {
        return Ok(Vec::new());
    }
    let mut out = Map::new();
    out.insert(name.to_string(), Value::from(docs.len() as u64));
    Ok(vec![out])
}

fn is_exclusion(value: &Value) -> bool {
    matches!(value, Value::Bool(false)) || value.as_f64() == Some(0.0)
}

fn is_inclusion(value: &Value) -> bool {
    matches!(value, Value::Bool(true)) || value.as_f64().map(|n| n != 0.0).unwrap_or(false)
}

fn project(doc: Document, spec: &Map<String, Value>) -> EvalResult<Document> {
    let only_id = spec.len() == 1 && spec.get("_id").map(|v| !is_exclusion(v)).unwrap_or(false);
    let inclusion_mode = only_id || spec.iter().any(|(k, v)| k != "_id" && !is_exclusion(v));

    if !inclusion_mode {
        let mut out = doc;
        for path in spec.keys() {
            remove_path(&mut out, path);
        }
        return Ok(out);
    }

    let mut out = Map::new();
    let id_excluded = spec.get("_id").map(is_exclusion).unwrap_or(false);
    if !id_excluded && !spec.contains_key("_id") {
        if let Some(id) = doc.get("_id") {
            out.insert("_id".to_string(), id.clone());
        }
    }
    for (path, value) in spec {
        if is_exclusion(value) {
            if path == "_id" {
                continue;
            }
            return Err(reject(format!(
                "Invalid $project :: cannot do exclusion on field {} in inclusion projection",
                path
            )));
        }
        if is_inclusion(value) {
            if let Some(found) = resolve_path(&doc, path) {
                set_path(&mut out, path, found);
            }
        } else {
            set_path(&mut out, path, eval(value, &doc)?);
        }
    }
    Ok(out)
}

fn unwind(docs: Vec<Document>, body: &Value) -> EvalResult<Vec<Document>> {
    let (path_expr, preserve, index_field) = match body {
        Value::String(s) => (s.as_str(), false, None),
        Value::Object(obj) => (
            obj.get("path").and_then(Value::as_str).unwrap_or_default(),
            obj.get("preserveNullAndEmptyArrays")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            obj.get("includeArrayIndex").and_then(Value::as_str),
        ),
        _ => return Err(reject("expected either a string or an object as specification for $unwind stage")),
    };
    let path = path_expr
        .strip_prefix('$')
        .filter(|p| !p.is_empty())
        .ok_or_else(|| reject("path option to $unwind stage should be prefixed with a '$'"))?;

    let mut out = Vec::new();
    for doc in docs {
        match resolve_path(&doc, path) {
            Some(Value::Array(items)) if !items.is_empty() => {
                for (i, item) in items.into_iter().enumerate() {
                    let mut copy = doc.clone();
                    set_path(&mut copy, path, item);
                    if let Some(field) = index_field {
                        set_path(&mut copy, field, Value::from(i as u64));
                    }
                    out.push(copy);
                }
            }
            Some(Value::Array(_)) | Some(Value::Null) | None => {
                if preserve {
                    let mut copy = doc;
                    if let Some(field) = index_field {
                        set_path(&mut copy, field, Value::Null);
                    }
                    out.push(copy);
                }
            }
            Some(_) => out.push(doc),
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// 分组
// ---------------------------------------------------------------------------

/// 单个累加器的定义
struct AccSpec {
    name: String,
    op: String,
    arg: Value,
}

const ACCUMULATORS: [&str; 9] = [
    "$sum", "$avg", "$min", "$max", "$first", "$last", "$push", "$addToSet", "$count",
];

/// 累加器状态
enum Accumulator {
    Sum(Num),
    Avg { total: f64, n: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
    First(Option<Value>),
    Last(Value),
    Push(Vec<Value>),
    AddToSet(Vec<Value>),
}

impl Accumulator {
    fn spec(name: &str, op: &str, arg: Value) -> AccSpec {
        AccSpec {
            name: name.to_string(),
            op: op.to_string(),
            arg,
        }
    }

    fn parse_specs(spec: &Map<String, Value>) -> EvalResult<Vec<AccSpec>> {
        let mut out = Vec::new();
        for (name, value) in spec {
            if name == "_id" {
                continue;
            }
            let obj = value.as_object().ok_or_else(|| {
                reject(format!(
                    "The field '{}' must be an accumulator object",
                    name
                ))
            })?;
            let (op, arg) = match obj.iter().next() {
                Some((op, arg)) if obj.len() == 1 => (op, arg),
                _ => {
                    return Err(reject(format!(
                        "The field '{}' must specify one accumulator",
                        name
                    )))
                }
            };
            if !ACCUMULATORS.contains(&op.as_str()) {
                return Err(reject(format!("unknown group operator '{}'", op)));
            }
            if op == "$count" {
                out.push(Accumulator::spec(name, "$sum", Value::from(1)));
            } else {
                out.push(Accumulator::spec(name, op, arg.clone()));
            }
        }
        Ok(out)
    }

    fn new(op: &str) -> Self {
        match op {
            "$sum" => Accumulator::Sum(Num::Int(0)),
            "$avg" => Accumulator::Avg { total: 0.0, n: 0 },
            "$min" => Accumulator::Min(None),
            "$max" => Accumulator::Max(None),
            "$first" => Accumulator::First(None),
            "$last" => Accumulator::Last(Value::Null),
            "$push" => Accumulator::Push(Vec::new()),
            _ => Accumulator::AddToSet(Vec::new()),
        }
    }

    fn push(&mut self, value: Value) {
        match self {
            Accumulator::Sum(total) => {
                if let Some(n) = Num::from_value(&value) {
                    *total = total.add(n);
                }
            }
            Accumulator::Avg { total, n } => {
                if let Some(v) = Num::from_value(&value) {
                    *total += v.as_f64();
                    *n += 1;
                }
            }
            Accumulator::Min(_) | Accumulator::Max(_) if value.is_null() => {}
            Accumulator::Min(best) => {
                if best
                    .as_ref()
                    .map(|b| compare_values(&value, b).is_lt())
                    .unwrap_or(true)
                {
                    *best = Some(value);
                }
            }
            Accumulator::Max(best) => {
                if best
                    .as_ref()
                    .map(|b| compare_values(&value, b).is_gt())
                    .unwrap_or(true)
                {
                    *best = Some(value);
                }
            }
            Accumulator::First(first) => {
                if first.is_none() {
                    *first = Some(value);
                }
            }
            Accumulator::Last(last) => *last = value,
            Accumulator::Push(items) => items.push(value),
            Accumulator::AddToSet(items) => {
                if !items.iter().any(|v| values_equal(v, &value)) {
                    items.push(value);
                }
            }
        }
    }

    fn finish(self) -> Value {
        match self {
            Accumulator::Sum(total) => total.into_value(),
            Accumulator::Avg { total, n } => {
                if n == 0 {
                    Value::Null
                } else {
                    Num::Float(total / n as f64).into_value()
                }
            }
            Accumulator::Min(v) | Accumulator::Max(v) | Accumulator::First(v) => v.unwrap_or(Value::Null),
            Accumulator::Last(v) => v,
            Accumulator::Push(items) | Accumulator::AddToSet(items) => Value::Array(items),
        }
    }
}

/// 按首次出现顺序保存的分组表
#[derive(Default)]
struct GroupTable {
    index: HashMap<String, usize>,
    groups: Vec<(Value, Vec<(String, Accumulator)>)>,
}

impl GroupTable {
    fn add(&mut self, key: Value, doc: &Document, specs: &[AccSpec]) -> EvalResult<()> {
        let fingerprint = key.to_string();
        let slot = match self.index.get(&fingerprint) {
            Some(slot) => *slot,
            None => {
                let accs = specs
                    .iter()
                    .map(|s| (s.name.clone(), Accumulator::new(&s.op)))
                    .collect();
                self.groups.push((key, accs));
                self.index.insert(fingerprint, self.groups.len() - 1);
                self.groups.len() - 1
            }
        };
        for (spec, (_, acc)) in specs.iter().zip(self.groups[slot].1.iter_mut()) {
            acc.push(eval(&spec.arg, doc)?);
        }
        Ok(())
    }

    fn finish(self) -> Vec<Document> {
        self.groups
            .into_iter()
            .map(|(key, accs)| {
                let mut out = Map::new();
                out.insert("_id".to_string(), key);
                for (name, acc) in accs {
                    out.insert(name, acc.finish());
                }
                out
            })
            .collect()
    }
}

fn group(docs: Vec<Document>, body: &Value) -> EvalResult<Vec<Document>> {
    let spec = body
        .as_object()
        .ok_or_else(|| reject("a group's fields must be specified in an object"))?;
    let id_expr = spec
        .get("_id")
        .ok_or_else(|| reject("a group specification must include an _id"))?;
    let specs = Accumulator::parse_specs(spec)?;

    let mut table = GroupTable::default();
    for doc in &docs {
        table.add(eval(id_expr, doc)?, doc, &specs)?;
    }
    Ok(table.finish())
}

fn bucket(docs: Vec<Document>, body: &Value) -> EvalResult<Vec<Document>> {
    let spec = body
        .as_object()
        .ok_or_else(|| reject("$bucket specification must be an object"))?;
    let group_by = spec
        .get("groupBy")
        .ok_or_else(|| reject("$bucket requires 'groupBy' and 'boundaries' to be specified"))?;
    let boundaries = spec
        .get("boundaries")
        .and_then(Value::as_array)
        .filter(|b| b.len() >= 2)
        .ok_or_else(|| reject("The $bucket 'boundaries' field must be an array of at least two values"))?;
    let default = spec.get("default");
    let specs = match spec.get("output").and_then(Value::as_object) {
        Some(output) => Accumulator::parse_specs(output)?,
        None => vec![Accumulator::spec("count", "$sum", Value::from(1))],
    };

    let mut table = GroupTable::default();
    for doc in &docs {
        let value = eval(group_by, doc)?;
        let lower = boundaries.windows(2).find(|w| {
            compare_values(&value, &w[0]).is_ge() && compare_values(&value, &w[1]).is_lt()
        });
        let key = match (lower, default) {
            (Some(w), _) => w[0].clone(),
            (None, Some(d)) => d.clone(),
            (None, None) => {
                return Err(reject(
                    "$switch could not find a matching branch for an input, and no default was specified.",
                ))
            }
        };
        table.add(key, doc, &specs)?;
    }
    let mut out = table.finish();
    out.sort_by(|a, b| compare_values(&a["_id"], &b["_id"]));
    Ok(out)
}
