//! 内存存储的求值器：字段路径、值比较、查询匹配与表达式
//!
//! 日期以规范化的 RFC 3339 字符串（秒精度、Z 结尾）保存，因此可按字符串比较。
//! 整数运算尽量保持整数，浮点保持原值，不做舍入。

use std::cmp::Ordering;
use std::fmt::Write as _;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Timelike, Utc};
use regex::RegexBuilder;
use serde_json::{Map, Number, Value};

use crate::store::{Document, StoreError};

pub type EvalResult<T> = Result<T, StoreError>;

pub(crate) fn reject(msg: impl Into<String>) -> StoreError {
    StoreError::Rejected(msg.into())
}

// ---------------------------------------------------------------------------
// 日期
// ---------------------------------------------------------------------------

pub fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    for fmt in ["%Y-%m-%d", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|naive| Utc.from_utc_datetime(&naive));
        }
    }
    None
}

pub fn format_date(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// 规范化日期字符串；无法解析时返回 None
pub fn normalize_date(s: &str) -> Option<String> {
    parse_date(s).map(|dt| format_date(&dt))
}

/// `{"$date": "..."}` 扩展 JSON
fn extended_date(obj: &Map<String, Value>) -> Option<String> {
    if obj.len() != 1 {
        return None;
    }
    match obj.get("$date")? {
        Value::String(s) => normalize_date(s),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .map(|dt| format_date(&dt)),
        _ => None,
    }
}

fn literal(value: &Value) -> Value {
    match value {
        Value::Object(obj) => extended_date(obj).map(Value::String).unwrap_or_else(|| value.clone()),
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// 数值
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    pub(crate) fn from_value(value: &Value) -> Option<Num> {
        match value {
            Value::Number(n) => n.as_i64().map(Num::Int).or_else(|| n.as_f64().map(Num::Float)),
            _ => None,
        }
    }

    pub(crate) fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }

    pub(crate) fn add(self, other: Num) -> Num {
        match (self, other) {
            (Num::Int(a), Num::Int(b)) => a
                .checked_add(b)
                .map(Num::Int)
                .unwrap_or(Num::Float(a as f64 + b as f64)),
            (a, b) => Num::Float(a.as_f64() + b.as_f64()),
        }
    }

    fn sub(self, other: Num) -> Num {
        match (self, other) {
            (Num::Int(a), Num::Int(b)) => a
                .checked_sub(b)
                .map(Num::Int)
                .unwrap_or(Num::Float(a as f64 - b as f64)),
            (a, b) => Num::Float(a.as_f64() - b.as_f64()),
        }
    }

    fn mul(self, other: Num) -> Num {
        match (self, other) {
            (Num::Int(a), Num::Int(b)) => a
                .checked_mul(b)
                .map(Num::Int)
                .unwrap_or(Num::Float(a as f64 * b as f64)),
            (a, b) => Num::Float(a.as_f64() * b.as_f64()),
        }
    }

    /// 非有限浮点渲染为 null
    pub(crate) fn into_value(self) -> Value {
        match self {
            Num::Int(i) => Value::from(i),
            Num::Float(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        }
    }
}

// ---------------------------------------------------------------------------
// 字段路径
// ---------------------------------------------------------------------------

fn walk(value: &Value, segments: &[&str]) -> Option<Value> {
    let Some((head, rest)) = segments.split_first() else {
        return Some(value.clone());
    };
    match value {
        Value::Object(map) => walk(map.get(*head)?, rest),
        Value::Array(items) => {
            if let Ok(index) = head.parse::<usize>() {
                return walk(items.get(index)?, rest);
            }
            let found: Vec<Value> = items.iter().filter_map(|item| walk(item, segments)).collect();
            if found.is_empty() {
                None
            } else {
                Some(Value::Array(found))
            }
        }
        _ => None,
    }
}

/// 取点分路径的值；路径经过数组时对元素逐个展开
pub fn resolve_path(doc: &Document, path: &str) -> Option<Value> {
    let segments: Vec<&str> = path.split('.').collect();
    let (head, rest) = segments.split_first()?;
    walk(doc.get(*head)?, rest)
}

/// 写入点分路径，必要时创建中间对象
pub fn set_path(doc: &mut Document, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = doc
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(child) = entry {
                set_path(child, rest, value);
            }
        }
    }
}

pub fn remove_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Object(child)) = doc.get_mut(head) {
                remove_path(child, rest);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// 比较
// ---------------------------------------------------------------------------

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// 全序比较：先按类型，再按值
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => match (Num::from_value(a), Num::from_value(b)) {
            (Some(Num::Int(x)), Some(Num::Int(y))) => x.cmp(&y),
            (Some(x), Some(y)) => x.as_f64().partial_cmp(&y.as_f64()).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare_values(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y.iter()) {
                let ord = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

pub fn values_equal(a: &Value, b: &Value) -> bool {
    compare_values(a, b) == Ordering::Equal
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(_) => Num::from_value(value).map(|n| n.as_f64() != 0.0).unwrap_or(false),
        _ => true,
    }
}

// ---------------------------------------------------------------------------
// 查询匹配（$match）
// ---------------------------------------------------------------------------

fn query_list(value: &Value, op: &str) -> EvalResult<Vec<Value>> {
    match value {
        Value::Array(items) if !items.is_empty() => Ok(items.clone()),
        _ => Err(reject(format!("{} must be a nonempty array", op))),
    }
}

/// 文档是否满足查询
pub fn matches(query: &Value, doc: &Document) -> EvalResult<bool> {
    let obj = query
        .as_object()
        .ok_or_else(|| reject("the match filter must be an expression in an object"))?;
    for (key, cond) in obj {
        let ok = match key.as_str() {
            "$and" => {
                let mut all = true;
                for sub in query_list(cond, "$and")? {
                    if !matches(&sub, doc)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" | "$nor" => {
                let mut any = false;
                for sub in query_list(cond, key)? {
                    if matches(&sub, doc)? {
                        any = true;
                        break;
                    }
                }
                if key == "$or" {
                    any
                } else {
                    !any
                }
            }
            "$expr" => truthy(&eval(cond, doc)?),
            "$text" => return Err(reject("text index required for $text query")),
            op if op.starts_with('$') => {
                return Err(reject(format!("unknown top level operator: {}", op)))
            }
            path => field_matches(resolve_path(doc, path).as_ref(), cond)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn is_operator_object(obj: &Map<String, Value>) -> bool {
    !obj.is_empty() && obj.keys().all(|k| k.starts_with('$')) && extended_date(obj).is_none()
}

fn field_matches(value: Option<&Value>, cond: &Value) -> EvalResult<bool> {
    if let Value::Object(ops) = cond {
        if is_operator_object(ops) {
            for (op, arg) in ops {
                if !operator_matches(value, op, arg, ops)? {
                    return Ok(false);
                }
            }
            return Ok(true);
        }
    }
    Ok(equals_or_contains(value, &literal(cond)))
}

fn equals_or_contains(value: Option<&Value>, target: &Value) -> bool {
    match value {
        None => target.is_null(),
        Some(Value::Array(items)) => {
            values_equal(&Value::Array(items.clone()), target)
                || items.iter().any(|item| values_equal(item, target))
        }
        Some(v) => values_equal(v, target),
    }
}

fn candidates(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => {
            let mut all: Vec<&Value> = items.iter().collect();
            all.push(value);
            all
        }
        other => vec![other],
    }
}

fn compare_matches(value: Option<&Value>, target: &Value, accept: fn(Ordering) -> bool) -> bool {
    let Some(value) = value else {
        return false;
    };
    candidates(value)
        .into_iter()
        .any(|v| type_rank(v) == type_rank(target) && accept(compare_values(v, target)))
}

fn operator_matches(
    value: Option<&Value>,
    op: &str,
    arg: &Value,
    siblings: &Map<String, Value>,
) -> EvalResult<bool> {
    let target = literal(arg);
    match op {
        "$eq" => Ok(equals_or_contains(value, &target)),
        "$ne" => Ok(!equals_or_contains(value, &target)),
        "$gt" => Ok(compare_matches(value, &target, |o| o == Ordering::Greater)),
        "$gte" => Ok(compare_matches(value, &target, |o| o != Ordering::Less)),
        "$lt" => Ok(compare_matches(value, &target, |o| o == Ordering::Less)),
        "$lte" => Ok(compare_matches(value, &target, |o| o != Ordering::Greater)),
        "$in" | "$nin" => {
            let options = arg
                .as_array()
                .ok_or_else(|| reject(format!("{} needs an array", op)))?;
            let found = options
                .iter()
                .any(|option| equals_or_contains(value, &literal(option)));
            Ok(if op == "$in" { found } else { !found })
        }
        "$exists" => Ok(value.is_some() == truthy(arg)),
        "$regex" => {
            let pattern = arg
                .as_str()
                .ok_or_else(|| reject("$regex has to be a string"))?;
            let flags = siblings.get("$options").and_then(Value::as_str).unwrap_or("");
            let re = RegexBuilder::new(pattern)
                .case_insensitive(flags.contains('i'))
                .multi_line(flags.contains('m'))
                .dot_matches_new_line(flags.contains('s'))
                .build()
                .map_err(|e| reject(format!("invalid regular expression: {}", e)))?;
            Ok(value
                .map(|v| {
                    candidates(v)
                        .into_iter()
                        .any(|c| c.as_str().map(|s| re.is_match(s)).unwrap_or(false))
                })
                .unwrap_or(false))
        }
        "$options" => Ok(true),
        "$not" => Ok(!field_matches(value, arg)?),
        "$size" => {
            let n = arg
                .as_u64()
                .ok_or_else(|| reject("$size needs a non-negative integer"))?;
            Ok(matches!(value, Some(Value::Array(items)) if items.len() as u64 == n))
        }
        "$all" => {
            let required = arg.as_array().ok_or_else(|| reject("$all needs an array"))?;
            Ok(required
                .iter()
                .all(|r| equals_or_contains(value, &literal(r))))
        }
        "$elemMatch" => {
            let Some(Value::Array(items)) = value else {
                return Ok(false);
            };
            for item in items {
                let hit = match item {
                    Value::Object(obj) if !arg.as_object().map(is_operator_object).unwrap_or(false) => {
                        matches(arg, obj)?
                    }
                    other => field_matches(Some(other), arg)?,
                };
                if hit {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        other => Err(reject(format!("unknown operator: {}", other))),
    }
}

// ---------------------------------------------------------------------------
// 表达式
// ---------------------------------------------------------------------------

/// 对文档求值一个聚合表达式
pub fn eval(expr: &Value, doc: &Document) -> EvalResult<Value> {
    match expr {
        Value::String(s) if s.starts_with("$$") => variable(s, doc),
        Value::String(s) if s.len() > 1 && s.starts_with('$') => {
            Ok(resolve_path(doc, &s[1..]).unwrap_or(Value::Null))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| eval(item, doc))
            .collect::<EvalResult<Vec<_>>>()
            .map(Value::Array),
        Value::Object(obj) => {
            if let Some(date) = extended_date(obj) {
                return Ok(Value::String(date));
            }
            if obj.len() == 1 {
                if let Some((op, arg)) = obj.iter().next().filter(|(k, _)| k.starts_with('$')) {
                    return eval_operator(op, arg, doc);
                }
            }
            let mut out = Map::new();
            for (key, value) in obj {
                if key.starts_with('$') {
                    return Err(reject(format!(
                        "an expression specification must contain exactly one field, found '{}' among others",
                        key
                    )));
                }
                out.insert(key.clone(), eval(value, doc)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn variable(name: &str, doc: &Document) -> EvalResult<Value> {
    let (var, rest) = match name[2..].split_once('.') {
        Some((var, rest)) => (var, Some(rest)),
        None => (&name[2..], None),
    };
    match var {
        "ROOT" | "CURRENT" => Ok(match rest {
            Some(path) => resolve_path(doc, path).unwrap_or(Value::Null),
            None => Value::Object(doc.clone()),
        }),
        "REMOVE" => Ok(Value::Null),
        other => Err(reject(format!("Use of undefined variable: {}", other))),
    }
}

fn eval_args(arg: &Value, doc: &Document) -> EvalResult<Vec<Value>> {
    match arg {
        Value::Array(items) => items.iter().map(|item| eval(item, doc)).collect(),
        single => Ok(vec![eval(single, doc)?]),
    }
}

fn exactly<const N: usize>(op: &str, arg: &Value, doc: &Document) -> EvalResult<[Value; N]> {
    let values = eval_args(arg, doc)?;
    let found = values.len();
    values.try_into().map_err(|_| {
        reject(format!(
            "Expression {} takes exactly {} arguments. {} were passed in.",
            op, N, found
        ))
    })
}

fn numeric(op: &str, value: &Value) -> EvalResult<Option<Num>> {
    match value {
        Value::Null => Ok(None),
        Value::Number(_) => Ok(Num::from_value(value)),
        other => Err(reject(format!(
            "{} only supports numeric types, not {}",
            op,
            type_name(other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn date_value(op: &str, value: &Value) -> EvalResult<Option<DateTime<Utc>>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => parse_date(s)
            .map(Some)
            .ok_or_else(|| reject(format!("{} can't convert from BSON type string to Date", op))),
        Value::Number(n) => Ok(n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single())),
        other => Err(reject(format!(
            "{} can't convert from BSON type {} to Date",
            op,
            type_name(other)
        ))),
    }
}

/// 日期操作符的参数可以是表达式，也可以是 {date: 表达式}
fn date_operand<'a>(arg: &'a Value) -> &'a Value {
    match arg {
        Value::Object(obj) if obj.contains_key("date") => obj.get("date").unwrap_or(arg),
        Value::Array(items) if items.len() == 1 => &items[0],
        other => other,
    }
}

fn eval_operator(op: &str, arg: &Value, doc: &Document) -> EvalResult<Value> {
    match op {
        "$literal" => Ok(arg.clone()),

        "$add" | "$multiply" => {
            let mut acc = if op == "$add" { Num::Int(0) } else { Num::Int(1) };
            for value in eval_args(arg, doc)? {
                match numeric(op, &value)? {
                    Some(n) => acc = if op == "$add" { acc.add(n) } else { acc.mul(n) },
                    None => return Ok(Value::Null),
                }
            }
            Ok(acc.into_value())
        }
        "$subtract" => {
            let [a, b] = exactly::<2>(op, arg, doc)?;
            match (numeric(op, &a)?, numeric(op, &b)?) {
                (Some(x), Some(y)) => Ok(x.sub(y).into_value()),
                _ => Ok(Value::Null),
            }
        }
        "$divide" | "$mod" => {
            let [a, b] = exactly::<2>(op, arg, doc)?;
            match (numeric(op, &a)?, numeric(op, &b)?) {
                (Some(x), Some(y)) => {
                    if y.as_f64() == 0.0 {
                        return Err(reject(format!("can't {} by zero", op)));
                    }
                    if op == "$divide" {
                        Ok(Num::Float(x.as_f64() / y.as_f64()).into_value())
                    } else {
                        match (x, y) {
                            (Num::Int(p), Num::Int(q)) => p
                                .checked_rem(q)
                                .map(Value::from)
                                .ok_or_else(|| reject("integer overflow in $mod")),
                            _ => Ok(Num::Float(x.as_f64() % y.as_f64()).into_value()),
                        }
                    }
                }
                _ => Ok(Value::Null),
            }
        }
        "$abs" | "$ceil" | "$floor" => {
            let [a] = exactly::<1>(op, arg, doc)?;
            Ok(match numeric(op, &a)? {
                None => Value::Null,
                Some(Num::Int(i)) if op == "$abs" => Value::from(i.saturating_abs()),
                Some(Num::Int(i)) => Value::from(i),
                Some(Num::Float(f)) => {
                    let r = match op {
                        "$abs" => f.abs(),
                        "$ceil" => f.ceil(),
                        _ => f.floor(),
                    };
                    Num::Float(r).into_value()
                }
            })
        }
        "$round" => {
            let values = eval_args(arg, doc)?;
            let value = values.first().cloned().unwrap_or(Value::Null);
            let places = values.get(1).and_then(Value::as_i64).unwrap_or(0);
            Ok(match numeric(op, &value)? {
                None => Value::Null,
                Some(Num::Int(i)) => Value::from(i),
                Some(Num::Float(f)) => {
                    let factor = 10f64.powi(places as i32);
                    Num::Float((f * factor).round() / factor).into_value()
                }
            })
        }

        "$ifNull" => {
            let values = eval_args(arg, doc)?;
            if values.len() < 2 {
                return Err(reject("$ifNull needs at least two arguments"));
            }
            Ok(values
                .iter()
                .find(|v| !v.is_null())
                .cloned()
                .unwrap_or(Value::Null))
        }
        "$cond" => {
            let (cond, then, otherwise) = match arg {
                Value::Array(items) if items.len() == 3 => (&items[0], &items[1], &items[2]),
                Value::Object(obj) => match (obj.get("if"), obj.get("then"), obj.get("else")) {
                    (Some(c), Some(t), Some(e)) => (c, t, e),
                    _ => return Err(reject("Missing 'if', 'then' or 'else' parameter to $cond")),
                },
                _ => return Err(reject("Expression $cond takes exactly 3 arguments")),
            };
            if truthy(&eval(cond, doc)?) {
                eval(then, doc)
            } else {
                eval(otherwise, doc)
            }
        }

        "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" | "$cmp" => {
            let [a, b] = exactly::<2>(op, arg, doc)?;
            let ord = compare_values(&a, &b);
            Ok(match op {
                "$eq" => Value::Bool(ord == Ordering::Equal),
                "$ne" => Value::Bool(ord != Ordering::Equal),
                "$gt" => Value::Bool(ord == Ordering::Greater),
                "$gte" => Value::Bool(ord != Ordering::Less),
                "$lt" => Value::Bool(ord == Ordering::Less),
                "$lte" => Value::Bool(ord != Ordering::Greater),
                _ => Value::from(match ord {
                    Ordering::Less => -1,
                    Ordering::Equal => 0,
                    Ordering::Greater => 1,
                }),
            })
        }
        "$and" => Ok(Value::Bool(eval_args(arg, doc)?.iter().all(truthy))),
        "$or" => Ok(Value::Bool(eval_args(arg, doc)?.iter().any(truthy))),
        "$not" => {
            let [a] = exactly::<1>(op, arg, doc)?;
            Ok(Value::Bool(!truthy(&a)))
        }
        "$in" => {
            let [needle, haystack] = exactly::<2>(op, arg, doc)?;
            let items = haystack
                .as_array()
                .ok_or_else(|| reject("$in requires an array as a second argument"))?;
            Ok(Value::Bool(items.iter().any(|item| values_equal(item, &needle))))
        }

        "$year" | "$month" | "$dayOfMonth" | "$dayOfWeek" | "$dayOfYear" | "$hour" => {
            let value = eval(date_operand(arg), doc)?;
            Ok(match date_value(op, &value)? {
                None => Value::Null,
                Some(dt) => Value::from(match op {
                    "$year" => dt.year() as i64,
                    "$month" => dt.month() as i64,
                    "$dayOfMonth" => dt.day() as i64,
                    "$dayOfWeek" => dt.weekday().number_from_sunday() as i64,
                    "$dayOfYear" => dt.ordinal() as i64,
                    _ => dt.hour() as i64,
                }),
            })
        }
        "$dateToString" => {
            let spec = arg
                .as_object()
                .ok_or_else(|| reject("$dateToString only supports an object as its argument"))?;
            let date = eval(spec.get("date").unwrap_or(&Value::Null), doc)?;
            let format = spec
                .get("format")
                .and_then(Value::as_str)
                .unwrap_or("%Y-%m-%dT%H:%M:%S.%LZ")
                .replace("%L", "%3f");
            match date_value(op, &date)? {
                None => Ok(spec.get("onNull").cloned().unwrap_or(Value::Null)),
                Some(dt) => {
                    let mut out = String::new();
                    write!(out, "{}", dt.format(&format))
                        .map_err(|_| reject(format!("invalid $dateToString format '{}'", format)))?;
                    Ok(Value::String(out))
                }
            }
        }
        "$toDate" => {
            let [value] = exactly::<1>(op, arg, doc)?;
            match &value {
                Value::String(s) => normalize_date(s)
                    .map(Value::String)
                    .ok_or_else(|| reject(format!("Error parsing date string '{}'", s))),
                _ => Ok(date_value(op, &value)?
                    .map(|dt| Value::String(format_date(&dt)))
                    .unwrap_or(Value::Null)),
            }
        }

        "$toString" => {
            let [value] = exactly::<1>(op, arg, doc)?;
            Ok(match value {
                Value::Null => Value::Null,
                Value::String(s) => Value::String(s),
                other => Value::String(other.to_string()),
            })
        }
        "$toInt" | "$toLong" | "$toDouble" | "$toDecimal" => {
            let [value] = exactly::<1>(op, arg, doc)?;
            let parsed = match &value {
                Value::Null => return Ok(Value::Null),
                Value::Bool(b) => Some(Num::Int(*b as i64)),
                Value::Number(_) => Num::from_value(&value),
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Num::Int)
                    .ok()
                    .or_else(|| s.trim().parse::<f64>().ok().map(Num::Float)),
                _ => None,
            }
            .ok_or_else(|| reject(format!("Failed to parse number '{}' in {}", value, op)))?;
            Ok(match (op, parsed) {
                ("$toInt" | "$toLong", n) => Value::from(n.as_f64().trunc() as i64),
                (_, n) => Num::Float(n.as_f64()).into_value(),
            })
        }
        "$concat" => {
            let mut out = String::new();
            for value in eval_args(arg, doc)? {
                match value {
                    Value::Null => return Ok(Value::Null),
                    Value::String(s) => out.push_str(&s),
                    other => {
                        return Err(reject(format!(
                            "$concat only supports strings, not {}",
                            type_name(&other)
                        )))
                    }
                }
            }
            Ok(Value::String(out))
        }
        "$toLower" | "$toUpper" => {
            let [value] = exactly::<1>(op, arg, doc)?;
            Ok(match value {
                Value::Null => Value::String(String::new()),
                Value::String(s) if op == "$toLower" => Value::String(s.to_lowercase()),
                Value::String(s) => Value::String(s.to_uppercase()),
                other => Value::String(other.to_string()),
            })
        }
        "$substr" | "$substrCP" => {
            let [value, start, len] = exactly::<3>(op, arg, doc)?;
            let s = value.as_str().unwrap_or_default();
            let start = start.as_u64().unwrap_or(0) as usize;
            let len = len.as_i64().unwrap_or(-1);
            let chars = s.chars().skip(start);
            let out: String = if len < 0 {
                chars.collect()
            } else {
                chars.take(len as usize).collect()
            };
            Ok(Value::String(out))
        }
        "$size" => {
            let [value] = exactly::<1>(op, arg, doc)?;
            match value {
                Value::Array(items) => Ok(Value::from(items.len() as u64)),
                other => Err(reject(format!(
                    "The argument to $size must be an array. Type of argument: {}",
                    type_name(&other)
                ))),
            }
        }
        "$arrayElemAt" => {
            let [array, index] = exactly::<2>(op, arg, doc)?;
            let items = array
                .as_array()
                .ok_or_else(|| reject("$arrayElemAt's first argument must be an array"))?;
            let index = index
                .as_i64()
                .ok_or_else(|| reject("$arrayElemAt's second argument must be an integer"))?;
            let position = if index < 0 {
                items.len() as i64 + index
            } else {
                index
            };
            Ok(usize::try_from(position)
                .ok()
                .and_then(|p| items.get(p).cloned())
                .unwrap_or(Value::Null))
        }

        "$sum" | "$avg" | "$min" | "$max" => {
            let mut values = eval_args(arg, doc)?;
            if values.len() == 1 {
                if let Some(Value::Array(items)) = values.first() {
                    values = items.clone();
                }
            }
            Ok(fold_values(op, &values))
        }

        other => Err(reject(format!("Unrecognized expression '{}'", other))),
    }
}

/// 数组上的 $sum / $avg / $min / $max（表达式形式）
fn fold_values(op: &str, values: &[Value]) -> Value {
    match op {
        "$sum" => values
            .iter()
            .filter_map(Num::from_value)
            .fold(Num::Int(0), Num::add)
            .into_value(),
        "$avg" => {
            let nums: Vec<f64> = values.iter().filter_map(Num::from_value).map(Num::as_f64).collect();
            if nums.is_empty() {
                Value::Null
            } else {
                Num::Float(nums.iter().sum::<f64>() / nums.len() as f64).into_value()
            }
        }
        _ => {
            let mut present = values.iter().filter(|v| !v.is_null());
            let first = present.next().cloned();
            present
                .fold(first, |best, v| match best {
                    Some(b) => {
                        let ord = compare_values(v, &b);
                        let replace = if op == "$min" {
                            ord == Ordering::Less
                        } else {
                            ord == Ordering::Greater
                        };
                        Some(if replace { v.clone() } else { b })
                    }
                    None => Some(v.clone()),
                })
                .unwrap_or(Value::Null)
        }
    }
}
