//! 管道类型
//!
//! Pipeline 是有序的阶段列表，每个阶段是「操作符 → 参数」的单键对象，
//! 线上格式为 JSON 数组：`[{"$match": {...}}, {"$limit": 10}]`。
//! 校验通过后不再修改；执行时需要补 `$limit` 会生成新值（with_stage）。

use std::fmt;

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// 管道结构错误（解析生成结果时使用）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineShapeError {
    #[error("pipeline must be a JSON array of stages")]
    NotAnArray,

    #[error("pipeline cannot be empty")]
    Empty,

    #[error("stage {0} must be a JSON object")]
    StageNotObject(usize),

    #[error("stage {index} must have exactly one operator, found {found}")]
    OperatorCount { index: usize, found: usize },
}

/// 单个阶段
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub operator: String,
    pub body: Value,
}

impl Stage {
    pub fn new(operator: impl Into<String>, body: Value) -> Self {
        Self {
            operator: operator.into(),
            body,
        }
    }

    pub fn limit(n: usize) -> Self {
        Self::new("$limit", Value::from(n as u64))
    }

    /// `$limit` / `$skip` 一类计数参数：非负整数，或小数部分为 0 的浮点数（`5.0`）
    pub fn count_argument(&self) -> Option<u64> {
        count_argument(&self.body)
    }

    pub fn to_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert(self.operator.clone(), self.body.clone());
        Value::Object(map)
    }
}

pub fn count_argument(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= 0.0 && *f <= u64::MAX as f64)
                .map(|f| f as u64)
        }),
        _ => None,
    }
}

impl Serialize for Stage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.operator, &self.body)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for Stage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct StageVisitor;

        impl<'de> Visitor<'de> for StageVisitor {
            type Value = Stage;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a single-key object {operator: body}")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Stage, A::Error> {
                let (operator, body) = access
                    .next_entry::<String, Value>()?
                    .ok_or_else(|| de::Error::custom("stage has no operator"))?;
                if access.next_key::<String>()?.is_some() {
                    return Err(de::Error::custom("stage must have exactly one operator"));
                }
                Ok(Stage { operator, body })
            }
        }

        deserializer.deserialize_map(StageVisitor)
    }
}

/// 聚合管道（有序）
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pipeline(Vec<Stage>);

impl Pipeline {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self(stages)
    }

    /// 从任意 JSON 值构造，给出带阶段下标的结构错误
    pub fn from_value(value: &Value) -> Result<Self, PipelineShapeError> {
        let items = value.as_array().ok_or(PipelineShapeError::NotAnArray)?;
        if items.is_empty() {
            return Err(PipelineShapeError::Empty);
        }
        let mut stages = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let obj = item
                .as_object()
                .ok_or(PipelineShapeError::StageNotObject(index))?;
            if obj.len() != 1 {
                return Err(PipelineShapeError::OperatorCount {
                    index,
                    found: obj.len(),
                });
            }
            if let Some((operator, body)) = obj.iter().next() {
                stages.push(Stage::new(operator.clone(), body.clone()));
            }
        }
        Ok(Self(stages))
    }

    pub fn stages(&self) -> &[Stage] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Stage> {
        self.0.iter()
    }

    pub fn operators(&self) -> Vec<&str> {
        self.0.iter().map(|s| s.operator.as_str()).collect()
    }

    pub fn has_stage(&self, operator: &str) -> bool {
        self.0.iter().any(|s| s.operator == operator)
    }

    /// 返回末尾追加一个阶段后的新管道，自身不变
    pub fn with_stage(&self, stage: Stage) -> Pipeline {
        let mut stages = self.0.clone();
        stages.push(stage);
        Pipeline(stages)
    }

    pub fn to_value(&self) -> Value {
        Value::Array(self.0.iter().map(Stage::to_value).collect())
    }

    pub fn to_pretty_json(&self) -> String {
        serde_json::to_string_pretty(&self.0).unwrap_or_else(|_| self.to_value().to_string())
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_value())
    }
}

impl<'a> IntoIterator for &'a Pipeline {
    type Item = &'a Stage;
    type IntoIter = std::slice::Iter<'a, Stage>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_serialize_reparse_keeps_order_and_keys() {
        let pipeline = Pipeline::from_value(&json!([
            {"$match": {"dates.fiscal_year": "2013-2014"}},
            {"$group": {"_id": "$department.normalized_name", "total": {"$sum": "$item.total_price"}}},
            {"$sort": {"total": -1}},
            {"$limit": 5}
        ]))
        .unwrap();

        let text = serde_json::to_string(&pipeline).unwrap();
        let reparsed: Pipeline = serde_json::from_str(&text).unwrap();
        assert_eq!(reparsed, pipeline);
        assert_eq!(reparsed.operators(), vec!["$match", "$group", "$sort", "$limit"]);
    }

    #[test]
    fn test_from_value_shape_errors() {
        assert_eq!(
            Pipeline::from_value(&json!({"$match": {}})),
            Err(PipelineShapeError::NotAnArray)
        );
        assert_eq!(Pipeline::from_value(&json!([])), Err(PipelineShapeError::Empty));
        assert_eq!(
            Pipeline::from_value(&json!([{"$match": {}}, 3])),
            Err(PipelineShapeError::StageNotObject(1))
        );
        assert_eq!(
            Pipeline::from_value(&json!([{"$match": {}, "$limit": 1}])),
            Err(PipelineShapeError::OperatorCount { index: 0, found: 2 })
        );
    }

    #[test]
    fn test_deserialize_rejects_multi_key_stage() {
        let parsed: Result<Pipeline, _> = serde_json::from_str(r#"[{"$match": {}, "$sort": {}}]"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_with_stage_leaves_original_untouched() {
        let original = Pipeline::new(vec![Stage::new("$match", json!({}))]);
        let extended = original.with_stage(Stage::limit(10));
        assert_eq!(original.len(), 1);
        assert_eq!(extended.len(), 2);
        assert!(extended.has_stage("$limit"));
        assert!(!original.has_stage("$limit"));
    }
}
