//! Schema 参考：字段路径/类型与阶段白名单
//!
//! 生成 Prompt 与静态校验共用同一份只读数据。白名单随 schema 一起版本化，
//! 可从 TOML 加载（见 config/schema.example.toml），未配置时使用内置采购单 schema。

pub mod procurement;

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use procurement::purchase_orders;

/// 永远禁止的写入 / 管理类阶段
pub const WRITE_STAGES: [&str; 2] = ["$out", "$merge"];

/// 默认只读阶段白名单
pub const DEFAULT_ALLOWED_STAGES: [&str; 20] = [
    "$match",
    "$group",
    "$sort",
    "$limit",
    "$skip",
    "$project",
    "$addFields",
    "$set",
    "$unset",
    "$count",
    "$unwind",
    "$lookup",
    "$facet",
    "$bucket",
    "$bucketAuto",
    "$sortByCount",
    "$replaceRoot",
    "$replaceWith",
    "$sample",
    "$geoNear",
];

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Failed to read schema file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse schema file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid schema reference: {0}")]
    Invalid(String),
}

/// 字段类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Number,
    Integer,
    Boolean,
    Date,
    Object,
    Array,
    GeoPoint,
}

impl FieldKind {
    /// 允许引用其子路径的类型（如 supplier.location.coordinates）
    fn has_children(&self) -> bool {
        matches!(self, FieldKind::Object | FieldKind::Array | FieldKind::GeoPoint)
    }

    fn label(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Integer => "integer",
            FieldKind::Boolean => "boolean",
            FieldKind::Date => "ISODate",
            FieldKind::Object => "object",
            FieldKind::Array => "array",
            FieldKind::GeoPoint => "GeoJSON Point",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub path: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub description: String,
}

impl FieldSpec {
    pub fn new(path: &str, kind: FieldKind, description: &str) -> Self {
        Self {
            path: path.to_string(),
            kind,
            description: description.to_string(),
        }
    }
}

fn default_allowed_stages() -> Vec<String> {
    DEFAULT_ALLOWED_STAGES.iter().map(|s| s.to_string()).collect()
}

fn default_forbidden_stages() -> Vec<String> {
    WRITE_STAGES.iter().map(|s| s.to_string()).collect()
}

/// Schema 参考（只读，跨请求共享）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaReference {
    /// 与白名单一起变更
    pub version: String,
    pub collection: String,
    #[serde(default)]
    pub description: String,
    pub fields: Vec<FieldSpec>,
    #[serde(default = "default_allowed_stages")]
    pub allowed_stages: Vec<String>,
    #[serde(default = "default_forbidden_stages")]
    pub forbidden_stages: Vec<String>,
    /// 写入生成 Prompt 的领域提示（类型陷阱、常用写法）
    #[serde(default)]
    pub notes: Vec<String>,
}

impl SchemaReference {
    /// 从 TOML 文件加载并校验
    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, SchemaError> {
        let schema: SchemaReference = toml::from_str(raw)?;
        schema.checked()
    }

    /// 校验白名单与字段定义；写入阶段总是补进禁止列表
    pub fn checked(mut self) -> Result<Self, SchemaError> {
        if self.fields.is_empty() {
            return Err(SchemaError::Invalid("no fields defined".to_string()));
        }
        for field in &self.fields {
            if field.path.is_empty() || field.path.starts_with('$') || field.path.ends_with('.') {
                return Err(SchemaError::Invalid(format!("bad field path '{}'", field.path)));
            }
        }
        for stage in self.allowed_stages.iter().chain(self.forbidden_stages.iter()) {
            if !stage.starts_with('$') || stage.len() < 2 {
                return Err(SchemaError::Invalid(format!(
                    "stage '{}' must start with $",
                    stage
                )));
            }
        }
        for write in WRITE_STAGES {
            if !self.forbidden_stages.iter().any(|s| s == write) {
                self.forbidden_stages.push(write.to_string());
            }
        }
        if let Some(conflict) = self
            .allowed_stages
            .iter()
            .find(|s| self.forbidden_stages.contains(s))
        {
            return Err(SchemaError::Invalid(format!(
                "stage '{}' is both allowed and forbidden",
                conflict
            )));
        }
        Ok(self)
    }

    pub fn is_allowed_stage(&self, operator: &str) -> bool {
        self.allowed_stages.iter().any(|s| s == operator)
    }

    pub fn is_forbidden_stage(&self, operator: &str) -> bool {
        WRITE_STAGES.contains(&operator) || self.forbidden_stages.iter().any(|s| s == operator)
    }

    /// 路径是否存在：等于已知字段、是已知字段的父路径，或是对象/数组字段的子路径
    pub fn has_path(&self, path: &str) -> bool {
        self.fields.iter().any(|f| {
            f.path == path
                || is_descendant(&f.path, path)
                || (f.kind.has_children() && is_descendant(path, &f.path))
        })
    }

    pub fn field(&self, path: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.path == path)
    }

    /// 渲染为 Prompt 中的 schema 描述
    pub fn prompt_description(&self) -> String {
        let mut out = format!("## Collection: {} (schema {})\n", self.collection, self.version);
        if !self.description.is_empty() {
            out.push_str(&self.description);
            out.push('\n');
        }
        out.push_str("\n### Fields:\n");
        for field in &self.fields {
            if field.description.is_empty() {
                out.push_str(&format!("- {} ({})\n", field.path, field.kind.label()));
            } else {
                out.push_str(&format!(
                    "- {} ({}): {}\n",
                    field.path,
                    field.kind.label(),
                    field.description
                ));
            }
        }
        if !self.notes.is_empty() {
            out.push_str("\n### Important Notes:\n");
            for note in &self.notes {
                out.push_str(&format!("- {}\n", note));
            }
        }
        out
    }
}

/// `child` 是否为 `parent` 的严格子路径（按 `.` 分段）
fn is_descendant(child: &str, parent: &str) -> bool {
    child.len() > parent.len()
        && child.starts_with(parent)
        && child.as_bytes()[parent.len()] == b'.'
}
