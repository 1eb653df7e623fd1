//! 从文件加载文档：JSON 数组或 JSON Lines（每行一个文档）

use std::path::Path;

use serde_json::Value;
use thiserror::Error;

use crate::schema::{FieldKind, SchemaReference};
use crate::store::expr::{normalize_date, resolve_path, set_path};
use crate::store::Document;

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON on line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Entry {0} is not a JSON object")]
    NotAnObject(usize),
}

/// 按扩展名选择格式：`.json` 为数组，其余按 JSON Lines
pub async fn load_documents(path: &Path) -> Result<Vec<Document>, LoaderError> {
    let raw = tokio::fs::read_to_string(path).await?;
    let is_array = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let docs = if is_array {
        parse_array(&raw)?
    } else {
        parse_lines(&raw)?
    };
    tracing::info!(path = %path.display(), documents = docs.len(), "documents loaded");
    Ok(docs)
}

fn parse_array(raw: &str) -> Result<Vec<Document>, LoaderError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|source| LoaderError::Parse { line: 1, source })?;
    let items = match value {
        Value::Array(items) => items,
        _ => return Err(LoaderError::NotAnObject(0)),
    };
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(doc) => Ok(doc),
            _ => Err(LoaderError::NotAnObject(i)),
        })
        .collect()
}

pub fn parse_lines(raw: &str) -> Result<Vec<Document>, LoaderError> {
    let mut docs = Vec::new();
    for (i, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(doc)) => docs.push(doc),
            Ok(_) => return Err(LoaderError::NotAnObject(i + 1)),
            Err(source) => return Err(LoaderError::Parse { line: i + 1, source }),
        }
    }
    Ok(docs)
}

/// 把 schema 中声明为日期的字段统一成 RFC 3339（无法解析的置为 null）
pub fn normalize_date_fields(docs: &mut [Document], schema: &SchemaReference) {
    let date_paths: Vec<&str> = schema
        .fields
        .iter()
        .filter(|f| f.kind == FieldKind::Date)
        .map(|f| f.path.as_str())
        .collect();
    if date_paths.is_empty() {
        return;
    }
    let mut invalid = 0usize;
    for doc in docs.iter_mut() {
        for path in &date_paths {
            if let Some(Value::String(raw)) = resolve_path(doc, path) {
                let normalized = normalize_date(&raw);
                if normalized.is_none() {
                    invalid += 1;
                }
                set_path(doc, path, normalized.map(Value::String).unwrap_or(Value::Null));
            }
        }
    }
    if invalid > 0 {
        tracing::warn!(invalid, "unparseable date values replaced with null");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::procurement;
    use std::io::Write;

    #[tokio::test]
    async fn test_load_jsonl_skips_blank_lines() {
        let mut file = tempfile::Builder::new().suffix(".jsonl").tempfile().unwrap();
        writeln!(file, r#"{{"a": 1}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"a": 2}}"#).unwrap();
        let docs = load_documents(file.path()).await.unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1]["a"], 2);
    }

    #[tokio::test]
    async fn test_load_json_array() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"[{{"a": 1}}, {{"a": 2}}, {{"a": 3}}]"#).unwrap();
        assert_eq!(load_documents(file.path()).await.unwrap().len(), 3);
    }

    #[test]
    fn test_parse_errors_carry_line() {
        match parse_lines("{\"a\": 1}\n{oops") {
            Err(LoaderError::Parse { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(parse_lines("[1]"), Err(LoaderError::NotAnObject(1))));
    }

    #[test]
    fn test_normalize_dates() {
        let mut docs = parse_lines(
            r#"{"dates": {"creation": "08/27/2013", "purchase": "not a date"}, "item": {"name": "x"}}"#,
        )
        .unwrap();
        normalize_date_fields(&mut docs, &procurement::purchase_orders());
        assert_eq!(docs[0]["dates"]["creation"], "2013-08-27T00:00:00Z");
        assert!(docs[0]["dates"]["purchase"].is_null());
        assert_eq!(docs[0]["item"]["name"], "x");
    }
}
