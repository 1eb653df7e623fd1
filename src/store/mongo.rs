//! MongoDB 文档库（`mongo` feature）
//!
//! 连接池由 mongodb::Client 管理，可被多个运行共享。聚合带 max_time，
//! 结果按 JSON 规则归一：ObjectId → 十六进制串，日期 → RFC 3339，NaN → null，±Inf → "Infinity" / "-Infinity"。

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use mongodb::bson::{doc, Bson, Document as BsonDocument};
use mongodb::error::{Error as MongoError, ErrorKind};
use mongodb::{Client, Collection};
use serde_json::{Map, Number, Value};

use crate::pipeline::Pipeline;
use crate::store::{Document, DocumentStore, StoreError};

/// 服务端 MaxTimeMSExpired
const MAX_TIME_EXPIRED: i32 = 50;

#[derive(Clone)]
pub struct MongoStore {
    client: Client,
    collection: Collection<BsonDocument>,
    name: String,
    max_time: Duration,
}

impl MongoStore {
    pub async fn connect(
        uri: &str,
        database: &str,
        collection: &str,
        max_time: Duration,
    ) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(uri)
            .await
            .map_err(|e| StoreError::Unavailable(format!("failed to connect to MongoDB: {}", e)))?;
        let handle = client.database(database).collection::<BsonDocument>(collection);
        tracing::info!(database, collection, "MongoDB store configured");
        Ok(Self {
            client,
            collection: handle,
            name: collection.to_string(),
            max_time,
        })
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    fn collection_name(&self) -> &str {
        &self.name
    }

    async fn aggregate(&self, pipeline: &Pipeline) -> Result<Vec<Document>, StoreError> {
        let stages = to_bson_pipeline(pipeline)?;
        let mut cursor = self
            .collection
            .aggregate(stages)
            .max_time(self.max_time)
            .await
            .map_err(map_error)?;

        let mut rows = Vec::new();
        while cursor.advance().await.map_err(map_error)? {
            let raw = cursor.deserialize_current().map_err(map_error)?;
            rows.push(document_to_json(raw));
        }
        Ok(rows)
    }

    async fn count_documents(&self) -> Result<u64, StoreError> {
        self.collection
            .estimated_document_count()
            .await
            .map_err(map_error)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map(|_| ())
            .map_err(map_error)
    }
}

/// 管道的每个阶段按扩展 JSON 编码（`{"$date": ...}` 会变成 BSON 日期）
pub fn to_bson_pipeline(pipeline: &Pipeline) -> Result<Vec<BsonDocument>, StoreError> {
    pipeline
        .iter()
        .map(|stage| match Bson::try_from(stage.to_value()) {
            Ok(Bson::Document(doc)) => Ok(doc),
            Ok(_) => Err(StoreError::Rejected(format!(
                "stage {} did not encode to a document",
                stage.operator
            ))),
            Err(e) => Err(StoreError::Rejected(format!(
                "stage {} cannot be encoded: {}",
                stage.operator, e
            ))),
        })
        .collect()
}

fn map_error(err: MongoError) -> StoreError {
    match err.kind.as_ref() {
        ErrorKind::Command(cmd) if cmd.code == MAX_TIME_EXPIRED => {
            StoreError::TimedOut(format!("Query execution failed: {}", cmd.message))
        }
        ErrorKind::Command(cmd) => StoreError::Rejected(format!("Query execution failed: {}", cmd.message)),
        ErrorKind::ServerSelection { .. }
        | ErrorKind::Io(_)
        | ErrorKind::ConnectionPoolCleared { .. }
        | ErrorKind::Authentication { .. } => StoreError::Unavailable(format!("MongoDB unavailable: {}", err)),
        _ => StoreError::Rejected(format!("Query execution failed: {}", err)),
    }
}

pub fn document_to_json(doc: BsonDocument) -> Document {
    doc.into_iter().map(|(k, v)| (k, bson_to_json(v))).collect::<Map<String, Value>>()
}

pub fn bson_to_json(value: Bson) -> Value {
    match value {
        Bson::Double(f) if f.is_nan() => Value::Null,
        Bson::Double(f) if f.is_infinite() => {
            Value::String(if f > 0.0 { "Infinity" } else { "-Infinity" }.to_string())
        }
        Bson::Double(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        Bson::Int32(i) => Value::from(i),
        Bson::Int64(i) => Value::from(i),
        Bson::String(s) => Value::String(s),
        Bson::Boolean(b) => Value::Bool(b),
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(dt) => DateTime::<Utc>::from_timestamp_millis(dt.timestamp_millis())
            .map(|d| Value::String(d.to_rfc3339_opts(SecondsFormat::AutoSi, true)))
            .unwrap_or(Value::Null),
        Bson::Array(items) => Value::Array(items.into_iter().map(bson_to_json).collect()),
        Bson::Document(doc) => Value::Object(document_to_json(doc)),
        decimal @ Bson::Decimal128(_) => match decimal.into_relaxed_extjson() {
            Value::Object(mut obj) => match obj.remove("$numberDecimal") {
                Some(Value::String(s)) => s
                    .parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or(Value::String(s)),
                _ => Value::Null,
            },
            other => other,
        },
        other => other.into_relaxed_extjson(),
    }
}
