//! Document store boundary
//!
//! Beacon treats its persistent store as an external, schema-less,
//! hierarchical key-value log. Every backend provides the same contract:
//!
//! - `read` / `query` report the commit sequence they observed
//! - `write` merges a partial document at the top level (creating it if absent)
//! - `compare_and_set` commits only while a field still holds the expected value
//! - every commit is announced on a broadcast change stream, in commit order
//!
//! ```text
//!  IncidentService ──write/CAS──▶ ┌──────────────────┐ ──ChangeEvent──▶ SyncHub
//!  LocationFeed ────write───────▶ │  DocumentStore   │ ──ChangeEvent──▶ LiveView tasks
//!  AdvisoryBridge ──write───────▶ │ (memory | mongo) │
//!                                 └──────────────────┘
//! ```

pub mod memory;
pub mod mongo;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use tokio::sync::broadcast;

use crate::types::{BeaconError, Result};

pub use memory::MemoryStore;
pub use mongo::MongoStore;

/// Collection holding incident reports
pub const INCIDENTS: &str = "incidents";
/// Collection holding categories / incident types
pub const CATEGORIES: &str = "categories";
/// Collection holding user profiles
pub const USERS: &str = "users";

/// Key of the server-value sentinel object
const SERVER_VALUE_KEY: &str = ".sv";

/// Placeholder resolved to the store clock (epoch millis) at commit time
pub fn server_timestamp() -> Value {
    serde_json::json!({ SERVER_VALUE_KEY: "timestamp" })
}

/// Placeholder resolved to the sequence number of the commit writing it.
///
/// Every commit gets a distinct sequence, so a field stamped with it is a
/// revision: it changes on each write that carries the sentinel.
pub fn server_sequence() -> Value {
    serde_json::json!({ SERVER_VALUE_KEY: "seq" })
}

fn server_value_kind(value: &Value) -> Option<&str> {
    match value {
        Value::Object(map) if map.len() == 1 => map.get(SERVER_VALUE_KEY).and_then(Value::as_str),
        _ => None,
    }
}

/// Replace server-value sentinels in `value`: timestamps with `now_ms`,
/// sequences with `seq`. Backends call this while holding their commit
/// lock, with the sequence the commit is about to take.
pub fn resolve_server_values(value: &mut Value, now_ms: i64, seq: u64) {
    match server_value_kind(value) {
        Some("timestamp") => {
            *value = Value::from(now_ms);
            return;
        }
        Some("seq") => {
            *value = Value::from(seq);
            return;
        }
        _ => {}
    }
    match value {
        Value::Object(map) => {
            for child in map.values_mut() {
                resolve_server_values(child, now_ms, seq);
            }
        }
        Value::Array(items) => {
            for child in items.iter_mut() {
                resolve_server_values(child, now_ms, seq);
            }
        }
        _ => {}
    }
}

/// Store clock that never goes backwards within one process
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last_ms: AtomicI64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current time in epoch millis, clamped to the last value handed out
    pub fn now_ms(&self) -> i64 {
        let wall = chrono::Utc::now().timestamp_millis();
        let prev = self.last_ms.fetch_max(wall, AtomicOrdering::SeqCst);
        prev.max(wall)
    }
}

/// `<collection>/<id>` reference to a single document
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocPath {
    pub collection: String,
    pub id: String,
}

impl DocPath {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// Parse `collection/id`
    pub fn parse(path: &str) -> Result<Self> {
        match path.trim_matches('/').split_once('/') {
            Some((collection, id))
                if !collection.is_empty() && !id.is_empty() && !id.contains('/') =>
            {
                Ok(Self::new(collection, id))
            }
            _ => Err(BeaconError::BadRequest(format!("Invalid document path '{}'", path))),
        }
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// A document as stored: its key plus schema-less data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub id: String,
    pub data: Value,
}

impl StoredDocument {
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }

    /// Deserialize into a typed record, exposing the key as `id`
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        let mut data = self.data.clone();
        if let Value::Object(ref mut map) = data {
            map.insert("id".to_string(), Value::String(self.id.clone()));
        }
        serde_json::from_value(data).map_err(|e| {
            BeaconError::Internal(format!("Document '{}' does not decode: {}", self.id, e))
        })
    }
}

/// Acknowledgement of a committed write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Store-wide commit sequence number
    pub seq: u64,
    /// Store clock at commit (epoch millis)
    pub committed_at_ms: i64,
}

/// Single-document read
#[derive(Debug, Clone)]
pub struct ReadResult {
    pub seq: u64,
    pub document: Option<StoredDocument>,
}

/// Ordered collection read
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub seq: u64,
    pub documents: Vec<StoredDocument>,
}

/// Collection query: order by a field, optionally keep only entries equal
/// to a value. Without `order_by`, documents come back in key order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equal_to: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default)]
    pub descending: bool,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn order_by(field: impl Into<String>) -> Self {
        Self {
            order_by: Some(field.into()),
            ..Default::default()
        }
    }

    pub fn equal_to(mut self, value: impl Into<Value>) -> Self {
        self.equal_to = Some(value.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    /// An equality filter needs a field to compare
    pub fn validate(&self) -> Result<()> {
        if self.equal_to.is_some() && self.order_by.is_none() {
            return Err(BeaconError::BadRequest(
                "equalTo requires orderBy to name the compared field".into(),
            ));
        }
        Ok(())
    }

    /// Apply the filter, ordering and limit to an unordered set of documents
    pub fn apply(&self, mut documents: Vec<StoredDocument>) -> Vec<StoredDocument> {
        if let (Some(field), Some(expected)) = (&self.order_by, &self.equal_to) {
            documents.retain(|doc| field_value(&doc.data, field) == expected);
        }

        documents.sort_by(|a, b| {
            let primary = match &self.order_by {
                Some(field) => compare_values(field_value(&a.data, field), field_value(&b.data, field)),
                None => Ordering::Equal,
            };
            primary.then_with(|| a.id.cmp(&b.id))
        });

        if self.descending {
            documents.reverse();
        }
        if let Some(limit) = self.limit {
            documents.truncate(limit);
        }
        documents
    }
}

static NULL: Value = Value::Null;

/// Field lookup that treats a missing field as null
pub fn field_value<'a>(data: &'a Value, field: &str) -> &'a Value {
    data.get(field).unwrap_or(&NULL)
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values:
/// null < booleans < numbers < strings < arrays < objects
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => {
            let rank = type_rank(a).cmp(&type_rank(b));
            if rank == Ordering::Equal {
                // Same composite type: fall back to canonical text
                a.to_string().cmp(&b.to_string())
            } else {
                rank
            }
        }
    }
}

/// Merge a partial document into `target` at the top level
pub fn merge_patch(target: &mut Value, patch: Value) -> Result<()> {
    let Value::Object(fields) = patch else {
        return Err(BeaconError::BadRequest("Partial document must be a JSON object".into()));
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(existing) = target {
        for (key, value) in fields {
            existing.insert(key, value);
        }
    }
    Ok(())
}

/// What happened to a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Upsert,
    Delete,
}

/// Notification pushed to subscribers after every commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub path: DocPath,
    pub seq: u64,
    pub kind: ChangeKind,
}

/// Capacity of store change channels
pub const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Persistent store consumed by the engine
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Backend identifier for logs and health output
    fn backend(&self) -> &'static str;

    /// Read a single document
    async fn read(&self, path: &DocPath) -> Result<ReadResult>;

    /// Ordered, optionally filtered read of a collection
    async fn query(&self, collection: &str, query: &Query) -> Result<QueryResult>;

    /// Merge a partial document, creating it if needed
    async fn write(&self, path: &DocPath, patch: Value) -> Result<Commit>;

    /// Create a document under a store-assigned key
    async fn push(&self, collection: &str, value: Value) -> Result<(String, Commit)>;

    /// Merge `patch` only if `field` still equals `expected`.
    ///
    /// Fails with `NotFound` for a missing document and
    /// `StaleWriteRejected` when the precondition no longer holds.
    async fn compare_and_set(
        &self,
        path: &DocPath,
        field: &str,
        expected: &Value,
        patch: Value,
    ) -> Result<Commit>;

    /// Remove a document
    async fn delete(&self, path: &DocPath) -> Result<Commit>;

    /// Change stream, delivered in commit order
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;
}
