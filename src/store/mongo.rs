//! MongoDB-backed document store
//!
//! Every document lives in a single `documents` collection keyed
//! `"{collection}:{id}"`; the schema-less payload sits under `data`.
//! Writes from this process are serialized through one commit lock so the
//! sequence numbers and change notifications leave in commit order.
//!
//! Change notifications are fanned out in-process after each committed
//! write, the same way the projection store announces its updates.

use async_trait::async_trait;
use bson::{doc, Bson, DateTime, Document};
use futures_util::TryStreamExt;
use mongodb::options::{FindOneOptions, UpdateOptions};
use mongodb::{Client, Collection, IndexModel};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    field_value, resolve_server_values, ChangeEvent, ChangeKind, Commit, DocPath, DocumentStore,
    MonotonicClock, Query, QueryResult, ReadResult, StoredDocument, CHANGE_CHANNEL_CAPACITY,
};
use crate::types::{BeaconError, Result};

/// Default collection name for stored documents
pub const DOCUMENTS_COLLECTION: &str = "documents";

/// Record shape inside MongoDB
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    #[serde(rename = "_id")]
    key: String,
    collection: String,
    doc_id: String,
    seq: i64,
    data: Document,
    updated_at: DateTime,
}

impl StoredRecord {
    fn into_document(self) -> Result<StoredDocument> {
        let data: Value = bson::from_document(self.data)?;
        Ok(StoredDocument::new(self.doc_id, data))
    }
}

fn record_key(path: &DocPath) -> String {
    format!("{}:{}", path.collection, path.id)
}

fn to_data_document(value: Value) -> Result<Document> {
    match value {
        Value::Object(_) => Ok(bson::to_document(&value)?),
        _ => Err(BeaconError::BadRequest("Document must be a JSON object".into())),
    }
}

/// Turn a top-level patch into `$set` entries on `data.<field>`
fn data_set_fields(patch: Value) -> Result<Document> {
    let Value::Object(fields) = patch else {
        return Err(BeaconError::BadRequest("Partial document must be a JSON object".into()));
    };
    let mut set = Document::new();
    for (key, value) in fields {
        set.insert(format!("data.{}", key), bson::to_bson(&value)?);
    }
    Ok(set)
}

/// MongoDB store
pub struct MongoStore {
    collection: Collection<StoredRecord>,
    seq: AtomicU64,
    commit_lock: Mutex<()>,
    clock: MonotonicClock,
    changes: broadcast::Sender<ChangeEvent>,
}

impl MongoStore {
    /// Connect, verify with a ping, ensure indexes and recover the sequence
    pub async fn connect(uri: &str, db_name: &str) -> Result<Self> {
        info!("Connecting to MongoDB at {}", uri);

        // Avoid hanging on an unreachable server
        let timeout_uri = if uri.contains('?') {
            format!("{}&serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        } else {
            format!("{}?serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        };

        let client = Client::with_uri_str(&timeout_uri).await.map_err(|e| {
            BeaconError::StoreUnavailable(format!("Failed to connect to MongoDB: {}", e))
        })?;

        client
            .database(db_name)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| BeaconError::StoreUnavailable(format!("MongoDB ping failed: {}", e)))?;

        let collection = client
            .database(db_name)
            .collection::<StoredRecord>(DOCUMENTS_COLLECTION);

        Self::ensure_indexes(&collection).await;

        let last_seq = collection
            .find_one(doc! {})
            .with_options(FindOneOptions::builder().sort(doc! { "seq": -1 }).build())
            .await?
            .map(|r| r.seq.max(0) as u64)
            .unwrap_or(0);

        info!(
            "Connected to MongoDB database '{}' (resuming at seq {})",
            db_name, last_seq
        );

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            collection,
            seq: AtomicU64::new(last_seq),
            commit_lock: Mutex::new(()),
            clock: MonotonicClock::new(),
            changes,
        })
    }

    async fn ensure_indexes(collection: &Collection<StoredRecord>) {
        let indexes = vec![
            doc! { "collection": 1, "doc_id": 1 },
            doc! { "seq": -1 },
        ];

        for keys in indexes {
            let index = IndexModel::builder().keys(keys).build();
            if let Err(e) = collection.create_index(index).await {
                warn!("Failed to create index: {}", e);
            }
        }
    }

    fn current_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Announce a commit. Caller holds the commit lock.
    fn announce(&self, path: &DocPath, seq: u64, kind: ChangeKind) -> Commit {
        let _ = self.changes.send(ChangeEvent {
            path: path.clone(),
            seq,
            kind,
        });
        debug!(path = %path, seq, ?kind, "MongoDB commit");
        Commit {
            seq,
            committed_at_ms: self.clock.now_ms(),
        }
    }

    async fn exists(&self, path: &DocPath) -> Result<bool> {
        Ok(self
            .collection
            .find_one(doc! { "_id": record_key(path) })
            .await?
            .is_some())
    }

    fn update_for(&self, path: &DocPath, patch: Value, seq: u64) -> Result<Document> {
        let mut set = data_set_fields(patch)?;
        set.insert("seq", seq as i64);
        set.insert("updated_at", DateTime::now());
        Ok(doc! {
            "$set": set,
            "$setOnInsert": {
                "collection": &path.collection,
                "doc_id": &path.id,
            },
        })
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    fn backend(&self) -> &'static str {
        "mongo"
    }

    async fn read(&self, path: &DocPath) -> Result<ReadResult> {
        let seq = self.current_seq();
        let record = self
            .collection
            .find_one(doc! { "_id": record_key(path) })
            .await?;

        Ok(ReadResult {
            seq,
            document: record.map(StoredRecord::into_document).transpose()?,
        })
    }

    async fn query(&self, collection: &str, query: &Query) -> Result<QueryResult> {
        query.validate()?;
        let seq = self.current_seq();

        let mut filter = doc! { "collection": collection };
        if let (Some(field), Some(expected)) = (&query.order_by, &query.equal_to) {
            filter.insert(format!("data.{}", field), json_to_bson(expected)?);
        }

        let records: Vec<StoredRecord> = self.collection.find(filter).await?.try_collect().await?;
        let documents = records
            .into_iter()
            .map(StoredRecord::into_document)
            .collect::<Result<Vec<_>>>()?;

        // Ordering and limit follow the shared value order, not BSON's
        Ok(QueryResult {
            seq,
            documents: query.apply(documents),
        })
    }

    async fn write(&self, path: &DocPath, mut patch: Value) -> Result<Commit> {
        let _guard = self.commit_lock.lock().await;
        let seq = self.current_seq() + 1;
        resolve_server_values(&mut patch, self.clock.now_ms(), seq);
        let update = self.update_for(path, patch, seq)?;

        self.collection
            .update_one(doc! { "_id": record_key(path) }, update)
            .with_options(UpdateOptions::builder().upsert(true).build())
            .await?;

        self.seq.store(seq, Ordering::SeqCst);
        Ok(self.announce(path, seq, ChangeKind::Upsert))
    }

    async fn push(&self, collection: &str, mut value: Value) -> Result<(String, Commit)> {
        let id = Uuid::new_v4().simple().to_string();
        let path = DocPath::new(collection, id.clone());

        let _guard = self.commit_lock.lock().await;
        let seq = self.current_seq() + 1;
        resolve_server_values(&mut value, self.clock.now_ms(), seq);
        let data = to_data_document(value)?;
        let record = StoredRecord {
            key: record_key(&path),
            collection: collection.to_string(),
            doc_id: id.clone(),
            seq: seq as i64,
            data,
            updated_at: DateTime::now(),
        };
        self.collection.insert_one(record).await?;

        self.seq.store(seq, Ordering::SeqCst);
        Ok((id, self.announce(&path, seq, ChangeKind::Upsert)))
    }

    async fn compare_and_set(
        &self,
        path: &DocPath,
        field: &str,
        expected: &Value,
        mut patch: Value,
    ) -> Result<Commit> {
        let _guard = self.commit_lock.lock().await;
        let seq = self.current_seq() + 1;
        resolve_server_values(&mut patch, self.clock.now_ms(), seq);
        let update = self.update_for(path, patch, seq)?;

        let filter = doc! {
            "_id": record_key(path),
            format!("data.{}", field): json_to_bson(expected)?,
        };
        let result = self.collection.update_one(filter, update).await?;

        if result.matched_count == 0 {
            if !self.exists(path).await? {
                return Err(BeaconError::NotFound(path.to_string()));
            }
            let current = self
                .read(path)
                .await?
                .document
                .map(|d| field_value(&d.data, field).clone())
                .unwrap_or(Value::Null);
            return Err(BeaconError::StaleWriteRejected(format!(
                "{}: expected {} = {}, found {}",
                path, field, expected, current
            )));
        }

        self.seq.store(seq, Ordering::SeqCst);
        Ok(self.announce(path, seq, ChangeKind::Upsert))
    }

    async fn delete(&self, path: &DocPath) -> Result<Commit> {
        let _guard = self.commit_lock.lock().await;
        let result = self
            .collection
            .delete_one(doc! { "_id": record_key(path) })
            .await?;

        if result.deleted_count == 0 {
            return Err(BeaconError::NotFound(path.to_string()));
        }

        let seq = self.current_seq() + 1;
        self.seq.store(seq, Ordering::SeqCst);
        Ok(self.announce(path, seq, ChangeKind::Delete))
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }
}

/// Convert a JSON value into BSON for `data.<field>` filters
fn json_to_bson(value: &Value) -> Result<Bson> {
    Ok(bson::to_bson(value)?)
}

#[cfg(test)]
mod tests {
    // Round trips against a live server need a running MongoDB instance;
    // the pure conversions are covered here.
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_key() {
        assert_eq!(record_key(&DocPath::new("incidents", "abc")), "incidents:abc");
    }

    #[test]
    fn test_data_set_fields_prefixes_data() {
        let set = data_set_fields(json!({"status": "Verified", "assignedTo": "Team-A"})).unwrap();
        assert_eq!(set.get_str("data.status").unwrap(), "Verified");
        assert_eq!(set.get_str("data.assignedTo").unwrap(), "Team-A");
        assert!(data_set_fields(json!("nope")).is_err());
    }

    #[test]
    fn test_record_round_trips_to_json() {
        let record = StoredRecord {
            key: "users:u1".into(),
            collection: "users".into(),
            doc_id: "u1".into(),
            seq: 3,
            data: to_data_document(json!({"location": {"latitude": 1.5, "longitude": -2.0}}))
                .unwrap(),
            updated_at: DateTime::now(),
        };
        let doc = record.into_document().unwrap();
        assert_eq!(doc.id, "u1");
        assert_eq!(doc.data["location"]["latitude"], 1.5);
    }

    #[test]
    fn test_json_to_bson() {
        assert_eq!(json_to_bson(&json!("Reported")).unwrap(), Bson::String("Reported".into()));
    }
}
