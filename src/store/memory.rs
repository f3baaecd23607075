//! In-process document store
//!
//! All state sits behind one lock so a commit, its sequence number and its
//! change notification happen together; subscribers therefore see events in
//! commit order. Used for development, tests and single-node deployments.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    merge_patch, resolve_server_values, ChangeEvent, ChangeKind, Commit, DocPath, DocumentStore,
    MonotonicClock, Query, QueryResult, ReadResult, StoredDocument, CHANGE_CHANNEL_CAPACITY,
};
use crate::types::{BeaconError, Result};

#[derive(Default)]
struct Inner {
    collections: HashMap<String, BTreeMap<String, Value>>,
    seq: u64,
}

impl Inner {
    fn get(&self, path: &DocPath) -> Option<&Value> {
        self.collections
            .get(&path.collection)
            .and_then(|docs| docs.get(&path.id))
    }
}

/// Memory-backed store with a commit-ordered change stream
pub struct MemoryStore {
    inner: RwLock<Inner>,
    clock: MonotonicClock,
    changes: broadcast::Sender<ChangeEvent>,
    online: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(Inner::default()),
            clock: MonotonicClock::new(),
            changes,
            online: AtomicBool::new(true),
        }
    }

    /// Simulate losing or regaining connectivity to the store
    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was != online {
            warn!(online, "Memory store connectivity changed");
        }
    }

    fn ensure_online(&self) -> Result<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BeaconError::StoreUnavailable("memory store is offline".into()))
        }
    }

    /// Current commit sequence
    pub async fn seq(&self) -> u64 {
        self.inner.read().await.seq
    }

    /// Number of documents in a collection
    pub async fn count(&self, collection: &str) -> usize {
        self.inner
            .read()
            .await
            .collections
            .get(collection)
            .map(|docs| docs.len())
            .unwrap_or(0)
    }

    /// Commit a new value for `path` and announce it. Caller holds the lock.
    fn commit(&self, inner: &mut Inner, path: &DocPath, value: Option<Value>) -> Commit {
        inner.seq += 1;
        let seq = inner.seq;
        let kind = match value {
            Some(value) => {
                inner
                    .collections
                    .entry(path.collection.clone())
                    .or_default()
                    .insert(path.id.clone(), value);
                ChangeKind::Upsert
            }
            None => {
                if let Some(docs) = inner.collections.get_mut(&path.collection) {
                    docs.remove(&path.id);
                }
                ChangeKind::Delete
            }
        };

        // No receivers is fine
        let _ = self.changes.send(ChangeEvent {
            path: path.clone(),
            seq,
            kind,
        });

        debug!(path = %path, seq, ?kind, "Memory store commit");
        Commit {
            seq,
            committed_at_ms: self.clock.now_ms(),
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn read(&self, path: &DocPath) -> Result<ReadResult> {
        self.ensure_online()?;
        let inner = self.inner.read().await;
        Ok(ReadResult {
            seq: inner.seq,
            document: inner
                .get(path)
                .map(|data| StoredDocument::new(path.id.clone(), data.clone())),
        })
    }

    async fn query(&self, collection: &str, query: &Query) -> Result<QueryResult> {
        self.ensure_online()?;
        query.validate()?;
        let inner = self.inner.read().await;
        let documents: Vec<StoredDocument> = inner
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, data)| StoredDocument::new(id.clone(), data.clone()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(QueryResult {
            seq: inner.seq,
            documents: query.apply(documents),
        })
    }

    async fn write(&self, path: &DocPath, mut patch: Value) -> Result<Commit> {
        self.ensure_online()?;

        let mut inner = self.inner.write().await;
        resolve_server_values(&mut patch, self.clock.now_ms(), inner.seq + 1);
        let mut value = inner.get(path).cloned().unwrap_or(Value::Null);
        merge_patch(&mut value, patch)?;
        Ok(self.commit(&mut inner, path, Some(value)))
    }

    async fn push(&self, collection: &str, mut value: Value) -> Result<(String, Commit)> {
        self.ensure_online()?;
        if !value.is_object() {
            return Err(BeaconError::BadRequest("Document must be a JSON object".into()));
        }
        let id = Uuid::new_v4().simple().to_string();
        let path = DocPath::new(collection, id.clone());
        let mut inner = self.inner.write().await;
        resolve_server_values(&mut value, self.clock.now_ms(), inner.seq + 1);
        let commit = self.commit(&mut inner, &path, Some(value));
        Ok((id, commit))
    }

    async fn compare_and_set(
        &self,
        path: &DocPath,
        field: &str,
        expected: &Value,
        mut patch: Value,
    ) -> Result<Commit> {
        self.ensure_online()?;

        let mut inner = self.inner.write().await;
        let mut value = inner
            .get(path)
            .cloned()
            .ok_or_else(|| BeaconError::NotFound(path.to_string()))?;

        let current = super::field_value(&value, field);
        if current != expected {
            return Err(BeaconError::StaleWriteRejected(format!(
                "{}: expected {} = {}, found {}",
                path, field, expected, current
            )));
        }

        resolve_server_values(&mut patch, self.clock.now_ms(), inner.seq + 1);
        merge_patch(&mut value, patch)?;
        Ok(self.commit(&mut inner, path, Some(value)))
    }

    async fn delete(&self, path: &DocPath) -> Result<Commit> {
        self.ensure_online()?;
        let mut inner = self.inner.write().await;
        if inner.get(path).is_none() {
            return Err(BeaconError::NotFound(path.to_string()));
        }
        Ok(self.commit(&mut inner, path, None))
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{server_sequence, server_timestamp};
    use std::sync::Arc;
    use serde_json::json;

    #[tokio::test]
    async fn test_push_then_read() {
        let store = MemoryStore::new();
        let (id, commit) = store
            .push("incidents", json!({"title": "Flooded road"}))
            .await
            .unwrap();
        assert_eq!(commit.seq, 1);

        let read = store.read(&DocPath::new("incidents", &id)).await.unwrap();
        assert_eq!(read.seq, 1);
        assert_eq!(read.document.unwrap().data["title"], "Flooded road");
    }

    #[tokio::test]
    async fn test_write_merges_and_stamps() {
        let store = MemoryStore::new();
        let path = DocPath::new("users", "u1");
        store.write(&path, json!({"name": "Ana"})).await.unwrap();
        store
            .write(&path, json!({"location": {"latitude": 1.0}, "updatedAt": server_timestamp()}))
            .await
            .unwrap();

        let doc = store.read(&path).await.unwrap().document.unwrap();
        assert_eq!(doc.data["name"], "Ana");
        assert_eq!(doc.data["location"]["latitude"], 1.0);
        assert!(doc.data["updatedAt"].as_i64().unwrap() > 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_server_values_follow_commit_order() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for n in 0..64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let path = DocPath::new("incidents", format!("i{}", n));
                let patch = json!({"rev": server_sequence(), "updatedAt": server_timestamp()});
                store.write(&path, patch).await.unwrap()
            }));
        }
        for handle in handles {
            let commit = handle.await.unwrap();
            assert!(commit.seq > 0);
        }

        let mut docs = store
            .query("incidents", &Query::new())
            .await
            .unwrap()
            .documents;
        docs.sort_by_key(|d| d.data["rev"].as_u64().unwrap());

        let revs: Vec<u64> = docs.iter().map(|d| d.data["rev"].as_u64().unwrap()).collect();
        assert_eq!(revs, (1..=64).collect::<Vec<u64>>());
        let stamps: Vec<i64> = docs
            .iter()
            .map(|d| d.data["updatedAt"].as_i64().unwrap())
            .collect();
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_compare_and_set_precondition() {
        let store = MemoryStore::new();
        let path = DocPath::new("incidents", "i1");
        store.write(&path, json!({"status": "Verified"})).await.unwrap();

        store
            .compare_and_set(&path, "status", &json!("Verified"), json!({"status": "Rejected"}))
            .await
            .unwrap();

        let err = store
            .compare_and_set(&path, "status", &json!("Verified"), json!({"status": "TeamDispatched"}))
            .await
            .unwrap_err();
        assert!(matches!(err, BeaconError::StaleWriteRejected(_)));

        let doc = store.read(&path).await.unwrap().document.unwrap();
        assert_eq!(doc.data["status"], "Rejected");
    }

    #[tokio::test]
    async fn test_compare_and_set_missing_document() {
        let store = MemoryStore::new();
        let err = store
            .compare_and_set(&DocPath::new("incidents", "none"), "status", &json!("Reported"), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BeaconError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_change_stream_in_commit_order() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe();

        let path = DocPath::new("incidents", "i1");
        store.write(&path, json!({"n": 1})).await.unwrap();
        store.write(&path, json!({"n": 2})).await.unwrap();
        store.delete(&path).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let third = rx.recv().await.unwrap();
        assert_eq!((first.seq, second.seq, third.seq), (1, 2, 3));
        assert_eq!(third.kind, ChangeKind::Delete);
    }

    #[tokio::test]
    async fn test_offline_store_rejects_operations() {
        let store = MemoryStore::new();
        store.set_online(false);
        let err = store.read(&DocPath::new("incidents", "x")).await.unwrap_err();
        assert!(matches!(err, BeaconError::StoreUnavailable(_)));

        store.set_online(true);
        assert!(store.read(&DocPath::new("incidents", "x")).await.is_ok());
    }

    #[tokio::test]
    async fn test_query_collection() {
        let store = MemoryStore::new();
        for status in ["Reported", "Verified", "Reported"] {
            store.push("incidents", json!({"status": status})).await.unwrap();
        }
        let result = store
            .query("incidents", &Query::order_by("status").equal_to("Reported"))
            .await
            .unwrap();
        assert_eq!(result.documents.len(), 2);
        assert_eq!(result.seq, 3);
        assert_eq!(store.count("incidents").await, 3);
    }
}
