//! Realtime sync layer
//!
//! Turns the store's change stream into live views. Each [`LiveView`] is
//! backed by its own task which re-queries its target whenever a commit
//! touches it and publishes the full snapshot on a watch channel.
//!
//! ```text
//!   DocumentStore ──ChangeEvent──▶ view task ──ViewState──▶ LiveView holder
//!        ▲                             │
//!        └────── read / query ◀────────┘
//! ```
//!
//! Guarantees per view:
//! - snapshots are published in non-decreasing commit sequence
//! - a `None` target never queries and reports no data with loading=false
//! - on store failure the last data is kept and loading is reasserted
//! - dropping (or closing) the view detaches its watch

mod view;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::store::{ChangeEvent, DocPath, DocumentStore, Query, StoredDocument};
use crate::types::Result;

pub use view::LiveView;

/// Default delay before re-querying after a store failure
pub const DEFAULT_SYNC_RETRY: Duration = Duration::from_millis(2000);

/// Cached snapshots kept once no view is attached to them
const SNAPSHOT_CACHE_CAPACITY: usize = 512;

/// What a live view follows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ViewTarget {
    Document {
        #[serde(flatten)]
        path: DocPath,
    },
    Collection {
        collection: String,
        #[serde(flatten)]
        query: Query,
    },
}

impl ViewTarget {
    pub fn document(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self::Document {
            path: DocPath::new(collection, id),
        }
    }

    pub fn collection(collection: impl Into<String>, query: Query) -> Self {
        Self::Collection {
            collection: collection.into(),
            query,
        }
    }

    /// Collection filtered on `field == value`, or no target while the
    /// value is not known yet.
    pub fn filtered(
        collection: impl Into<String>,
        field: impl Into<String>,
        value: Option<Value>,
    ) -> Option<Self> {
        match value {
            None | Some(Value::Null) => None,
            Some(value) => Some(Self::collection(
                collection,
                Query::order_by(field).equal_to(value),
            )),
        }
    }

    pub fn collection_name(&self) -> &str {
        match self {
            Self::Document { path } => &path.collection,
            Self::Collection { collection, .. } => collection,
        }
    }

    /// Whether a commit can change this view's snapshot
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        match self {
            Self::Document { path } => &event.path == path,
            Self::Collection { collection, .. } => &event.path.collection == collection,
        }
    }

    /// Key under which equivalent targets share a cached snapshot
    pub fn cache_key(&self) -> String {
        match self {
            Self::Document { path } => format!("doc:{}", path),
            Self::Collection { collection, query } => format!(
                "col:{}?{}",
                collection,
                serde_json::to_string(query).unwrap_or_default()
            ),
        }
    }
}

impl fmt::Display for ViewTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cache_key())
    }
}

/// Materialized data of one snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SnapshotData {
    /// `None` when the document does not exist
    Document(Option<StoredDocument>),
    Collection(Vec<StoredDocument>),
}

/// A complete point-in-time view of a target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub seq: u64,
    pub data: SnapshotData,
}

/// What a live view currently shows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewState {
    pub data: Option<SnapshotData>,
    pub loading: bool,
    /// Commit sequence of `data` (0 before the first snapshot)
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ViewState {
    /// No target: nothing to load
    pub fn idle(seq: u64) -> Self {
        Self {
            data: None,
            loading: false,
            seq,
            error: None,
        }
    }

    pub fn loading(data: Option<SnapshotData>, seq: u64) -> Self {
        Self {
            data,
            loading: true,
            seq,
            error: None,
        }
    }

    pub fn ready(snapshot: Snapshot) -> Self {
        Self {
            data: Some(snapshot.data),
            loading: false,
            seq: snapshot.seq,
            error: None,
        }
    }

    /// Store failed: keep what we had, reassert loading
    pub fn degraded(data: Option<SnapshotData>, seq: u64, error: String) -> Self {
        Self {
            data,
            loading: true,
            seq,
            error: Some(error),
        }
    }

    /// Decode a document view. `None` if no data yet or the document is absent.
    pub fn document<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match &self.data {
            Some(SnapshotData::Document(Some(doc))) => doc.decode().map(Some),
            Some(SnapshotData::Collection(docs)) => docs.first().map(|d| d.decode()).transpose(),
            _ => Ok(None),
        }
    }

    /// Decode a collection view, in snapshot order
    pub fn collection<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        match &self.data {
            Some(SnapshotData::Collection(docs)) => docs.iter().map(|d| d.decode()).collect(),
            Some(SnapshotData::Document(Some(doc))) => Ok(vec![doc.decode()?]),
            _ => Ok(Vec::new()),
        }
    }
}

struct HubInner {
    store: Arc<dyn DocumentStore>,
    cache: DashMap<String, Snapshot>,
    /// Attached watches per cache key
    active: DashMap<String, usize>,
    retry: Duration,
}

impl HubInner {
    async fn snapshot(&self, target: &ViewTarget) -> Result<Snapshot> {
        match target {
            ViewTarget::Document { path } => {
                let read = self.store.read(path).await?;
                Ok(Snapshot {
                    seq: read.seq,
                    data: SnapshotData::Document(read.document),
                })
            }
            ViewTarget::Collection { collection, query } => {
                let result = self.store.query(collection, query).await?;
                Ok(Snapshot {
                    seq: result.seq,
                    data: SnapshotData::Collection(result.documents),
                })
            }
        }
    }

    fn remember(&self, key: &str, snapshot: &Snapshot) {
        if self.cache.len() >= SNAPSHOT_CACHE_CAPACITY && !self.cache.contains_key(key) {
            self.cache.retain(|k, _| self.active.contains_key(k));
        }
        self.cache.insert(key.to_string(), snapshot.clone());
    }

    fn attach(&self, key: &str) {
        let mut count = self.active.entry(key.to_string()).or_insert(0);
        *count += 1;
        debug!(target_key = key, watchers = *count, "Watch attached");
    }

    fn detach(&self, key: &str) {
        let remaining = {
            match self.active.get_mut(key) {
                Some(mut count) => {
                    *count = count.saturating_sub(1);
                    *count
                }
                None => 0,
            }
        };
        if remaining == 0 {
            self.active.remove_if(key, |_, count| *count == 0);
        }
        debug!(target_key = key, watchers = remaining, "Watch released");
    }
}

/// Registry of live views over one store
#[derive(Clone)]
pub struct SyncHub {
    inner: Arc<HubInner>,
}

impl SyncHub {
    pub fn new(store: Arc<dyn DocumentStore>, retry: Duration) -> Self {
        Self {
            inner: Arc::new(HubInner {
                store,
                cache: DashMap::new(),
                active: DashMap::new(),
                retry,
            }),
        }
    }

    /// Open a live view. `None` waits for a target without querying.
    pub fn watch(&self, target: Option<ViewTarget>) -> LiveView {
        LiveView::spawn(Arc::clone(&self.inner), target)
    }

    pub fn watch_document(&self, collection: &str, id: &str) -> LiveView {
        self.watch(Some(ViewTarget::document(collection, id)))
    }

    pub fn watch_collection(&self, collection: &str, query: Query) -> LiveView {
        self.watch(Some(ViewTarget::collection(collection, query)))
    }

    /// Total attached watches across all targets
    pub fn active_watches(&self) -> usize {
        self.inner.active.iter().map(|entry| *entry.value()).sum()
    }

    /// Attached watches for targets equivalent to `target`
    pub fn watchers(&self, target: &ViewTarget) -> usize {
        self.inner
            .active
            .get(&target.cache_key())
            .map(|count| *count)
            .unwrap_or(0)
    }

    /// Last snapshot delivered for an equivalent target, if still cached
    pub fn cached(&self, target: &ViewTarget) -> Option<Snapshot> {
        self.inner
            .cache
            .get(&target.cache_key())
            .map(|snapshot| snapshot.clone())
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.inner.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChangeKind;
    use serde_json::json;

    #[test]
    fn test_target_matching() {
        let event = ChangeEvent {
            path: DocPath::new("incidents", "a"),
            seq: 1,
            kind: ChangeKind::Upsert,
        };
        assert!(ViewTarget::document("incidents", "a").matches(&event));
        assert!(!ViewTarget::document("incidents", "b").matches(&event));
        assert!(ViewTarget::collection("incidents", Query::new()).matches(&event));
        assert!(!ViewTarget::collection("users", Query::new()).matches(&event));
    }

    #[test]
    fn test_equivalent_targets_share_cache_key() {
        let a = ViewTarget::collection("incidents", Query::order_by("status").equal_to("Reported"));
        let b = ViewTarget::filtered("incidents", "status", Some(json!("Reported"))).unwrap();
        assert_eq!(a.cache_key(), b.cache_key());
        assert_ne!(a.cache_key(), ViewTarget::collection("incidents", Query::new()).cache_key());
    }

    #[test]
    fn test_filtered_without_value_is_no_target() {
        assert!(ViewTarget::filtered("categories", "parentId", None).is_none());
        assert!(ViewTarget::filtered("categories", "parentId", Some(Value::Null)).is_none());
    }

    #[test]
    fn test_target_wire_format() {
        let target: ViewTarget = serde_json::from_value(json!({
            "kind": "collection",
            "collection": "incidents",
            "orderBy": "status",
            "equalTo": "Verified"
        }))
        .unwrap();
        assert_eq!(
            target,
            ViewTarget::collection("incidents", Query::order_by("status").equal_to("Verified"))
        );

        let doc: ViewTarget =
            serde_json::from_value(json!({"kind": "document", "collection": "users", "id": "u1"}))
                .unwrap();
        assert_eq!(doc, ViewTarget::document("users", "u1"));
    }

    #[test]
    fn test_view_state_decoding() {
        #[derive(serde::Deserialize)]
        struct Named {
            id: String,
            name: String,
        }
        let state = ViewState::ready(Snapshot {
            seq: 4,
            data: SnapshotData::Collection(vec![
                StoredDocument::new("a", json!({"name": "Fire"})),
                StoredDocument::new("b", json!({"name": "Flood"})),
            ]),
        });
        let items: Vec<Named> = state.collection().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].id, "b");
        assert_eq!(items[1].name, "Flood");

        let idle = ViewState::idle(0);
        assert!(!idle.loading);
        assert!(idle.document::<Named>().unwrap().is_none());
    }
}
