//! Advisory bridge
//!
//! Wraps an [`AdvisoryBackend`] with a per-call timeout and turns every
//! failure into a neutral answer, so callers never see advisory errors.
//! Enrichment of a freshly created incident runs in its own task and
//! writes nothing but the `advisory` field.

use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backend::*;
use crate::incident::{Advisory, Category, Incident};
use crate::store::{server_sequence, DocPath, DocumentStore, Query, CATEGORIES, INCIDENTS};
use crate::types::BeaconError;

/// Default best-effort timeout per advisory call
pub const DEFAULT_ADVISORY_TIMEOUT: Duration = Duration::from_millis(8000);

/// How many recent incidents are offered for duplicate detection
pub const DUPLICATE_WINDOW: usize = 20;

pub struct AdvisoryBridge {
    backend: Arc<dyn AdvisoryBackend>,
    store: Arc<dyn DocumentStore>,
    timeout: Duration,
}

impl AdvisoryBridge {
    pub fn new(
        backend: Arc<dyn AdvisoryBackend>,
        store: Arc<dyn DocumentStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            store,
            timeout,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_enabled()
    }

    pub fn backend_id(&self) -> &str {
        self.backend.id()
    }

    /// Run one backend call under the timeout; failures become `T::default()`
    async fn guarded<T, F>(&self, call: &'static str, fut: F) -> T
    where
        T: Default,
        F: Future<Output = crate::types::Result<T>>,
    {
        let error = match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => return value,
            Ok(Err(BeaconError::AdvisoryUnavailable(reason))) => {
                BeaconError::AdvisoryUnavailable(reason)
            }
            Ok(Err(other)) => BeaconError::AdvisoryUnavailable(other.to_string()),
            Err(_) => BeaconError::AdvisoryUnavailable(format!(
                "timed out after {}ms",
                self.timeout.as_millis()
            )),
        };
        warn!(call, backend = self.backend.id(), error = %error, "Advisory call failed");
        T::default()
    }

    pub async fn suggest_categories(&self, description: &str, report: &Value) -> CategorySuggestion {
        let known_categories = self.known_categories().await;
        let request = CategoryRequest {
            description: description.to_string(),
            report: report.clone(),
            known_categories,
        };
        self.guarded("suggest_categories", self.backend.suggest_categories(&request))
            .await
    }

    pub async fn summarize(&self, details: &str) -> Summary {
        self.guarded("summarize", self.backend.summarize(details)).await
    }

    /// Ask for a duplicate among `recent`. A candidate id that is not one of
    /// the offered reports is discarded.
    pub async fn detect_duplicates(
        &self,
        report: &Value,
        recent: Vec<DuplicateCandidate>,
    ) -> DuplicateCheck {
        if recent.is_empty() {
            return DuplicateCheck::default();
        }
        let request = DuplicateRequest {
            report: report.clone(),
            recent,
        };
        let mut check = self
            .guarded("detect_duplicates", self.backend.detect_duplicates(&request))
            .await;
        if let Some(id) = &check.candidate_id {
            if !request.recent.iter().any(|c| &c.id == id) {
                debug!(candidate = %id, "Discarding unknown duplicate candidate");
                check.candidate_id = None;
            }
        }
        check
    }

    async fn known_categories(&self) -> Vec<String> {
        match self.store.query(CATEGORIES, &Query::new()).await {
            Ok(result) => result
                .documents
                .iter()
                .filter_map(|doc| doc.decode::<Category>().ok())
                .map(|c| c.name)
                .collect(),
            Err(e) => {
                warn!(error = %e, "Could not load categories for advisory");
                Vec::new()
            }
        }
    }

    async fn recent_incidents(&self, exclude: &str) -> Vec<DuplicateCandidate> {
        let query = Query::order_by("dateReported")
            .descending()
            .with_limit(DUPLICATE_WINDOW + 1);
        match self.store.query(INCIDENTS, &query).await {
            Ok(result) => result
                .documents
                .iter()
                .filter(|doc| doc.id != exclude)
                .filter_map(|doc| doc.decode::<Incident>().ok())
                .take(DUPLICATE_WINDOW)
                .map(|i| DuplicateCandidate {
                    location: json!(i.location),
                    id: i.id,
                    title: i.title,
                    description: i.description,
                    category: i.category,
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "Could not load recent incidents for advisory");
                Vec::new()
            }
        }
    }

    /// Gather all three advisory answers for an incident
    pub async fn advise(&self, incident: &Incident) -> Advisory {
        let report = json!({
            "title": incident.title,
            "description": incident.description,
            "category": incident.category,
            "type": incident.incident_type,
            "priority": incident.priority,
            "location": incident.location,
        });
        let details = format!("{}\n\n{}", incident.title, incident.description);
        let recent = self.recent_incidents(&incident.id).await;

        let (suggestion, summary, duplicate) = tokio::join!(
            self.suggest_categories(&incident.description, &report),
            self.summarize(&details),
            self.detect_duplicates(&report, recent),
        );

        Advisory {
            summary: Some(summary.summary).filter(|s| !s.trim().is_empty()),
            suggested_categories: suggestion.categories,
            reasoning: Some(suggestion.reasoning).filter(|r| !r.trim().is_empty()),
            duplicate_candidate_id: duplicate.candidate_id,
        }
    }

    /// Compute advisory metadata and attach it to the stored incident.
    ///
    /// The write is conditioned on the immutable `dateReported`, so an
    /// incident deleted in the meantime is not resurrected.
    pub async fn enrich(&self, incident: &Incident) {
        let advisory = self.advise(incident).await;
        if advisory.is_empty() {
            debug!(incident_id = %incident.id, "No advisory metadata to attach");
            return;
        }

        let path = DocPath::new(INCIDENTS, &incident.id);
        let result = self
            .store
            .compare_and_set(
                &path,
                "dateReported",
                &json!(incident.date_reported),
                json!({ "advisory": advisory, "rev": server_sequence() }),
            )
            .await;

        match result {
            Ok(commit) => info!(
                incident_id = %incident.id,
                seq = commit.seq,
                duplicate = advisory.duplicate_candidate_id.is_some(),
                "Advisory metadata attached"
            ),
            Err(e) => warn!(incident_id = %incident.id, error = %e, "Advisory metadata not attached"),
        }
    }

    /// Run [`enrich`](Self::enrich) in the background
    pub fn spawn_enrichment(self: &Arc<Self>, incident: Incident) -> JoinHandle<()> {
        let bridge = Arc::clone(self);
        tokio::spawn(async move { bridge.enrich(&incident).await })
    }
}
