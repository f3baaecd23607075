//! Incident operations against the store
//!
//! Every mutation checks the caller's role first. Status changes are
//! committed with a compare-and-set on `status`, so of two racing
//! transitions from the same state exactly one lands; the other gets
//! `StaleWriteRejected`.

use serde_json::{json, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::machine::{self, validate_transition};
use super::model::{Incident, IncidentUpdate, NewIncident, TransitionRequest};
use crate::advisory::AdvisoryBridge;
use crate::auth::{effective_role, tokens, PermissionCatalog, Principal};
use crate::store::{server_sequence, server_timestamp, DocPath, DocumentStore, Query, INCIDENTS};
use crate::types::{BeaconError, Result};

#[derive(Clone)]
pub struct IncidentService {
    store: Arc<dyn DocumentStore>,
    catalog: Arc<PermissionCatalog>,
    advisory: Option<Arc<AdvisoryBridge>>,
}

impl IncidentService {
    pub fn new(store: Arc<dyn DocumentStore>, catalog: Arc<PermissionCatalog>) -> Self {
        Self {
            store,
            catalog,
            advisory: None,
        }
    }

    /// Enrich new incidents through `bridge` (skipped if it is disabled)
    pub fn with_advisory(mut self, bridge: Arc<AdvisoryBridge>) -> Self {
        self.advisory = Some(bridge).filter(|b| b.is_enabled());
        self
    }

    pub fn catalog(&self) -> &PermissionCatalog {
        &self.catalog
    }

    fn path(id: &str) -> DocPath {
        DocPath::new(INCIDENTS, id)
    }

    async fn load(&self, id: &str) -> Result<Incident> {
        self.store
            .read(&Self::path(id))
            .await?
            .document
            .ok_or_else(|| BeaconError::NotFound(format!("incident '{}'", id)))?
            .decode()
    }

    /// Submit a new report. Returns once the incident is committed.
    pub async fn create(&self, principal: Option<&Principal>, report: NewIncident) -> Result<Incident> {
        let (incident, _enrichment) = self.create_tracked(principal, report).await?;
        Ok(incident)
    }

    /// Like [`create`](Self::create), also returning the handle of the
    /// background advisory enrichment, if one was started.
    pub async fn create_tracked(
        &self,
        principal: Option<&Principal>,
        report: NewIncident,
    ) -> Result<(Incident, Option<JoinHandle<()>>)> {
        let role = effective_role(principal);
        self.catalog.require(role, machine::CREATE_PERMISSION)?;
        report.validate()?;

        let reporter_id = match (report.anonymous, principal) {
            (false, Some(p)) => Some(p.id.clone()),
            _ => None,
        };

        let record = json!({
            "title": report.title.trim(),
            "description": report.description.trim(),
            "category": report.category,
            "type": report.incident_type,
            "status": machine::INITIAL_STATUS,
            "priority": report.priority,
            "location": report.location,
            "dateReported": server_timestamp(),
            "updatedAt": server_timestamp(),
            "rev": server_sequence(),
            "reporterId": reporter_id,
            "media": report.media,
            "advisory": Value::Null,
            "assignedTo": Value::Null,
        });

        let (id, commit) = self.store.push(INCIDENTS, record).await?;
        let incident = self.load(&id).await?;

        info!(
            incident_id = %id,
            role,
            anonymous = incident.reporter_id.is_none(),
            seq = commit.seq,
            "Incident reported"
        );

        let enrichment = self
            .advisory
            .as_ref()
            .map(|bridge| bridge.spawn_enrichment(incident.clone()));

        Ok((incident, enrichment))
    }

    pub async fn get(&self, principal: Option<&Principal>, id: &str) -> Result<Incident> {
        self.catalog
            .require(effective_role(principal), tokens::INCIDENTS_VIEW)?;
        self.load(id).await
    }

    pub async fn list(&self, principal: Option<&Principal>, query: &Query) -> Result<Vec<Incident>> {
        self.catalog
            .require(effective_role(principal), tokens::INCIDENTS_VIEW)?;
        self.store
            .query(INCIDENTS, query)
            .await?
            .documents
            .iter()
            .map(|doc| doc.decode())
            .collect()
    }

    /// Validate and commit one status change
    pub async fn transition(
        &self,
        principal: Option<&Principal>,
        id: &str,
        request: &TransitionRequest,
    ) -> Result<Incident> {
        let role = effective_role(principal);
        let current = self.load(id).await?;
        let plan = validate_transition(&self.catalog, role, current.status, request)?;

        let (field, expected) = plan.precondition();
        let commit = self
            .store
            .compare_and_set(&Self::path(id), field, &expected, plan.patch())
            .await?;

        info!(
            incident_id = %id,
            from = %plan.from,
            to = %plan.to,
            role,
            assigned_to = plan.assigned_to.as_deref(),
            seq = commit.seq,
            "Incident transitioned"
        );

        self.load(id).await
    }

    /// Transition, re-fetching and retrying once if the status moved
    /// underneath us. The retry re-validates against the fresh status.
    pub async fn transition_retrying_once(
        &self,
        principal: Option<&Principal>,
        id: &str,
        request: &TransitionRequest,
    ) -> Result<Incident> {
        match self.transition(principal, id, request).await {
            Err(BeaconError::StaleWriteRejected(reason)) => {
                warn!(incident_id = %id, %reason, "Stale transition, retrying once");
                self.transition(principal, id, request).await
            }
            other => other,
        }
    }

    /// Edit title, description, priority, category, location or media.
    ///
    /// Conditioned on `rev`, which every incident write restamps with its
    /// commit sequence, so a concurrent edit, transition or advisory write
    /// since the read is never overwritten.
    pub async fn update_details(
        &self,
        principal: Option<&Principal>,
        id: &str,
        update: IncidentUpdate,
    ) -> Result<Incident> {
        let role = effective_role(principal);
        self.catalog.require(role, tokens::INCIDENTS_UPDATE)?;
        update.validate()?;

        let path = Self::path(id);
        let current = self
            .store
            .read(&path)
            .await?
            .document
            .ok_or_else(|| BeaconError::NotFound(format!("incident '{}'", id)))?;
        let existing: Incident = current.decode()?;
        let expected = current.data.get("rev").cloned().unwrap_or(Value::Null);

        let mut patch = json!({ "updatedAt": server_timestamp(), "rev": server_sequence() });
        if let Some(title) = &update.title {
            patch["title"] = json!(title.trim());
        }
        if let Some(description) = &update.description {
            patch["description"] = json!(description.trim());
        }
        if let Some(category) = &update.category {
            patch["category"] = json!(category);
        }
        if let Some(incident_type) = &update.incident_type {
            patch["type"] = json!(incident_type);
        }
        if let Some(priority) = update.priority {
            patch["priority"] = json!(priority);
        }
        if let Some(location) = &update.location {
            patch["location"] = json!(location);
        }
        if !update.add_media.is_empty() {
            let mut media = existing.media;
            media.extend(update.add_media.iter().cloned());
            patch["media"] = json!(media);
        }

        let commit = self
            .store
            .compare_and_set(&path, "rev", &expected, patch)
            .await?;
        info!(incident_id = %id, role, seq = commit.seq, "Incident details updated");

        self.load(id).await
    }

    pub async fn delete(&self, principal: Option<&Principal>, id: &str) -> Result<()> {
        let role = effective_role(principal);
        self.catalog.require(role, tokens::INCIDENTS_DELETE)?;
        let commit = self.store.delete(&Self::path(id)).await?;
        info!(incident_id = %id, role, seq = commit.seq, "Incident deleted");
        Ok(())
    }
}
