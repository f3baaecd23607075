//! Category tree management
//!
//! Categories form at most two levels: a top-level entry has no parent, a
//! subtype's parent must itself be top-level. Deleting a category that
//! still has subtypes is refused.

use serde_json::json;
use std::sync::Arc;
use tracing::info;

use super::model::{Category, NewCategory};
use crate::auth::{effective_role, tokens, PermissionCatalog, Principal};
use crate::store::{DocPath, DocumentStore, Query, CATEGORIES};
use crate::types::{BeaconError, Result};

#[derive(Clone)]
pub struct CategoryService {
    store: Arc<dyn DocumentStore>,
    catalog: Arc<PermissionCatalog>,
}

impl CategoryService {
    pub fn new(store: Arc<dyn DocumentStore>, catalog: Arc<PermissionCatalog>) -> Self {
        Self { store, catalog }
    }

    pub async fn get(&self, id: &str) -> Result<Option<Category>> {
        self.store
            .read(&DocPath::new(CATEGORIES, id))
            .await?
            .document
            .map(|doc| doc.decode())
            .transpose()
    }

    /// All categories, ordered by name
    pub async fn list(&self) -> Result<Vec<Category>> {
        self.store
            .query(CATEGORIES, &Query::order_by("name"))
            .await?
            .documents
            .iter()
            .map(|doc| doc.decode())
            .collect()
    }

    pub async fn subtypes(&self, parent_id: &str) -> Result<Vec<Category>> {
        self.store
            .query(CATEGORIES, &Query::order_by("parentId").equal_to(parent_id))
            .await?
            .documents
            .iter()
            .map(|doc| doc.decode())
            .collect()
    }

    pub async fn create(&self, principal: Option<&Principal>, new: NewCategory) -> Result<Category> {
        let role = effective_role(principal);
        self.catalog.require(role, tokens::CATEGORIES_MANAGE)?;

        let name = new.name.trim();
        if name.is_empty() {
            return Err(BeaconError::BadRequest("Category name must not be empty".into()));
        }

        if let Some(parent_id) = &new.parent_id {
            let parent = self.get(parent_id).await?.ok_or_else(|| {
                BeaconError::BadRequest(format!("Parent category '{}' does not exist", parent_id))
            })?;
            if !parent.is_top_level() {
                return Err(BeaconError::BadRequest(format!(
                    "Parent category '{}' is itself a subtype",
                    parent_id
                )));
            }
        }

        let (id, commit) = self
            .store
            .push(CATEGORIES, json!({ "name": name, "parentId": new.parent_id }))
            .await?;
        info!(category_id = %id, role, seq = commit.seq, "Category created");

        Ok(Category {
            id,
            name: name.to_string(),
            parent_id: new.parent_id,
        })
    }

    pub async fn delete(&self, principal: Option<&Principal>, id: &str) -> Result<()> {
        let role = effective_role(principal);
        self.catalog.require(role, tokens::CATEGORIES_MANAGE)?;

        let children = self.subtypes(id).await?;
        if !children.is_empty() {
            return Err(BeaconError::BadRequest(format!(
                "Category '{}' still has {} subtype(s)",
                id,
                children.len()
            )));
        }

        let commit = self.store.delete(&DocPath::new(CATEGORIES, id)).await?;
        info!(category_id = %id, role, seq = commit.seq, "Category deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::roles;
    use crate::store::MemoryStore;

    fn setup() -> (CategoryService, Principal) {
        let service = CategoryService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(PermissionCatalog::builtin()),
        );
        (service, Principal::new("admin-1", roles::ADMIN))
    }

    fn named(name: &str, parent: Option<&str>) -> NewCategory {
        NewCategory {
            name: name.into(),
            parent_id: parent.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_two_level_tree() {
        let (service, admin) = setup();
        let fire = service.create(Some(&admin), named("Fire", None)).await.unwrap();
        let wildfire = service
            .create(Some(&admin), named("Wildfire", Some(&fire.id)))
            .await
            .unwrap();
        assert_eq!(wildfire.parent_id.as_deref(), Some(fire.id.as_str()));

        // A subtype cannot parent another entry
        let err = service
            .create(Some(&admin), named("Brush", Some(&wildfire.id)))
            .await
            .unwrap_err();
        assert!(matches!(err, BeaconError::BadRequest(_)));

        let err = service
            .create(Some(&admin), named("Orphan", Some("missing")))
            .await
            .unwrap_err();
        assert!(matches!(err, BeaconError::BadRequest(_)));

        assert_eq!(service.subtypes(&fire.id).await.unwrap().len(), 1);
        let names: Vec<_> = service.list().await.unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["Fire", "Wildfire"]);
    }

    #[tokio::test]
    async fn test_delete_refused_while_subtypes_exist() {
        let (service, admin) = setup();
        let flood = service.create(Some(&admin), named("Flood", None)).await.unwrap();
        let flash = service
            .create(Some(&admin), named("Flash flood", Some(&flood.id)))
            .await
            .unwrap();

        assert!(service.delete(Some(&admin), &flood.id).await.is_err());
        service.delete(Some(&admin), &flash.id).await.unwrap();
        service.delete(Some(&admin), &flood.id).await.unwrap();
        assert!(service.get(&flood.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_manage_permission_required() {
        let (service, _) = setup();
        let coordinator = Principal::new("c", roles::COORDINATOR);
        let err = service
            .create(Some(&coordinator), named("Fire", None))
            .await
            .unwrap_err();
        assert!(matches!(err, BeaconError::PermissionDenied { .. }));
        assert!(service.create(None, named("Fire", None)).await.is_err());
    }
}
