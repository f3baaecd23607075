//! Permission catalog and access evaluation
//!
//! Roles map to fixed sets of `resource.action` tokens. The catalog is
//! built once at startup (built-in table or a JSON file) and never mutated
//! afterwards, so it can be shared behind an `Arc` and read from any task.
//!
//! Evaluation fails closed: unknown roles and unknown tokens are denied.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use crate::types::{BeaconError, Result};

/// Permission tokens understood by the engine
pub mod tokens {
    pub const INCIDENTS_CREATE: &str = "incidents.create";
    pub const INCIDENTS_VIEW: &str = "incidents.view";
    pub const INCIDENTS_VERIFY: &str = "incidents.verify";
    pub const INCIDENTS_REJECT: &str = "incidents.reject";
    pub const INCIDENTS_DISPATCH: &str = "incidents.dispatch";
    pub const INCIDENTS_UPDATE: &str = "incidents.update";
    pub const INCIDENTS_RESOLVE: &str = "incidents.resolve";
    pub const INCIDENTS_DELETE: &str = "incidents.delete";
    pub const CATEGORIES_MANAGE: &str = "categories.manage";
    pub const USERS_MANAGE: &str = "users.manage";
    pub const LOCATION_PUBLISH: &str = "location.publish";
    pub const ANALYTICS_VIEW: &str = "analytics.view";

    /// Every token the built-in catalog knows about
    pub const ALL: &[&str] = &[
        INCIDENTS_CREATE,
        INCIDENTS_VIEW,
        INCIDENTS_VERIFY,
        INCIDENTS_REJECT,
        INCIDENTS_DISPATCH,
        INCIDENTS_UPDATE,
        INCIDENTS_RESOLVE,
        INCIDENTS_DELETE,
        CATEGORIES_MANAGE,
        USERS_MANAGE,
        LOCATION_PUBLISH,
        ANALYTICS_VIEW,
    ];
}

/// Role names of the built-in catalog
pub mod roles {
    pub const ADMIN: &str = "admin";
    pub const COORDINATOR: &str = "coordinator";
    pub const RESPONDER: &str = "responder";
    pub const REPORTER: &str = "reporter";
    /// Role used for callers without a principal
    pub const ANONYMOUS: &str = "anonymous";
}

/// Tokens granted to a built-in role.
/// Returns None for roles the built-in table does not define.
fn builtin_grants(role: &str) -> Option<&'static [&'static str]> {
    use tokens::*;

    match role {
        roles::ADMIN => Some(ALL),

        roles::COORDINATOR => Some(&[
            INCIDENTS_CREATE,
            INCIDENTS_VIEW,
            INCIDENTS_VERIFY,
            INCIDENTS_REJECT,
            INCIDENTS_DISPATCH,
            INCIDENTS_UPDATE,
            INCIDENTS_RESOLVE,
            LOCATION_PUBLISH,
            ANALYTICS_VIEW,
        ]),

        roles::RESPONDER => Some(&[
            INCIDENTS_CREATE,
            INCIDENTS_VIEW,
            INCIDENTS_UPDATE,
            INCIDENTS_RESOLVE,
            LOCATION_PUBLISH,
        ]),

        roles::REPORTER => Some(&[INCIDENTS_CREATE, INCIDENTS_VIEW]),

        roles::ANONYMOUS => Some(&[INCIDENTS_CREATE]),

        _ => None,
    }
}

/// Check that a token has the `resource.action` shape
pub fn is_well_formed_token(token: &str) -> bool {
    match token.split_once('.') {
        Some((resource, action)) => {
            let valid = |s: &str| {
                !s.is_empty()
                    && s.chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
            };
            valid(resource) && valid(action)
        }
        None => false,
    }
}

/// On-disk catalog format: `{"roles": {"<role>": ["<token>", ...]}}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogFile {
    pub roles: HashMap<String, Vec<String>>,
}

/// Immutable role → permission-set mapping
#[derive(Debug, Clone)]
pub struct PermissionCatalog {
    roles: HashMap<String, HashSet<String>>,
}

impl Default for PermissionCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PermissionCatalog {
    /// The built-in catalog
    pub fn builtin() -> Self {
        let roles = [
            roles::ADMIN,
            roles::COORDINATOR,
            roles::RESPONDER,
            roles::REPORTER,
            roles::ANONYMOUS,
        ]
        .into_iter()
        .filter_map(|role| {
            builtin_grants(role).map(|grants| {
                (
                    role.to_string(),
                    grants.iter().map(|t| t.to_string()).collect(),
                )
            })
        })
        .collect();

        Self { roles }
    }

    /// Build a catalog from the file format, validating every token
    pub fn from_file_format(file: CatalogFile) -> Result<Self> {
        let mut roles = HashMap::with_capacity(file.roles.len());

        for (role, grants) in file.roles {
            if role.trim().is_empty() {
                return Err(BeaconError::Config("Catalog contains an empty role name".into()));
            }
            let mut set = HashSet::with_capacity(grants.len());
            for token in grants {
                if !is_well_formed_token(&token) {
                    return Err(BeaconError::Config(format!(
                        "Role '{}' has malformed permission token '{}'",
                        role, token
                    )));
                }
                set.insert(token);
            }
            roles.insert(role, set);
        }

        Ok(Self { roles })
    }

    /// Parse a catalog from JSON text
    pub fn from_json(json: &str) -> Result<Self> {
        let file: CatalogFile = serde_json::from_str(json)
            .map_err(|e| BeaconError::Config(format!("Invalid permission catalog: {}", e)))?;
        Self::from_file_format(file)
    }

    /// Load a catalog from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            BeaconError::Config(format!(
                "Failed to read permission catalog {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json(&text)
    }

    /// True iff `token` is granted to `role`. Unknown roles are denied.
    pub fn has_permission(&self, role: &str, token: &str) -> bool {
        self.roles
            .get(role)
            .map(|grants| grants.contains(token))
            .unwrap_or(false)
    }

    /// True if any of `tokens` is granted. Empty input is false.
    pub fn has_any(&self, role: &str, tokens: &[&str]) -> bool {
        tokens.iter().any(|t| self.has_permission(role, t))
    }

    /// True if all of `tokens` are granted. Empty input is vacuously true.
    pub fn has_all(&self, role: &str, tokens: &[&str]) -> bool {
        tokens.iter().all(|t| self.has_permission(role, t))
    }

    /// Fail with `PermissionDenied` unless `token` is granted to `role`
    pub fn require(&self, role: &str, token: &str) -> Result<()> {
        if self.has_permission(role, token) {
            Ok(())
        } else {
            Err(BeaconError::permission_denied(role, token))
        }
    }

    /// Sorted permission list for a role (empty for unknown roles)
    pub fn permissions_for(&self, role: &str) -> Vec<String> {
        self.roles
            .get(role)
            .map(|grants| grants.iter().cloned().collect::<BTreeSet<_>>())
            .unwrap_or_default()
            .into_iter()
            .collect()
    }

    /// Whether the catalog defines this role
    pub fn knows_role(&self, role: &str) -> bool {
        self.roles.contains_key(role)
    }

    pub fn role_count(&self) -> usize {
        self.roles.len()
    }
}

#[cfg(test)]
mod tests {
    use super::tokens::*;
    use super::*;

    #[test]
    fn test_admin_has_everything() {
        let catalog = PermissionCatalog::builtin();
        for token in ALL {
            assert!(catalog.has_permission(roles::ADMIN, token), "{}", token);
        }
    }

    #[test]
    fn test_responder_cannot_verify() {
        let catalog = PermissionCatalog::builtin();
        assert!(!catalog.has_permission(roles::RESPONDER, INCIDENTS_VERIFY));
        assert!(catalog.has_permission(roles::RESPONDER, INCIDENTS_UPDATE));
        assert!(catalog.has_permission(roles::RESPONDER, INCIDENTS_RESOLVE));
    }

    #[test]
    fn test_coordinator_verifies_and_dispatches() {
        let catalog = PermissionCatalog::builtin();
        assert!(catalog.has_all(
            roles::COORDINATOR,
            &[INCIDENTS_VERIFY, INCIDENTS_DISPATCH]
        ));
        assert!(!catalog.has_permission(roles::COORDINATOR, INCIDENTS_DELETE));
    }

    #[test]
    fn test_anonymous_can_only_create() {
        let catalog = PermissionCatalog::builtin();
        assert_eq!(
            catalog.permissions_for(roles::ANONYMOUS),
            vec![INCIDENTS_CREATE.to_string()]
        );
    }

    #[test]
    fn test_unknown_role_fails_closed() {
        let catalog = PermissionCatalog::builtin();
        for token in ALL {
            assert!(!catalog.has_permission("superuser", token));
        }
        assert!(!catalog.has_any("superuser", ALL));
        assert!(catalog.permissions_for("superuser").is_empty());
    }

    #[test]
    fn test_any_all_edge_cases() {
        let catalog = PermissionCatalog::builtin();
        assert!(catalog.has_all(roles::REPORTER, &[]));
        assert!(!catalog.has_any(roles::REPORTER, &[]));
        assert!(catalog.has_any(roles::REPORTER, &[INCIDENTS_DELETE, INCIDENTS_VIEW]));
        assert!(!catalog.has_all(roles::REPORTER, &[INCIDENTS_DELETE, INCIDENTS_VIEW]));
        // Vacuous truth holds even for unknown roles
        assert!(catalog.has_all("ghost", &[]));
    }

    #[test]
    fn test_require_names_missing_token() {
        let catalog = PermissionCatalog::builtin();
        assert!(catalog.require(roles::REPORTER, INCIDENTS_VIEW).is_ok());
        let err = catalog
            .require(roles::REPORTER, INCIDENTS_VERIFY)
            .unwrap_err();
        match err {
            BeaconError::PermissionDenied { role, token } => {
                assert_eq!(role, "reporter");
                assert_eq!(token, INCIDENTS_VERIFY);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_deterministic_across_calls() {
        let catalog = PermissionCatalog::builtin();
        let first: Vec<bool> = ALL
            .iter()
            .map(|t| catalog.has_permission(roles::COORDINATOR, t))
            .collect();
        for _ in 0..10 {
            let again: Vec<bool> = ALL
                .iter()
                .map(|t| catalog.has_permission(roles::COORDINATOR, t))
                .collect();
            assert_eq!(first, again);
        }
    }

    #[test]
    fn test_catalog_from_json() {
        let catalog = PermissionCatalog::from_json(
            r#"{"roles": {"dispatcher": ["incidents.dispatch", "incidents.view"]}}"#,
        )
        .unwrap();
        assert!(catalog.has_permission("dispatcher", INCIDENTS_DISPATCH));
        // File replaces the built-in table entirely
        assert!(!catalog.has_permission(roles::ADMIN, INCIDENTS_VIEW));
        assert_eq!(catalog.role_count(), 1);
    }

    #[test]
    fn test_malformed_tokens_rejected() {
        assert!(PermissionCatalog::from_json(r#"{"roles": {"x": ["incidents"]}}"#).is_err());
        assert!(PermissionCatalog::from_json(r#"{"roles": {"x": ["Incidents.Create"]}}"#).is_err());
        assert!(PermissionCatalog::from_json(r#"{"roles": {"x": [".create"]}}"#).is_err());
        assert!(PermissionCatalog::from_json("not json").is_err());
    }

    #[test]
    fn test_token_shape() {
        assert!(is_well_formed_token("incidents.delete"));
        assert!(is_well_formed_token("location.publish"));
        assert!(!is_well_formed_token("incidents."));
        assert!(!is_well_formed_token("incidents"));
    }
}
