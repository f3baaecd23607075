//! Authentication and authorization for Beacon
//!
//! Provides:
//! - JWT validation yielding the calling principal
//! - The immutable role → permission catalog and its evaluator

pub mod jwt;
pub mod permissions;

pub use jwt::{effective_role, extract_token_from_header, Claims, JwtValidator, Principal};
pub use permissions::{is_well_formed_token, roles, tokens, CatalogFile, PermissionCatalog};
