//! Beacon - incident lifecycle and live dispatch gateway
//!
//! Beacon sits between field devices, dispatch consoles and a shared
//! document store. Every change to an incident is checked against a role
//! catalog and a fixed lifecycle before it is committed.
//!
//! ## Services
//!
//! - **Access control**: role → permission catalog and evaluator
//! - **Lifecycle**: incident state machine with compare-and-set commits
//! - **Location**: per-user throttled position feeds
//! - **Sync**: live views over documents and collections
//! - **Advisory**: optional AI suggestions stored as metadata only

pub mod advisory;
pub mod auth;
pub mod config;
pub mod incident;
pub mod location;
pub mod routes;
pub mod server;
pub mod store;
pub mod sync;
pub mod types;

pub use config::Args;
pub use server::{run, AppState};
pub use types::{BeaconError, Result};
