//! Incident lifecycle
//!
//! - `model`: stored records and request payloads
//! - `machine`: the transition table and its guards
//! - `service`: creation, transitions and edits against the store
//! - `category`: the two-level category tree

pub mod category;
pub mod machine;
pub mod model;
pub mod service;

pub use category::CategoryService;
pub use machine::{validate_transition, TransitionPlan, TransitionRule, TRANSITIONS};
pub use model::{
    Advisory, Category, Coordinates, Incident, IncidentStatus, IncidentUpdate, Location,
    LocationMetadata, NewCategory, NewIncident, Priority, TransitionRequest, UserProfile,
};
pub use service::IncidentService;
