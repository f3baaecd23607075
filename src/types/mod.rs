//! Shared types for Beacon

pub mod error;

pub use error::{BeaconError, Result};
