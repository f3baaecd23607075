//! Incident, category and user-profile records
//!
//! Field names follow the stored JSON (camelCase). Timestamps are epoch
//! millis assigned by the store clock.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::{BeaconError, Result};

/// Lifecycle status of an incident
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IncidentStatus {
    Reported,
    Verified,
    TeamDispatched,
    InProgress,
    Resolved,
    Rejected,
}

impl IncidentStatus {
    pub const ALL: [IncidentStatus; 6] = [
        Self::Reported,
        Self::Verified,
        Self::TeamDispatched,
        Self::InProgress,
        Self::Resolved,
        Self::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reported => "Reported",
            Self::Verified => "Verified",
            Self::TeamDispatched => "TeamDispatched",
            Self::InProgress => "InProgress",
            Self::Resolved => "Resolved",
            Self::Rejected => "Rejected",
        }
    }

    /// No transition leaves a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Rejected)
    }
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IncidentStatus {
    type Err = BeaconError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| BeaconError::BadRequest(format!("Unknown incident status '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// A `{latitude, longitude}` pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(-90.0..=90.0).contains(&self.latitude) || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(BeaconError::BadRequest(format!(
                "Coordinates out of range: ({}, {})",
                self.latitude, self.longitude
            )));
        }
        Ok(())
    }
}

/// Where an incident happened: a free-text address or a coordinate pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Location {
    Coordinates(Coordinates),
    Address(String),
}

impl Location {
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Coordinates(c) => c.validate(),
            Self::Address(a) if a.trim().is_empty() => {
                Err(BeaconError::BadRequest("Location address is empty".into()))
            }
            Self::Address(_) => Ok(()),
        }
    }
}

/// Non-authoritative annotations produced by the advisory services.
///
/// Nothing here is ever copied into `status`, `priority` or `category`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Advisory {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggested_categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_candidate_id: Option<String>,
}

impl Advisory {
    pub fn is_empty(&self) -> bool {
        self.summary.is_none()
            && self.suggested_categories.is_empty()
            && self.reasoning.is_none()
            && self.duplicate_candidate_id.is_none()
    }
}

/// Stored incident report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    #[serde(default)]
    pub id: String,
    pub title: String,
    pub description: String,
    pub category: String,
    /// Optional subtype within `category`
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub incident_type: Option<String>,
    pub status: IncidentStatus,
    #[serde(default)]
    pub priority: Priority,
    pub location: Location,
    pub date_reported: i64,
    #[serde(default)]
    pub reporter_id: Option<String>,
    #[serde(default)]
    pub media: Vec<String>,
    #[serde(default)]
    pub advisory: Option<Advisory>,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub updated_at: Option<i64>,
    /// Commit sequence of the last write to this record
    #[serde(default)]
    pub rev: u64,
}

/// Submission payload for a new incident
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewIncident {
    pub title: String,
    pub description: String,
    pub category: String,
    #[serde(default, rename = "type")]
    pub incident_type: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    pub location: Location,
    #[serde(default)]
    pub media: Vec<String>,
    /// Submit without attaching the caller's id
    #[serde(default)]
    pub anonymous: bool,
}

fn require_text(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(BeaconError::BadRequest(format!("'{}' must not be empty", field)));
    }
    Ok(())
}

fn validate_media(media: &[String]) -> Result<()> {
    if media.iter().any(|url| url.trim().is_empty()) {
        return Err(BeaconError::BadRequest("Media URLs must not be empty".into()));
    }
    Ok(())
}

impl NewIncident {
    pub fn validate(&self) -> Result<()> {
        require_text("title", &self.title)?;
        require_text("description", &self.description)?;
        require_text("category", &self.category)?;
        self.location.validate()?;
        validate_media(&self.media)
    }
}

/// Detail edit. Status, reporter and report date are not editable here;
/// unknown fields (including those) are rejected at parse time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IncidentUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default, rename = "type")]
    pub incident_type: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub location: Option<Location>,
    /// URLs appended to the existing media list
    #[serde(default)]
    pub add_media: Vec<String>,
}

impl IncidentUpdate {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(BeaconError::BadRequest("Update contains no fields".into()));
        }
        if let Some(title) = &self.title {
            require_text("title", title)?;
        }
        if let Some(description) = &self.description {
            require_text("description", description)?;
        }
        if let Some(category) = &self.category {
            require_text("category", category)?;
        }
        if let Some(location) = &self.location {
            location.validate()?;
        }
        validate_media(&self.add_media)
    }
}

/// Requested status change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRequest {
    pub to: IncidentStatus,
    #[serde(default)]
    pub assigned_to: Option<String>,
}

impl TransitionRequest {
    pub fn to(status: IncidentStatus) -> Self {
        Self {
            to: status,
            assigned_to: None,
        }
    }

    pub fn dispatch(assigned_to: impl Into<String>) -> Self {
        Self {
            to: IncidentStatus::TeamDispatched,
            assigned_to: Some(assigned_to.into()),
        }
    }
}

/// Category / incident type. A null `parentId` marks a top-level entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<String>,
}

impl Category {
    pub fn is_top_level(&self) -> bool {
        self.parent_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCategory {
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationMetadata {
    pub accuracy: f64,
    #[serde(default)]
    pub heading: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub user_type: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub location: Option<Coordinates>,
    #[serde(default)]
    pub location_metadata: Option<LocationMetadata>,
}
