//! Advisory backend contract
//!
//! Backends answer three questions about a report: which categories fit,
//! what a one-paragraph summary would be, and whether it repeats a recent
//! report. Answers are advisory only.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Result;

/// Input for category suggestion
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryRequest {
    pub description: String,
    /// The submitted report as stored
    pub report: Value,
    /// Names of categories the deployment knows about
    pub known_categories: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategorySuggestion {
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    #[serde(default)]
    pub summary: String,
}

/// A recent report offered as a possible duplicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateCandidate {
    pub id: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub location: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateRequest {
    pub report: Value,
    pub recent: Vec<DuplicateCandidate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateCheck {
    #[serde(default)]
    pub candidate_id: Option<String>,
}

/// AI collaborator behind the advisory bridge
#[async_trait]
pub trait AdvisoryBackend: Send + Sync {
    /// Backend identifier (model name) for logs
    fn id(&self) -> &str;

    /// False for the no-op backend; the bridge skips enrichment entirely
    fn is_enabled(&self) -> bool {
        true
    }

    async fn suggest_categories(&self, request: &CategoryRequest) -> Result<CategorySuggestion>;

    async fn summarize(&self, details: &str) -> Result<Summary>;

    async fn detect_duplicates(&self, request: &DuplicateRequest) -> Result<DuplicateCheck>;
}

/// Backend used when no advisory service is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledAdvisory;

#[async_trait]
impl AdvisoryBackend for DisabledAdvisory {
    fn id(&self) -> &str {
        "disabled"
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn suggest_categories(&self, _request: &CategoryRequest) -> Result<CategorySuggestion> {
        Ok(CategorySuggestion::default())
    }

    async fn summarize(&self, _details: &str) -> Result<Summary> {
        Ok(Summary::default())
    }

    async fn detect_duplicates(&self, _request: &DuplicateRequest) -> Result<DuplicateCheck> {
        Ok(DuplicateCheck::default())
    }
}
