//! Mock advisory backend for testing.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use super::backend::*;
use crate::types::{BeaconError, Result};

/// Mock backend with canned answers, an optional delay and a failure switch
pub struct MockAdvisory {
    suggestion: CategorySuggestion,
    summary: Summary,
    duplicate: DuplicateCheck,
    delay: Option<Duration>,
    failing: AtomicBool,
    call_count: AtomicU32,
}

impl Default for MockAdvisory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdvisory {
    pub fn new() -> Self {
        Self {
            suggestion: CategorySuggestion::default(),
            summary: Summary::default(),
            duplicate: DuplicateCheck::default(),
            delay: None,
            failing: AtomicBool::new(false),
            call_count: AtomicU32::new(0),
        }
    }

    pub fn with_suggestion(mut self, categories: &[&str], reasoning: impl Into<String>) -> Self {
        self.suggestion = CategorySuggestion {
            categories: categories.iter().map(|c| c.to_string()).collect(),
            reasoning: reasoning.into(),
        };
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Summary {
            summary: summary.into(),
        };
        self
    }

    pub fn with_duplicate(mut self, candidate_id: impl Into<String>) -> Self {
        self.duplicate = DuplicateCheck {
            candidate_id: Some(candidate_id.into()),
        };
        self
    }

    /// Sleep before answering each call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of backend calls made
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    async fn answer<T: Clone>(&self, value: &T) -> Result<T> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(BeaconError::AdvisoryUnavailable("mock backend failing".into()));
        }
        Ok(value.clone())
    }
}

#[async_trait]
impl AdvisoryBackend for MockAdvisory {
    fn id(&self) -> &str {
        "mock-advisory"
    }

    async fn suggest_categories(&self, _request: &CategoryRequest) -> Result<CategorySuggestion> {
        self.answer(&self.suggestion).await
    }

    async fn summarize(&self, _details: &str) -> Result<Summary> {
        self.answer(&self.summary).await
    }

    async fn detect_duplicates(&self, _request: &DuplicateRequest) -> Result<DuplicateCheck> {
        self.answer(&self.duplicate).await
    }
}
