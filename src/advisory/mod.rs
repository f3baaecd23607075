//! Advisory bridge to the AI collaborators
//!
//! Category suggestion, summarization and duplicate detection are
//! optional. Their answers are stored as `advisory` metadata on the
//! incident and never decide status, priority or category.

pub mod backend;
pub mod bridge;
pub mod mock;
pub mod openai;

pub use backend::{
    AdvisoryBackend, CategoryRequest, CategorySuggestion, DisabledAdvisory, DuplicateCandidate,
    DuplicateCheck, DuplicateRequest, Summary,
};
pub use bridge::{AdvisoryBridge, DEFAULT_ADVISORY_TIMEOUT, DUPLICATE_WINDOW};
pub use mock::MockAdvisory;
pub use openai::LlmAdvisoryBackend;
