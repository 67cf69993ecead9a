//! Document store boundary
//!
//! Progress and correction documents are both versioned so the services can
//! run compare-and-swap transactions over them. Every write is pushed to
//! subscribers as a `DocumentChange`.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::escalation::CorrectionRequest;
use crate::progression::UserProgress;

pub use memory::MemoryStore;

/// Attempts a store transaction makes before giving up on conflicts
pub const MAX_TRANSACTION_ATTEMPTS: usize = 8;

/// Error type for document store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Version conflict on {key}: expected {expected:?}, found {found:?}")]
    Conflict {
        key: String,
        expected: Option<u64>,
        found: Option<u64>,
    },

    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Conflicts and outages may succeed on a later attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Unavailable(_))
    }
}

/// Result type for document store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// A document together with the version it was read at
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

/// Push notification for a write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "collection", rename_all = "snake_case")]
pub enum DocumentChange {
    Progress { user_id: String, version: u64 },
    Correction { request: CorrectionRequest },
}

/// Persistence for progress and correction documents
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// `None` when the user has no document yet
    async fn load_progress(&self, user_id: &str) -> StoreResult<Option<Versioned<UserProgress>>>;

    /// Write `progress` if the stored version is still `expected_version`
    /// (`None` = no document). Returns the new version.
    async fn compare_and_swap_progress(
        &self,
        user_id: &str,
        expected_version: Option<u64>,
        progress: &UserProgress,
    ) -> StoreResult<u64>;

    async fn load_correction(
        &self,
        request_id: &str,
    ) -> StoreResult<Option<Versioned<CorrectionRequest>>>;

    /// Write `request` if its stored version is still `expected_version`
    /// (`None` = new request). Returns the new version.
    async fn compare_and_swap_correction(
        &self,
        expected_version: Option<u64>,
        request: &CorrectionRequest,
    ) -> StoreResult<u64>;

    /// Most recent non-completed request for a user
    async fn open_correction_for_user(&self, user_id: &str)
        -> StoreResult<Option<CorrectionRequest>>;

    fn subscribe(&self) -> broadcast::Receiver<DocumentChange>;
}
