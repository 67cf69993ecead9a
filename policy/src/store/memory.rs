//! In-memory document store
//!
//! Documents are held as serialized JSON so reads hand out independent
//! copies, the same way a remote store would.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use super::{DocumentChange, DocumentStore, StoreError, StoreResult, Versioned};
use crate::escalation::CorrectionRequest;
use crate::progression::UserProgress;

/// Channel capacity for change notifications
const CHANGE_CAPACITY: usize = 256;

/// Shared reference to MemoryStore
pub type SharedMemoryStore = Arc<MemoryStore>;

#[derive(Debug, Clone)]
struct Stored {
    version: u64,
    bytes: Vec<u8>,
}

/// `DocumentStore` backed by process memory
pub struct MemoryStore {
    progress: RwLock<HashMap<String, Stored>>,
    corrections: RwLock<HashMap<String, Stored>>,
    changes: broadcast::Sender<DocumentChange>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            progress: RwLock::new(HashMap::new()),
            corrections: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedMemoryStore {
        Arc::new(self)
    }

    /// Every stored correction request, oldest first
    pub fn corrections(&self) -> StoreResult<Vec<CorrectionRequest>> {
        let map = self.corrections.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut requests = map
            .values()
            .map(|s| decode::<CorrectionRequest>(&s.bytes))
            .collect::<StoreResult<Vec<_>>>()?;
        requests.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        Ok(requests)
    }

    /// User ids with a stored progress document, sorted
    pub fn users(&self) -> StoreResult<Vec<String>> {
        let map = self.progress.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut users: Vec<String> = map.keys().cloned().collect();
        users.sort();
        Ok(users)
    }

    fn notify(&self, change: DocumentChange) {
        // No subscribers is fine
        let receivers = self.changes.send(change).unwrap_or(0);
        debug!(receivers, "document change published");
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn load_progress(&self, user_id: &str) -> StoreResult<Option<Versioned<UserProgress>>> {
        let map = self.progress.read().map_err(|_| StoreError::LockPoisoned)?;
        match map.get(user_id) {
            Some(stored) => Ok(Some(Versioned {
                version: stored.version,
                value: decode(&stored.bytes)?,
            })),
            None => Ok(None),
        }
    }

    async fn compare_and_swap_progress(
        &self,
        user_id: &str,
        expected_version: Option<u64>,
        progress: &UserProgress,
    ) -> StoreResult<u64> {
        let bytes = encode(progress)?;
        let version = {
            let mut map = self.progress.write().map_err(|_| StoreError::LockPoisoned)?;
            let found = map.get(user_id).map(|s| s.version);
            if found != expected_version {
                return Err(StoreError::Conflict {
                    key: format!("progress/{}", user_id),
                    expected: expected_version,
                    found,
                });
            }
            let version = found.unwrap_or(0) + 1;
            map.insert(user_id.to_string(), Stored { version, bytes });
            version
        };

        self.notify(DocumentChange::Progress {
            user_id: user_id.to_string(),
            version,
        });
        Ok(version)
    }

    async fn load_correction(
        &self,
        request_id: &str,
    ) -> StoreResult<Option<Versioned<CorrectionRequest>>> {
        let map = self.corrections.read().map_err(|_| StoreError::LockPoisoned)?;
        match map.get(request_id) {
            Some(stored) => Ok(Some(Versioned {
                version: stored.version,
                value: decode(&stored.bytes)?,
            })),
            None => Ok(None),
        }
    }

    async fn compare_and_swap_correction(
        &self,
        expected_version: Option<u64>,
        request: &CorrectionRequest,
    ) -> StoreResult<u64> {
        let bytes = encode(request)?;
        let version = {
            let mut map = self.corrections.write().map_err(|_| StoreError::LockPoisoned)?;
            let found = map.get(&request.id).map(|s| s.version);
            if found != expected_version {
                return Err(StoreError::Conflict {
                    key: format!("corrections/{}", request.id),
                    expected: expected_version,
                    found,
                });
            }
            let version = found.unwrap_or(0) + 1;
            map.insert(request.id.clone(), Stored { version, bytes });
            version
        };

        self.notify(DocumentChange::Correction {
            request: request.clone(),
        });
        Ok(version)
    }

    async fn open_correction_for_user(
        &self,
        user_id: &str,
    ) -> StoreResult<Option<CorrectionRequest>> {
        Ok(self
            .corrections()?
            .into_iter()
            .filter(|r| r.user_id == user_id && r.is_open())
            .last())
    }

    fn subscribe(&self) -> broadcast::Receiver<DocumentChange> {
        self.changes.subscribe()
    }
}
