//! Integration tests for the progression service
//!
//! Runs concurrent transactions for one user against a store that yields
//! between read and write, so compare-and-swap conflicts actually happen.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::broadcast;

use quranlab_policy::escalation::CorrectionRequest;
use quranlab_policy::events::EventBus;
use quranlab_policy::progression::{MilestoneId, ProgressionEngine, UserProgress};
use quranlab_policy::store::{
    DocumentChange, DocumentStore, MemoryStore, StoreError, StoreResult, Versioned,
    MAX_TRANSACTION_ATTEMPTS,
};
use quranlab_policy::{PolicyError, ProgressionService};

/// MemoryStore that yields after every progress read
struct YieldingStore {
    inner: MemoryStore,
    conflicts: AtomicUsize,
    always_conflict: bool,
}

impl YieldingStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            conflicts: AtomicUsize::new(0),
            always_conflict: false,
        }
    }

    fn conflicting() -> Self {
        Self {
            always_conflict: true,
            ..Self::new()
        }
    }
}

#[async_trait]
impl DocumentStore for YieldingStore {
    async fn load_progress(&self, user_id: &str) -> StoreResult<Option<Versioned<UserProgress>>> {
        let loaded = self.inner.load_progress(user_id).await;
        tokio::task::yield_now().await;
        loaded
    }

    async fn compare_and_swap_progress(
        &self,
        user_id: &str,
        expected_version: Option<u64>,
        progress: &UserProgress,
    ) -> StoreResult<u64> {
        if self.always_conflict {
            self.conflicts.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Conflict {
                key: user_id.to_string(),
                expected: expected_version,
                found: Some(99),
            });
        }
        let result = self
            .inner
            .compare_and_swap_progress(user_id, expected_version, progress)
            .await;
        if matches!(result, Err(StoreError::Conflict { .. })) {
            self.conflicts.fetch_add(1, Ordering::SeqCst);
        }
        result
    }

    async fn load_correction(
        &self,
        request_id: &str,
    ) -> StoreResult<Option<Versioned<CorrectionRequest>>> {
        self.inner.load_correction(request_id).await
    }

    async fn compare_and_swap_correction(
        &self,
        expected_version: Option<u64>,
        request: &CorrectionRequest,
    ) -> StoreResult<u64> {
        self.inner
            .compare_and_swap_correction(expected_version, request)
            .await
    }

    async fn open_correction_for_user(
        &self,
        user_id: &str,
    ) -> StoreResult<Option<CorrectionRequest>> {
        self.inner.open_correction_for_user(user_id).await
    }

    fn subscribe(&self) -> broadcast::Receiver<DocumentChange> {
        self.inner.subscribe()
    }
}

fn service(store: Arc<YieldingStore>) -> ProgressionService<YieldingStore> {
    ProgressionService::new(store, ProgressionEngine::new(), EventBus::new().shared())
}

/// Test: concurrent milestone awards for one user all land
#[tokio::test]
async fn test_concurrent_awards_all_commit() {
    let store = Arc::new(YieldingStore::new());
    let svc = service(store.clone());

    let milestones = [
        MilestoneId::FirstRecitation,
        MilestoneId::DailyStreak7,
        MilestoneId::ExpertValidated,
    ];
    let results = join_all(milestones.iter().map(|m| svc.award_milestone("u1", *m))).await;
    assert!(results.iter().all(|r| r.is_ok()));

    let progress = svc.progress("u1").await.unwrap();
    assert_eq!(progress.total_points, 100 + 300 + 500);
    assert_eq!(progress.milestones.len(), 3);
    assert!(
        store.conflicts.load(Ordering::SeqCst) > 0,
        "interleaved transactions should have conflicted at least once"
    );
}

/// Test: racing awards of the same milestone pay it once
#[tokio::test]
async fn test_duplicate_milestone_race_pays_once() {
    let store = Arc::new(YieldingStore::new());
    let svc = service(store);

    let results = join_all((0..4).map(|_| svc.award_milestone("u1", MilestoneId::FirstRecitation))).await;
    let paid: u64 = results
        .into_iter()
        .map(|r| r.unwrap().outcome.awarded_points)
        .sum();

    assert_eq!(paid, 100);
    assert_eq!(svc.progress("u1").await.unwrap().total_points, 100);
}

/// Test: improvements and streaks interleave without losing points
#[tokio::test]
async fn test_mixed_operations_interleave() {
    let store = Arc::new(YieldingStore::new());
    let svc = service(store);

    let (improvement, streak) = tokio::join!(
        svc.record_accuracy_change("u1", 60.0, 70.0),
        svc.record_daily_streak("u1", 7),
    );
    assert_eq!(improvement.unwrap().outcome.awarded_points, 100);
    assert_eq!(streak.unwrap().outcome.awarded_points, 300);

    let progress = svc.progress("u1").await.unwrap();
    assert_eq!(progress.total_points, 400);
    assert_eq!(progress.recent_earnings.len(), 2);
}

/// Test: a store that always conflicts exhausts the retry budget
#[tokio::test]
async fn test_exhausted_transaction_surfaces_transient_error() {
    let store = Arc::new(YieldingStore::conflicting());
    let svc = service(store.clone());

    let err = svc
        .award_milestone("u1", MilestoneId::FirstRecitation)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PolicyError::TransactionExhausted { attempts, .. } if attempts == MAX_TRANSACTION_ATTEMPTS
    ));
    assert!(err.is_transient());
    assert_eq!(store.conflicts.load(Ordering::SeqCst), MAX_TRANSACTION_ATTEMPTS);
    assert_eq!(svc.progress("u1").await.unwrap().total_points, 0);
}
