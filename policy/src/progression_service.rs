//! Progression service: store transactions around the progression engine
//!
//! Every operation loads the user's progress document, runs the pure engine
//! on a copy, and writes it back with compare-and-swap. A conflicting write
//! restarts the transaction from a fresh read, so concurrent awards for the
//! same user both land. Events and webhooks go out only after commit.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::events::{DomainEvent, SharedEventBus};
use crate::notices::NoticeKind;
use crate::progression::{
    LevelThreshold, MilestoneId, ProgressionEngine, ProgressionError, ProgressionEvent,
    ProgressionOutcome, UserProgress,
};
use crate::services::{DisabledWebhooks, WebhookEvent, WebhookSink};
use crate::store::{DocumentStore, StoreError, MAX_TRANSACTION_ATTEMPTS};
use crate::{PolicyError, PolicyResult};

/// Result of a committed progression operation
#[derive(Debug, Clone)]
pub struct CommittedProgress {
    pub outcome: ProgressionOutcome,
    /// State after the commit
    pub progress: UserProgress,
    /// Store version written, `None` when nothing changed
    pub version: Option<u64>,
}

/// Transactional adapter between a `DocumentStore` and `ProgressionEngine`
pub struct ProgressionService<S> {
    store: Arc<S>,
    engine: ProgressionEngine,
    bus: SharedEventBus,
    webhooks: Arc<dyn WebhookSink>,
}

impl<S: DocumentStore> ProgressionService<S> {
    pub fn new(store: Arc<S>, engine: ProgressionEngine, bus: SharedEventBus) -> Self {
        Self {
            store,
            engine,
            bus,
            webhooks: Arc::new(DisabledWebhooks),
        }
    }

    pub fn with_webhooks(mut self, webhooks: Arc<dyn WebhookSink>) -> Self {
        self.webhooks = webhooks;
        self
    }

    pub fn engine(&self) -> &ProgressionEngine {
        &self.engine
    }

    /// Current progress; a user with no document gets the default state
    pub async fn progress(&self, user_id: &str) -> PolicyResult<UserProgress> {
        Ok(self
            .store
            .load_progress(user_id)
            .await?
            .map(|v| v.value)
            .unwrap_or_else(|| UserProgress::new(user_id)))
    }

    pub async fn record_accuracy_change(
        &self,
        user_id: &str,
        previous_accuracy: f64,
        current_accuracy: f64,
    ) -> PolicyResult<CommittedProgress> {
        let committed = self
            .transact(user_id, |engine, progress, now| {
                engine.record_accuracy_change(progress, previous_accuracy, current_accuracy, now)
            })
            .await?;

        info!(
            user_id = %user_id,
            previous_accuracy,
            current_accuracy,
            points = committed.outcome.awarded_points,
            total_points = committed.progress.total_points,
            level = committed.progress.current_level,
            "accuracy change recorded"
        );

        if previous_accuracy != current_accuracy {
            self.send_webhook(WebhookEvent::RecitationCompleted {
                user_id: user_id.to_string(),
                accuracy: current_accuracy,
                jannah_points: committed.outcome.awarded_points,
                timestamp: Utc::now(),
            })
            .await;
        }
        self.announce(user_id, &committed).await;
        Ok(committed)
    }

    pub async fn award_milestone(
        &self,
        user_id: &str,
        milestone: MilestoneId,
    ) -> PolicyResult<CommittedProgress> {
        let committed = self
            .transact(user_id, |engine, progress, now| {
                Ok(engine.award_milestone(progress, milestone, now))
            })
            .await?;
        self.announce(user_id, &committed).await;
        Ok(committed)
    }

    pub async fn record_daily_streak(
        &self,
        user_id: &str,
        streak_days: u32,
    ) -> PolicyResult<CommittedProgress> {
        let committed = self
            .transact(user_id, |engine, progress, now| {
                Ok(engine.record_daily_streak(progress, streak_days, now))
            })
            .await?;
        self.announce(user_id, &committed).await;
        Ok(committed)
    }

    /// Read-modify-CAS loop. `op` may run several times and must be pure.
    async fn transact<F>(&self, user_id: &str, op: F) -> PolicyResult<CommittedProgress>
    where
        F: Fn(
                &ProgressionEngine,
                &mut UserProgress,
                DateTime<Utc>,
            ) -> Result<ProgressionOutcome, ProgressionError>
            + Send
            + Sync,
    {
        for attempt in 1..=MAX_TRANSACTION_ATTEMPTS {
            let loaded = self.store.load_progress(user_id).await?;
            let expected_version = loaded.as_ref().map(|v| v.version);
            let mut progress = loaded
                .map(|v| v.value)
                .unwrap_or_else(|| UserProgress::new(user_id));

            let outcome = op(&self.engine, &mut progress, Utc::now())?;
            if outcome.is_empty() {
                return Ok(CommittedProgress {
                    outcome,
                    progress,
                    version: None,
                });
            }

            match self
                .store
                .compare_and_swap_progress(user_id, expected_version, &progress)
                .await
            {
                Ok(version) => {
                    return Ok(CommittedProgress {
                        outcome,
                        progress,
                        version: Some(version),
                    })
                }
                Err(StoreError::Conflict { .. }) => {
                    debug!(user_id = %user_id, attempt, "progress write conflicted, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(
            user_id = %user_id,
            attempts = MAX_TRANSACTION_ATTEMPTS,
            "progress transaction abandoned"
        );
        Err(PolicyError::TransactionExhausted {
            user_id: user_id.to_string(),
            attempts: MAX_TRANSACTION_ATTEMPTS,
        })
    }

    /// Publish committed events and fire milestone/certificate webhooks
    async fn announce(&self, user_id: &str, committed: &CommittedProgress) {
        let now = Utc::now();
        for event in &committed.outcome.events {
            self.bus
                .publish(DomainEvent::from_progression(user_id, event, now));

            match event {
                ProgressionEvent::MilestoneAchieved { milestone, .. } => {
                    info!(user_id = %user_id, milestone = %milestone, "milestone achieved");
                    self.send_webhook(WebhookEvent::MilestoneReached {
                        user_id: user_id.to_string(),
                        milestone: *milestone,
                        total_points: committed.progress.total_points,
                        level: committed.progress.current_level,
                    })
                    .await;
                }
                ProgressionEvent::LevelUp { new_level, .. } => {
                    info!(user_id = %user_id, new_level, "level up");
                    if *new_level == LevelThreshold::max_level() {
                        self.send_webhook(WebhookEvent::CertificateEarned {
                            user_id: user_id.to_string(),
                            certificate_id: format!("cert_{}", uuid::Uuid::new_v4().simple()),
                            achievement: LevelThreshold::for_level(*new_level).name.to_string(),
                            total_points: committed.progress.total_points,
                        })
                        .await;
                    }
                }
                ProgressionEvent::PointsAwarded { .. } => {}
            }
        }
    }

    async fn send_webhook(&self, event: WebhookEvent) {
        if let Err(e) = self.webhooks.deliver(&event).await {
            let kind = event.kind();
            warn!(?kind, error = %e, "webhook delivery failed");
            let user_id = match &event {
                WebhookEvent::RecitationCompleted { user_id, .. }
                | WebhookEvent::ExpertAssigned { user_id, .. }
                | WebhookEvent::CertificateEarned { user_id, .. }
                | WebhookEvent::MilestoneReached { user_id, .. } => user_id.clone(),
            };
            self.bus.publish(DomainEvent::TransientFailure {
                user_id: Some(user_id),
                request_id: None,
                operation: format!("webhook:{:?}", kind),
                error: e.to_string(),
                severity: NoticeKind::Warning,
                timestamp: Utc::now(),
            });
        }
    }
}
