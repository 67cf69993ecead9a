//! Correction service: drives the escalation engine from store changes,
//! deadline timers and collaborator calls
//!
//! # Flow
//!
//! ```text
//! initiate ──▶ match experts ──▶ save(pending) ──▶ schedule deadline ──▶ assign first + notify
//!                                                        │
//!                        deadline fires ◀────────────────┘
//!                              │ pending|assigned?
//!                              ├─ yes ─▶ other senior? ─▶ re-assign + notify
//!                              │                      └─▶ EscalationUnavailable
//!                              └─ no ──▶ nothing
//!
//! store change ──▶ on_external_update ──▶ completed? ──▶ cancel deadline
//! ```
//!
//! Every write to a correction document is a compare-and-swap on a fresh
//! read. A writer that loses the race re-runs its decision against the newer
//! document, so an escalation never lands on a request an expert has already
//! picked up.
//!
//! Collaborator failures are logged and surfaced as notices; they never
//! change request status. The deadline still governs escalation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PolicyConfig;
use crate::escalation::{
    AnalysisResult, CorrectionRequest, CorrectionStatus, DeadlineScheduler, EscalationDecision,
    EscalationEngine, EscalationError, Expert, ExternalUpdate, HumanFeedback, ScholarReview,
    UpdateOutcome,
};
use crate::events::{DomainEvent, SharedEventBus};
use crate::notices::{NoticeKind, NoticeLog};
use crate::services::{
    DisabledWebhooks, ExpertMatcher, ExpertNotification, ExpertNotifier, ExpertQuery,
    WebhookEvent, WebhookSink,
};
use crate::store::{
    DocumentChange, DocumentStore, StoreError, Versioned, MAX_TRANSACTION_ATTEMPTS,
};
use crate::{PolicyError, PolicyResult};

/// Result of `CorrectionService::initiate`
#[derive(Debug, Clone, PartialEq)]
pub enum InitiateOutcome {
    /// Accuracy at or above the correction threshold
    NotNeeded,
    /// The user already has an open request; it is returned unchanged
    AlreadyOpen(CorrectionRequest),
    Created {
        request: CorrectionRequest,
        decision: EscalationDecision,
    },
}

impl InitiateOutcome {
    pub fn request(&self) -> Option<&CorrectionRequest> {
        match self {
            Self::NotNeeded => None,
            Self::AlreadyOpen(request) => Some(request),
            Self::Created { request, .. } => Some(request),
        }
    }
}

/// Matching preferences used when building an `ExpertQuery`
#[derive(Debug, Clone, PartialEq)]
pub struct MatchDefaults {
    pub region: String,
    pub language: String,
    pub recitation_style: String,
}

impl Default for MatchDefaults {
    fn default() -> Self {
        Self {
            region: "global".to_string(),
            language: "english".to_string(),
            recitation_style: "hafs".to_string(),
        }
    }
}

/// External collaborators of the correction service
#[derive(Clone)]
pub struct Collaborators {
    pub matcher: Arc<dyn ExpertMatcher>,
    pub notifier: Arc<dyn ExpertNotifier>,
    pub webhooks: Arc<dyn WebhookSink>,
}

impl Collaborators {
    pub fn new(matcher: Arc<dyn ExpertMatcher>, notifier: Arc<dyn ExpertNotifier>) -> Self {
        Self {
            matcher,
            notifier,
            webhooks: Arc::new(DisabledWebhooks),
        }
    }

    pub fn with_webhooks(mut self, webhooks: Arc<dyn WebhookSink>) -> Self {
        self.webhooks = webhooks;
        self
    }
}

/// Engine and matching settings
#[derive(Debug, Clone, Default)]
pub struct CorrectionSettings {
    pub engine: EscalationEngine,
    pub defaults: MatchDefaults,
}

impl CorrectionSettings {
    pub fn from_config(config: &PolicyConfig) -> Self {
        Self {
            engine: EscalationEngine::with_config(config.escalation_config()),
            defaults: MatchDefaults {
                region: config.experts.default_region.clone(),
                language: config.experts.default_language.clone(),
                recitation_style: config.experts.default_style.clone(),
            },
        }
    }
}

/// A correction write that committed, or found nothing to change
#[derive(Debug, Clone)]
struct CorrectionCommit<T> {
    request: CorrectionRequest,
    value: T,
    /// Store version written, `None` when nothing changed
    version: Option<u64>,
}

/// Local view of a request and the candidate pool matched for it
#[derive(Debug, Clone)]
struct Tracked {
    request: CorrectionRequest,
    candidates: Vec<Expert>,
}

struct Inner<S> {
    store: Arc<S>,
    settings: CorrectionSettings,
    collaborators: Collaborators,
    bus: SharedEventBus,
    notices: Arc<NoticeLog>,
    scheduler: DeadlineScheduler,
    tracked: RwLock<HashMap<String, Tracked>>,
    user_locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Reactive adapter around `EscalationEngine`. Cheap to clone.
pub struct CorrectionService<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for CorrectionService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: DocumentStore + 'static> CorrectionService<S> {
    pub fn new(
        store: Arc<S>,
        bus: SharedEventBus,
        collaborators: Collaborators,
        settings: CorrectionSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                settings,
                collaborators,
                bus,
                notices: Arc::new(NoticeLog::new()),
                scheduler: DeadlineScheduler::new(),
                tracked: RwLock::new(HashMap::new()),
                user_locks: std::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    fn engine(&self) -> &EscalationEngine {
        &self.inner.settings.engine
    }

    fn tracked(&self) -> RwLockReadGuard<'_, HashMap<String, Tracked>> {
        self.inner.tracked.read().unwrap_or_else(|p| p.into_inner())
    }

    fn tracked_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, Tracked>> {
        self.inner.tracked.write().unwrap_or_else(|p| p.into_inner())
    }

    fn user_lock(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .inner
            .user_locks
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        locks.entry(user_id.to_string()).or_default().clone()
    }

    /// Drop per-user locks nobody holds or waits on
    fn prune_user_locks(&self) {
        let mut locks = self
            .inner
            .user_locks
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn notices(&self) -> Arc<NoticeLog> {
        Arc::clone(&self.inner.notices)
    }

    /// Local projection of a request
    pub fn request(&self, request_id: &str) -> Option<CorrectionRequest> {
        self.tracked().get(request_id).map(|t| t.request.clone())
    }

    /// Every tracked request, oldest first
    pub fn requests(&self) -> Vec<CorrectionRequest> {
        let mut requests: Vec<CorrectionRequest> =
            self.tracked().values().map(|t| t.request.clone()).collect();
        requests.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        requests
    }

    /// Candidate pool stored for a request at initiation, empty once completed
    pub fn candidates(&self, request_id: &str) -> Vec<Expert> {
        self.tracked()
            .get(request_id)
            .map(|t| t.candidates.clone())
            .unwrap_or_default()
    }

    pub fn has_deadline(&self, request_id: &str) -> bool {
        self.inner.scheduler.is_scheduled(request_id)
    }

    pub fn active_deadlines(&self) -> usize {
        self.inner.scheduler.active_count()
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Open a correction request for a low-accuracy analysis.
    ///
    /// At most one open request per user: a second call while one is open
    /// returns the existing request.
    pub async fn initiate(
        &self,
        user_id: &str,
        analysis: AnalysisResult,
    ) -> PolicyResult<InitiateOutcome> {
        if !self.engine().needs_correction(&analysis) {
            debug!(user_id = %user_id, accuracy = analysis.accuracy, "no correction needed");
            return Ok(InitiateOutcome::NotNeeded);
        }

        let lock = self.user_lock(user_id);
        let outcome = {
            let _guard = lock.lock().await;
            self.initiate_locked(user_id, analysis).await
        };
        drop(lock);
        self.prune_user_locks();
        outcome
    }

    async fn initiate_locked(
        &self,
        user_id: &str,
        analysis: AnalysisResult,
    ) -> PolicyResult<InitiateOutcome> {
        if let Some(existing) = self.open_request_for(user_id).await? {
            info!(user_id = %user_id, request_id = %existing.id, "correction already open");
            return Ok(InitiateOutcome::AlreadyOpen(existing));
        }

        let now = Utc::now();
        let Some(request) = self.engine().open_request(user_id, &analysis, now) else {
            return Ok(InitiateOutcome::NotNeeded);
        };

        let candidates = self.match_experts(&request).await;

        self.inner
            .store
            .compare_and_swap_correction(None, &request)
            .await?;
        self.track(&request, candidates.clone());
        info!(
            user_id = %user_id,
            request_id = %request.id,
            accuracy = analysis.accuracy,
            priority = %request.priority,
            candidates = candidates.len(),
            "correction requested"
        );
        self.inner.bus.publish(DomainEvent::CorrectionRequested {
            request_id: request.id.clone(),
            user_id: user_id.to_string(),
            accuracy: analysis.accuracy,
            priority: request.priority,
            guaranteed_response_by: request.guaranteed_response_by,
            timestamp: now,
        });

        self.schedule_deadline(&request);

        let CorrectionCommit {
            request,
            value: decision,
            version,
        } = self
            .transact(&request.id, |request, now| {
                Ok(self.engine().assign_initial(request, &candidates, now))
            })
            .await?;
        match &decision {
            EscalationDecision::Assigned { expert } => {
                if version.is_some() {
                    self.refresh(&request);
                }
                self.on_assigned(&request, expert).await;
                self.inner.notices.success(format!(
                    "Expert {} has been assigned to your correction.",
                    display_name(expert)
                ));
            }
            EscalationDecision::NoCandidate { reason } => {
                warn!(request_id = %request.id, reason = %reason, "no expert assigned at initiation");
            }
            EscalationDecision::Escalated { .. } | EscalationDecision::NotApplicable { .. } => {}
        }

        let guarantee = self.engine().guarantee();
        let window = match guarantee.num_minutes() {
            0 => format!("{} seconds", guarantee.num_seconds()),
            minutes => format!("{} minutes", minutes),
        };
        self.inner.notices.info(format!(
            "Correction request submitted. Expert will respond within {}.",
            window
        ));

        Ok(InitiateOutcome::Created { request, decision })
    }

    /// Deadline policy for one request. Never reschedules.
    ///
    /// The decision is re-taken on every transaction attempt, so a request
    /// that reached in-progress before the write lands is left alone.
    pub async fn on_deadline_expired(&self, request_id: &str) -> PolicyResult<EscalationDecision> {
        self.inner.scheduler.forget(request_id);

        let candidates = self.candidates(request_id);
        let CorrectionCommit {
            request,
            value: decision,
            ..
        } = self
            .transact(request_id, |request, now| {
                Ok(self.engine().on_deadline_expired(request, &candidates, now))
            })
            .await?;
        let now = Utc::now();

        match &decision {
            EscalationDecision::Escalated {
                from_expert,
                to_expert,
            } => {
                self.inner
                    .notices
                    .warning("Response time exceeded. Escalating to senior expert.");
                self.refresh(&request);
                info!(
                    request_id = %request.id,
                    from = from_expert.as_deref().unwrap_or("-"),
                    to = %to_expert.id,
                    "correction escalated"
                );
                self.inner.bus.publish(DomainEvent::CorrectionEscalated {
                    request_id: request.id.clone(),
                    user_id: request.user_id.clone(),
                    from_expert: from_expert.clone(),
                    to_expert: to_expert.id.clone(),
                    timestamp: now,
                });
                self.on_assigned(&request, to_expert).await;
                self.inner
                    .notices
                    .info("Request escalated to senior expert for immediate attention.");
            }
            EscalationDecision::NoCandidate { reason } => {
                warn!(request_id = %request.id, reason = %reason, "escalation unavailable");
                self.inner.bus.publish(DomainEvent::EscalationUnavailable {
                    request_id: request.id.clone(),
                    user_id: request.user_id.clone(),
                    reason: reason.clone(),
                    timestamp: now,
                });
                self.inner
                    .notices
                    .warning("Response time exceeded. No senior expert is available yet.");
            }
            EscalationDecision::NotApplicable { status } => {
                debug!(request_id = %request.id, status = %status, "deadline passed after pickup");
            }
            EscalationDecision::Assigned { .. } => {}
        }

        Ok(decision)
    }

    /// Apply a change observed in the store to the local projection.
    ///
    /// Unknown requests and stale echoes of older writes are ignored.
    pub async fn on_external_update(
        &self,
        update: ExternalUpdate,
    ) -> PolicyResult<Option<UpdateOutcome>> {
        let applied = {
            let mut tracked = self.tracked_mut();
            let Some(entry) = tracked.get_mut(&update.request_id) else {
                debug!(request_id = %update.request_id, "update for untracked request");
                return Ok(None);
            };

            let request = &mut entry.request;
            if !request.status.can_transition_to(update.status)
                && update.updated_at <= request.updated_at
            {
                debug!(
                    request_id = %request.id,
                    status = %update.status,
                    "stale update ignored"
                );
                return Ok(None);
            }

            let had_feedback = request.human_feedback.is_some();
            let outcome = self.engine().apply_update(request, &update)?;
            let feedback_arrived = !had_feedback && request.human_feedback.is_some();
            let request = request.clone();
            if outcome.newly_completed {
                entry.candidates = Vec::new();
            }
            (outcome, request, feedback_arrived)
        };
        let (outcome, request, feedback_arrived) = applied;

        if outcome.newly_completed {
            self.inner.scheduler.cancel(&request.id);
            info!(
                request_id = %request.id,
                response_time_minutes = outcome.response_time_minutes,
                escalated = request.escalated,
                "correction completed"
            );
            self.inner.bus.publish(DomainEvent::CorrectionCompleted {
                request_id: request.id.clone(),
                user_id: request.user_id.clone(),
                response_time_minutes: outcome.response_time_minutes,
                escalated: request.escalated,
                timestamp: Utc::now(),
            });
            self.inner.notices.success(format!(
                "Correction completed in {} minutes.",
                outcome.response_time_minutes
            ));
        } else if outcome.status_changed() {
            info!(
                request_id = %request.id,
                from = %outcome.previous_status,
                to = %outcome.status,
                "correction status updated"
            );
            self.inner.bus.publish(DomainEvent::CorrectionUpdated {
                request_id: request.id.clone(),
                user_id: request.user_id.clone(),
                previous_status: outcome.previous_status,
                status: outcome.status,
                response_time_minutes: outcome.response_time_minutes,
                timestamp: Utc::now(),
            });
        }

        if feedback_arrived {
            self.inner.notices.info("Expert feedback received.");
        }

        Ok(Some(outcome))
    }

    /// Write an expert-side status change to the store and apply it locally
    pub async fn submit_expert_update(
        &self,
        request_id: &str,
        status: CorrectionStatus,
        human_feedback: Option<HumanFeedback>,
        scholar_review: Option<ScholarReview>,
    ) -> PolicyResult<Option<UpdateOutcome>> {
        let committed = self
            .transact(request_id, |document, now| {
                if !document.status.can_transition_to(status) {
                    return Err(EscalationError::InvalidTransition {
                        request_id: request_id.to_string(),
                        from: document.status,
                        to: status,
                    }
                    .into());
                }
                document.status = status;
                if let Some(feedback) = &human_feedback {
                    document.human_feedback = Some(feedback.clone());
                }
                if let Some(review) = &scholar_review {
                    document.scholar_review = Some(review.clone());
                }
                document.updated_at = now;
                Ok(())
            })
            .await?;

        self.on_external_update(ExternalUpdate::from_request(&committed.request))
            .await
    }

    /// Mark a request completed with the expert's feedback
    pub async fn complete(
        &self,
        request_id: &str,
        human_feedback: Option<HumanFeedback>,
    ) -> PolicyResult<Option<UpdateOutcome>> {
        self.submit_expert_update(request_id, CorrectionStatus::Completed, human_feedback, None)
            .await
    }

    /// Feed store change notifications into `on_external_update`.
    ///
    /// The task holds only a weak reference and ends once the service is dropped.
    pub fn spawn_listener(&self) -> JoinHandle<()> {
        let mut changes = self.inner.store.subscribe();
        let weak: Weak<Inner<S>> = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            loop {
                let change = match changes.recv().await {
                    Ok(change) => change,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "correction listener lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let DocumentChange::Correction { request } = change else {
                    continue;
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let service = CorrectionService { inner };
                if let Err(e) = service
                    .on_external_update(ExternalUpdate::from_request(&request))
                    .await
                {
                    warn!(request_id = %request.id, error = %e, "failed to apply store update");
                }
            }
            debug!("correction listener stopped");
        })
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn open_request_for(&self, user_id: &str) -> PolicyResult<Option<CorrectionRequest>> {
        let local = self
            .tracked()
            .values()
            .filter(|t| t.request.user_id == user_id && t.request.is_open())
            .map(|t| t.request.clone())
            .max_by(|a, b| a.requested_at.cmp(&b.requested_at));
        if local.is_some() {
            return Ok(local);
        }
        Ok(self.inner.store.open_correction_for_user(user_id).await?)
    }

    async fn load(&self, request_id: &str) -> PolicyResult<Versioned<CorrectionRequest>> {
        self.inner
            .store
            .load_correction(request_id)
            .await?
            .ok_or_else(|| PolicyError::UnknownRequest(request_id.to_string()))
    }

    /// Read-modify-CAS loop over one correction document.
    ///
    /// `op` runs on a fresh read every attempt and must be pure. A document
    /// `op` leaves unchanged is not written.
    async fn transact<T, F>(&self, request_id: &str, op: F) -> PolicyResult<CorrectionCommit<T>>
    where
        F: Fn(&mut CorrectionRequest, DateTime<Utc>) -> PolicyResult<T> + Send + Sync,
        T: Send,
    {
        for attempt in 1..=MAX_TRANSACTION_ATTEMPTS {
            let loaded = self.load(request_id).await?;
            let mut request = loaded.value.clone();
            let value = op(&mut request, Utc::now())?;
            if request == loaded.value {
                return Ok(CorrectionCommit {
                    request,
                    value,
                    version: None,
                });
            }

            match self
                .inner
                .store
                .compare_and_swap_correction(Some(loaded.version), &request)
                .await
            {
                Ok(version) => {
                    return Ok(CorrectionCommit {
                        request,
                        value,
                        version: Some(version),
                    })
                }
                Err(StoreError::Conflict { .. }) => {
                    debug!(request_id = %request_id, attempt, "correction write conflicted, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(
            request_id = %request_id,
            attempts = MAX_TRANSACTION_ATTEMPTS,
            "correction transaction abandoned"
        );
        Err(PolicyError::CorrectionTransactionExhausted {
            request_id: request_id.to_string(),
            attempts: MAX_TRANSACTION_ATTEMPTS,
        })
    }

    async fn match_experts(&self, request: &CorrectionRequest) -> Vec<Expert> {
        let defaults = &self.inner.settings.defaults;
        let query = ExpertQuery {
            user_region: defaults.region.clone(),
            preferred_language: defaults.language.clone(),
            recitation_style: request
                .analysis
                .detected_style
                .clone()
                .unwrap_or_else(|| defaults.recitation_style.clone()),
            urgency: request.priority,
        };

        match self.inner.collaborators.matcher.find_experts(&query).await {
            Ok(experts) => self.engine().eligible_candidates(experts),
            Err(e) => {
                warn!(request_id = %request.id, error = %e, "expert matching failed");
                self.transient_failure(request, "find_experts", &e.to_string());
                Vec::new()
            }
        }
    }

    fn track(&self, request: &CorrectionRequest, candidates: Vec<Expert>) {
        self.tracked_mut().insert(
            request.id.clone(),
            Tracked {
                request: request.clone(),
                candidates,
            },
        );
    }

    /// Replace the local projection with a committed write unless a newer
    /// store update already landed there
    fn refresh(&self, request: &CorrectionRequest) {
        if let Some(entry) = self.tracked_mut().get_mut(&request.id) {
            if request.updated_at >= entry.request.updated_at {
                entry.request = request.clone();
            }
        }
    }

    fn schedule_deadline(&self, request: &CorrectionRequest) {
        let weak = Arc::downgrade(&self.inner);
        let request_id = request.id.clone();
        let delay = request.time_remaining(Utc::now());

        self.inner.scheduler.schedule(request.id.clone(), delay, async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let service = CorrectionService { inner };
            if let Err(e) = service.on_deadline_expired(&request_id).await {
                warn!(request_id = %request_id, error = %e, "deadline handling failed");
            }
        });
    }

    /// Notify the expert and fire the assignment event/webhook
    async fn on_assigned(&self, request: &CorrectionRequest, expert: &Expert) {
        self.inner.bus.publish(DomainEvent::ExpertAssigned {
            request_id: request.id.clone(),
            user_id: request.user_id.clone(),
            expert_id: expert.id.clone(),
            timestamp: Utc::now(),
        });

        let notification = ExpertNotification {
            expert_id: expert.id.clone(),
            correction_request_id: request.id.clone(),
            priority: request.priority,
            estimated_time: expert.average_response_time,
        };
        if let Err(e) = self.inner.collaborators.notifier.notify(&notification).await {
            warn!(request_id = %request.id, expert_id = %expert.id, error = %e, "expert notification failed");
            self.transient_failure(request, "notify_expert", &e.to_string());
        }

        let hook = WebhookEvent::ExpertAssigned {
            request_id: request.id.clone(),
            expert_id: expert.id.clone(),
            user_id: request.user_id.clone(),
            priority: request.priority,
            estimated_time: expert.average_response_time,
        };
        if let Err(e) = self.inner.collaborators.webhooks.deliver(&hook).await {
            warn!(request_id = %request.id, error = %e, "expert webhook failed");
        }
    }

    fn transient_failure(&self, request: &CorrectionRequest, operation: &str, error: &str) {
        self.inner.bus.publish(DomainEvent::TransientFailure {
            user_id: Some(request.user_id.clone()),
            request_id: Some(request.id.clone()),
            operation: operation.to_string(),
            error: error.to_string(),
            severity: NoticeKind::Warning,
            timestamp: Utc::now(),
        });
        self.inner
            .notices
            .warning("Expert service is temporarily unavailable. Your request is still queued.");
    }
}

fn display_name(expert: &Expert) -> &str {
    if expert.name.is_empty() {
        &expert.id
    } else {
        &expert.name
    }
}
