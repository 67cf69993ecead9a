//! Per-user session loop
//!
//! Each user gets one tokio task reading an mpsc channel, so events for the
//! same user are handled one at a time in arrival order. Failures inside a
//! handler are logged and counted; the loop keeps going.
//!
//! Progression and correction are independent: a progress write that fails
//! for an analysis is reported to the user and the correction check still
//! runs.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::correction_service::{CorrectionService, InitiateOutcome};
use crate::escalation::AnalysisResult;
use crate::notices::NoticeLog;
use crate::progression::MilestoneId;
use crate::progression_service::ProgressionService;
use crate::services::{AnalysisRequest, RecitationAnalyzer};
use crate::store::DocumentStore;
use crate::{PolicyError, PolicyResult};

/// Buffered events per session before `send` waits
pub const SESSION_CHANNEL_CAPACITY: usize = 64;

/// Learner-side event delivered to a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    AnalysisCompleted { analysis: AnalysisResult },
    StreakUpdated { streak_days: u32 },
    MilestoneEarned { milestone: MilestoneId },
}

/// Counters returned when a session closes
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSummary {
    pub user_id: String,
    pub processed: usize,
    pub failures: usize,
    pub points_awarded: u64,
    pub corrections_opened: usize,
    pub last_accuracy: Option<f64>,
}

/// Handle to a running per-user session
pub struct UserSession {
    user_id: String,
    sender: mpsc::Sender<SessionEvent>,
    handle: JoinHandle<SessionSummary>,
    notices: Arc<NoticeLog>,
}

impl UserSession {
    /// Spawn the session task.
    ///
    /// `last_accuracy` seeds the accuracy the first analysis is compared to;
    /// with `None` the first analysis only records a baseline.
    pub fn spawn<S: DocumentStore + 'static>(
        user_id: impl Into<String>,
        last_accuracy: Option<f64>,
        progression: Arc<ProgressionService<S>>,
        corrections: CorrectionService<S>,
    ) -> Self {
        let user_id = user_id.into();
        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
        let notices = corrections.notices();
        let worker = SessionWorker {
            summary: SessionSummary {
                user_id: user_id.clone(),
                last_accuracy,
                ..SessionSummary::default()
            },
            progression,
            corrections,
            notices: Arc::clone(&notices),
        };
        let handle = tokio::spawn(worker.run(receiver));
        Self {
            user_id,
            sender,
            handle,
            notices,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub async fn send(&self, event: SessionEvent) -> PolicyResult<()> {
        self.sender
            .send(event)
            .await
            .map_err(|_| PolicyError::SessionClosed(self.user_id.clone()))
    }

    /// Score a recitation and queue the result as `AnalysisCompleted`.
    ///
    /// An analyzer failure is shown to the user and nothing is queued.
    pub async fn submit_recitation(
        &self,
        analyzer: &dyn RecitationAnalyzer,
        request: &AnalysisRequest,
    ) -> PolicyResult<AnalysisResult> {
        let analysis = match analyzer.analyze(request).await {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!(user_id = %self.user_id, error = %e, "recitation analysis failed");
                self.notices
                    .warning("Recitation analysis is unavailable right now. Please try again.");
                return Err(e.into());
            }
        };
        debug!(user_id = %self.user_id, accuracy = analysis.accuracy, "recitation analyzed");
        self.send(SessionEvent::AnalysisCompleted {
            analysis: analysis.clone(),
        })
        .await?;
        Ok(analysis)
    }

    /// Stop accepting events, wait for the backlog to drain
    pub async fn close(self) -> PolicyResult<SessionSummary> {
        drop(self.sender);
        self.handle
            .await
            .map_err(|_| PolicyError::SessionClosed(self.user_id))
    }
}

struct SessionWorker<S> {
    summary: SessionSummary,
    progression: Arc<ProgressionService<S>>,
    corrections: CorrectionService<S>,
    notices: Arc<NoticeLog>,
}

impl<S: DocumentStore + 'static> SessionWorker<S> {
    async fn run(mut self, mut receiver: mpsc::Receiver<SessionEvent>) -> SessionSummary {
        info!(user_id = %self.summary.user_id, "session started");

        while let Some(event) = receiver.recv().await {
            debug!(user_id = %self.summary.user_id, ?event, "session event");
            if let Err(e) = self.handle(event).await {
                self.summary.failures += 1;
                warn!(user_id = %self.summary.user_id, error = %e, "session event failed");
            }
            self.summary.processed += 1;
        }

        info!(
            user_id = %self.summary.user_id,
            processed = self.summary.processed,
            failures = self.summary.failures,
            "session closed"
        );
        self.summary
    }

    async fn handle(&mut self, event: SessionEvent) -> PolicyResult<()> {
        let user_id = self.summary.user_id.clone();
        match event {
            SessionEvent::AnalysisCompleted { analysis } => {
                let current = analysis.accuracy;
                if let Some(previous) = self.summary.last_accuracy {
                    match self
                        .progression
                        .record_accuracy_change(&user_id, previous, current)
                        .await
                    {
                        Ok(committed) => {
                            self.summary.points_awarded += committed.outcome.awarded_points
                        }
                        // bad input, not an outage
                        Err(e @ PolicyError::Progression(_)) => return Err(e),
                        Err(e) => self.progress_not_saved(&e),
                    }
                }
                self.summary.last_accuracy = Some(current);

                if let InitiateOutcome::Created { .. } =
                    self.corrections.initiate(&user_id, analysis).await?
                {
                    self.summary.corrections_opened += 1;
                }
            }
            SessionEvent::StreakUpdated { streak_days } => {
                let committed = self
                    .progression
                    .record_daily_streak(&user_id, streak_days)
                    .await?;
                self.summary.points_awarded += committed.outcome.awarded_points;
            }
            SessionEvent::MilestoneEarned { milestone } => {
                let committed = self.progression.award_milestone(&user_id, milestone).await?;
                self.summary.points_awarded += committed.outcome.awarded_points;
            }
        }
        Ok(())
    }

    fn progress_not_saved(&mut self, error: &PolicyError) {
        self.summary.failures += 1;
        warn!(
            user_id = %self.summary.user_id,
            error = %error,
            transient = error.is_transient(),
            "progress update skipped"
        );
        if error.is_transient() {
            self.notices
                .warning("Points could not be saved right now. Please try again later.");
        } else {
            self.notices.error("Points could not be saved.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correction_service::{Collaborators, CorrectionSettings};
    use crate::escalation::{CorrectionRequest, Expert, ExpertLevel};
    use crate::events::EventBus;
    use crate::notices::NoticeKind;
    use crate::progression::{ProgressionEngine, UserProgress};
    use crate::services::{
        MockExpertMatcher, MockExpertNotifier, MockRecitationAnalyzer, ServiceError,
    };
    use crate::store::{DocumentChange, MemoryStore, StoreError, StoreResult, Versioned};
    use async_trait::async_trait;
    use tokio::sync::broadcast;

    /// Progress documents are unreachable; corrections work
    #[derive(Default)]
    struct ProgressOutage {
        inner: MemoryStore,
    }

    #[async_trait]
    impl DocumentStore for ProgressOutage {
        async fn load_progress(
            &self,
            _user_id: &str,
        ) -> StoreResult<Option<Versioned<UserProgress>>> {
            Err(StoreError::Unavailable("progress backend offline".to_string()))
        }

        async fn compare_and_swap_progress(
            &self,
            _user_id: &str,
            _expected_version: Option<u64>,
            _progress: &UserProgress,
        ) -> StoreResult<u64> {
            Err(StoreError::Unavailable("progress backend offline".to_string()))
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

    fn session(
        last_accuracy: Option<f64>,
    ) -> (UserSession, Arc<MemoryStore>, CorrectionService<MemoryStore>) {
        let store = MemoryStore::new().shared();
        let (session, corrections) = session_on(store.clone(), last_accuracy);
        (session, store, corrections)
    }

    fn session_on<S: DocumentStore + 'static>(
        store: Arc<S>,
        last_accuracy: Option<f64>,
    ) -> (UserSession, CorrectionService<S>) {
        let bus = EventBus::new().shared();

        let mut matcher = MockExpertMatcher::new();
        matcher.expect_find_experts().returning(|_| {
            Ok(vec![Expert {
                id: "j1".to_string(),
                name: "Hafiz J".to_string(),
                rating: 4.9,
                available: true,
                level: ExpertLevel::Junior,
                average_response_time: 10,
                languages: Vec::new(),
                region: "global".to_string(),
                years_of_experience: None,
                completion_rate: None,
                active_requests: None,
            }])
        });
        let mut notifier = MockExpertNotifier::new();
        notifier.expect_notify().returning(|_| Ok(()));

        let progression = Arc::new(ProgressionService::new(
            store.clone(),
            ProgressionEngine::new(),
            bus.clone(),
        ));
        let corrections = CorrectionService::new(
            store.clone(),
            bus,
            Collaborators::new(Arc::new(matcher), Arc::new(notifier)),
            CorrectionSettings::default(),
        );
        let session = UserSession::spawn("u1", last_accuracy, progression, corrections.clone());
        (session, corrections)
    }

    fn recitation() -> AnalysisRequest {
        AnalysisRequest {
            audio_data: "UklGRg==".to_string(),
            analysis_type: "tajweed".to_string(),
            accuracy: 99.9,
        }
    }

    #[tokio::test]
    async fn test_first_analysis_sets_baseline_only() {
        let (session, store, corrections) = session(None);
        session
            .send(SessionEvent::AnalysisCompleted {
                analysis: AnalysisResult::with_accuracy(97.0),
            })
            .await
            .unwrap();
        let summary = session.close().await.unwrap();

        assert_eq!(summary.processed, 1);
        assert_eq!(summary.points_awarded, 0);
        assert_eq!(summary.last_accuracy, Some(97.0));
        assert!(store.load_progress("u1").await.unwrap().is_none());
        assert!(corrections.requests().is_empty());
    }

    #[tokio::test]
    async fn test_events_processed_in_order() {
        let (session, store, corrections) = session(Some(60.0));
        session
            .send(SessionEvent::AnalysisCompleted {
                analysis: AnalysisResult::with_accuracy(70.0),
            })
            .await
            .unwrap();
        session
            .send(SessionEvent::StreakUpdated { streak_days: 7 })
            .await
            .unwrap();
        session
            .send(SessionEvent::MilestoneEarned {
                milestone: MilestoneId::FirstRecitation,
            })
            .await
            .unwrap();
        let summary = session.close().await.unwrap();

        assert_eq!(summary.processed, 3);
        assert_eq!(summary.failures, 0);
        assert_eq!(summary.corrections_opened, 1);
        // 100 improvement + 300 weekly streak + 100 first recitation
        assert_eq!(summary.points_awarded, 500);

        let stored = store.load_progress("u1").await.unwrap().unwrap();
        assert_eq!(stored.value.total_points, 500);
        assert_eq!(corrections.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_accuracy_counts_as_failure() {
        let (session, _store, _corrections) = session(Some(60.0));
        session
            .send(SessionEvent::AnalysisCompleted {
                analysis: AnalysisResult::with_accuracy(140.0),
            })
            .await
            .unwrap();
        let summary = session.close().await.unwrap();

        assert_eq!(summary.processed, 1);
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.last_accuracy, Some(60.0));
    }

    #[tokio::test]
    async fn test_progress_outage_still_opens_correction() {
        let store = Arc::new(ProgressOutage::default());
        let (session, corrections) = session_on(store, Some(70.0));
        session
            .send(SessionEvent::AnalysisCompleted {
                analysis: AnalysisResult::with_accuracy(60.0),
            })
            .await
            .unwrap();
        let summary = session.close().await.unwrap();

        assert_eq!(summary.processed, 1);
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.points_awarded, 0);
        assert_eq!(summary.corrections_opened, 1);
        assert_eq!(summary.last_accuracy, Some(60.0));
        assert_eq!(corrections.requests().len(), 1);
        assert!(corrections
            .notices()
            .snapshot()
            .iter()
            .any(|n| n.kind == NoticeKind::Warning && n.message.starts_with("Points")));
    }

    #[tokio::test]
    async fn test_submit_recitation_queues_analysis() {
        let (session, _store, corrections) = session(None);
        let mut analyzer = MockRecitationAnalyzer::new();
        analyzer
            .expect_analyze()
            .withf(|r| r.analysis_type == "tajweed")
            .times(1)
            .returning(|_| Ok(AnalysisResult::with_accuracy(64.0)));

        let analysis = session
            .submit_recitation(&analyzer, &recitation())
            .await
            .unwrap();
        assert_eq!(analysis.accuracy, 64.0);

        let summary = session.close().await.unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.last_accuracy, Some(64.0));
        assert_eq!(summary.corrections_opened, 1);
        assert_eq!(corrections.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_analyzer_failure_queues_nothing() {
        let (session, _store, corrections) = session(Some(80.0));
        let mut analyzer = MockRecitationAnalyzer::new();
        analyzer
            .expect_analyze()
            .returning(|_| Err(ServiceError::Status { status: 503, body: String::new() }));

        let err = session
            .submit_recitation(&analyzer, &recitation())
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let summary = session.close().await.unwrap();
        assert_eq!(summary.processed, 0);
        assert_eq!(summary.last_accuracy, Some(80.0));
        assert_eq!(
            corrections.notices().snapshot()[0].kind,
            NoticeKind::Warning
        );
    }

    #[test]
    fn test_session_event_wire_format() {
        let event: SessionEvent =
            serde_json::from_str(r#"{"event":"streak_updated","streak_days":30}"#).unwrap();
        assert_eq!(event, SessionEvent::StreakUpdated { streak_days: 30 });
    }
}
