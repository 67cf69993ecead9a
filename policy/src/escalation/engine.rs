//! Escalation Engine: deterministic correction-request decisions
//!
//! Consumes analysis results, expert lists and external status updates and
//! produces `EscalationDecision`s over a `CorrectionRequest`. No timers or
//! I/O live here; `DeadlineScheduler` and `correction_service` drive it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::state::{
    AnalysisResult, CorrectionRequest, CorrectionStatus, EscalationReason, Expert, ExpertLevel,
    HumanFeedback, Priority, ScholarReview,
};

/// Errors raised by the escalation engine
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EscalationError {
    #[error("illegal status transition {from} -> {to} for request {request_id}")]
    InvalidTransition {
        request_id: String,
        from: CorrectionStatus,
        to: CorrectionStatus,
    },

    #[error("update for request {got} applied to request {expected}")]
    RequestMismatch { expected: String, got: String },
}

/// Decision produced when a request is assigned or its deadline fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum EscalationDecision {
    /// First expert assigned at initiation
    Assigned { expert: Expert },
    /// Deadline passed, request moved to a senior expert
    Escalated {
        from_expert: Option<String>,
        to_expert: Expert,
    },
    /// No expert qualified; the request is left untouched
    NoCandidate { reason: String },
    /// The request has moved past the point where escalation applies
    NotApplicable { status: CorrectionStatus },
}

impl EscalationDecision {
    /// Expert newly put on the request, if any
    pub fn assigned_expert(&self) -> Option<&Expert> {
        match self {
            Self::Assigned { expert } => Some(expert),
            Self::Escalated { to_expert, .. } => Some(to_expert),
            _ => None,
        }
    }
}

/// Status change reported by the document store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalUpdate {
    pub request_id: String,
    pub status: CorrectionStatus,
    #[serde(default)]
    pub human_feedback: Option<HumanFeedback>,
    #[serde(default)]
    pub scholar_review: Option<ScholarReview>,
    pub updated_at: DateTime<Utc>,
}

impl ExternalUpdate {
    /// Project a stored request document into an update
    pub fn from_request(request: &CorrectionRequest) -> Self {
        Self {
            request_id: request.id.clone(),
            status: request.status,
            human_feedback: request.human_feedback.clone(),
            scholar_review: request.scholar_review.clone(),
            updated_at: request.updated_at,
        }
    }
}

/// What applying an external update changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub previous_status: CorrectionStatus,
    pub status: CorrectionStatus,
    pub response_time_minutes: i64,
    /// True only on the update that first reached `completed`
    pub newly_completed: bool,
}

impl UpdateOutcome {
    pub fn status_changed(&self) -> bool {
        self.previous_status != self.status
    }
}

/// Configuration for the Escalation Engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Analyses strictly below this accuracy open a request
    pub correction_threshold: f64,
    /// Accuracy below this is high priority
    pub high_priority_below: f64,
    /// Accuracy below this (and not high) is medium priority
    pub medium_priority_below: f64,
    /// Response guarantee window, seconds
    pub guarantee_secs: i64,
    /// Minimum rating for a candidate expert
    pub min_rating: f64,
    /// Applied only when the expert reports years of experience
    pub min_experience_years: Option<u32>,
    /// Applied only when the expert reports a completion rate
    pub min_completion_rate: Option<f64>,
    /// Applied only when the expert reports its open request count
    pub max_concurrent_requests: Option<u32>,
    /// Tier targeted by deadline escalation
    pub escalation_level: ExpertLevel,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            correction_threshold: 95.0,
            high_priority_below: 70.0,
            medium_priority_below: 85.0,
            guarantee_secs: 30 * 60,
            min_rating: 4.5,
            min_experience_years: None,
            min_completion_rate: None,
            max_concurrent_requests: None,
            escalation_level: ExpertLevel::Senior,
        }
    }
}

/// The Escalation Engine
#[derive(Debug, Clone, Default)]
pub struct EscalationEngine {
    config: EscalationConfig,
}

impl EscalationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: EscalationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EscalationConfig {
        &self.config
    }

    pub fn guarantee(&self) -> Duration {
        Duration::seconds(self.config.guarantee_secs)
    }

    pub fn needs_correction(&self, analysis: &AnalysisResult) -> bool {
        analysis.accuracy < self.config.correction_threshold
    }

    pub fn priority_for(&self, accuracy: f64) -> Priority {
        if accuracy < self.config.high_priority_below {
            Priority::High
        } else if accuracy < self.config.medium_priority_below {
            Priority::Medium
        } else {
            Priority::Low
        }
    }

    /// Open a request for a low-accuracy analysis; `None` when none is needed
    pub fn open_request(
        &self,
        user_id: &str,
        analysis: &AnalysisResult,
        now: DateTime<Utc>,
    ) -> Option<CorrectionRequest> {
        if !self.needs_correction(analysis) {
            return None;
        }
        Some(CorrectionRequest::new(
            user_id,
            analysis.clone(),
            self.priority_for(analysis.accuracy),
            now,
            self.guarantee(),
        ))
    }

    /// Whether an expert passes the candidate filter
    pub fn is_eligible(&self, expert: &Expert) -> bool {
        if !expert.available || expert.rating < self.config.min_rating {
            return false;
        }
        if let (Some(min), Some(years)) = (self.config.min_experience_years, expert.years_of_experience)
        {
            if years < min {
                return false;
            }
        }
        if let (Some(min), Some(rate)) = (self.config.min_completion_rate, expert.completion_rate) {
            if rate < min {
                return false;
            }
        }
        if let (Some(max), Some(open)) = (self.config.max_concurrent_requests, expert.active_requests)
        {
            if open >= max {
                return false;
            }
        }
        true
    }

    /// Filter the matcher's list, keeping its order
    pub fn eligible_candidates(&self, experts: Vec<Expert>) -> Vec<Expert> {
        experts.into_iter().filter(|e| self.is_eligible(e)).collect()
    }

    /// Assign the first candidate to a freshly opened request
    pub fn assign_initial(
        &self,
        request: &mut CorrectionRequest,
        candidates: &[Expert],
        now: DateTime<Utc>,
    ) -> EscalationDecision {
        if !request.status.is_escalatable() {
            return EscalationDecision::NotApplicable {
                status: request.status,
            };
        }
        match candidates.first() {
            Some(expert) => {
                request.assign(expert.id.clone(), now);
                EscalationDecision::Assigned {
                    expert: expert.clone(),
                }
            }
            None => EscalationDecision::NoCandidate {
                reason: "no expert passed the candidate filter".to_string(),
            },
        }
    }

    /// Deadline policy: re-assign to a senior expert if nobody picked it up.
    ///
    /// The guarantee window is never moved.
    pub fn on_deadline_expired(
        &self,
        request: &mut CorrectionRequest,
        candidates: &[Expert],
        now: DateTime<Utc>,
    ) -> EscalationDecision {
        if !request.status.is_escalatable() {
            return EscalationDecision::NotApplicable {
                status: request.status,
            };
        }

        let current = request.assigned_expert_id.as_deref();
        let senior = candidates.iter().find(|e| {
            e.available && e.level == self.config.escalation_level && Some(e.id.as_str()) != current
        });

        match senior {
            Some(expert) => {
                let from_expert = request.assigned_expert_id.clone();
                let overdue_minutes = (now - request.guaranteed_response_by).num_minutes().max(0);
                request.record_escalation(
                    expert.id.clone(),
                    EscalationReason::GuaranteeBreached { overdue_minutes },
                    now,
                );
                EscalationDecision::Escalated {
                    from_expert,
                    to_expert: expert.clone(),
                }
            }
            None => EscalationDecision::NoCandidate {
                reason: format!(
                    "no available {:?} expert in candidate pool",
                    self.config.escalation_level
                )
                .to_lowercase(),
            },
        }
    }

    /// Apply a status change observed in the store
    pub fn apply_update(
        &self,
        request: &mut CorrectionRequest,
        update: &ExternalUpdate,
    ) -> Result<UpdateOutcome, EscalationError> {
        if update.request_id != request.id {
            return Err(EscalationError::RequestMismatch {
                expected: request.id.clone(),
                got: update.request_id.clone(),
            });
        }

        let previous_status = request.status;
        if !previous_status.can_transition_to(update.status) {
            return Err(EscalationError::InvalidTransition {
                request_id: request.id.clone(),
                from: previous_status,
                to: update.status,
            });
        }

        request.status = update.status;
        if let Some(feedback) = &update.human_feedback {
            request.human_feedback = Some(feedback.clone());
        }
        if let Some(review) = &update.scholar_review {
            request.scholar_review = Some(review.clone());
        }
        let response_time_minutes = response_time_minutes(request.requested_at, update.updated_at);
        request.response_time_minutes = Some(response_time_minutes);
        if update.updated_at > request.updated_at {
            request.updated_at = update.updated_at;
        }

        Ok(UpdateOutcome {
            previous_status,
            status: request.status,
            response_time_minutes,
            newly_completed: request.status == CorrectionStatus::Completed
                && previous_status != CorrectionStatus::Completed,
        })
    }
}

/// Whole minutes between request creation and an update, never negative
pub fn response_time_minutes(requested_at: DateTime<Utc>, updated_at: DateTime<Utc>) -> i64 {
    (updated_at - requested_at).num_minutes().max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expert(id: &str, level: ExpertLevel, rating: f64, available: bool) -> Expert {
        Expert {
            id: id.to_string(),
            name: format!("Expert {}", id),
            rating,
            available,
            level,
            average_response_time: 15,
            languages: vec!["english".to_string()],
            region: "global".to_string(),
            years_of_experience: None,
            completion_rate: None,
            active_requests: None,
        }
    }

    fn open(engine: &EscalationEngine, accuracy: f64) -> CorrectionRequest {
        engine
            .open_request("u1", &AnalysisResult::with_accuracy(accuracy), Utc::now())
            .unwrap()
    }

    #[test]
    fn test_threshold_guard() {
        let engine = EscalationEngine::new();
        let now = Utc::now();
        assert!(engine
            .open_request("u1", &AnalysisResult::with_accuracy(95.0), now)
            .is_none());
        assert!(engine
            .open_request("u1", &AnalysisResult::with_accuracy(94.99), now)
            .is_some());
    }

    #[test]
    fn test_priority_bands() {
        let engine = EscalationEngine::new();
        assert_eq!(engine.priority_for(65.0), Priority::High);
        assert_eq!(engine.priority_for(70.0), Priority::Medium);
        assert_eq!(engine.priority_for(84.9), Priority::Medium);
        assert_eq!(engine.priority_for(85.0), Priority::Low);
        assert_eq!(engine.priority_for(92.0), Priority::Low);
    }

    #[test]
    fn test_guarantee_window_from_request_time() {
        let engine = EscalationEngine::new();
        let now = Utc::now();
        let req = engine
            .open_request("u1", &AnalysisResult::with_accuracy(65.0), now)
            .unwrap();
        assert_eq!(req.priority, Priority::High);
        assert_eq!(req.status, CorrectionStatus::Pending);
        assert_eq!(req.guaranteed_response_by - req.requested_at, Duration::minutes(30));
    }

    #[test]
    fn test_candidate_filter_keeps_order() {
        let engine = EscalationEngine::new();
        let experts = vec![
            expert("a", ExpertLevel::Junior, 4.4, true),
            expert("b", ExpertLevel::Junior, 4.9, false),
            expert("c", ExpertLevel::Master, 4.5, true),
            expert("d", ExpertLevel::Senior, 4.7, true),
        ];
        let ids: Vec<String> = engine
            .eligible_candidates(experts)
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["c", "d"]);
    }

    #[test]
    fn test_optional_minimums_apply_only_when_reported() {
        let engine = EscalationEngine::with_config(EscalationConfig {
            min_experience_years: Some(2),
            min_completion_rate: Some(95.0),
            ..Default::default()
        });
        let mut unknown = expert("a", ExpertLevel::Junior, 4.8, true);
        assert!(engine.is_eligible(&unknown));
        unknown.years_of_experience = Some(1);
        assert!(!engine.is_eligible(&unknown));
        unknown.years_of_experience = Some(3);
        unknown.completion_rate = Some(90.0);
        assert!(!engine.is_eligible(&unknown));
        unknown.completion_rate = Some(97.5);
        assert!(engine.is_eligible(&unknown));

        let busy_limit = EscalationEngine::with_config(EscalationConfig {
            max_concurrent_requests: Some(5),
            ..Default::default()
        });
        unknown.active_requests = Some(5);
        assert!(!busy_limit.is_eligible(&unknown));
        unknown.active_requests = Some(4);
        assert!(busy_limit.is_eligible(&unknown));
    }

    #[test]
    fn test_assign_first_candidate() {
        let engine = EscalationEngine::new();
        let mut req = open(&engine, 80.0);
        let pool = vec![
            expert("x", ExpertLevel::Junior, 4.6, true),
            expert("y", ExpertLevel::Senior, 4.9, true),
        ];
        let decision = engine.assign_initial(&mut req, &pool, Utc::now());
        assert_eq!(decision.assigned_expert().map(|e| e.id.as_str()), Some("x"));
        assert_eq!(req.status, CorrectionStatus::Assigned);

        let mut empty = open(&engine, 80.0);
        assert!(matches!(
            engine.assign_initial(&mut empty, &[], Utc::now()),
            EscalationDecision::NoCandidate { .. }
        ));
        assert_eq!(empty.status, CorrectionStatus::Pending);
    }

    #[test]
    fn test_deadline_escalates_to_other_senior() {
        let engine = EscalationEngine::new();
        let mut req = open(&engine, 60.0);
        let pool = vec![
            expert("s1", ExpertLevel::Senior, 4.9, true),
            expert("s2", ExpertLevel::Senior, 4.8, true),
        ];
        engine.assign_initial(&mut req, &pool, Utc::now());
        assert_eq!(req.assigned_expert_id.as_deref(), Some("s1"));

        let at = req.guaranteed_response_by;
        let decision = engine.on_deadline_expired(&mut req, &pool, at);
        match decision {
            EscalationDecision::Escalated {
                from_expert,
                to_expert,
            } => {
                assert_eq!(from_expert.as_deref(), Some("s1"));
                assert_eq!(to_expert.id, "s2");
            }
            other => panic!("unexpected decision: {:?}", other),
        }
        assert!(req.escalated);
        assert_eq!(req.status, CorrectionStatus::Assigned);
        assert_eq!(req.guaranteed_response_by - req.requested_at, Duration::minutes(30));
    }

    #[test]
    fn test_deadline_without_senior_leaves_request() {
        let engine = EscalationEngine::new();
        let mut req = open(&engine, 60.0);
        let pool = vec![expert("j", ExpertLevel::Junior, 4.9, true)];
        engine.assign_initial(&mut req, &pool, Utc::now());
        let before = req.clone();

        let decision = engine.on_deadline_expired(&mut req, &pool, Utc::now());
        assert!(matches!(decision, EscalationDecision::NoCandidate { .. }));
        assert_eq!(req, before);
    }

    #[test]
    fn test_deadline_ignored_once_in_progress() {
        let engine = EscalationEngine::new();
        let mut req = open(&engine, 60.0);
        let pool = vec![expert("s1", ExpertLevel::Senior, 4.9, true)];
        req.status = CorrectionStatus::InProgress;

        let decision = engine.on_deadline_expired(&mut req, &pool, Utc::now());
        assert_eq!(
            decision,
            EscalationDecision::NotApplicable {
                status: CorrectionStatus::InProgress
            }
        );
        assert!(!req.escalated);
    }

    #[test]
    fn test_apply_update_records_response_time() {
        let engine = EscalationEngine::new();
        let mut req = open(&engine, 60.0);
        let update = ExternalUpdate {
            request_id: req.id.clone(),
            status: CorrectionStatus::InProgress,
            human_feedback: None,
            scholar_review: None,
            updated_at: req.requested_at + Duration::seconds(12 * 60 + 59),
        };

        let outcome = engine.apply_update(&mut req, &update).unwrap();
        assert!(outcome.status_changed());
        assert_eq!(outcome.response_time_minutes, 12);
        assert!(!outcome.newly_completed);
        assert_eq!(req.response_time_minutes, Some(12));
    }

    #[test]
    fn test_apply_update_completion_and_feedback() {
        let engine = EscalationEngine::new();
        let mut req = open(&engine, 60.0);
        let update = ExternalUpdate {
            request_id: req.id.clone(),
            status: CorrectionStatus::Completed,
            human_feedback: Some(HumanFeedback {
                assessment: "Good effort".to_string(),
                corrections: Vec::new(),
                recommendations: vec!["Practice madd".to_string()],
            }),
            scholar_review: None,
            updated_at: req.requested_at + Duration::minutes(20),
        };

        let outcome = engine.apply_update(&mut req, &update).unwrap();
        assert!(outcome.newly_completed);
        assert!(req.human_feedback.is_some());

        // echo of the same status is accepted but not "newly" completed
        let again = engine.apply_update(&mut req, &update).unwrap();
        assert!(!again.newly_completed);
    }

    #[test]
    fn test_apply_update_rejects_leaving_completed() {
        let engine = EscalationEngine::new();
        let mut req = open(&engine, 60.0);
        req.status = CorrectionStatus::Completed;
        let update = ExternalUpdate {
            request_id: req.id.clone(),
            status: CorrectionStatus::Assigned,
            human_feedback: None,
            scholar_review: None,
            updated_at: Utc::now(),
        };
        assert!(matches!(
            engine.apply_update(&mut req, &update),
            Err(EscalationError::InvalidTransition { .. })
        ));
        assert_eq!(req.status, CorrectionStatus::Completed);
    }

    #[test]
    fn test_apply_update_rejects_other_request() {
        let engine = EscalationEngine::new();
        let mut req = open(&engine, 60.0);
        let update = ExternalUpdate {
            request_id: "correction_other".to_string(),
            status: CorrectionStatus::InProgress,
            human_feedback: None,
            scholar_review: None,
            updated_at: Utc::now(),
        };
        assert!(matches!(
            engine.apply_update(&mut req, &update),
            Err(EscalationError::RequestMismatch { .. })
        ));
    }
}
