//! Correction State: request lifecycle, experts and review payloads

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a correction request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CorrectionStatus {
    /// Created, no expert yet
    Pending,
    /// An expert has been assigned (or re-assigned by escalation)
    Assigned,
    /// A human has started working on it
    InProgress,
    /// Terminal
    Completed,
}

impl CorrectionStatus {
    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Assigned => 1,
            Self::InProgress => 2,
            Self::Completed => 3,
        }
    }

    /// Whether `next` is a legal move from this status.
    ///
    /// Forward moves are legal, `pending|assigned → assigned` is the
    /// re-assignment edge, and re-applying the current status is a no-op.
    /// Nothing leaves `completed`.
    pub fn can_transition_to(&self, next: CorrectionStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            Self::Completed => false,
            _ => next.rank() > self.rank(),
        }
    }

    /// Deadline escalation only applies while no human has picked the request up
    pub fn is_escalatable(&self) -> bool {
        matches!(self, Self::Pending | Self::Assigned)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl std::fmt::Display for CorrectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Assigned => write!(f, "assigned"),
            Self::InProgress => write!(f, "in-progress"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// Urgency derived from accuracy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Expert seniority tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpertLevel {
    Junior,
    Senior,
    Master,
    Scholar,
}

/// A human reviewer, as reported by the expert-matching service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Expert {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// 0.0 – 5.0
    pub rating: f64,
    pub available: bool,
    pub level: ExpertLevel,
    /// Minutes
    #[serde(default)]
    pub average_response_time: u32,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub years_of_experience: Option<u32>,
    /// Percentage of accepted requests completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_rate: Option<f64>,
    /// Requests currently assigned to this expert
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_requests: Option<u32>,
}

/// Output of the AI analysis service. Only `accuracy` drives policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    /// 0 – 100
    pub accuracy: f64,
    #[serde(default)]
    pub harakat: Vec<serde_json::Value>,
    #[serde(default)]
    pub suggestions: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_style: Option<String>,
}

impl AnalysisResult {
    pub fn with_accuracy(accuracy: f64) -> Self {
        Self {
            accuracy,
            harakat: Vec::new(),
            suggestions: Vec::new(),
            detected_style: None,
        }
    }
}

/// One concrete fix suggested by an expert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    pub original: String,
    pub corrected: String,
    #[serde(default)]
    pub note: String,
}

/// Feedback left by the assigned expert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanFeedback {
    pub assessment: String,
    #[serde(default)]
    pub corrections: Vec<Correction>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

/// Second-layer review by a scholar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScholarReview {
    pub opinion: String,
    pub ruling: String,
    #[serde(default)]
    pub notes: String,
}

/// Why a request was re-assigned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    /// Response guarantee passed with no human pickup
    GuaranteeBreached { overdue_minutes: i64 },
}

impl std::fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GuaranteeBreached { overdue_minutes } => {
                write!(f, "response guarantee breached ({}m overdue)", overdue_minutes)
            }
        }
    }
}

/// Record of an escalation event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub from_expert: Option<String>,
    pub to_expert: String,
    pub reason: EscalationReason,
    pub timestamp: DateTime<Utc>,
}

/// One escalation workflow instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionRequest {
    pub id: String,
    pub user_id: String,
    pub analysis: AnalysisResult,
    pub status: CorrectionStatus,
    pub priority: Priority,
    pub requested_at: DateTime<Utc>,
    /// `requested_at` + guarantee window; never moved by escalation
    pub guaranteed_response_by: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_expert_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_feedback: Option<HumanFeedback>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scholar_review: Option<ScholarReview>,
    #[serde(default)]
    pub escalated: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub escalation_history: Vec<EscalationRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_minutes: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

impl CorrectionRequest {
    pub fn new(
        user_id: impl Into<String>,
        analysis: AnalysisResult,
        priority: Priority,
        requested_at: DateTime<Utc>,
        guarantee: Duration,
    ) -> Self {
        Self {
            id: format!("correction_{}", uuid::Uuid::new_v4().simple()),
            user_id: user_id.into(),
            analysis,
            status: CorrectionStatus::Pending,
            priority,
            requested_at,
            guaranteed_response_by: requested_at + guarantee,
            assigned_expert_id: None,
            human_feedback: None,
            scholar_review: None,
            escalated: false,
            escalation_history: Vec::new(),
            response_time_minutes: None,
            updated_at: requested_at,
        }
    }

    /// Assign (or re-assign) an expert
    pub fn assign(&mut self, expert_id: impl Into<String>, now: DateTime<Utc>) {
        self.assigned_expert_id = Some(expert_id.into());
        self.status = CorrectionStatus::Assigned;
        self.updated_at = now;
    }

    /// Record an escalation and re-assign
    pub fn record_escalation(
        &mut self,
        to_expert: impl Into<String>,
        reason: EscalationReason,
        now: DateTime<Utc>,
    ) {
        let to_expert = to_expert.into();
        self.escalation_history.push(EscalationRecord {
            from_expert: self.assigned_expert_id.clone(),
            to_expert: to_expert.clone(),
            reason,
            timestamp: now,
        });
        self.escalated = true;
        self.assign(to_expert, now);
    }

    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        now >= self.guaranteed_response_by
    }

    /// Time left until the guarantee, zero once passed
    pub fn time_remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.guaranteed_response_by - now)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }

    pub fn summary(&self) -> String {
        format!(
            "request={} user={} status={} priority={} expert={} escalated={}",
            self.id,
            self.user_id,
            self.status,
            self.priority,
            self.assigned_expert_id.as_deref().unwrap_or("-"),
            self.escalated,
        )
    }
}
