//! Domain events published by the progression and correction services

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::escalation::{CorrectionStatus, Priority};
use crate::notices::NoticeKind;
use crate::progression::{MilestoneId, ProgressionEvent};

/// Everything observable that the policy services decide
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    PointsAwarded {
        user_id: String,
        points: u64,
        reason: String,
        total_points: u64,
        timestamp: DateTime<Utc>,
    },

    LevelUp {
        user_id: String,
        previous_level: u32,
        new_level: u32,
        bonus: u64,
        timestamp: DateTime<Utc>,
    },

    MilestoneAchieved {
        user_id: String,
        milestone: MilestoneId,
        points: u64,
        timestamp: DateTime<Utc>,
    },

    /// A low-accuracy analysis opened a correction request
    CorrectionRequested {
        request_id: String,
        user_id: String,
        accuracy: f64,
        priority: Priority,
        guaranteed_response_by: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },

    ExpertAssigned {
        request_id: String,
        user_id: String,
        expert_id: String,
        timestamp: DateTime<Utc>,
    },

    /// Deadline passed and the request moved to a senior expert
    CorrectionEscalated {
        request_id: String,
        user_id: String,
        from_expert: Option<String>,
        to_expert: String,
        timestamp: DateTime<Utc>,
    },

    /// Deadline passed but no senior expert was available
    EscalationUnavailable {
        request_id: String,
        user_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    CorrectionUpdated {
        request_id: String,
        user_id: String,
        previous_status: CorrectionStatus,
        status: CorrectionStatus,
        response_time_minutes: i64,
        timestamp: DateTime<Utc>,
    },

    CorrectionCompleted {
        request_id: String,
        user_id: String,
        response_time_minutes: i64,
        escalated: bool,
        timestamp: DateTime<Utc>,
    },

    /// An external call failed; state was left unchanged
    TransientFailure {
        user_id: Option<String>,
        request_id: Option<String>,
        operation: String,
        error: String,
        severity: NoticeKind,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Convert an engine event into a domain event for `user_id`
    pub fn from_progression(user_id: &str, event: &ProgressionEvent, at: DateTime<Utc>) -> Self {
        let user_id = user_id.to_string();
        match event {
            ProgressionEvent::PointsAwarded {
                points,
                reason,
                total_points,
            } => Self::PointsAwarded {
                user_id,
                points: *points,
                reason: reason.clone(),
                total_points: *total_points,
                timestamp: at,
            },
            ProgressionEvent::LevelUp {
                previous_level,
                new_level,
                bonus,
            } => Self::LevelUp {
                user_id,
                previous_level: *previous_level,
                new_level: *new_level,
                bonus: *bonus,
                timestamp: at,
            },
            ProgressionEvent::MilestoneAchieved { milestone, points } => Self::MilestoneAchieved {
                user_id,
                milestone: *milestone,
                points: *points,
                timestamp: at,
            },
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::PointsAwarded { timestamp, .. } => *timestamp,
            Self::LevelUp { timestamp, .. } => *timestamp,
            Self::MilestoneAchieved { timestamp, .. } => *timestamp,
            Self::CorrectionRequested { timestamp, .. } => *timestamp,
            Self::ExpertAssigned { timestamp, .. } => *timestamp,
            Self::CorrectionEscalated { timestamp, .. } => *timestamp,
            Self::EscalationUnavailable { timestamp, .. } => *timestamp,
            Self::CorrectionUpdated { timestamp, .. } => *timestamp,
            Self::CorrectionCompleted { timestamp, .. } => *timestamp,
            Self::TransientFailure { timestamp, .. } => *timestamp,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::PointsAwarded { .. } => "points_awarded",
            Self::LevelUp { .. } => "level_up",
            Self::MilestoneAchieved { .. } => "milestone_achieved",
            Self::CorrectionRequested { .. } => "correction_requested",
            Self::ExpertAssigned { .. } => "expert_assigned",
            Self::CorrectionEscalated { .. } => "correction_escalated",
            Self::EscalationUnavailable { .. } => "escalation_unavailable",
            Self::CorrectionUpdated { .. } => "correction_updated",
            Self::CorrectionCompleted { .. } => "correction_completed",
            Self::TransientFailure { .. } => "transient_failure",
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::PointsAwarded { user_id, .. }
            | Self::LevelUp { user_id, .. }
            | Self::MilestoneAchieved { user_id, .. }
            | Self::CorrectionRequested { user_id, .. }
            | Self::ExpertAssigned { user_id, .. }
            | Self::CorrectionEscalated { user_id, .. }
            | Self::EscalationUnavailable { user_id, .. }
            | Self::CorrectionUpdated { user_id, .. }
            | Self::CorrectionCompleted { user_id, .. } => Some(user_id),
            Self::TransientFailure { user_id, .. } => user_id.as_deref(),
        }
    }

    /// Correction request this event is scoped to, if any
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::CorrectionRequested { request_id, .. }
            | Self::ExpertAssigned { request_id, .. }
            | Self::CorrectionEscalated { request_id, .. }
            | Self::EscalationUnavailable { request_id, .. }
            | Self::CorrectionUpdated { request_id, .. }
            | Self::CorrectionCompleted { request_id, .. } => Some(request_id),
            Self::TransientFailure { request_id, .. } => request_id.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_tag_matches_event_type() {
        let event = DomainEvent::EscalationUnavailable {
            request_id: "correction_1".to_string(),
            user_id: "u1".to_string(),
            reason: "no senior".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.event_type());
        assert_eq!(event.request_id(), Some("correction_1"));
    }

    #[test]
    fn test_from_progression_keeps_fields() {
        let at = Utc::now();
        let event = DomainEvent::from_progression(
            "u7",
            &ProgressionEvent::LevelUp {
                previous_level: 1,
                new_level: 2,
                bonus: 200,
            },
            at,
        );
        assert_eq!(event.event_type(), "level_up");
        assert_eq!(event.user_id(), Some("u7"));
        assert_eq!(event.request_id(), None);
        assert_eq!(event.timestamp(), at);
    }
}
