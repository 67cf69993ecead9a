//! Progression State: per-user points, level, earnings and achievements

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::levels::{self, LevelThreshold, MIN_LEVEL};
use super::milestones::MilestoneId;

/// Number of earnings kept in `recent_earnings`
pub const RECENT_EARNINGS_CAP: usize = 10;

/// What an earning was awarded for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EarningKind {
    /// Accuracy went up between two recitations
    RecitationImprovement {
        /// Accuracy delta in percentage points
        improvement: f64,
        /// Accuracy of the new recitation
        accuracy: f64,
        /// Points before the bonus multiplier
        base_points: u64,
        /// Multiplier applied to `base_points`
        bonus_multiplier: f64,
    },
    /// A catalogue milestone was reached
    MilestoneAchievement {
        milestone: String,
        achievement_id: MilestoneId,
    },
    /// Bonus paid when a new level is reached
    LevelUp { new_level: u32, bonus: u64 },
}

impl EarningKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::RecitationImprovement { .. } => "recitation_improvement",
            Self::MilestoneAchievement { .. } => "milestone_achievement",
            Self::LevelUp { .. } => "level_up",
        }
    }
}

/// A single points award. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Earning {
    pub points: u64,
    pub timestamp: DateTime<Utc>,
    pub metadata: EarningKind,
}

impl Earning {
    /// Improvement delta, for recitation-improvement earnings
    pub fn improvement(&self) -> Option<f64> {
        match self.metadata {
            EarningKind::RecitationImprovement { improvement, .. } => Some(improvement),
            _ => None,
        }
    }
}

/// Record kept for each milestone a user holds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Achievement {
    pub name: String,
    pub points: u64,
    pub icon: String,
    pub achieved_at: DateTime<Utc>,
}

/// Per-user progression aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProgress {
    pub user_id: String,
    pub total_points: u64,
    pub current_level: u32,
    /// Newest last, at most `RECENT_EARNINGS_CAP` entries
    #[serde(default)]
    pub recent_earnings: Vec<Earning>,
    /// Insertion-ordered, append-only
    #[serde(default)]
    pub milestones: Vec<MilestoneId>,
    #[serde(default)]
    pub achievements: BTreeMap<MilestoneId, Achievement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level_up_at: Option<DateTime<Utc>>,
}

impl UserProgress {
    /// Default state for a user with no stored document
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            total_points: 0,
            current_level: MIN_LEVEL,
            recent_earnings: Vec::new(),
            milestones: Vec::new(),
            achievements: BTreeMap::new(),
            last_updated: None,
            level_up_at: None,
        }
    }

    pub fn has_milestone(&self, id: MilestoneId) -> bool {
        self.milestones.contains(&id)
    }

    /// Append an earning, dropping the oldest entries past the cap
    pub(crate) fn push_earning(&mut self, earning: Earning) {
        self.recent_earnings.push(earning);
        if self.recent_earnings.len() > RECENT_EARNINGS_CAP {
            let excess = self.recent_earnings.len() - RECENT_EARNINGS_CAP;
            self.recent_earnings.drain(..excess);
        }
    }

    /// Last `n` recitation-improvement earnings, oldest first
    pub fn recent_improvements(&self, n: usize) -> Vec<&Earning> {
        let mut picked: Vec<&Earning> = self
            .recent_earnings
            .iter()
            .rev()
            .filter(|e| matches!(e.metadata, EarningKind::RecitationImprovement { .. }))
            .take(n)
            .collect();
        picked.reverse();
        picked
    }

    pub fn level_info(&self) -> &'static LevelThreshold {
        LevelThreshold::for_level(self.current_level)
    }

    pub fn points_to_next_level(&self) -> u64 {
        levels::points_to_next_level(self.total_points, self.current_level)
    }

    pub fn progress_percentage(&self) -> f64 {
        levels::progress_percentage(self.total_points, self.current_level)
    }

    /// One-line summary for logging
    pub fn summary(&self) -> String {
        format!(
            "user={} points={} level={} milestones={}",
            self.user_id,
            self.total_points,
            self.current_level,
            self.milestones.len()
        )
    }
}
