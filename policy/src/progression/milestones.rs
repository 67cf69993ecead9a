//! Milestone catalogue

use serde::{Deserialize, Serialize};

/// Identifier of an achievement milestone
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MilestoneId {
    #[serde(rename = "first_recitation")]
    FirstRecitation,
    #[serde(rename = "accuracy_80")]
    Accuracy80,
    #[serde(rename = "accuracy_90")]
    Accuracy90,
    #[serde(rename = "accuracy_95")]
    Accuracy95,
    #[serde(rename = "perfect_recitation")]
    PerfectRecitation,
    #[serde(rename = "daily_streak_7")]
    DailyStreak7,
    #[serde(rename = "daily_streak_30")]
    DailyStreak30,
    #[serde(rename = "expert_validated")]
    ExpertValidated,
    #[serde(rename = "scholar_approved")]
    ScholarApproved,
    #[serde(rename = "community_helper")]
    CommunityHelper,
}

impl MilestoneId {
    /// Stable string id, as persisted
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FirstRecitation => "first_recitation",
            Self::Accuracy80 => "accuracy_80",
            Self::Accuracy90 => "accuracy_90",
            Self::Accuracy95 => "accuracy_95",
            Self::PerfectRecitation => "perfect_recitation",
            Self::DailyStreak7 => "daily_streak_7",
            Self::DailyStreak30 => "daily_streak_30",
            Self::ExpertValidated => "expert_validated",
            Self::ScholarApproved => "scholar_approved",
            Self::CommunityHelper => "community_helper",
        }
    }

    /// Catalogue entry for this milestone
    pub fn definition(&self) -> &'static Milestone {
        MILESTONES
            .iter()
            .find(|m| m.id == *self)
            .unwrap_or(&MILESTONES[0])
    }
}

impl std::fmt::Display for MilestoneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MilestoneId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MILESTONES
            .iter()
            .map(|m| m.id)
            .find(|id| id.as_str() == s)
            .ok_or_else(|| format!("unknown milestone: {}", s))
    }
}

/// A milestone definition
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Milestone {
    pub id: MilestoneId,
    pub name: &'static str,
    pub points: u64,
    pub icon: &'static str,
}

/// Every milestone a user can earn
pub const MILESTONES: &[Milestone] = &[
    Milestone {
        id: MilestoneId::FirstRecitation,
        name: "First Recitation",
        points: 100,
        icon: "🎤",
    },
    Milestone {
        id: MilestoneId::Accuracy80,
        name: "80% Accuracy Achieved",
        points: 500,
        icon: "🎯",
    },
    Milestone {
        id: MilestoneId::Accuracy90,
        name: "90% Accuracy Achieved",
        points: 1_000,
        icon: "⭐",
    },
    Milestone {
        id: MilestoneId::Accuracy95,
        name: "95% Accuracy Achieved",
        points: 2_000,
        icon: "🌟",
    },
    Milestone {
        id: MilestoneId::PerfectRecitation,
        name: "Perfect Recitation",
        points: 5_000,
        icon: "👑",
    },
    Milestone {
        id: MilestoneId::DailyStreak7,
        name: "7-Day Streak",
        points: 300,
        icon: "🔥",
    },
    Milestone {
        id: MilestoneId::DailyStreak30,
        name: "30-Day Streak",
        points: 1_500,
        icon: "💎",
    },
    Milestone {
        id: MilestoneId::ExpertValidated,
        name: "Expert Validated",
        points: 500,
        icon: "✅",
    },
    Milestone {
        id: MilestoneId::ScholarApproved,
        name: "Scholar Approved",
        points: 1_000,
        icon: "🎓",
    },
    Milestone {
        id: MilestoneId::CommunityHelper,
        name: "Community Helper",
        points: 750,
        icon: "🤝",
    },
];

/// Accuracy thresholds checked after every accuracy update, in order
pub const ACCURACY_MILESTONES: &[(f64, MilestoneId)] = &[
    (80.0, MilestoneId::Accuracy80),
    (90.0, MilestoneId::Accuracy90),
    (95.0, MilestoneId::Accuracy95),
    (99.5, MilestoneId::PerfectRecitation),
];

/// Streak lengths (days) that unlock streak milestones
pub const STREAK_MILESTONES: &[(u32, MilestoneId)] = &[
    (7, MilestoneId::DailyStreak7),
    (30, MilestoneId::DailyStreak30),
];
