//! Progression Engine: deterministic points, level and milestone decisions
//!
//! Consumes accuracy changes and a `UserProgress` value and mutates it in
//! place, returning everything that happened as a `ProgressionOutcome`.
//! No I/O happens here; persistence and notification live in
//! `progression_service`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::levels::level_for_points;
use super::milestones::{MilestoneId, ACCURACY_MILESTONES, STREAK_MILESTONES};
use super::state::{Achievement, Earning, EarningKind, UserProgress};

/// Tolerance added before flooring base points, so that decimal deltas such
/// as `90.3 - 90.1` do not lose a point to binary rounding.
const BASE_POINTS_EPSILON: f64 = 1e-9;

/// Errors raised by the progression engine
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProgressionError {
    #[error("accuracy {value} is outside [0, 100]")]
    InvalidAccuracy { value: f64 },
}

/// Something the engine decided, in the order it happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressionEvent {
    PointsAwarded {
        points: u64,
        reason: String,
        total_points: u64,
    },
    LevelUp {
        previous_level: u32,
        new_level: u32,
        bonus: u64,
    },
    MilestoneAchieved {
        milestone: MilestoneId,
        points: u64,
    },
}

/// Result of one engine operation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressionOutcome {
    /// Sum of all earnings created by the operation
    pub awarded_points: u64,
    /// Earnings created, oldest first
    pub earnings: Vec<Earning>,
    pub events: Vec<ProgressionEvent>,
}

impl ProgressionOutcome {
    /// True when the operation changed nothing
    pub fn is_empty(&self) -> bool {
        self.earnings.is_empty() && self.events.is_empty()
    }

    /// Levels reached during the operation
    pub fn level_ups(&self) -> Vec<u32> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ProgressionEvent::LevelUp { new_level, .. } => Some(*new_level),
                _ => None,
            })
            .collect()
    }

    /// Milestones newly achieved during the operation
    pub fn milestones(&self) -> Vec<MilestoneId> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ProgressionEvent::MilestoneAchieved { milestone, .. } => Some(*milestone),
                _ => None,
            })
            .collect()
    }
}

/// Breakdown of the improvement award for one accuracy change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImprovementAward {
    pub base_points: u64,
    /// Bonus multiplier in hundredths (150 = 1.5x)
    pub multiplier_pct: u64,
    pub consistency_bonus: bool,
    pub points: u64,
}

impl ImprovementAward {
    pub fn multiplier(&self) -> f64 {
        self.multiplier_pct as f64 / 100.0
    }
}

/// Tunables for the progression engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressionConfig {
    /// Points per percentage point of accuracy improvement
    pub points_per_percent: u64,
    /// How many recent improvement earnings the consistency bonus inspects
    pub consistency_window: usize,
    /// Minimum improvement earnings in the window for the consistency bonus
    pub consistency_min_count: usize,
    /// Level-up bonus per level reached
    pub level_up_bonus_per_level: u64,
}

impl Default for ProgressionConfig {
    fn default() -> Self {
        Self {
            points_per_percent: 10,
            consistency_window: 5,
            consistency_min_count: 3,
            level_up_bonus_per_level: 100,
        }
    }
}

/// The Progression Engine
#[derive(Debug, Clone, Default)]
pub struct ProgressionEngine {
    config: ProgressionConfig,
}

impl ProgressionEngine {
    /// Create a new engine with default config
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with custom config
    pub fn with_config(config: ProgressionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProgressionConfig {
        &self.config
    }

    /// Apply an accuracy change to a user's progress.
    ///
    /// Awards improvement points (with tier and consistency bonuses), then
    /// runs the accuracy milestone check. Equal accuracies are a no-op.
    pub fn record_accuracy_change(
        &self,
        progress: &mut UserProgress,
        previous_accuracy: f64,
        current_accuracy: f64,
        now: DateTime<Utc>,
    ) -> Result<ProgressionOutcome, ProgressionError> {
        validate_accuracy(previous_accuracy)?;
        validate_accuracy(current_accuracy)?;

        let mut outcome = ProgressionOutcome::default();
        if previous_accuracy == current_accuracy {
            return Ok(outcome);
        }

        let award = self.improvement_award(progress, previous_accuracy, current_accuracy);
        if award.points > 0 {
            self.award(
                progress,
                award.points,
                EarningKind::RecitationImprovement {
                    improvement: current_accuracy - previous_accuracy,
                    accuracy: current_accuracy,
                    base_points: award.base_points,
                    bonus_multiplier: award.multiplier(),
                },
                now,
                &mut outcome,
            );
        }

        for (threshold, milestone) in ACCURACY_MILESTONES {
            if current_accuracy >= *threshold {
                self.grant_milestone(progress, *milestone, now, &mut outcome);
            }
        }

        Ok(outcome)
    }

    /// Compute the improvement award without mutating anything
    pub fn improvement_award(
        &self,
        progress: &UserProgress,
        previous_accuracy: f64,
        current_accuracy: f64,
    ) -> ImprovementAward {
        let base_points = self.base_points(previous_accuracy, current_accuracy);

        let mut multiplier_pct = 100;
        if current_accuracy >= 95.0 {
            multiplier_pct += 50;
        } else if current_accuracy >= 90.0 {
            multiplier_pct += 25;
        } else if current_accuracy >= 80.0 {
            multiplier_pct += 10;
        }

        let consistency_bonus = self.consistency_bonus(progress);
        if consistency_bonus {
            multiplier_pct += 20;
        }

        ImprovementAward {
            base_points,
            multiplier_pct,
            consistency_bonus,
            points: base_points * multiplier_pct / 100,
        }
    }

    /// `floor(max(0, current - previous) * points_per_percent)`
    pub fn base_points(&self, previous_accuracy: f64, current_accuracy: f64) -> u64 {
        let delta = current_accuracy - previous_accuracy;
        if delta <= 0.0 {
            return 0;
        }
        (delta * self.config.points_per_percent as f64 + BASE_POINTS_EPSILON).floor() as u64
    }

    /// True when the last few improvement earnings all show positive improvement
    pub fn consistency_bonus(&self, progress: &UserProgress) -> bool {
        let recent = progress.recent_improvements(self.config.consistency_window);
        recent.len() >= self.config.consistency_min_count
            && recent
                .iter()
                .all(|e| e.improvement().map(|i| i > 0.0).unwrap_or(false))
    }

    /// Award a catalogue milestone once. Already-held milestones are a no-op.
    pub fn award_milestone(
        &self,
        progress: &mut UserProgress,
        milestone: MilestoneId,
        now: DateTime<Utc>,
    ) -> ProgressionOutcome {
        let mut outcome = ProgressionOutcome::default();
        self.grant_milestone(progress, milestone, now, &mut outcome);
        outcome
    }

    /// Award streak milestones unlocked by a streak of `streak_days`
    pub fn record_daily_streak(
        &self,
        progress: &mut UserProgress,
        streak_days: u32,
        now: DateTime<Utc>,
    ) -> ProgressionOutcome {
        let mut outcome = ProgressionOutcome::default();
        for (days, milestone) in STREAK_MILESTONES {
            if streak_days >= *days {
                self.grant_milestone(progress, *milestone, now, &mut outcome);
            }
        }
        outcome
    }

    fn grant_milestone(
        &self,
        progress: &mut UserProgress,
        milestone: MilestoneId,
        now: DateTime<Utc>,
        outcome: &mut ProgressionOutcome,
    ) {
        if progress.has_milestone(milestone) {
            return;
        }
        let def = milestone.definition();

        progress.milestones.push(milestone);
        progress.achievements.insert(
            milestone,
            Achievement {
                name: def.name.to_string(),
                points: def.points,
                icon: def.icon.to_string(),
                achieved_at: now,
            },
        );
        outcome.events.push(ProgressionEvent::MilestoneAchieved {
            milestone,
            points: def.points,
        });

        self.award(
            progress,
            def.points,
            EarningKind::MilestoneAchievement {
                milestone: def.name.to_string(),
                achievement_id: milestone,
            },
            now,
            outcome,
        );
    }

    /// Shared award path: credit points, log the earning, re-evaluate level.
    ///
    /// A level-up pays `new_level * level_up_bonus_per_level` through the same
    /// path, and the level is re-evaluated after each bonus so a bonus that
    /// crosses another threshold is caught too.
    fn award(
        &self,
        progress: &mut UserProgress,
        points: u64,
        kind: EarningKind,
        now: DateTime<Utc>,
        outcome: &mut ProgressionOutcome,
    ) {
        let mut pending = Some((points, kind));

        while let Some((points, kind)) = pending.take() {
            if points == 0 {
                break;
            }

            progress.total_points = progress.total_points.saturating_add(points);
            progress.last_updated = Some(now);

            let reason = kind.label().to_string();
            let earning = Earning {
                points,
                timestamp: now,
                metadata: kind,
            };
            progress.push_earning(earning.clone());
            outcome.earnings.push(earning);
            outcome.awarded_points += points;
            outcome.events.push(ProgressionEvent::PointsAwarded {
                points,
                reason,
                total_points: progress.total_points,
            });

            let new_level = level_for_points(progress.total_points);
            if new_level > progress.current_level {
                let previous_level = progress.current_level;
                let bonus = u64::from(new_level) * self.config.level_up_bonus_per_level;
                progress.current_level = new_level;
                progress.level_up_at = Some(now);
                outcome.events.push(ProgressionEvent::LevelUp {
                    previous_level,
                    new_level,
                    bonus,
                });
                pending = Some((bonus, EarningKind::LevelUp { new_level, bonus }));
            }
        }
    }
}

fn validate_accuracy(value: f64) -> Result<(), ProgressionError> {
    if value.is_finite() && (0.0..=100.0).contains(&value) {
        Ok(())
    } else {
        Err(ProgressionError::InvalidAccuracy { value })
    }
}
