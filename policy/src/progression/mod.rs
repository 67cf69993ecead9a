//! Progression Engine: Jannah points, levels and milestones
//!
//! A pure state machine over `UserProgress`. Every accuracy change is turned
//! into at most one improvement earning, followed by any milestone earnings
//! and level-up bonuses it unlocks.
//!
//! # Award Path
//!
//! ```text
//! accuracy change
//!     │
//!     ├─ base = floor(max(0, Δ) × 10)
//!     ├─ multiplier = 1.0 + tier bonus (0.5 / 0.25 / 0.10) + consistency (0.20)
//!     ├─ award = floor(base × multiplier)  ── 0 → nothing recorded
//!     │
//!     ▼
//! award(points) ──▶ total += points, log earning (last 10 kept)
//!     │
//!     └─ level(total) > current? → level-up, award(new_level × 100) ─┐
//!                                                                     │
//!        ◀────────────────────── re-evaluate ────────────────────────┘
//!
//! milestone check (80 / 90 / 95 / 99.5) → award(milestone points) once each
//! ```

pub mod engine;
pub mod levels;
pub mod milestones;
pub mod state;

pub use engine::{
    ImprovementAward, ProgressionConfig, ProgressionEngine, ProgressionError, ProgressionEvent,
    ProgressionOutcome,
};
pub use levels::{level_for_points, LevelThreshold, LEVEL_THRESHOLDS};
pub use milestones::{Milestone, MilestoneId, MILESTONES};
pub use state::{Achievement, Earning, EarningKind, UserProgress, RECENT_EARNINGS_CAP};
