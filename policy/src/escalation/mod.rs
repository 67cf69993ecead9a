//! Escalation Engine: correction requests against a response guarantee
//!
//! # Lifecycle
//!
//! ```text
//!  analysis < 95 ──▶ pending ──(first candidate)──▶ assigned ──▶ in-progress ──▶ completed
//!                       │                              ▲  │
//!                       └──────── deadline: senior ────┘  └─ deadline: other senior
//! ```
//!
//! Deadline escalation only fires while the request is `pending` or
//! `assigned`. The guarantee is anchored to `requested_at` and never moves.

pub mod deadline;
pub mod engine;
pub mod state;

pub use deadline::DeadlineScheduler;
pub use engine::{
    response_time_minutes, EscalationConfig, EscalationDecision, EscalationEngine,
    EscalationError, ExternalUpdate, UpdateOutcome,
};
pub use state::{
    AnalysisResult, Correction, CorrectionRequest, CorrectionStatus, EscalationReason,
    EscalationRecord, Expert, ExpertLevel, HumanFeedback, Priority, ScholarReview,
};
