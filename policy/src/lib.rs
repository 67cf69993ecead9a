//! QuranLab Policy Library
//!
//! This library provides:
//! - Jannah points progression: improvement awards, tier and consistency
//!   bonuses, milestones, streaks and the level ladder
//! - Hafiz correction escalation: request intake, expert assignment, the
//!   response-time guarantee and senior escalation
//! - Store-backed service adapters that run both engines against a
//!   document store, an event bus and HTTP collaborators
//!
//! # Layout
//!
//! ```text
//! progression / escalation     pure engines, no I/O
//! store / events / services    boundaries (documents, domain events, HTTP + webhooks)
//! progression_service          compare-and-swap transactions around the progression engine
//! correction_service           deadline timers and store updates around the escalation engine
//! session                      per-user ordered event loop over both services
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod config;
pub mod correction_service;
pub mod escalation;
pub mod events;
pub mod notices;
pub mod progression;
pub mod progression_service;
pub mod services;
pub mod session;
pub mod store;

pub use config::{ConfigError, ConfigResult, PolicyConfig};
pub use correction_service::{
    Collaborators, CorrectionService, CorrectionSettings, InitiateOutcome, MatchDefaults,
};
pub use escalation::{
    AnalysisResult, CorrectionRequest, CorrectionStatus, EscalationConfig, EscalationDecision,
    EscalationEngine, EscalationError, Expert, ExpertLevel, ExternalUpdate, Priority,
};
pub use events::{DomainEvent, EventBus, EventFilter, SharedEventBus};
pub use notices::{Notice, NoticeKind, NoticeLog};
pub use progression::{
    LevelThreshold, MilestoneId, ProgressionConfig, ProgressionEngine, ProgressionError,
    ProgressionOutcome, UserProgress,
};
pub use progression_service::{CommittedProgress, ProgressionService};
pub use services::{ServiceError, ServiceResult};
pub use session::{SessionEvent, SessionSummary, UserSession};
pub use store::{DocumentStore, MemoryStore, StoreError, StoreResult};

/// Error type for the service adapters
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Progression(#[from] ProgressionError),

    #[error(transparent)]
    Escalation(#[from] EscalationError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Progress transaction for {user_id} gave up after {attempts} conflicting attempts")]
    TransactionExhausted { user_id: String, attempts: usize },

    #[error("Correction transaction for {request_id} gave up after {attempts} conflicting attempts")]
    CorrectionTransactionExhausted { request_id: String, attempts: usize },

    #[error("Unknown correction request: {0}")]
    UnknownRequest(String),

    #[error("Session for {0} is closed")]
    SessionClosed(String),
}

impl PolicyError {
    /// Failures a caller may retry later without changing its input
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Service(_)
            | Self::TransactionExhausted { .. }
            | Self::CorrectionTransactionExhausted { .. } => true,
            _ => false,
        }
    }
}

pub type PolicyResult<T> = Result<T, PolicyError>;
