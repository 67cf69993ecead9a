//! External collaborators
//!
//! Expert matching, expert notification, AI analysis and outbound webhooks
//! are reached through these traits. `http` holds the reqwest
//! implementations; tests substitute mocks or in-process fakes.

pub mod http;
pub mod webhook;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::escalation::{AnalysisResult, Expert, Priority};

pub use http::{HttpExpertMatcher, HttpExpertNotifier, HttpRecitationAnalyzer};
pub use webhook::{WebhookDelivery, WebhookDispatcher, WebhookEvent, WebhookKind};

/// Error type for collaborator calls
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Service not configured: {0}")]
    NotConfigured(String),
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Request(err.to_string())
        }
    }
}

/// Result type for collaborator calls
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Expert-matching query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpertQuery {
    pub user_region: String,
    pub preferred_language: String,
    pub recitation_style: String,
    pub urgency: Priority,
}

/// Notification sent to an assigned expert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpertNotification {
    pub expert_id: String,
    pub correction_request_id: String,
    pub priority: Priority,
    /// Expert's average response time, minutes
    pub estimated_time: u32,
}

/// Request to the AI analysis service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    /// Base64-encoded audio
    pub audio_data: String,
    pub analysis_type: String,
    /// Display accuracy target passed through to the model
    pub accuracy: f64,
}

/// Returns candidate experts in preference order
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExpertMatcher: Send + Sync {
    async fn find_experts(&self, query: &ExpertQuery) -> ServiceResult<Vec<Expert>>;
}

/// Delivers an assignment to an expert
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExpertNotifier: Send + Sync {
    async fn notify(&self, notification: &ExpertNotification) -> ServiceResult<()>;
}

/// Scores a recitation
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecitationAnalyzer: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> ServiceResult<AnalysisResult>;
}

/// Outbound integration hook
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WebhookSink: Send + Sync {
    async fn deliver(&self, event: &WebhookEvent) -> ServiceResult<WebhookDelivery>;
}

/// Sink that drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledWebhooks;

#[async_trait]
impl WebhookSink for DisabledWebhooks {
    async fn deliver(&self, _event: &WebhookEvent) -> ServiceResult<WebhookDelivery> {
        Ok(WebhookDelivery::Skipped)
    }
}
