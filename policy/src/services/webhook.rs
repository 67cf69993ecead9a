//! Zapier-style outbound webhooks
//!
//! One URL per kind; kinds without a URL are skipped silently.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::http::{build_client, post_json};
use super::{ServiceResult, WebhookSink};
use crate::config::WebhookConfig;
use crate::escalation::Priority;
use crate::progression::MilestoneId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookKind {
    RecitationCompleted,
    ExpertAssigned,
    CertificateEarned,
    ProgressMilestone,
}

impl WebhookKind {
    pub const ALL: [WebhookKind; 4] = [
        Self::RecitationCompleted,
        Self::ExpertAssigned,
        Self::CertificateEarned,
        Self::ProgressMilestone,
    ];
}

/// Payload sent to a webhook, tagged with its trigger name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum WebhookEvent {
    #[serde(rename = "recitation.completed", rename_all = "camelCase")]
    RecitationCompleted {
        user_id: String,
        accuracy: f64,
        /// Points awarded for this recitation
        jannah_points: u64,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "expert.assigned", rename_all = "camelCase")]
    ExpertAssigned {
        request_id: String,
        expert_id: String,
        user_id: String,
        priority: Priority,
        estimated_time: u32,
    },

    #[serde(rename = "certificate.earned", rename_all = "camelCase")]
    CertificateEarned {
        user_id: String,
        certificate_id: String,
        achievement: String,
        total_points: u64,
    },

    #[serde(rename = "milestone.reached", rename_all = "camelCase")]
    MilestoneReached {
        user_id: String,
        milestone: MilestoneId,
        total_points: u64,
        level: u32,
    },
}

impl WebhookEvent {
    pub fn kind(&self) -> WebhookKind {
        match self {
            Self::RecitationCompleted { .. } => WebhookKind::RecitationCompleted,
            Self::ExpertAssigned { .. } => WebhookKind::ExpertAssigned,
            Self::CertificateEarned { .. } => WebhookKind::CertificateEarned,
            Self::MilestoneReached { .. } => WebhookKind::ProgressMilestone,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookDelivery {
    Sent,
    /// No URL configured for the kind
    Skipped,
}

/// Posts webhook events to their configured URLs
pub struct WebhookDispatcher {
    urls: HashMap<WebhookKind, String>,
    client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(urls: HashMap<WebhookKind, String>, timeout: Duration) -> ServiceResult<Self> {
        let urls = urls
            .into_iter()
            .filter(|(_, url)| !url.trim().is_empty())
            .collect();
        Ok(Self {
            urls,
            client: build_client(timeout)?,
        })
    }

    pub fn from_config(config: &WebhookConfig) -> ServiceResult<Self> {
        let mut urls = HashMap::new();
        for kind in WebhookKind::ALL {
            if let Some(url) = config.url_for(kind) {
                urls.insert(kind, url.to_string());
            }
        }
        Self::new(urls, config.http_timeout())
    }

    pub fn is_configured(&self, kind: WebhookKind) -> bool {
        self.urls.contains_key(&kind)
    }
}

#[async_trait]
impl WebhookSink for WebhookDispatcher {
    async fn deliver(&self, event: &WebhookEvent) -> ServiceResult<WebhookDelivery> {
        let kind = event.kind();
        let Some(url) = self.urls.get(&kind) else {
            debug!(?kind, "webhook skipped (no url)");
            return Ok(WebhookDelivery::Skipped);
        };

        post_json(&self.client, url, event).await?;
        debug!(?kind, "webhook delivered");
        Ok(WebhookDelivery::Sent)
    }
}
