//! Policy configuration
//!
//! Defaults come from environment variables; `PolicyConfig::from_toml_file`
//! overlays a TOML file on top (keys present in the file win).

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::escalation::{EscalationConfig, ExpertLevel};
use crate::progression::ProgressionConfig;
use crate::services::WebhookKind;

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Firebase project settings (the store itself is external)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirebaseConfig {
    pub api_key: Option<String>,
    pub auth_domain: Option<String>,
    pub project_id: String,
    pub storage_bucket: Option<String>,
    pub messaging_sender_id: Option<String>,
    pub app_id: Option<String>,
    pub measurement_id: Option<String>,
    pub use_emulators: bool,
}

impl Default for FirebaseConfig {
    fn default() -> Self {
        Self {
            api_key: env_opt("FIREBASE_API_KEY"),
            auth_domain: env_opt("FIREBASE_AUTH_DOMAIN"),
            project_id: env_string("FIREBASE_PROJECT_ID", "quranlab-divine-learning"),
            storage_bucket: env_opt("FIREBASE_STORAGE_BUCKET"),
            messaging_sender_id: env_opt("FIREBASE_MESSAGING_SENDER_ID"),
            app_id: env_opt("FIREBASE_APP_ID"),
            measurement_id: env_opt("FIREBASE_MEASUREMENT_ID"),
            use_emulators: env_parse("FIREBASE_USE_EMULATORS", false),
        }
    }
}

/// Zapier webhook URLs, one per kind
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub recitation_completed: Option<String>,
    pub expert_assigned: Option<String>,
    pub certificate_earned: Option<String>,
    pub progress_milestone: Option<String>,
    pub timeout_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            recitation_completed: env_opt("ZAPIER_RECITATION_WEBHOOK"),
            expert_assigned: env_opt("ZAPIER_EXPERT_WEBHOOK"),
            certificate_earned: env_opt("ZAPIER_CERTIFICATE_WEBHOOK"),
            progress_milestone: env_opt("ZAPIER_MILESTONE_WEBHOOK"),
            timeout_secs: env_parse("ZAPIER_TIMEOUT_SECS", 10),
        }
    }
}

impl WebhookConfig {
    pub fn url_for(&self, kind: WebhookKind) -> Option<&str> {
        let url = match kind {
            WebhookKind::RecitationCompleted => &self.recitation_completed,
            WebhookKind::ExpertAssigned => &self.expert_assigned,
            WebhookKind::CertificateEarned => &self.certificate_earned,
            WebhookKind::ProgressMilestone => &self.progress_milestone,
        };
        url.as_deref().filter(|u| !u.trim().is_empty())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// AI analysis service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub endpoint: String,
    pub model_version: String,
    pub analysis_type: String,
    /// Accuracy target advertised to the model
    pub display_accuracy: f64,
    /// Analyses strictly below this open a correction request
    pub correction_threshold: f64,
    pub timeout_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            endpoint: env_string(
                "AI_ANALYSIS_ENDPOINT",
                "http://localhost:3000/api/analyze-recitation",
            ),
            model_version: env_string("AI_MODEL_VERSION", "v2.1"),
            analysis_type: "tajweed-precision".to_string(),
            display_accuracy: 99.9,
            correction_threshold: env_parse("CORRECTION_THRESHOLD", 95.0),
            timeout_secs: env_parse("AI_ANALYSIS_TIMEOUT_SECS", 60),
        }
    }
}

impl AnalysisConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Expert matching and escalation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpertConfig {
    pub matching_url: String,
    pub notify_url: String,
    pub response_guarantee_minutes: i64,
    pub min_rating: f64,
    pub min_experience_years: u32,
    pub min_completion_rate: f64,
    pub max_concurrent_requests: u32,
    pub escalation_level: ExpertLevel,
    pub default_region: String,
    pub default_language: String,
    pub default_style: String,
    pub timeout_secs: u64,
}

impl Default for ExpertConfig {
    fn default() -> Self {
        Self {
            matching_url: env_string(
                "EXPERT_MATCHING_URL",
                "http://localhost:3000/api/find-experts",
            ),
            notify_url: env_string("EXPERT_NOTIFY_URL", "http://localhost:3000/api/notify-expert"),
            response_guarantee_minutes: env_parse("EXPERT_RESPONSE_GUARANTEE_MINUTES", 30),
            min_rating: env_parse("EXPERT_MIN_RATING", 4.5),
            min_experience_years: env_parse("EXPERT_MIN_EXPERIENCE_YEARS", 2),
            min_completion_rate: env_parse("EXPERT_MIN_COMPLETION_RATE", 95.0),
            max_concurrent_requests: env_parse("EXPERT_MAX_CONCURRENT_REQUESTS", 5),
            escalation_level: ExpertLevel::Senior,
            default_region: env_string("EXPERT_DEFAULT_REGION", "global"),
            default_language: env_string("EXPERT_DEFAULT_LANGUAGE", "english"),
            default_style: env_string("EXPERT_DEFAULT_STYLE", "hafs"),
            timeout_secs: env_parse("EXPERT_TIMEOUT_SECS", 15),
        }
    }
}

impl ExpertConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Top-level policy configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub firebase: FirebaseConfig,
    pub webhooks: WebhookConfig,
    pub analysis: AnalysisConfig,
    pub experts: ExpertConfig,
    pub progression: ProgressionConfig,
}

impl PolicyConfig {
    /// Environment defaults overlaid with the TOML file at `path`
    pub fn from_toml_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let percent = |name: &str, value: f64| {
            if value.is_finite() && (0.0..=100.0).contains(&value) {
                Ok(())
            } else {
                Err(ConfigError::Invalid(format!(
                    "{} must be within [0, 100], got {}",
                    name, value
                )))
            }
        };
        percent("analysis.correction_threshold", self.analysis.correction_threshold)?;
        percent("analysis.display_accuracy", self.analysis.display_accuracy)?;
        percent("experts.min_completion_rate", self.experts.min_completion_rate)?;

        if self.experts.response_guarantee_minutes <= 0 {
            return Err(ConfigError::Invalid(
                "experts.response_guarantee_minutes must be positive".to_string(),
            ));
        }
        if !(0.0..=5.0).contains(&self.experts.min_rating) {
            return Err(ConfigError::Invalid(format!(
                "experts.min_rating must be within [0, 5], got {}",
                self.experts.min_rating
            )));
        }
        if self.progression.points_per_percent == 0 {
            return Err(ConfigError::Invalid(
                "progression.points_per_percent must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Escalation engine settings derived from the analysis and expert sections
    pub fn escalation_config(&self) -> EscalationConfig {
        EscalationConfig {
            correction_threshold: self.analysis.correction_threshold,
            guarantee_secs: self.experts.response_guarantee_minutes * 60,
            min_rating: self.experts.min_rating,
            min_experience_years: Some(self.experts.min_experience_years),
            min_completion_rate: Some(self.experts.min_completion_rate),
            max_concurrent_requests: Some(self.experts.max_concurrent_requests),
            escalation_level: self.experts.escalation_level,
            ..EscalationConfig::default()
        }
    }

    /// Copy with credentials masked, for printing
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.firebase.api_key.is_some() {
            copy.firebase.api_key = Some("***".to_string());
        }
        for url in [
            &mut copy.webhooks.recitation_completed,
            &mut copy.webhooks.expert_assigned,
            &mut copy.webhooks.certificate_earned,
            &mut copy.webhooks.progress_milestone,
        ] {
            if url.is_some() {
                *url = Some("***".to_string());
            }
        }
        copy
    }
}
