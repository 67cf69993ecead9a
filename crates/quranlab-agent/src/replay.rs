//! Script replay
//!
//! Feeds a JSONL script of learner and expert events through the policy
//! services on an in-memory store. One JSON object per line, `#` comments
//! and blank lines are skipped:
//!
//! ```text
//! {"type":"experts","experts":[{"id":"h1","name":"Hafiz Ali","rating":4.9,"available":true,"level":"senior","averageResponseTime":12}]}
//! {"type":"analysis","user_id":"amina","accuracy":72.5}
//! {"type":"streak","user_id":"amina","days":7}
//! {"type":"milestone","user_id":"amina","milestone":"first_recitation"}
//! {"type":"expert_update","user_id":"amina","status":"completed","assessment":"Clear makharij"}
//! {"type":"wait","secs":1800}
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use quranlab_policy::escalation::{CorrectionRequest, CorrectionStatus, Expert, HumanFeedback};
use quranlab_policy::events::{DomainEvent, EventBus, SharedEventBus};
use quranlab_policy::notices::Notice;
use quranlab_policy::progression::{MilestoneId, ProgressionEngine, UserProgress};
use quranlab_policy::services::{
    ExpertMatcher, ExpertNotification, ExpertNotifier, ExpertQuery, ServiceResult,
    WebhookDispatcher,
};
use quranlab_policy::store::MemoryStore;
use quranlab_policy::{
    Collaborators, CorrectionService, CorrectionSettings, PolicyConfig, PolicyError,
    ProgressionService, SessionEvent, SessionSummary, UserSession,
};

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("Failed to read script {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Line {line}: user {user_id} has no open correction request")]
    NoOpenRequest { line: usize, user_id: String },

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Service(#[from] quranlab_policy::ServiceError),
}

pub type ReplayResult<T> = Result<T, ReplayError>;

/// One script line
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScriptStep {
    /// Replace the expert pool returned by matching
    Experts { experts: Vec<Expert> },
    Analysis {
        user_id: String,
        accuracy: f64,
        #[serde(default)]
        style: Option<String>,
    },
    Streak { user_id: String, days: u32 },
    Milestone {
        user_id: String,
        milestone: MilestoneId,
    },
    /// Expert-side status change on the user's open request
    ExpertUpdate {
        user_id: String,
        status: CorrectionStatus,
        #[serde(default)]
        assessment: Option<String>,
    },
    Wait { secs: u64 },
}

/// A parsed step and its 1-based line number
#[derive(Debug, Clone, PartialEq)]
pub struct NumberedStep {
    pub line: usize,
    pub step: ScriptStep,
}

pub fn parse_script(text: &str) -> ReplayResult<Vec<NumberedStep>> {
    text.lines()
        .enumerate()
        .filter(|(_, l)| {
            let l = l.trim();
            !l.is_empty() && !l.starts_with('#')
        })
        .map(|(i, l)| {
            serde_json::from_str(l)
                .map(|step| NumberedStep { line: i + 1, step })
                .map_err(|source| ReplayError::Parse { line: i + 1, source })
        })
        .collect()
}

pub fn load_script(path: &Path) -> ReplayResult<Vec<NumberedStep>> {
    let text = std::fs::read_to_string(path).map_err(|source| ReplayError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_script(&text)
}

/// Matcher answering from the script's current expert list
#[derive(Default)]
pub struct ScriptedMatcher {
    experts: RwLock<Vec<Expert>>,
}

impl ScriptedMatcher {
    pub fn set(&self, experts: Vec<Expert>) {
        *self.experts.write().unwrap_or_else(|p| p.into_inner()) = experts;
    }
}

#[async_trait]
impl ExpertMatcher for ScriptedMatcher {
    async fn find_experts(&self, query: &ExpertQuery) -> ServiceResult<Vec<Expert>> {
        let experts = self
            .experts
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        debug!(urgency = %query.urgency, count = experts.len(), "scripted expert match");
        Ok(experts)
    }
}

/// Notifier that only logs
#[derive(Default)]
pub struct LoggingNotifier;

#[async_trait]
impl ExpertNotifier for LoggingNotifier {
    async fn notify(&self, notification: &ExpertNotification) -> ServiceResult<()> {
        info!(
            expert_id = %notification.expert_id,
            request_id = %notification.correction_request_id,
            priority = %notification.priority,
            "expert notified"
        );
        Ok(())
    }
}

/// Per-user result of a replay
#[derive(Debug, Clone, Serialize)]
pub struct UserReport {
    pub progress: UserProgress,
    pub session: SessionSummary,
}

/// Final state printed by `quranlab-agent replay`
#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub steps: usize,
    pub users: BTreeMap<String, UserReport>,
    pub requests: Vec<CorrectionRequest>,
    pub events: BTreeMap<String, usize>,
    pub notices: Vec<Notice>,
    pub pending_deadlines: usize,
}

/// Replay driver. Sessions are drained before every expert update and wait
/// so script order is preserved across users and services.
pub struct Replay {
    progression: Arc<ProgressionService<MemoryStore>>,
    corrections: CorrectionService<MemoryStore>,
    matcher: Arc<ScriptedMatcher>,
    events: broadcast::Receiver<DomainEvent>,
    event_counts: BTreeMap<String, usize>,
    sessions: HashMap<String, UserSession>,
    summaries: BTreeMap<String, SessionSummary>,
}

impl Replay {
    /// Build services from `config`; `guarantee_secs` overrides the
    /// configured response guarantee.
    pub fn new(config: &PolicyConfig, guarantee_secs: Option<i64>) -> ReplayResult<Self> {
        let store = MemoryStore::new().shared();
        let bus: SharedEventBus = EventBus::new().shared();
        let webhooks = Arc::new(WebhookDispatcher::from_config(&config.webhooks)?);

        let progression = Arc::new(
            ProgressionService::new(
                store.clone(),
                ProgressionEngine::with_config(config.progression.clone()),
                bus.clone(),
            )
            .with_webhooks(webhooks.clone()),
        );

        let mut settings = CorrectionSettings::from_config(config);
        if let Some(secs) = guarantee_secs {
            let mut escalation = settings.engine.config().clone();
            escalation.guarantee_secs = secs;
            settings.engine = quranlab_policy::EscalationEngine::with_config(escalation);
        }

        let matcher = Arc::new(ScriptedMatcher::default());
        let collaborators = Collaborators::new(matcher.clone(), Arc::new(LoggingNotifier))
            .with_webhooks(webhooks);
        let events = bus.subscribe();
        let corrections = CorrectionService::new(store, bus, collaborators, settings);

        Ok(Self {
            progression,
            corrections,
            matcher,
            events,
            event_counts: BTreeMap::new(),
            sessions: HashMap::new(),
            summaries: BTreeMap::new(),
        })
    }

    pub async fn run(mut self, steps: Vec<NumberedStep>) -> ReplayResult<ReplayReport> {
        let total = steps.len();
        for NumberedStep { line, step } in steps {
            self.apply(line, step).await?;
            self.count_events();
        }
        self.settle().await?;
        self.count_events();
        self.report(total).await
    }

    async fn apply(&mut self, line: usize, step: ScriptStep) -> ReplayResult<()> {
        debug!(line, ?step, "replay step");
        match step {
            ScriptStep::Experts { experts } => {
                info!(line, count = experts.len(), "expert pool updated");
                self.matcher.set(experts);
            }
            ScriptStep::Analysis {
                user_id,
                accuracy,
                style,
            } => {
                let mut analysis = quranlab_policy::AnalysisResult::with_accuracy(accuracy);
                analysis.detected_style = style;
                self.session(&user_id)
                    .send(SessionEvent::AnalysisCompleted { analysis })
                    .await?;
            }
            ScriptStep::Streak { user_id, days } => {
                self.session(&user_id)
                    .send(SessionEvent::StreakUpdated { streak_days: days })
                    .await?;
            }
            ScriptStep::Milestone { user_id, milestone } => {
                self.session(&user_id)
                    .send(SessionEvent::MilestoneEarned { milestone })
                    .await?;
            }
            ScriptStep::ExpertUpdate {
                user_id,
                status,
                assessment,
            } => {
                self.settle().await?;
                let request = self
                    .corrections
                    .requests()
                    .into_iter()
                    .rev()
                    .find(|r| r.user_id == user_id && r.is_open())
                    .ok_or_else(|| ReplayError::NoOpenRequest {
                        line,
                        user_id: user_id.clone(),
                    })?;
                let feedback = assessment.map(|assessment| HumanFeedback {
                    assessment,
                    corrections: Vec::new(),
                    recommendations: Vec::new(),
                });
                self.corrections
                    .submit_expert_update(&request.id, status, feedback, None)
                    .await?;
            }
            ScriptStep::Wait { secs } => {
                self.settle().await?;
                tokio::time::sleep(Duration::from_secs(secs)).await;
                // let fired deadline tasks finish
                tokio::task::yield_now().await;
            }
        }
        Ok(())
    }

    fn session(&mut self, user_id: &str) -> &UserSession {
        let progression = &self.progression;
        let corrections = &self.corrections;
        let summaries = &self.summaries;
        self.sessions.entry(user_id.to_string()).or_insert_with(|| {
            let last_accuracy = summaries.get(user_id).and_then(|s| s.last_accuracy);
            UserSession::spawn(
                user_id,
                last_accuracy,
                Arc::clone(progression),
                corrections.clone(),
            )
        })
    }

    /// Close every open session and fold its counters into the totals
    async fn settle(&mut self) -> ReplayResult<()> {
        for (user_id, session) in self.sessions.drain() {
            let closed = session.close().await?;
            let total = self
                .summaries
                .entry(user_id.clone())
                .or_insert_with(|| SessionSummary {
                    user_id,
                    ..SessionSummary::default()
                });
            total.processed += closed.processed;
            total.failures += closed.failures;
            total.points_awarded += closed.points_awarded;
            total.corrections_opened += closed.corrections_opened;
            total.last_accuracy = closed.last_accuracy;
        }
        Ok(())
    }

    fn count_events(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(event) => {
                    *self
                        .event_counts
                        .entry(event.event_type().to_string())
                        .or_default() += 1;
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    *self.event_counts.entry("lagged".to_string()).or_default() +=
                        skipped as usize;
                }
                Err(_) => break,
            }
        }
    }

    async fn report(self, steps: usize) -> ReplayResult<ReplayReport> {
        let mut users = BTreeMap::new();
        for (user_id, session) in &self.summaries {
            let progress = self.progression.progress(user_id).await?;
            users.insert(
                user_id.clone(),
                UserReport {
                    progress,
                    session: session.clone(),
                },
            );
        }

        Ok(ReplayReport {
            steps,
            users,
            requests: self.corrections.requests(),
            events: self.event_counts,
            notices: self.corrections.notices().snapshot(),
            pending_deadlines: self.corrections.active_deadlines(),
        })
    }
}

/// Load a script file and replay it
pub async fn replay_file(
    config: &PolicyConfig,
    path: &Path,
    guarantee_secs: Option<i64>,
) -> ReplayResult<ReplayReport> {
    let steps = load_script(path)?;
    info!(path = %path.display(), steps = steps.len(), "replaying script");
    Replay::new(config, guarantee_secs)?.run(steps).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_skips_comments_and_blank_lines() {
        let steps = parse_script(
            "# warm-up\n\n{\"type\":\"streak\",\"user_id\":\"u1\",\"days\":7}\n{\"type\":\"wait\",\"secs\":5}\n",
        )
        .unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].line, 3);
        assert_eq!(
            steps[0].step,
            ScriptStep::Streak {
                user_id: "u1".to_string(),
                days: 7
            }
        );
        assert_eq!(steps[1].step, ScriptStep::Wait { secs: 5 });
    }

    #[test]
    fn test_parse_error_reports_line() {
        let err = parse_script("{\"type\":\"wait\",\"secs\":1}\n{\"type\":\"dance\"}").unwrap_err();
        assert!(matches!(err, ReplayError::Parse { line: 2, .. }));
    }

    #[test]
    fn test_parse_expert_update_status() {
        let steps = parse_script(
            r#"{"type":"expert_update","user_id":"u1","status":"in-progress"}"#,
        )
        .unwrap();
        assert_eq!(
            steps[0].step,
            ScriptStep::ExpertUpdate {
                user_id: "u1".to_string(),
                status: CorrectionStatus::InProgress,
                assessment: None,
            }
        );
    }

    #[tokio::test]
    async fn test_scripted_matcher_returns_current_pool() {
        let matcher = ScriptedMatcher::default();
        let query = ExpertQuery {
            user_region: "global".to_string(),
            preferred_language: "english".to_string(),
            recitation_style: "hafs".to_string(),
            urgency: quranlab_policy::Priority::High,
        };
        assert!(matcher.find_experts(&query).await.unwrap().is_empty());

        let expert: Expert = serde_json::from_str(
            r#"{"id":"h1","name":"Hafiz Ali","rating":4.9,"available":true,"level":"senior","averageResponseTime":12,"languages":[],"region":"global"}"#,
        )
        .unwrap();
        matcher.set(vec![expert]);
        assert_eq!(matcher.find_experts(&query).await.unwrap().len(), 1);
    }
}
