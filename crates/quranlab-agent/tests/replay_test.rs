//! Replay tests: full scripts through sessions, progression and corrections

use std::time::Duration;

use quranlab_agent::replay::{parse_script, replay_file, Replay, ReplayError};
use quranlab_policy::escalation::CorrectionStatus;
use quranlab_policy::PolicyConfig;

const EXPERTS: &str = r#"{"type":"experts","experts":[{"id":"j1","name":"Hafiz Yusuf","rating":4.7,"available":true,"level":"junior","averageResponseTime":20},{"id":"s1","name":"Sheikh Idris","rating":4.9,"available":true,"level":"senior","averageResponseTime":10}]}"#;

fn script(lines: &[&str]) -> String {
    lines.join("\n")
}

/// Test: a learner below threshold gets escalated, then completed
#[tokio::test(start_paused = true)]
async fn test_replay_escalation_and_progression() {
    let text = script(&[
        EXPERTS,
        r#"{"type":"analysis","user_id":"amina","accuracy":60.0}"#,
        r#"{"type":"analysis","user_id":"amina","accuracy":70.0}"#,
        r#"{"type":"streak","user_id":"amina","days":7}"#,
        r#"{"type":"analysis","user_id":"bilal","accuracy":97.0}"#,
        r#"{"type":"milestone","user_id":"bilal","milestone":"first_recitation"}"#,
        r#"{"type":"wait","secs":1801}"#,
        r#"{"type":"expert_update","user_id":"amina","status":"completed","assessment":"Ghunnah fixed"}"#,
    ]);
    let steps = parse_script(&text).unwrap();
    let report = Replay::new(&PolicyConfig::default(), None)
        .unwrap()
        .run(steps)
        .await
        .unwrap();

    assert_eq!(report.steps, 8);

    let amina = &report.users["amina"];
    assert_eq!(amina.progress.total_points, 100 + 300);
    assert_eq!(amina.session.corrections_opened, 1);
    assert_eq!(amina.session.last_accuracy, Some(70.0));

    let bilal = &report.users["bilal"];
    assert_eq!(bilal.progress.total_points, 100);
    assert_eq!(bilal.session.corrections_opened, 0);

    assert_eq!(report.requests.len(), 1);
    let request = &report.requests[0];
    assert_eq!(request.user_id, "amina");
    assert_eq!(request.status, CorrectionStatus::Completed);
    assert!(request.escalated);
    assert_eq!(request.assigned_expert_id.as_deref(), Some("s1"));
    assert_eq!(
        request.human_feedback.as_ref().map(|f| f.assessment.as_str()),
        Some("Ghunnah fixed")
    );

    assert_eq!(report.events.get("correction_escalated"), Some(&1));
    assert_eq!(report.events.get("correction_completed"), Some(&1));
    assert_eq!(report.pending_deadlines, 0);
}

/// Test: a completed request before the deadline never escalates
#[tokio::test(start_paused = true)]
async fn test_replay_short_guarantee_override() {
    let text = script(&[
        EXPERTS,
        r#"{"type":"analysis","user_id":"amina","accuracy":80.0}"#,
        r#"{"type":"wait","secs":3}"#,
        r#"{"type":"expert_update","user_id":"amina","status":"in-progress"}"#,
        r#"{"type":"wait","secs":10}"#,
    ]);
    let steps = parse_script(&text).unwrap();
    let report = Replay::new(&PolicyConfig::default(), Some(5))
        .unwrap()
        .run(steps)
        .await
        .unwrap();

    let request = &report.requests[0];
    assert_eq!(request.status, CorrectionStatus::InProgress);
    assert!(!request.escalated);
    assert_eq!(request.assigned_expert_id.as_deref(), Some("j1"));
    assert_eq!(report.events.get("correction_escalated"), None);
    assert_eq!(report.events.get("correction_updated"), Some(&1));
}

/// Test: an expert update with nothing open is a script error
#[tokio::test]
async fn test_replay_update_without_request_fails() {
    let text = script(&[
        r#"{"type":"analysis","user_id":"amina","accuracy":99.0}"#,
        r#"{"type":"expert_update","user_id":"amina","status":"completed"}"#,
    ]);
    let steps = parse_script(&text).unwrap();
    let err = Replay::new(&PolicyConfig::default(), None)
        .unwrap()
        .run(steps)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ReplayError::NoOpenRequest { line: 2, ref user_id } if user_id == "amina"
    ));
}

/// Test: replaying from a file on disk
#[tokio::test(start_paused = true)]
async fn test_replay_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("session.jsonl");
    std::fs::write(
        &path,
        "# one learner, no experts online\n{\"type\":\"analysis\",\"user_id\":\"amina\",\"accuracy\":50.0}\n{\"type\":\"wait\",\"secs\":1801}\n",
    )
    .unwrap();

    let report = tokio::time::timeout(
        Duration::from_secs(3600),
        replay_file(&PolicyConfig::default(), &path, None),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(report.requests.len(), 1);
    assert_eq!(report.requests[0].status, CorrectionStatus::Pending);
    assert_eq!(report.events.get("escalation_unavailable"), Some(&1));
    assert!(!report.notices.is_empty());
}

/// Test: missing script file reports its path
#[tokio::test]
async fn test_replay_missing_file() {
    let err = replay_file(
        &PolicyConfig::default(),
        std::path::Path::new("/nonexistent/script.jsonl"),
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ReplayError::Io { .. }));
}
