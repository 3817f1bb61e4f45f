//! Fingerprint auto-approval and task scoping.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::json;

use claps::models::approval::ApprovalDecision;
use claps::models::task::{TaskMetadata, TaskSource};

use super::test_helpers::{mock_gateway, MockAdapter};

fn slack_metadata() -> TaskMetadata {
    TaskMetadata::Slack {
        channel_id: "C1".into(),
        thread_ts: "171.9".into(),
        user_id: "U1".into(),
        text: "x".into(),
        target_repo: None,
    }
}

#[tokio::test]
async fn non_dangerous_tools_pass_without_a_round_trip() {
    let temp = tempfile::tempdir().expect("tempdir");
    let adapter = Arc::new(MockAdapter::new(TaskSource::Slack));
    let gateway = mock_gateway(temp.path(), Arc::clone(&adapter)).await;
    gateway
        .set_current_task("t1", Some(slack_metadata()), Some("U1".into()))
        .await;

    for tool in ["Read", "Glob", "Grep", "WebFetch"] {
        let reply = gateway.approve(tool, &json!({})).await;
        assert_eq!(reply.decision, ApprovalDecision::Allow, "{tool} passes through");
    }
    assert_eq!(adapter.counters.approvals.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn approval_without_a_task_is_denied() {
    let temp = tempfile::tempdir().expect("tempdir");
    let adapter = Arc::new(MockAdapter::new(TaskSource::Slack));
    let gateway = mock_gateway(temp.path(), Arc::clone(&adapter)).await;

    let reply = gateway
        .approve("Bash", &json!({ "command": "ls" }))
        .await;
    assert_eq!(reply.decision, ApprovalDecision::Deny);
    assert_eq!(adapter.counters.approvals.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn repeat_fingerprint_is_auto_approved_without_the_router() {
    let temp = tempfile::tempdir().expect("tempdir");
    let adapter = Arc::new(MockAdapter::new(TaskSource::Slack));
    let gateway = mock_gateway(temp.path(), Arc::clone(&adapter)).await;
    gateway
        .set_current_task("t1", Some(slack_metadata()), Some("U1".into()))
        .await;

    let input = json!({ "command": "rm -rf /tmp/x" });
    let first = gateway.approve("Bash", &input).await;
    assert_eq!(first.decision, ApprovalDecision::Allow);
    assert_eq!(adapter.counters.approvals.load(Ordering::SeqCst), 1);

    // Same fingerprint: no second round-trip.
    let second = gateway.approve("Bash", &input).await;
    assert_eq!(second.decision, ApprovalDecision::Allow);
    assert!(second.message.unwrap_or_default().contains("Auto-approved"));
    assert_eq!(adapter.counters.approvals.load(Ordering::SeqCst), 1);

    // Different command: new fingerprint, new round-trip.
    let third = gateway
        .approve("Bash", &json!({ "command": "echo hello" }))
        .await;
    assert_eq!(third.decision, ApprovalDecision::Allow);
    assert_eq!(adapter.counters.approvals.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn denied_fingerprint_is_not_cached() {
    let temp = tempfile::tempdir().expect("tempdir");
    let adapter = Arc::new(MockAdapter::new(TaskSource::Slack));
    let gateway = mock_gateway(temp.path(), Arc::clone(&adapter)).await;
    gateway
        .set_current_task("t1", Some(slack_metadata()), Some("U1".into()))
        .await;
    adapter.set_decision(ApprovalDecision::Deny);

    let input = json!({ "command": "rm -rf /" });
    let first = gateway.approve("Bash", &input).await;
    assert_eq!(first.decision, ApprovalDecision::Deny);

    // A denied fingerprint still forces a round-trip next time.
    let second = gateway.approve("Bash", &input).await;
    assert_eq!(second.decision, ApprovalDecision::Deny);
    assert_eq!(adapter.counters.approvals.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn scope_reset_clears_the_allow_set() {
    let temp = tempfile::tempdir().expect("tempdir");
    let adapter = Arc::new(MockAdapter::new(TaskSource::Slack));
    let gateway = mock_gateway(temp.path(), Arc::clone(&adapter)).await;

    gateway
        .set_current_task("task-a", Some(slack_metadata()), Some("U1".into()))
        .await;
    let input = json!({ "command": "cargo test" });
    gateway.approve("Bash", &input).await;
    assert_eq!(adapter.counters.approvals.load(Ordering::SeqCst), 1);

    // New task: the allow-set is per-task, so the same fingerprint
    // round-trips again.
    gateway
        .set_current_task("task-b", Some(slack_metadata()), Some("U1".into()))
        .await;
    let reply = gateway.approve("Bash", &input).await;
    assert_eq!(reply.decision, ApprovalDecision::Allow);
    assert_eq!(adapter.counters.approvals.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn write_and_edit_fingerprint_by_path() {
    let temp = tempfile::tempdir().expect("tempdir");
    let adapter = Arc::new(MockAdapter::new(TaskSource::Slack));
    let gateway = mock_gateway(temp.path(), Arc::clone(&adapter)).await;
    gateway
        .set_current_task("t1", Some(slack_metadata()), Some("U1".into()))
        .await;

    gateway
        .approve("Write", &json!({ "file_path": "a.rs", "content": "1" }))
        .await;
    // Same path, different content: auto-approved.
    gateway
        .approve("Write", &json!({ "file_path": "a.rs", "content": "2" }))
        .await;
    assert_eq!(adapter.counters.approvals.load(Ordering::SeqCst), 1);

    // Different path: a fresh round-trip.
    gateway
        .approve("Write", &json!({ "file_path": "b.rs", "content": "1" }))
        .await;
    assert_eq!(adapter.counters.approvals.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn clear_scope_denies_followups() {
    let temp = tempfile::tempdir().expect("tempdir");
    let adapter = Arc::new(MockAdapter::new(TaskSource::Slack));
    let gateway = mock_gateway(temp.path(), Arc::clone(&adapter)).await;

    gateway
        .set_current_task("t1", Some(slack_metadata()), Some("U1".into()))
        .await;
    gateway.approve("Bash", &json!({ "command": "ls" })).await;
    gateway.clear_current_task().await;

    let reply = gateway.approve("Bash", &json!({ "command": "ls" })).await;
    assert_eq!(reply.decision, ApprovalDecision::Deny);
}

#[tokio::test]
async fn ask_defaults_the_option_set() {
    let temp = tempfile::tempdir().expect("tempdir");
    let adapter = Arc::new(MockAdapter::new(TaskSource::Slack));
    let gateway = mock_gateway(temp.path(), Arc::clone(&adapter)).await;
    gateway
        .set_current_task("t1", Some(slack_metadata()), Some("U1".into()))
        .await;

    // The mock answers with the first option, so the default set's first
    // entry comes back.
    let answer = gateway.ask("続行しますか？", &[], None).await.expect("ask");
    assert_eq!(answer, "はい");
    assert_eq!(adapter.counters.questions.load(Ordering::SeqCst), 1);

    let answer = gateway
        .ask("which one?", &["a".into(), "b".into()], None)
        .await
        .expect("ask");
    assert_eq!(answer, "a");
}
