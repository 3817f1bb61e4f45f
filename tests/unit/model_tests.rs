use claps::models::session::SessionKey;
use claps::models::task::{Task, TaskMetadata, TaskSource, TaskStatus};

fn slack_metadata() -> TaskMetadata {
    TaskMetadata::Slack {
        channel_id: "C1".into(),
        thread_ts: "1711.0001".into(),
        user_id: "U1".into(),
        text: "do the thing".into(),
        target_repo: None,
    }
}

#[test]
fn new_task_starts_pending() {
    let task = Task::new("do the thing".into(), slack_metadata());
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.source, TaskSource::Slack);
    assert!(task.started_at.is_none());
    assert!(task.result.is_none());
}

#[test]
fn http_task_reuses_correlation_id() {
    let metadata = TaskMetadata::Http {
        correlation_id: "corr-42".into(),
        device_id: None,
        text: "hi".into(),
        target_repo: None,
    };
    let task = Task::new("hi".into(), metadata);
    assert_eq!(task.id, "corr-42");
}

#[test]
fn metadata_serde_is_tagged_by_source() {
    let metadata = TaskMetadata::Github {
        owner: "octo".into(),
        repo: "demo".into(),
        issue_number: 7,
        issue_title: "Fix it".into(),
        issue_url: "https://github.com/octo/demo/issues/7".into(),
        requested_by: Some("octocat".into()),
        thread_id: None,
    };
    let value = serde_json::to_value(&metadata).expect("serialize");
    assert_eq!(value["source"], "github");
    assert_eq!(value["issue_number"], 7);

    let round: TaskMetadata = serde_json::from_value(value).expect("deserialize");
    assert_eq!(round, metadata);
}

#[test]
fn target_repo_only_on_channel_variants() {
    let slack = TaskMetadata::Slack {
        channel_id: "C1".into(),
        thread_ts: "t".into(),
        user_id: "U1".into(),
        text: String::new(),
        target_repo: Some("octo/demo".into()),
    };
    assert_eq!(slack.target_repo(), Some("octo/demo"));

    let github = TaskMetadata::Github {
        owner: "octo".into(),
        repo: "demo".into(),
        issue_number: 1,
        issue_title: String::new(),
        issue_url: String::new(),
        requested_by: None,
        thread_id: None,
    };
    assert_eq!(github.target_repo(), None);
}

#[test]
fn session_key_rendered_forms() {
    assert_eq!(SessionKey::slack("171.9", "U1").as_str(), "slack:171.9:U1");
    assert_eq!(
        SessionKey::github("octo", "demo", 42).as_str(),
        "github:octo/demo#42"
    );
    assert_eq!(SessionKey::line("L9").as_str(), "line:L9");
    assert_eq!(SessionKey::http("corr").as_str(), "http:corr");
    assert_eq!(
        SessionKey::user("U1", Some("octo/demo")).as_str(),
        "user:U1:octo/demo"
    );
    assert_eq!(SessionKey::user("U1", None).as_str(), "user:U1:default");
}
