//! End-to-end engine flows with a stub agent and a mock channel.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use claps::config::AdminConfig;
use claps::engine::TaskEngine;
use claps::gateway::GatewayState;
use claps::git::github::GithubClient;
use claps::history::HistoryStore;
use claps::models::session::SessionKey;
use claps::models::task::{TaskMetadata, TaskStatus};
use claps::queue::{TaskEvent, TaskQueue};
use claps::registry::ChannelRegistry;
use claps::router::NotificationRouter;
use claps::runner::AgentRunner;
use claps::session::SessionStore;
use claps::worktree::WorktreeManager;

use super::test_helpers::{test_config, test_identity, write_recording_agent, MockAdapter};

struct Stack {
    engine: Arc<TaskEngine>,
    queue: Arc<TaskQueue>,
    sessions: Arc<SessionStore>,
    adapter: Arc<MockAdapter>,
    home: std::path::PathBuf,
    _temp: tempfile::TempDir,
}

async fn build_stack(agent_body_session: &str) -> Stack {
    let temp = tempfile::tempdir().expect("tempdir");
    let home = temp.path().join("home");
    std::fs::create_dir_all(&home).expect("mkdir home");
    let agent = write_recording_agent(temp.path(), agent_body_session);
    let config = Arc::new(test_config(&home, &agent.to_string_lossy()));

    let adapter = Arc::new(MockAdapter::new(claps::models::task::TaskSource::Slack));
    let mut registry = ChannelRegistry::new();
    registry.register(Arc::clone(&adapter) as Arc<dyn claps::channels::ChannelAdapter>);
    let registry = Arc::new(registry);
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    registry
        .init_all(&claps::channels::ChannelCallbacks { inbound: tx })
        .await;
    registry.start_all().await;
    let router = Arc::new(NotificationRouter::new(Arc::clone(&registry)));

    let gateway = Arc::new(GatewayState::new(
        Arc::clone(&router),
        home.join("auth-token"),
        0,
        CancellationToken::new(),
    ));

    let queue = Arc::new(TaskQueue::new());
    let sessions = Arc::new(SessionStore::load(config.sessions_path(), 24).await);
    let worktrees = Arc::new(WorktreeManager::new(Arc::clone(&config)));
    let runner = Arc::new(AgentRunner::new(Arc::clone(&config)));
    let identity = test_identity(AdminConfig::default());
    let github = GithubClient::new(String::new());
    let history = HistoryStore::new(config.history_path());

    let engine = Arc::new(TaskEngine::new(
        Arc::clone(&config),
        Arc::clone(&queue),
        Arc::clone(&sessions),
        worktrees,
        runner,
        router,
        gateway,
        identity,
        github,
        history,
    ));

    Stack {
        engine,
        queue,
        sessions,
        adapter,
        home,
        _temp: temp,
    }
}

fn slack_message(thread_ts: &str, text: &str) -> TaskMetadata {
    TaskMetadata::Slack {
        channel_id: "C1".into(),
        thread_ts: thread_ts.into(),
        user_id: "U1".into(),
        text: text.into(),
        target_repo: None,
    }
}

#[tokio::test]
async fn slack_task_runs_in_shared_workspace_and_stores_session() {
    let stack = build_stack("stub-session-1").await;

    let task = stack
        .queue
        .add("do the thing".into(), slack_message("1000.1", "do the thing"))
        .await;
    stack.engine.pump().await;

    let done = stack.queue.get(&task.id).await.expect("task");
    assert_eq!(done.status, TaskStatus::Completed);
    let result = done.result.expect("result");
    assert_eq!(result.output, "stub done");
    assert_eq!(result.session_id.as_deref(), Some("stub-session-1"));

    // The session is stored under the slack conversation key with the
    // shared-workspace directory.
    let record = stack
        .sessions
        .get(&SessionKey::slack("1000.1", "U1"))
        .await
        .expect("session record");
    assert_eq!(record.session_id, "stub-session-1");
    assert!(record.working_directory.contains("workspace"));

    // The cross-channel fallback key is written too.
    assert!(stack
        .sessions
        .get(&SessionKey::user("U1", None))
        .await
        .is_some());

    // Notifications: started and completed exactly once.
    assert_eq!(stack.adapter.counters.started.load(Ordering::SeqCst), 1);
    assert_eq!(stack.adapter.counters.completed.load(Ordering::SeqCst), 1);
    assert_eq!(stack.adapter.counters.errors.load(Ordering::SeqCst), 0);

    // The agent ran without --resume on a first contact.
    let args = std::fs::read_to_string(
        std::path::Path::new(&record.working_directory).join("last-args.txt"),
    )
    .expect("args");
    assert!(!args.contains("--resume"));

    // A history line was appended.
    let history = std::fs::read_to_string(stack.home.join("history.jsonl")).expect("history");
    assert_eq!(history.lines().count(), 1);
    assert!(history.contains(&task.id));
}

#[tokio::test]
async fn follow_up_resumes_the_stored_session() {
    let stack = build_stack("stub-session-1").await;

    stack
        .queue
        .add("first".into(), slack_message("2000.2", "first"))
        .await;
    stack.engine.pump().await;

    stack
        .queue
        .add("second".into(), slack_message("2000.2", "second"))
        .await;
    stack.engine.pump().await;

    let record = stack
        .sessions
        .get(&SessionKey::slack("2000.2", "U1"))
        .await
        .expect("record");
    let args = std::fs::read_to_string(
        std::path::Path::new(&record.working_directory).join("last-args.txt"),
    )
    .expect("args");
    let args: Vec<&str> = args.lines().collect();
    let resume = args.iter().position(|a| *a == "--resume").expect("--resume");
    assert_eq!(args[resume + 1], "stub-session-1");
}

#[tokio::test]
async fn cross_channel_fallback_resumes_the_canonical_record() {
    let stack = build_stack("stub-session-1").await;

    // Seed only the canonical-user record, as if another channel created it.
    let workspace = stack.home.join("workspace");
    std::fs::create_dir_all(&workspace).expect("mkdir workspace");
    stack
        .sessions
        .put(
            &SessionKey::user("U1", None),
            "canonical-session",
            &workspace.to_string_lossy(),
        )
        .await
        .expect("seed");

    stack
        .queue
        .add("hello".into(), slack_message("3000.3", "hello"))
        .await;
    stack.engine.pump().await;

    let args = std::fs::read_to_string(workspace.join("last-args.txt")).expect("args");
    let args: Vec<&str> = args.lines().collect();
    let resume = args.iter().position(|a| *a == "--resume").expect("--resume");
    assert_eq!(args[resume + 1], "canonical-session");
}

#[tokio::test]
async fn at_most_one_task_runs_at_a_time() {
    let temp = tempfile::tempdir().expect("tempdir");
    let home = temp.path().join("home");
    std::fs::create_dir_all(&home).expect("mkdir home");
    // A slow agent so overlap would be observable.
    let agent = super::test_helpers::write_stub_agent(
        temp.path(),
        r#"sleep 0.3
echo '{"type":"result","result":"ok"}'"#,
    );
    let config = Arc::new(test_config(&home, &agent.to_string_lossy()));

    let adapter = Arc::new(MockAdapter::new(claps::models::task::TaskSource::Slack));
    let mut registry = ChannelRegistry::new();
    registry.register(Arc::clone(&adapter) as Arc<dyn claps::channels::ChannelAdapter>);
    let registry = Arc::new(registry);
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    registry
        .init_all(&claps::channels::ChannelCallbacks { inbound: tx })
        .await;
    registry.start_all().await;
    let router = Arc::new(NotificationRouter::new(Arc::clone(&registry)));
    let gateway = Arc::new(GatewayState::new(
        Arc::clone(&router),
        home.join("auth-token"),
        0,
        CancellationToken::new(),
    ));
    let queue = Arc::new(TaskQueue::new());
    let sessions = Arc::new(SessionStore::load(config.sessions_path(), 24).await);
    let engine = Arc::new(TaskEngine::new(
        Arc::clone(&config),
        Arc::clone(&queue),
        sessions,
        Arc::new(WorktreeManager::new(Arc::clone(&config))),
        Arc::new(AgentRunner::new(Arc::clone(&config))),
        router,
        gateway,
        test_identity(AdminConfig::default()),
        GithubClient::new(String::new()),
        HistoryStore::new(config.history_path()),
    ));

    let mut events = queue.subscribe().await;
    for i in 0..3 {
        queue
            .add(format!("task {i}"), slack_message(&format!("t{i}.0"), "x"))
            .await;
    }

    // Concurrent pumps: the single-flight flag must serialize them.
    tokio::join!(engine.pump(), engine.pump());

    // Observed event order: every Started is followed by its terminal
    // event before the next Started.
    let mut running = 0_i32;
    let mut max_running = 0_i32;
    while let Ok(event) = events.try_recv() {
        match event {
            TaskEvent::Started(_) => {
                running += 1;
                max_running = max_running.max(running);
            }
            TaskEvent::Completed(_) | TaskEvent::Failed(_) => running -= 1,
            TaskEvent::Added(_) => {}
        }
    }
    assert_eq!(max_running, 1, "never more than one task running");

    for status in [TaskStatus::Pending, TaskStatus::Running] {
        assert!(queue.list_by_status(status).await.is_empty());
    }
    assert_eq!(queue.list_by_status(TaskStatus::Completed).await.len(), 3);
}

#[tokio::test]
async fn agent_failure_posts_an_error_notification() {
    let temp = tempfile::tempdir().expect("tempdir");
    let home = temp.path().join("home");
    std::fs::create_dir_all(&home).expect("mkdir home");
    let agent = super::test_helpers::write_stub_agent(temp.path(), "exit 2");
    let config = Arc::new(test_config(&home, &agent.to_string_lossy()));

    let adapter = Arc::new(MockAdapter::new(claps::models::task::TaskSource::Slack));
    let mut registry = ChannelRegistry::new();
    registry.register(Arc::clone(&adapter) as Arc<dyn claps::channels::ChannelAdapter>);
    let registry = Arc::new(registry);
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    registry
        .init_all(&claps::channels::ChannelCallbacks { inbound: tx })
        .await;
    registry.start_all().await;
    let router = Arc::new(NotificationRouter::new(Arc::clone(&registry)));
    let gateway = Arc::new(GatewayState::new(
        Arc::clone(&router),
        home.join("auth-token"),
        0,
        CancellationToken::new(),
    ));
    let queue = Arc::new(TaskQueue::new());
    let engine = Arc::new(TaskEngine::new(
        Arc::clone(&config),
        Arc::clone(&queue),
        Arc::new(SessionStore::load(config.sessions_path(), 24).await),
        Arc::new(WorktreeManager::new(Arc::clone(&config))),
        Arc::new(AgentRunner::new(Arc::clone(&config))),
        router,
        Arc::clone(&gateway),
        test_identity(AdminConfig::default()),
        GithubClient::new(String::new()),
        HistoryStore::new(config.history_path()),
    ));

    let task = queue.add("boom".into(), slack_message("9.9", "boom")).await;
    engine.pump().await;

    let done = queue.get(&task.id).await.expect("task");
    assert_eq!(done.status, TaskStatus::Failed);
    assert_eq!(adapter.counters.errors.load(Ordering::SeqCst), 1);
    assert_eq!(adapter.counters.completed.load(Ordering::SeqCst), 0);

    // The gateway scope is released after the run.
    assert!(gateway.current_task().await.is_none());
}

#[tokio::test]
async fn issue_closed_cleanup_is_idempotent() {
    let stack = build_stack("stub-session-1").await;

    // Seed a session and a thread link as a github dispatch would.
    stack
        .sessions
        .put(
            &SessionKey::github("octo", "demo", 42),
            "sess-issue",
            "/tmp/wt",
        )
        .await
        .expect("seed session");
    stack
        .sessions
        .link_thread_issue("171.9", "octo", "demo", 42)
        .await
        .expect("seed link");

    stack.engine.handle_issue_closed("octo", "demo", 42).await;
    assert!(stack
        .sessions
        .get(&SessionKey::github("octo", "demo", 42))
        .await
        .is_none());
    assert!(stack.sessions.issue_for_thread("171.9").await.is_none());

    // Running it again must not error or recreate anything.
    stack.engine.handle_issue_closed("octo", "demo", 42).await;
}
