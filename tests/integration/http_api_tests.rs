//! HTTP polling channel flows through the mounted `/api/v1` surface.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use claps::channels::http::HttpPollAdapter;
use claps::channels::{ChannelAdapter, ChannelCallbacks, NotificationContext};
use claps::config::AdminConfig;
use claps::gateway::{self, GatewayState};
use claps::models::approval::ApprovalDecision;
use claps::models::task::TaskMetadata;
use claps::registry::ChannelRegistry;
use claps::router::NotificationRouter;

use super::test_helpers::{ephemeral_port, test_identity};

struct ApiStack {
    base: String,
    token: String,
    adapter: Arc<HttpPollAdapter>,
    inbound: tokio::sync::mpsc::UnboundedReceiver<claps::channels::InboundMessage>,
    ct: CancellationToken,
}

async fn spawn_api() -> ApiStack {
    let temp = tempfile::tempdir().expect("tempdir");
    let adapter = Arc::new(HttpPollAdapter::new(test_identity(AdminConfig::default())));

    let mut registry = ChannelRegistry::new();
    registry.register(Arc::clone(&adapter) as Arc<dyn ChannelAdapter>);
    let registry = Arc::new(registry);
    adapter.bind_registry(Arc::clone(&registry));

    let (tx, inbound) = tokio::sync::mpsc::unbounded_channel();
    registry
        .init_all(&ChannelCallbacks { inbound: tx })
        .await;
    registry.start_all().await;
    let router = Arc::new(NotificationRouter::new(Arc::clone(&registry)));

    let port = ephemeral_port().await;
    let ct = CancellationToken::new();
    let state = Arc::new(GatewayState::new(
        router,
        temp.path().join("auth-token"),
        port,
        ct.child_token(),
    ));
    let api = adapter.api_router(Arc::clone(&state));

    let serve_state = Arc::clone(&state);
    let serve_ct = ct.clone();
    tokio::spawn(async move {
        let _ = gateway::serve(serve_state, Some(api), serve_ct).await;
    });
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    std::mem::forget(temp);

    ApiStack {
        base: format!("http://127.0.0.1:{port}"),
        token: state.token().to_owned(),
        adapter,
        inbound,
        ct,
    }
}

#[tokio::test]
async fn api_health_is_open_and_reports_channels() {
    let stack = spawn_api().await;
    let response = reqwest::get(format!("{}/api/v1/health", stack.base))
        .await
        .expect("GET health");
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["channels"]["http"], "ok");
    stack.ct.cancel();
}

#[tokio::test]
async fn message_intake_requires_bearer_token() {
    let stack = spawn_api().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/api/v1/messages", stack.base))
        .json(&serde_json::json!({ "message": "hi" }))
        .send()
        .await
        .expect("POST messages");
    assert_eq!(response.status(), 401);
    stack.ct.cancel();
}

#[tokio::test]
async fn message_intake_returns_202_and_enqueues() {
    let mut stack = spawn_api().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/api/v1/messages", stack.base))
        .header("Authorization", format!("Bearer {}", stack.token))
        .json(&serde_json::json!({ "message": "hello device", "deviceId": "dev-1" }))
        .send()
        .await
        .expect("POST messages");
    assert_eq!(response.status(), 202);
    let body: serde_json::Value = response.json().await.expect("json");
    let task_id = body["taskId"].as_str().expect("taskId").to_owned();
    assert_eq!(body["status"], "queued");
    assert_eq!(
        body["pollUrl"].as_str().expect("pollUrl"),
        format!("/api/v1/tasks/{task_id}")
    );

    let inbound = stack.inbound.recv().await.expect("inbound message");
    assert_eq!(inbound.prompt, "hello device");
    match inbound.metadata {
        TaskMetadata::Http {
            correlation_id,
            device_id,
            ..
        } => {
            assert_eq!(correlation_id, task_id);
            assert_eq!(device_id.as_deref(), Some("dev-1"));
        }
        other => panic!("unexpected metadata: {other:?}"),
    }

    // The queued task is pollable immediately.
    let response = client
        .get(format!("{}/api/v1/tasks/{task_id}", stack.base))
        .header("Authorization", format!("Bearer {}", stack.token))
        .send()
        .await
        .expect("GET task");
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["status"], "queued");
    stack.ct.cancel();
}

#[tokio::test]
async fn unknown_task_is_404() {
    let stack = spawn_api().await;
    let client = reqwest::Client::new();
    let response = client
        .get(format!("{}/api/v1/tasks/ghost", stack.base))
        .header("Authorization", format!("Bearer {}", stack.token))
        .send()
        .await
        .expect("GET task");
    assert_eq!(response.status(), 404);
    stack.ct.cancel();
}

#[tokio::test]
async fn status_transitions_through_processing_to_completed() {
    let stack = spawn_api().await;
    let client = reqwest::Client::new();

    let ctx = NotificationContext {
        task_id: "corr-1".into(),
        metadata: TaskMetadata::Http {
            correlation_id: "corr-1".into(),
            device_id: None,
            text: "x".into(),
            target_repo: None,
        },
    };
    stack.adapter.notify_task_started(&ctx).await.expect("started");

    let body: serde_json::Value = client
        .get(format!("{}/api/v1/tasks/corr-1", stack.base))
        .header("Authorization", format!("Bearer {}", stack.token))
        .send()
        .await
        .expect("GET")
        .json()
        .await
        .expect("json");
    assert_eq!(body["status"], "processing");

    stack
        .adapter
        .notify_task_completed(&ctx, "all good", Some("https://github.com/o/r/pull/1"))
        .await
        .expect("completed");

    let body: serde_json::Value = client
        .get(format!("{}/api/v1/tasks/corr-1", stack.base))
        .header("Authorization", format!("Bearer {}", stack.token))
        .send()
        .await
        .expect("GET")
        .json()
        .await
        .expect("json");
    assert_eq!(body["status"], "completed");
    assert_eq!(body["result"]["output"], "all good");
    assert_eq!(body["result"]["pr_url"], "https://github.com/o/r/pull/1");
    stack.ct.cancel();
}

#[tokio::test]
async fn approval_round_trip_through_the_poll_api() {
    let stack = spawn_api().await;
    let client = reqwest::Client::new();

    let ctx = NotificationContext {
        task_id: "corr-2".into(),
        metadata: TaskMetadata::Http {
            correlation_id: "corr-2".into(),
            device_id: None,
            text: "x".into(),
            target_repo: None,
        },
    };

    // The engine side blocks on the approval; run it in a background task.
    let adapter = Arc::clone(&stack.adapter);
    let approval = tokio::spawn(async move {
        adapter
            .request_approval(&ctx, "req-1", "Bash", "rm -rf /tmp/x", None)
            .await
    });
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // Polling shows the pending approval.
    let body: serde_json::Value = client
        .get(format!("{}/api/v1/tasks/corr-2", stack.base))
        .header("Authorization", format!("Bearer {}", stack.token))
        .send()
        .await
        .expect("GET")
        .json()
        .await
        .expect("json");
    assert_eq!(body["status"], "awaiting_approval");
    assert_eq!(body["pending"]["request_id"], "req-1");
    assert_eq!(body["pending"]["tool"], "Bash");

    // The device approves.
    let response = client
        .post(format!("{}/api/v1/tasks/corr-2/approve", stack.base))
        .header("Authorization", format!("Bearer {}", stack.token))
        .json(&serde_json::json!({ "requestId": "req-1", "decision": "allow" }))
        .send()
        .await
        .expect("POST approve");
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["accepted"], true);

    let outcome = approval.await.expect("join").expect("outcome");
    assert_eq!(outcome.decision, ApprovalDecision::Allow);
    stack.ct.cancel();
}

#[tokio::test]
async fn approving_an_unknown_request_is_404() {
    let stack = spawn_api().await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/api/v1/tasks/corr-x/approve", stack.base))
        .header("Authorization", format!("Bearer {}", stack.token))
        .json(&serde_json::json!({ "requestId": "ghost", "decision": "deny" }))
        .send()
        .await
        .expect("POST approve");
    assert_eq!(response.status(), 404);
    stack.ct.cancel();
}

#[tokio::test]
async fn question_round_trip_through_the_poll_api() {
    let stack = spawn_api().await;
    let client = reqwest::Client::new();

    let ctx = NotificationContext {
        task_id: "corr-3".into(),
        metadata: TaskMetadata::Http {
            correlation_id: "corr-3".into(),
            device_id: None,
            text: "x".into(),
            target_repo: None,
        },
    };
    let adapter = Arc::clone(&stack.adapter);
    let options = vec!["はい".to_owned(), "いいえ".to_owned()];
    let question = tokio::spawn(async move {
        adapter
            .ask_question(&ctx, "req-q", "続行しますか？", &options)
            .await
    });
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let body: serde_json::Value = client
        .get(format!("{}/api/v1/tasks/corr-3", stack.base))
        .header("Authorization", format!("Bearer {}", stack.token))
        .send()
        .await
        .expect("GET")
        .json()
        .await
        .expect("json");
    assert_eq!(body["status"], "awaiting_answer");
    let options = body["pending"]["options"].as_array().expect("options");
    assert!(!options.is_empty(), "pending options are surfaced to the device");

    let response = client
        .post(format!("{}/api/v1/tasks/corr-3/answer", stack.base))
        .header("Authorization", format!("Bearer {}", stack.token))
        .json(&serde_json::json!({ "requestId": "req-q", "answer": "はい" }))
        .send()
        .await
        .expect("POST answer");
    assert_eq!(response.status(), 200);

    let answer = question.await.expect("join").expect("answer");
    assert_eq!(answer, "はい");
    stack.ct.cancel();
}
