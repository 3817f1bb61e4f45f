//! HTTP polling channel.
//!
//! Serves poll-based devices through the `/api/v1` surface mounted on the
//! authorization gateway: message intake, task status projection, and
//! approval/answer resolution. The adapter mirrors engine notifications
//! into a per-task status map that `GET /tasks/{id}` projects.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::channels::{
    ChannelAdapter, ChannelCallbacks, ChannelHealth, InboundMessage, NotificationContext,
};
use crate::gateway::GatewayState;
use crate::identity::IdentityResolver;
use crate::models::approval::{ApprovalDecision, ApprovalOutcome};
use crate::models::task::{TaskMetadata, TaskResult, TaskSource};
use crate::registry::ChannelRegistry;
use crate::{AppError, Result};

/// How long an approval or question waits for a poll-based device.
const PENDING_DEADLINE: Duration = Duration::from_secs(300);

/// Device-facing task status.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum PollStatus {
    Queued,
    Processing,
    AwaitingApproval,
    AwaitingAnswer,
    Completed,
    Failed,
}

/// Pending interaction surfaced to polling devices.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
struct PendingView {
    request_id: String,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    question: Option<String>,
    options: Vec<String>,
}

#[derive(Debug)]
enum PendingResolver {
    Approval(oneshot::Sender<ApprovalOutcome>),
    Answer(oneshot::Sender<String>),
}

#[derive(Debug, Default)]
struct TaskEntry {
    status: Option<PollStatus>,
    result: Option<TaskResult>,
    pending: Option<PendingView>,
    last_progress: Option<String>,
}

struct HttpChannelState {
    callbacks: OnceLock<ChannelCallbacks>,
    registry: OnceLock<Arc<ChannelRegistry>>,
    identity: IdentityResolver,
    tasks: Mutex<HashMap<String, TaskEntry>>,
    resolvers: Mutex<HashMap<String, PendingResolver>>,
}

/// Poll-based REST channel adapter.
pub struct HttpPollAdapter {
    state: Arc<HttpChannelState>,
}

impl HttpPollAdapter {
    /// Create the adapter.
    #[must_use]
    pub fn new(identity: IdentityResolver) -> Self {
        Self {
            state: Arc::new(HttpChannelState {
                callbacks: OnceLock::new(),
                registry: OnceLock::new(),
                identity,
                tasks: Mutex::new(HashMap::new()),
                resolvers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Late-bind the registry used by the channel health endpoint.
    pub fn bind_registry(&self, registry: Arc<ChannelRegistry>) {
        let _ = self.state.registry.set(registry);
    }

    /// Build the `/api/v1` router. `/health` is open; every other route is
    /// guarded by the gateway's bearer middleware.
    #[must_use]
    pub fn api_router(&self, gateway: Arc<GatewayState>) -> Router {
        let secured = Router::new()
            .route("/messages", post(post_message))
            .route("/tasks/{id}", get(get_task))
            .route("/tasks/{id}/approve", post(post_approve))
            .route("/tasks/{id}/answer", post(post_answer))
            .route_layer(axum::middleware::from_fn_with_state(
                gateway,
                crate::gateway::server::bearer_auth,
            ));
        Router::new()
            .route("/health", get(get_health))
            .merge(secured)
            .with_state(Arc::clone(&self.state))
    }

    async fn set_status(&self, task_id: &str, status: PollStatus) {
        let mut tasks = self.state.tasks.lock().await;
        let entry = tasks.entry(task_id.to_owned()).or_default();
        entry.status = Some(status);
        if !matches!(status, PollStatus::AwaitingApproval | PollStatus::AwaitingAnswer) {
            entry.pending = None;
        }
    }
}

#[async_trait]
impl ChannelAdapter for HttpPollAdapter {
    fn name(&self) -> &'static str {
        "http-poll"
    }

    fn source(&self) -> TaskSource {
        TaskSource::Http
    }

    async fn init(&self, callbacks: ChannelCallbacks) -> Result<()> {
        self.state
            .callbacks
            .set(callbacks)
            .map_err(|_| AppError::Channel("http adapter already initialized".into()))
    }

    async fn start(&self) -> Result<()> {
        // The HTTP surface is served by the gateway; nothing to launch.
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let resolvers: Vec<(String, PendingResolver)> =
            self.state.resolvers.lock().await.drain().collect();
        for (request_id, resolver) in resolvers {
            info!(request_id, "resolving pending device interaction as deny at stop");
            match resolver {
                PendingResolver::Approval(tx) => {
                    let _ = tx.send(ApprovalOutcome::deny("channel stopped"));
                }
                PendingResolver::Answer(tx) => {
                    let _ = tx.send(String::new());
                }
            }
        }
        Ok(())
    }

    async fn health(&self) -> ChannelHealth {
        ChannelHealth::Ok
    }

    fn is_user_allowed(&self, id: &str) -> bool {
        self.state.identity.is_user_allowed(TaskSource::Http, id)
    }

    async fn send_message(&self, ctx: &NotificationContext, text: &str) -> Result<()> {
        let mut tasks = self.state.tasks.lock().await;
        let entry = tasks.entry(ctx.task_id.clone()).or_default();
        entry.last_progress = Some(text.to_owned());
        Ok(())
    }

    async fn request_approval(
        &self,
        ctx: &NotificationContext,
        request_id: &str,
        tool: &str,
        command: &str,
        _requested_by: Option<&str>,
    ) -> Result<ApprovalOutcome> {
        let (tx, rx) = oneshot::channel();
        {
            let mut tasks = self.state.tasks.lock().await;
            let entry = tasks.entry(ctx.task_id.clone()).or_default();
            entry.status = Some(PollStatus::AwaitingApproval);
            entry.pending = Some(PendingView {
                request_id: request_id.to_owned(),
                kind: "approval",
                tool: Some(tool.to_owned()),
                command: Some(command.to_owned()),
                question: None,
                options: vec!["allow".into(), "deny".into()],
            });
        }
        self.state
            .resolvers
            .lock()
            .await
            .insert(request_id.to_owned(), PendingResolver::Approval(tx));

        let outcome = match tokio::time::timeout(PENDING_DEADLINE, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => ApprovalOutcome::deny("approval channel closed"),
            Err(_) => {
                warn!(request_id, "device approval timed out");
                ApprovalOutcome::deny("approval timed out")
            }
        };
        self.state.resolvers.lock().await.remove(request_id);
        self.set_status(&ctx.task_id, PollStatus::Processing).await;
        Ok(outcome)
    }

    async fn ask_question(
        &self,
        ctx: &NotificationContext,
        request_id: &str,
        question: &str,
        options: &[String],
    ) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        {
            let mut tasks = self.state.tasks.lock().await;
            let entry = tasks.entry(ctx.task_id.clone()).or_default();
            entry.status = Some(PollStatus::AwaitingAnswer);
            entry.pending = Some(PendingView {
                request_id: request_id.to_owned(),
                kind: "question",
                tool: None,
                command: None,
                question: Some(question.to_owned()),
                options: options.to_vec(),
            });
        }
        self.state
            .resolvers
            .lock()
            .await
            .insert(request_id.to_owned(), PendingResolver::Answer(tx));

        let answer = match tokio::time::timeout(PENDING_DEADLINE, rx).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(_)) => String::new(),
            Err(_) => {
                warn!(request_id, "device answer timed out");
                String::new()
            }
        };
        self.state.resolvers.lock().await.remove(request_id);
        self.set_status(&ctx.task_id, PollStatus::Processing).await;
        Ok(answer)
    }

    async fn notify_task_started(&self, ctx: &NotificationContext) -> Result<()> {
        self.set_status(&ctx.task_id, PollStatus::Processing).await;
        Ok(())
    }

    async fn notify_task_completed(
        &self,
        ctx: &NotificationContext,
        output: &str,
        pr_url: Option<&str>,
    ) -> Result<()> {
        let mut tasks = self.state.tasks.lock().await;
        let entry = tasks.entry(ctx.task_id.clone()).or_default();
        entry.status = Some(PollStatus::Completed);
        entry.pending = None;
        entry.result = Some(TaskResult {
            success: true,
            output: output.to_owned(),
            pr_url: pr_url.map(ToOwned::to_owned),
            error: None,
            session_id: None,
        });
        Ok(())
    }

    async fn notify_task_error(&self, ctx: &NotificationContext, error: &str) -> Result<()> {
        let mut tasks = self.state.tasks.lock().await;
        let entry = tasks.entry(ctx.task_id.clone()).or_default();
        entry.status = Some(PollStatus::Failed);
        entry.pending = None;
        entry.result = Some(TaskResult {
            success: false,
            error: Some(error.to_owned()),
            ..TaskResult::default()
        });
        Ok(())
    }

    async fn notify_progress(&self, ctx: &NotificationContext, message: &str) -> Result<()> {
        self.send_message(ctx, message).await
    }
}

// ── Route handlers ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostMessageBody {
    message: String,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    target_repo: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApproveBody {
    request_id: String,
    decision: ApprovalDecision,
    #[serde(default)]
    comment: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnswerBody {
    request_id: String,
    answer: String,
}

fn bad_request(rejection: &JsonRejection) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": rejection.body_text() })),
    )
        .into_response()
}

fn not_found(what: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": what }))).into_response()
}

async fn post_message(
    State(state): State<Arc<HttpChannelState>>,
    body: std::result::Result<Json<PostMessageBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_request(&rejection),
    };

    if let Some(device) = body.device_id.as_deref() {
        if !state.identity.is_user_allowed(TaskSource::Http, device) {
            return (
                StatusCode::FORBIDDEN,
                Json(json!({ "error": "device not allowed" })),
            )
                .into_response();
        }
    }

    let Some(callbacks) = state.callbacks.get() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "channel not initialized" })),
        )
            .into_response();
    };

    let correlation_id = Uuid::new_v4().to_string();
    state
        .tasks
        .lock()
        .await
        .insert(correlation_id.clone(), TaskEntry {
            status: Some(PollStatus::Queued),
            ..TaskEntry::default()
        });

    let metadata = TaskMetadata::Http {
        correlation_id: correlation_id.clone(),
        device_id: body.device_id,
        text: body.message.clone(),
        target_repo: body.target_repo,
    };
    let inbound = InboundMessage {
        prompt: body.message,
        metadata,
    };
    if callbacks.inbound.send(inbound).is_err() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "engine unavailable" })),
        )
            .into_response();
    }

    (
        StatusCode::ACCEPTED,
        Json(json!({
            "taskId": correlation_id,
            "status": "queued",
            "pollUrl": format!("/api/v1/tasks/{correlation_id}"),
        })),
    )
        .into_response()
}

async fn get_task(
    State(state): State<Arc<HttpChannelState>>,
    Path(id): Path<String>,
) -> Response {
    let tasks = state.tasks.lock().await;
    let Some(entry) = tasks.get(&id) else {
        return not_found("unknown task");
    };
    let mut payload = json!({
        "taskId": id,
        "status": entry.status.unwrap_or(PollStatus::Queued),
    });
    if let Some(result) = &entry.result {
        payload["result"] = serde_json::to_value(result).unwrap_or(Value::Null);
    }
    if let Some(pending) = &entry.pending {
        payload["pending"] = serde_json::to_value(pending).unwrap_or(Value::Null);
    }
    if let Some(progress) = &entry.last_progress {
        payload["lastProgress"] = Value::String(progress.clone());
    }
    Json(payload).into_response()
}

async fn post_approve(
    State(state): State<Arc<HttpChannelState>>,
    Path(id): Path<String>,
    body: std::result::Result<Json<ApproveBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_request(&rejection),
    };
    let _ = id;
    let Some(resolver) = state.resolvers.lock().await.remove(&body.request_id) else {
        return not_found("no pending approval for request id");
    };
    match resolver {
        PendingResolver::Approval(tx) => {
            let outcome = ApprovalOutcome {
                decision: body.decision,
                comment: body.comment,
                responded_by: None,
            };
            let _ = tx.send(outcome);
            Json(json!({
                "requestId": body.request_id,
                "decision": body.decision,
                "accepted": true,
            }))
            .into_response()
        }
        PendingResolver::Answer(tx) => {
            // Wrong endpoint for this pending; put it back untouched.
            state
                .resolvers
                .lock()
                .await
                .insert(body.request_id.clone(), PendingResolver::Answer(tx));
            not_found("pending request is a question")
        }
    }
}

async fn post_answer(
    State(state): State<Arc<HttpChannelState>>,
    Path(id): Path<String>,
    body: std::result::Result<Json<AnswerBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_request(&rejection),
    };
    let _ = id;
    let Some(resolver) = state.resolvers.lock().await.remove(&body.request_id) else {
        return not_found("no pending question for request id");
    };
    match resolver {
        PendingResolver::Answer(tx) => {
            let _ = tx.send(body.answer.clone());
            Json(json!({
                "requestId": body.request_id,
                "answer": body.answer,
                "accepted": true,
            }))
            .into_response()
        }
        PendingResolver::Approval(tx) => {
            state
                .resolvers
                .lock()
                .await
                .insert(body.request_id.clone(), PendingResolver::Approval(tx));
            not_found("pending request is an approval")
        }
    }
}

async fn get_health(State(state): State<Arc<HttpChannelState>>) -> Response {
    let channels = match state.registry.get() {
        Some(registry) => {
            let mut channels = serde_json::Map::new();
            for (source, health) in registry.health_all().await {
                channels.insert(source.to_string(), json!(health.as_status()));
            }
            Value::Object(channels)
        }
        None => json!({}),
    };
    Json(json!({ "status": "ok", "channels": channels })).into_response()
}
