//! LINE Messaging API channel adapter.
//!
//! Inbound text arrives on a local webhook listener; outbound messages go
//! through the Messaging API push endpoint. Approvals and questions render
//! as quick-reply buttons whose postbacks resolve the pending decision.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channels::{
    ChannelAdapter, ChannelCallbacks, ChannelHealth, InboundMessage, NotificationContext,
};
use crate::config::LineConfig;
use crate::identity::IdentityResolver;
use crate::models::approval::{ApprovalDecision, ApprovalOutcome};
use crate::models::task::{TaskMetadata, TaskSource};
use crate::{AppError, Result};

const API_BASE: &str = "https://api.line.me/v2/bot";
const PENDING_DEADLINE: Duration = Duration::from_secs(300);
const POSTBACK_SEPARATOR: &str = "::";

struct LineShared {
    config: LineConfig,
    identity: IdentityResolver,
    http: reqwest::Client,
    callbacks: OnceLock<ChannelCallbacks>,
    pending_approvals: Mutex<HashMap<String, oneshot::Sender<ApprovalOutcome>>>,
    pending_questions: Mutex<HashMap<String, oneshot::Sender<String>>>,
}

/// LINE channel adapter.
pub struct LineAdapter {
    shared: Arc<LineShared>,
    webhook_task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl LineAdapter {
    /// Create the adapter for the given LINE configuration.
    #[must_use]
    pub fn new(config: LineConfig, identity: IdentityResolver) -> Self {
        Self {
            shared: Arc::new(LineShared {
                config,
                identity,
                http: reqwest::Client::new(),
                callbacks: OnceLock::new(),
                pending_approvals: Mutex::new(HashMap::new()),
                pending_questions: Mutex::new(HashMap::new()),
            }),
            webhook_task: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// The LINE user id a context's notifications go to, when its
    /// metadata names one.
    fn target_user(ctx: &NotificationContext) -> Option<&str> {
        match &ctx.metadata {
            TaskMetadata::Line { user_id, .. } => Some(user_id),
            _ => None,
        }
    }

    async fn push(&self, user_id: &str, messages: Value) -> Result<()> {
        let response = self
            .shared
            .http
            .post(format!("{API_BASE}/message/push"))
            .header(
                "Authorization",
                format!("Bearer {}", self.shared.config.channel_access_token),
            )
            .json(&json!({ "to": user_id, "messages": messages }))
            .send()
            .await
            .map_err(|err| AppError::Channel(format!("line push failed: {err}")))?;
        if !response.status().is_success() {
            return Err(AppError::Channel(format!(
                "line push returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    fn quick_reply_message(text: &str, items: &[(String, String)]) -> Value {
        let items: Vec<Value> = items
            .iter()
            .map(|(label, data)| {
                json!({
                    "type": "action",
                    "action": {
                        "type": "postback",
                        "label": label,
                        "data": data,
                        "displayText": label,
                    },
                })
            })
            .collect();
        json!([{
            "type": "text",
            "text": text,
            "quickReply": { "items": items },
        }])
    }
}

#[async_trait]
impl ChannelAdapter for LineAdapter {
    fn name(&self) -> &'static str {
        "line"
    }

    fn source(&self) -> TaskSource {
        TaskSource::Line
    }

    async fn init(&self, callbacks: ChannelCallbacks) -> Result<()> {
        self.shared
            .callbacks
            .set(callbacks)
            .map_err(|_| AppError::Channel("line adapter already initialized".into()))
    }

    async fn start(&self) -> Result<()> {
        if self.shared.config.channel_access_token.is_empty() {
            return Err(AppError::Channel("line access token not configured".into()));
        }

        let router = Router::new()
            .route("/webhook", post(handle_webhook))
            .with_state(Arc::clone(&self.shared));
        let bind = std::net::SocketAddr::from(([127, 0, 0, 1], self.shared.config.webhook_port));
        let listener = tokio::net::TcpListener::bind(bind)
            .await
            .map_err(|err| AppError::Channel(format!("failed to bind line webhook: {err}")))?;
        info!(%bind, "line webhook listening");

        let cancel = self.cancel.clone();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                cancel.cancelled().await;
            });
            if let Err(err) = serve.await {
                warn!(%err, "line webhook server error");
            }
        });
        *self.webhook_task.lock().await = Some(task);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        if let Some(task) = self.webhook_task.lock().await.take() {
            let _ = task.await;
        }
        for (request_id, tx) in self.shared.pending_approvals.lock().await.drain() {
            info!(request_id, "resolving pending line approval as deny at stop");
            let _ = tx.send(ApprovalOutcome::deny("channel stopped"));
        }
        self.shared.pending_questions.lock().await.clear();
        Ok(())
    }

    async fn health(&self) -> ChannelHealth {
        if self.shared.config.channel_access_token.is_empty() {
            return ChannelHealth::Down("line access token not configured".into());
        }
        ChannelHealth::Ok
    }

    fn is_user_allowed(&self, id: &str) -> bool {
        self.shared.identity.is_user_allowed(TaskSource::Line, id)
    }

    async fn send_message(&self, ctx: &NotificationContext, text: &str) -> Result<()> {
        let Some(user_id) = Self::target_user(ctx) else {
            debug!(task_id = %ctx.task_id, "line adapter has no target for foreign metadata");
            return Ok(());
        };
        self.push(user_id, json!([{ "type": "text", "text": text }]))
            .await
    }

    async fn request_approval(
        &self,
        ctx: &NotificationContext,
        request_id: &str,
        tool: &str,
        command: &str,
        _requested_by: Option<&str>,
    ) -> Result<ApprovalOutcome> {
        let Some(user_id) = Self::target_user(ctx) else {
            return Ok(ApprovalOutcome::deny("no line target for task"));
        };

        let (tx, rx) = oneshot::channel();
        self.shared
            .pending_approvals
            .lock()
            .await
            .insert(request_id.to_owned(), tx);

        let text = format!("承認リクエスト: {tool}\n\n{command}");
        let items = vec![
            (
                "許可".to_owned(),
                format!("approve{POSTBACK_SEPARATOR}{request_id}{POSTBACK_SEPARATOR}allow"),
            ),
            (
                "拒否".to_owned(),
                format!("approve{POSTBACK_SEPARATOR}{request_id}{POSTBACK_SEPARATOR}deny"),
            ),
        ];
        if let Err(err) = self
            .push(user_id, Self::quick_reply_message(&text, &items))
            .await
        {
            self.shared.pending_approvals.lock().await.remove(request_id);
            return Err(err);
        }

        let outcome = match tokio::time::timeout(PENDING_DEADLINE, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => ApprovalOutcome::deny("approval channel closed"),
            Err(_) => {
                warn!(request_id, "line approval timed out");
                ApprovalOutcome::deny("approval timed out")
            }
        };
        self.shared.pending_approvals.lock().await.remove(request_id);
        Ok(outcome)
    }

    async fn ask_question(
        &self,
        ctx: &NotificationContext,
        request_id: &str,
        question: &str,
        options: &[String],
    ) -> Result<String> {
        let Some(user_id) = Self::target_user(ctx) else {
            return Err(AppError::Channel("no line target for task".into()));
        };

        let (tx, rx) = oneshot::channel();
        self.shared
            .pending_questions
            .lock()
            .await
            .insert(request_id.to_owned(), tx);

        let items: Vec<(String, String)> = options
            .iter()
            .map(|option| {
                (
                    option.clone(),
                    format!(
                        "question{POSTBACK_SEPARATOR}{request_id}{POSTBACK_SEPARATOR}{option}"
                    ),
                )
            })
            .collect();
        if let Err(err) = self
            .push(user_id, Self::quick_reply_message(question, &items))
            .await
        {
            self.shared.pending_questions.lock().await.remove(request_id);
            return Err(err);
        }

        let reply = tokio::time::timeout(PENDING_DEADLINE, rx).await;
        self.shared.pending_questions.lock().await.remove(request_id);
        match reply {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(_)) => Err(AppError::Channel("question channel closed".into())),
            Err(_) => Err(AppError::Timeout("question timed out".into())),
        }
    }

    async fn notify_task_started(&self, ctx: &NotificationContext) -> Result<()> {
        self.send_message(ctx, "🚀 タスクを開始しました").await
    }

    async fn notify_task_completed(
        &self,
        ctx: &NotificationContext,
        output: &str,
        pr_url: Option<&str>,
    ) -> Result<()> {
        let mut text = format!("✅ タスクが完了しました\n\n{output}");
        if let Some(pr_url) = pr_url {
            text.push_str(&format!("\n\n{pr_url}"));
        }
        self.send_split_message(ctx, &text).await
    }

    async fn notify_task_error(&self, ctx: &NotificationContext, error: &str) -> Result<()> {
        self.send_message(ctx, &format!("❌ タスクが失敗しました: {error}"))
            .await
    }

    async fn notify_progress(&self, ctx: &NotificationContext, message: &str) -> Result<()> {
        self.send_message(ctx, message).await
    }
}

/// Webhook handler: text messages become inbound tasks, postbacks resolve
/// pending approvals and questions. Always answers 200 so LINE does not
/// retry on our internal errors.
async fn handle_webhook(
    State(shared): State<Arc<LineShared>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let Some(events) = body["events"].as_array() else {
        return StatusCode::OK;
    };

    for event in events {
        match event["type"].as_str() {
            Some("message") => handle_message_event(&shared, event),
            Some("postback") => handle_postback_event(&shared, event).await,
            _ => {}
        }
    }
    StatusCode::OK
}

fn handle_message_event(shared: &LineShared, event: &Value) {
    if event["message"]["type"].as_str() != Some("text") {
        return;
    }
    let Some(user_id) = event["source"]["userId"].as_str() else {
        return;
    };
    let Some(text) = event["message"]["text"].as_str() else {
        return;
    };
    let reply_token = event["replyToken"].as_str().unwrap_or_default();

    if !shared.identity.is_user_allowed(TaskSource::Line, user_id) {
        warn!(user_id, "unauthorized line user; message ignored");
        return;
    }

    let metadata = TaskMetadata::Line {
        user_id: user_id.to_owned(),
        reply_token: reply_token.to_owned(),
        text: text.to_owned(),
        target_repo: crate::channels::slack::inbound::parse_target_repo(text),
    };
    let inbound = InboundMessage {
        prompt: text.to_owned(),
        metadata,
    };
    if let Some(callbacks) = shared.callbacks.get() {
        if callbacks.inbound.send(inbound).is_err() {
            warn!("engine inbound channel closed; line message dropped");
        }
    }
}

async fn handle_postback_event(shared: &LineShared, event: &Value) {
    let Some(data) = event["postback"]["data"].as_str() else {
        return;
    };
    let user_id = event["source"]["userId"].as_str().unwrap_or_default();
    let parts: Vec<&str> = data.splitn(3, POSTBACK_SEPARATOR).collect();
    match parts.as_slice() {
        ["approve", request_id, decision] => {
            let resolved = shared.pending_approvals.lock().await.remove(*request_id);
            if let Some(tx) = resolved {
                let decision = if *decision == "allow" {
                    ApprovalDecision::Allow
                } else {
                    ApprovalDecision::Deny
                };
                info!(request_id, %decision, user_id, "line approval decision received");
                let _ = tx.send(ApprovalOutcome {
                    decision,
                    comment: None,
                    responded_by: Some(user_id.to_owned()),
                });
            }
        }
        ["question", request_id, answer] => {
            let resolved = shared.pending_questions.lock().await.remove(*request_id);
            if let Some(tx) = resolved {
                info!(request_id, answer, user_id, "line question answered");
                let _ = tx.send((*answer).to_owned());
            }
        }
        _ => debug!(data, "unrecognized line postback"),
    }
}
