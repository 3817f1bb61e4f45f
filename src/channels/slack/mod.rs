//! Slack channel adapter: Socket Mode inbound, buffered outbound queue,
//! Block Kit approvals and questions.

pub mod blocks;
pub mod inbound;
pub mod outbound;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use slack_morphism::prelude::{
    SlackChannelId, SlackClientEventsListenerEnvironment, SlackClientSocketModeConfig,
    SlackClientSocketModeListener, SlackSocketModeListenerCallbacks, SlackTs,
};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::channels::{
    ChannelAdapter, ChannelCallbacks, ChannelHealth, NotificationContext,
};
use crate::config::SlackConfig;
use crate::identity::IdentityResolver;
use crate::models::approval::ApprovalOutcome;
use crate::models::task::{TaskMetadata, TaskSource};
use crate::{AppError, Result};

use outbound::{SlackMessage, SlackSender};

/// How long an approval or question waits for an operator click.
const PENDING_DEADLINE: Duration = Duration::from_secs(300);

/// Answer delivered by a question button press.
#[derive(Debug)]
pub struct QuestionReply {
    /// The chosen option.
    pub answer: String,
    /// Slack user that answered.
    pub answered_by: String,
}

/// State shared between the adapter and the socket-mode callbacks.
pub struct SlackShared {
    /// Channel configuration.
    pub config: SlackConfig,
    /// Whitelist / identity lookups.
    pub identity: IdentityResolver,
    /// Engine callbacks, set at init.
    pub callbacks: OnceLock<ChannelCallbacks>,
    /// Outbound sender, set at start.
    pub sender: OnceLock<Arc<SlackSender>>,
    /// Pending approval resolvers keyed by request id.
    pub pending_approvals: Mutex<HashMap<String, oneshot::Sender<ApprovalOutcome>>>,
    /// Pending question resolvers keyed by request id.
    pub pending_questions: Mutex<HashMap<String, oneshot::Sender<QuestionReply>>>,
}

/// Slack channel adapter.
pub struct SlackAdapter {
    shared: Arc<SlackShared>,
    socket_task: Mutex<Option<JoinHandle<()>>>,
}

impl SlackAdapter {
    /// Create the adapter for the given Slack configuration.
    #[must_use]
    pub fn new(config: SlackConfig, identity: IdentityResolver) -> Self {
        Self {
            shared: Arc::new(SlackShared {
                config,
                identity,
                callbacks: OnceLock::new(),
                sender: OnceLock::new(),
                pending_approvals: Mutex::new(HashMap::new()),
                pending_questions: Mutex::new(HashMap::new()),
            }),
            socket_task: Mutex::new(None),
        }
    }

    fn sender(&self) -> Result<&Arc<SlackSender>> {
        self.shared
            .sender
            .get()
            .ok_or_else(|| AppError::Channel("slack adapter not started".into()))
    }

    /// Resolve the channel and thread a context's notifications belong to.
    ///
    /// Slack tasks target their own thread; GitHub tasks with a linked
    /// notification thread target it in the configured channel; everything
    /// else lands unthreaded in the configured channel (router fallback).
    fn target_for(&self, ctx: &NotificationContext) -> (SlackChannelId, Option<SlackTs>) {
        match &ctx.metadata {
            TaskMetadata::Slack {
                channel_id,
                thread_ts,
                ..
            } => (
                SlackChannelId(channel_id.clone()),
                Some(SlackTs(thread_ts.clone())),
            ),
            TaskMetadata::Github {
                thread_id: Some(thread_id),
                ..
            } => (
                SlackChannelId(self.shared.config.channel_id.clone()),
                Some(SlackTs(thread_id.clone())),
            ),
            _ => (SlackChannelId(self.shared.config.channel_id.clone()), None),
        }
    }

    fn spawn_socket_mode(&self, sender: &Arc<SlackSender>) -> JoinHandle<()> {
        let listener_env = Arc::new(
            SlackClientEventsListenerEnvironment::new(sender.client())
                .with_error_handler(|err, _client, _state| {
                    error!(?err, "socket mode error");
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR
                })
                .with_user_state(Arc::clone(&self.shared)),
        );
        let callbacks = SlackSocketModeListenerCallbacks::new()
            .with_hello_events(|event, _client, _state| async move {
                info!(?event, "socket hello");
            })
            .with_interaction_events(inbound::handle_interaction)
            .with_push_events(inbound::handle_push);
        let config = SlackClientSocketModeConfig {
            max_connections_count: SlackClientSocketModeConfig::DEFAULT_CONNECTIONS_COUNT,
            debug_connections: SlackClientSocketModeConfig::DEFAULT_DEBUG_CONNECTIONS,
            initial_backoff_in_seconds:
                SlackClientSocketModeConfig::DEFAULT_INITIAL_BACKOFF_IN_SECONDS,
            reconnect_timeout_in_seconds:
                SlackClientSocketModeConfig::DEFAULT_RECONNECT_TIMEOUT_IN_SECONDS,
            ping_interval_in_seconds: SlackClientSocketModeConfig::DEFAULT_PING_INTERVAL_IN_SECONDS,
            ping_failure_threshold_times:
                SlackClientSocketModeConfig::DEFAULT_PING_FAILURE_THRESHOLD_TIMES,
        };

        let listener = SlackClientSocketModeListener::new(&config, listener_env, callbacks);
        let app_token = sender.app_token();
        tokio::spawn(async move {
            if let Err(error) = listener.listen_for(&app_token).await {
                error!(?error, "socket mode listen failed");
                return;
            }
            listener.serve().await;
            info!("socket mode listener exited");
        })
    }
}

#[async_trait]
impl ChannelAdapter for SlackAdapter {
    fn name(&self) -> &'static str {
        "slack"
    }

    fn source(&self) -> TaskSource {
        TaskSource::Slack
    }

    async fn init(&self, callbacks: ChannelCallbacks) -> Result<()> {
        self.shared
            .callbacks
            .set(callbacks)
            .map_err(|_| AppError::Channel("slack adapter already initialized".into()))
    }

    async fn start(&self) -> Result<()> {
        if self.shared.config.bot_token.is_empty() || self.shared.config.app_token.is_empty() {
            return Err(AppError::Channel("slack tokens not configured".into()));
        }
        let sender = Arc::new(SlackSender::start(&self.shared.config)?);
        self.shared
            .sender
            .set(Arc::clone(&sender))
            .map_err(|_| AppError::Channel("slack adapter already started".into()))?;
        let task = self.spawn_socket_mode(&sender);
        *self.socket_task.lock().await = Some(task);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(task) = self.socket_task.lock().await.take() {
            task.abort();
        }
        if let Some(sender) = self.shared.sender.get() {
            sender.stop();
        }
        for (request_id, tx) in self.shared.pending_approvals.lock().await.drain() {
            info!(request_id, "resolving pending slack approval as deny at stop");
            let _ = tx.send(ApprovalOutcome::deny("channel stopped"));
        }
        self.shared.pending_questions.lock().await.clear();
        Ok(())
    }

    async fn health(&self) -> ChannelHealth {
        if self.shared.config.bot_token.is_empty() || self.shared.config.app_token.is_empty() {
            return ChannelHealth::Down("slack tokens not configured".into());
        }
        ChannelHealth::Ok
    }

    fn is_user_allowed(&self, id: &str) -> bool {
        self.shared.identity.is_user_allowed(TaskSource::Slack, id)
    }

    async fn send_message(&self, ctx: &NotificationContext, text: &str) -> Result<()> {
        let (channel, thread) = self.target_for(ctx);
        let mut message = SlackMessage::plain(channel, text);
        if let Some(thread) = thread {
            message = message.in_thread(thread);
        }
        self.sender()?.enqueue(message).await
    }

    async fn request_approval(
        &self,
        ctx: &NotificationContext,
        request_id: &str,
        tool: &str,
        command: &str,
        requested_by: Option<&str>,
    ) -> Result<ApprovalOutcome> {
        let sender = self.sender()?;
        let (channel, thread) = self.target_for(ctx);

        let (tx, rx) = oneshot::channel();
        self.shared
            .pending_approvals
            .lock()
            .await
            .insert(request_id.to_owned(), tx);

        let mut message = SlackMessage::plain(channel, format!("Approval requested: {tool}"))
            .with_blocks(blocks::approval_blocks(request_id, tool, command, requested_by));
        if let Some(thread) = thread {
            message = message.in_thread(thread);
        }
        if let Err(err) = sender.post_returning_ts(message).await {
            self.shared.pending_approvals.lock().await.remove(request_id);
            return Err(err);
        }

        let outcome = match tokio::time::timeout(PENDING_DEADLINE, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => ApprovalOutcome::deny("approval channel closed"),
            Err(_) => {
                warn!(request_id, "slack approval timed out");
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
        let sender = self.sender()?;
        let (channel, thread) = self.target_for(ctx);

        let (tx, rx) = oneshot::channel();
        self.shared
            .pending_questions
            .lock()
            .await
            .insert(request_id.to_owned(), tx);

        let mut message = SlackMessage::plain(channel, question.to_owned())
            .with_blocks(blocks::question_blocks(request_id, question, options));
        if let Some(thread) = thread {
            message = message.in_thread(thread);
        }
        if let Err(err) = sender.post_returning_ts(message).await {
            self.shared.pending_questions.lock().await.remove(request_id);
            return Err(err);
        }

        let reply = tokio::time::timeout(PENDING_DEADLINE, rx).await;
        self.shared.pending_questions.lock().await.remove(request_id);
        match reply {
            Ok(Ok(reply)) => Ok(reply.answer),
            Ok(Err(_)) => Err(AppError::Channel("question channel closed".into())),
            Err(_) => Err(AppError::Timeout("question timed out".into())),
        }
    }

    async fn notify_task_started(&self, ctx: &NotificationContext) -> Result<()> {
        self.send_message(ctx, "🚀 Task started").await
    }

    async fn notify_task_completed(
        &self,
        ctx: &NotificationContext,
        output: &str,
        pr_url: Option<&str>,
    ) -> Result<()> {
        let mut text = format!("✅ Task completed\n\n{output}");
        if let Some(pr_url) = pr_url {
            text.push_str(&format!("\n\nPull request: {pr_url}"));
        }
        self.send_split_message(ctx, &text).await
    }

    async fn notify_task_error(&self, ctx: &NotificationContext, error: &str) -> Result<()> {
        self.send_message(ctx, &format!("❌ Task failed: {error}"))
            .await
    }

    async fn notify_progress(&self, ctx: &NotificationContext, message: &str) -> Result<()> {
        self.send_message(ctx, message).await
    }

    async fn post_reflection_result(&self, text: &str) -> Result<()> {
        let channel = SlackChannelId(self.shared.config.channel_id.clone());
        self.sender()?
            .enqueue(SlackMessage::plain(channel, text))
            .await
    }

    async fn create_issue_thread(
        &self,
        owner: &str,
        repo: &str,
        issue: u64,
        title: &str,
        url: &str,
    ) -> Result<String> {
        let channel = SlackChannelId(self.shared.config.channel_id.clone());
        let text = format!("📋 *{owner}/{repo}#{issue}* — {title}\n{url}");
        let ts = self
            .sender()?
            .post_returning_ts(SlackMessage::plain(channel, text))
            .await?;
        Ok(ts.to_string())
    }
}
