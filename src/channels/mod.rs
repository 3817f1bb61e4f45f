//! Channel adapter contract and shared channel types.
//!
//! Every messaging channel implements [`ChannelAdapter`]: a uniform
//! capability surface for sending, approving, asking, and notifying.
//! Adapters translate inbound channel traffic into [`InboundMessage`]s via
//! the callbacks handed to `init`, and must tolerate being invoked with a
//! metadata source different from their own — the router may have fallen
//! back to them.

pub mod http;
pub mod line;
pub mod slack;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use crate::models::approval::ApprovalOutcome;
use crate::models::task::{TaskMetadata, TaskSource};
use crate::models::worklog::WorkLogEvent;
use crate::Result;

/// Maximum characters per message chunk for split sends.
pub const SPLIT_CHUNK_CHARS: usize = 4000;

/// Task addressing information passed with every per-task capability call.
#[derive(Debug, Clone)]
pub struct NotificationContext {
    /// Task id.
    pub task_id: String,
    /// Origin metadata used for routing and rendering.
    pub metadata: TaskMetadata,
}

/// An inbound request translated from channel traffic.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Natural-language prompt text.
    pub prompt: String,
    /// Channel-specific origin metadata.
    pub metadata: TaskMetadata,
}

/// Callbacks handed to adapters during `init`.
#[derive(Clone)]
pub struct ChannelCallbacks {
    /// Sink for inbound requests; the engine side enqueues them as tasks.
    pub inbound: UnboundedSender<InboundMessage>,
}

/// Health of one adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelHealth {
    /// Fully operational.
    Ok,
    /// Operational with a caveat.
    Degraded(String),
    /// Not operational.
    Down(String),
}

impl ChannelHealth {
    /// Short status string for health endpoints.
    #[must_use]
    pub fn as_status(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Degraded(_) => "degraded",
            Self::Down(_) => "down",
        }
    }
}

/// Uniform capability surface implemented by every channel.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Human-readable adapter name.
    fn name(&self) -> &'static str;

    /// The task source this adapter serves.
    fn source(&self) -> TaskSource;

    /// Wire the adapter to the engine's inbound sink. Called once before
    /// `start`.
    async fn init(&self, callbacks: ChannelCallbacks) -> Result<()>;

    /// Begin serving channel traffic.
    async fn start(&self) -> Result<()>;

    /// Stop serving. Pending approvals and questions resolve as denials.
    async fn stop(&self) -> Result<()>;

    /// Current adapter health.
    async fn health(&self) -> ChannelHealth;

    /// Whether a channel-native user id may create tasks.
    fn is_user_allowed(&self, id: &str) -> bool;

    /// Send a plain message to the task's conversation.
    async fn send_message(&self, ctx: &NotificationContext, text: &str) -> Result<()>;

    /// Send a long message in chunks of [`SPLIT_CHUNK_CHARS`].
    async fn send_split_message(&self, ctx: &NotificationContext, text: &str) -> Result<()> {
        for chunk in split_chunks(text, SPLIT_CHUNK_CHARS) {
            self.send_message(ctx, &chunk).await?;
        }
        Ok(())
    }

    /// Ask the operator to allow or deny a tool invocation. Blocks until a
    /// decision arrives or the adapter's own deadline passes.
    async fn request_approval(
        &self,
        ctx: &NotificationContext,
        request_id: &str,
        tool: &str,
        command: &str,
        requested_by: Option<&str>,
    ) -> Result<ApprovalOutcome>;

    /// Ask the operator a free-form question with preset options.
    async fn ask_question(
        &self,
        ctx: &NotificationContext,
        request_id: &str,
        question: &str,
        options: &[String],
    ) -> Result<String>;

    /// Notify that the task started running.
    async fn notify_task_started(&self, ctx: &NotificationContext) -> Result<()>;

    /// Notify completion with the final output and optional PR URL.
    async fn notify_task_completed(
        &self,
        ctx: &NotificationContext,
        output: &str,
        pr_url: Option<&str>,
    ) -> Result<()>;

    /// Notify a task failure.
    async fn notify_task_error(&self, ctx: &NotificationContext, error: &str) -> Result<()>;

    /// Post a transient progress line.
    async fn notify_progress(&self, ctx: &NotificationContext, message: &str) -> Result<()>;

    /// Surface one agent work-log event.
    async fn notify_work_log(
        &self,
        ctx: &NotificationContext,
        event: &WorkLogEvent,
    ) -> Result<()> {
        self.notify_progress(ctx, &event.render()).await
    }

    /// Broadcast hook for reflection results. Most adapters ignore it.
    async fn post_reflection_result(&self, _text: &str) -> Result<()> {
        Ok(())
    }

    /// Create a notification thread for a GitHub issue, returning its id.
    /// Only the default adapter implements this meaningfully.
    async fn create_issue_thread(
        &self,
        _owner: &str,
        _repo: &str,
        _issue: u64,
        _title: &str,
        _url: &str,
    ) -> Result<String> {
        Ok(String::new())
    }
}

/// Split text into chunks of at most `limit` characters, on char
/// boundaries.
#[must_use]
pub fn split_chunks(text: &str, limit: usize) -> Vec<String> {
    if text.is_empty() {
        return vec![String::new()];
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0_usize;
    for ch in text.chars() {
        if count == limit {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
        current.push(ch);
        count += 1;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
