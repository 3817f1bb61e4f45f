//! Notification router: resolves the adapter for a task and dispatches
//! capability calls, broadcasting reflection results across all active
//! adapters.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::channels::{ChannelAdapter, NotificationContext};
use crate::models::approval::ApprovalOutcome;
use crate::models::task::TaskMetadata;
use crate::models::worklog::WorkLogEvent;
use crate::registry::ChannelRegistry;
use crate::{AppError, Result};

/// Routes per-task capability calls to the adapter responsible for the
/// task's source, falling back to the default adapter.
pub struct NotificationRouter {
    registry: Arc<ChannelRegistry>,
}

impl NotificationRouter {
    /// Bind the router to the registry.
    #[must_use]
    pub fn new(registry: Arc<ChannelRegistry>) -> Self {
        Self { registry }
    }

    /// The registry this router dispatches over.
    #[must_use]
    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Resolve the adapter for `metadata`: its source adapter when
    /// registered, otherwise the default adapter.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Channel` when no adapter is registered at all.
    pub fn resolve_adapter(
        &self,
        metadata: Option<&TaskMetadata>,
    ) -> Result<Arc<dyn ChannelAdapter>> {
        if let Some(metadata) = metadata {
            if let Some(adapter) = self.registry.adapter_for(metadata.source()) {
                return Ok(adapter);
            }
            debug!(source = %metadata.source(), "no adapter for source; using default");
        }
        self.registry
            .default_adapter()
            .ok_or_else(|| AppError::Channel("no adapters registered".into()))
    }

    /// Send a plain message to the task's conversation.
    pub async fn send_message(&self, ctx: &NotificationContext, text: &str) -> Result<()> {
        self.resolve_adapter(Some(&ctx.metadata))?
            .send_message(ctx, text)
            .await
    }

    /// Send a long message in chunks.
    pub async fn send_split_message(&self, ctx: &NotificationContext, text: &str) -> Result<()> {
        self.resolve_adapter(Some(&ctx.metadata))?
            .send_split_message(ctx, text)
            .await
    }

    /// Round-trip an approval request through the originating channel.
    pub async fn request_approval(
        &self,
        ctx: &NotificationContext,
        request_id: &str,
        tool: &str,
        command: &str,
        requested_by: Option<&str>,
    ) -> Result<ApprovalOutcome> {
        self.resolve_adapter(Some(&ctx.metadata))?
            .request_approval(ctx, request_id, tool, command, requested_by)
            .await
    }

    /// Round-trip a question through the originating channel.
    pub async fn ask_question(
        &self,
        ctx: &NotificationContext,
        request_id: &str,
        question: &str,
        options: &[String],
    ) -> Result<String> {
        self.resolve_adapter(Some(&ctx.metadata))?
            .ask_question(ctx, request_id, question, options)
            .await
    }

    /// Notify that the task started running.
    pub async fn notify_task_started(&self, ctx: &NotificationContext) -> Result<()> {
        self.resolve_adapter(Some(&ctx.metadata))?
            .notify_task_started(ctx)
            .await
    }

    /// Notify completion.
    pub async fn notify_task_completed(
        &self,
        ctx: &NotificationContext,
        output: &str,
        pr_url: Option<&str>,
    ) -> Result<()> {
        self.resolve_adapter(Some(&ctx.metadata))?
            .notify_task_completed(ctx, output, pr_url)
            .await
    }

    /// Notify a failure.
    pub async fn notify_task_error(&self, ctx: &NotificationContext, error: &str) -> Result<()> {
        self.resolve_adapter(Some(&ctx.metadata))?
            .notify_task_error(ctx, error)
            .await
    }

    /// Post a transient progress line.
    pub async fn notify_progress(&self, ctx: &NotificationContext, message: &str) -> Result<()> {
        self.resolve_adapter(Some(&ctx.metadata))?
            .notify_progress(ctx, message)
            .await
    }

    /// Surface an agent work-log event.
    pub async fn notify_work_log(
        &self,
        ctx: &NotificationContext,
        event: &WorkLogEvent,
    ) -> Result<()> {
        self.resolve_adapter(Some(&ctx.metadata))?
            .notify_work_log(ctx, event)
            .await
    }

    /// Broadcast a reflection result to every active adapter, once each.
    /// One adapter erroring never skips the rest.
    pub async fn post_reflection_result(&self, text: &str) {
        for adapter in self.registry.active_list() {
            if let Err(err) = adapter.post_reflection_result(text).await {
                warn!(name = adapter.name(), %err, "reflection broadcast failed for adapter");
            }
        }
    }

    /// Create a notification thread for a GitHub issue via the default
    /// adapter.
    pub async fn create_issue_thread(
        &self,
        owner: &str,
        repo: &str,
        issue: u64,
        title: &str,
        url: &str,
    ) -> Result<String> {
        self.registry
            .default_adapter()
            .ok_or_else(|| AppError::Channel("no adapters registered".into()))?
            .create_issue_thread(owner, repo, issue, title, url)
            .await
    }
}
