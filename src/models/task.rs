//! Task model: the unit of work dispatched by the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Originating channel of a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskSource {
    /// GitHub issue intake.
    Github,
    /// Slack message.
    Slack,
    /// LINE message.
    Line,
    /// HTTP polling device.
    Http,
}

impl std::fmt::Display for TaskSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Github => "github",
            Self::Slack => "slack",
            Self::Line => "line",
            Self::Http => "http",
        };
        f.write_str(name)
    }
}

/// Lifecycle status for a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Queued, not yet picked up.
    Pending,
    /// Currently executing. At most one task is in this state.
    Running,
    /// Finished with a successful result.
    Completed,
    /// Finished with a failure result.
    Failed,
}

/// Channel-specific origin metadata, discriminated by `source`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum TaskMetadata {
    /// GitHub issue origin.
    Github {
        /// Repository owner.
        owner: String,
        /// Repository name.
        repo: String,
        /// Issue number.
        issue_number: u64,
        /// Issue title.
        issue_title: String,
        /// Issue HTML URL.
        issue_url: String,
        /// GitHub login of the requesting user, when known.
        requested_by: Option<String>,
        /// Linked notification thread id, once one has been created.
        thread_id: Option<String>,
    },
    /// Slack message origin.
    Slack {
        /// Channel the message was posted in.
        channel_id: String,
        /// Thread timestamp the conversation is anchored to.
        thread_ts: String,
        /// Posting user id.
        user_id: String,
        /// Raw message text.
        text: String,
        /// Explicit `owner/repo` target, when the message names one.
        target_repo: Option<String>,
    },
    /// LINE message origin.
    Line {
        /// LINE user id.
        user_id: String,
        /// Reply token from the webhook event.
        reply_token: String,
        /// Raw message text.
        text: String,
        /// Explicit `owner/repo` target, when the message names one.
        target_repo: Option<String>,
    },
    /// HTTP polling-device origin.
    Http {
        /// Correlation id; doubles as the task id.
        correlation_id: String,
        /// Optional device identifier.
        device_id: Option<String>,
        /// Raw message text.
        text: String,
        /// Explicit `owner/repo` target, when the request names one.
        target_repo: Option<String>,
    },
}

impl TaskMetadata {
    /// The originating channel of this metadata variant.
    #[must_use]
    pub fn source(&self) -> TaskSource {
        match self {
            Self::Github { .. } => TaskSource::Github,
            Self::Slack { .. } => TaskSource::Slack,
            Self::Line { .. } => TaskSource::Line,
            Self::Http { .. } => TaskSource::Http,
        }
    }

    /// Explicit `owner/repo` target named by the request, if any.
    #[must_use]
    pub fn target_repo(&self) -> Option<&str> {
        match self {
            Self::Slack { target_repo, .. }
            | Self::Line { target_repo, .. }
            | Self::Http { target_repo, .. } => target_repo.as_deref(),
            Self::Github { .. } => None,
        }
    }
}

/// Final outcome of one agent invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TaskResult {
    /// Whether the agent process exited successfully.
    pub success: bool,
    /// Final agent text output.
    pub output: String,
    /// Pull-request URL extracted from the output, if present.
    pub pr_url: Option<String>,
    /// Error description for failed runs.
    pub error: Option<String>,
    /// Session id the agent reported, used for resume.
    pub session_id: Option<String>,
}

/// A unit of work created by a channel adapter and owned by the queue.
///
/// Completed tasks are read-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Task {
    /// Unique task identifier. For HTTP tasks this is the correlation id.
    pub id: String,
    /// Originating channel.
    pub source: TaskSource,
    /// Natural-language prompt text.
    pub prompt: String,
    /// Channel-specific origin metadata.
    pub metadata: TaskMetadata,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the pending→running transition.
    pub started_at: Option<DateTime<Utc>>,
    /// Timestamp of the running→completed|failed transition.
    pub completed_at: Option<DateTime<Utc>>,
    /// Final result, present once completed or failed.
    pub result: Option<TaskResult>,
}

impl Task {
    /// Construct a new pending task. HTTP tasks reuse the correlation id as
    /// their task id so polling clients can address them directly.
    #[must_use]
    pub fn new(prompt: String, metadata: TaskMetadata) -> Self {
        let id = match &metadata {
            TaskMetadata::Http { correlation_id, .. } => correlation_id.clone(),
            _ => Uuid::new_v4().to_string(),
        };
        Self {
            id,
            source: metadata.source(),
            prompt,
            metadata,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
        }
    }
}
