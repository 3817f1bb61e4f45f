//! Gateway state: token, task scope, fingerprints, and pendings.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::channels::NotificationContext;
use crate::models::approval::ApprovalDecision;
use crate::models::task::TaskMetadata;
use crate::router::NotificationRouter;
use crate::{AppError, Result};

/// Tools that can require operator approval; all others pass through.
const APPROVAL_TOOLS: [&str; 5] = ["Bash", "Write", "Edit", "Task", "NotebookEdit"];

/// Minimum spacing between tool-use progress posts.
const WORK_LOG_THROTTLE_SECS: u64 = 10;

/// Auto-approvals logged per fingerprint before suppression.
const AUTO_APPROVE_LOG_CAP: u32 = 5;

/// Characters of `Write` content shown in a command preview.
const WRITE_PREVIEW_CHARS: usize = 200;

/// Characters of `Edit` old/new text shown in a command preview.
const EDIT_PREVIEW_CHARS: usize = 100;

/// Default question options, offered when the agent sends none.
pub const DEFAULT_ASK_OPTIONS: [&str; 3] = ["はい", "いいえ", "わからない"];

/// The task scope hook calls are correlated against.
#[derive(Debug, Clone)]
pub struct CurrentTask {
    /// Task id.
    pub task_id: String,
    /// Full origin metadata when set by the engine; `None` when set via
    /// the bare `/set-task` endpoint.
    pub metadata: Option<TaskMetadata>,
    /// User the approval requests are attributed to.
    pub requested_by: Option<String>,
}

/// One in-flight approval or question, held for the duration of a hook
/// call so shutdown can account for it.
#[derive(Debug, Clone)]
pub struct PendingHookCall {
    /// Request id handed to the channel.
    pub request_id: String,
    /// Task the call belongs to.
    pub task_id: String,
    /// Tool being decided on.
    pub tool: String,
    /// Human-readable command preview.
    pub command: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Decision payload returned to the hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApproveReply {
    /// `allow` or `deny`.
    pub decision: ApprovalDecision,
    /// Optional human-readable explanation.
    pub message: Option<String>,
}

struct ScopeState {
    current: Option<CurrentTask>,
    allowed_keys: HashSet<String>,
    auto_counter: HashMap<String, u32>,
    last_work_log: Option<Instant>,
}

/// Shared gateway state: the auth token, the current-task scope, the
/// per-task fingerprint allow-set, and in-flight hook calls.
pub struct GatewayState {
    token: String,
    token_path: PathBuf,
    port: u16,
    router: Arc<NotificationRouter>,
    scope: Mutex<ScopeState>,
    pending: Mutex<HashMap<String, PendingHookCall>>,
    cancel: CancellationToken,
}

impl GatewayState {
    /// Create gateway state with a freshly generated token.
    #[must_use]
    pub fn new(
        router: Arc<NotificationRouter>,
        token_path: PathBuf,
        port: u16,
        cancel: CancellationToken,
    ) -> Self {
        // 32 random bytes, hex-encoded: two v4 UUIDs back to back.
        let token = format!(
            "{}{}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple()
        );
        Self {
            token,
            token_path,
            port,
            router,
            scope: Mutex::new(ScopeState {
                current: None,
                allowed_keys: HashSet::new(),
                auto_counter: HashMap::new(),
                last_work_log: None,
            }),
            pending: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    /// The loopback port the gateway binds.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The current auth token. Exposed for tests and the token file.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Cancellation token that aborts in-flight hook calls.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Write the token file with mode 0600.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Gateway` if the file cannot be written.
    pub async fn write_token_file(&self) -> Result<()> {
        if let Some(parent) = self.token_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| AppError::Gateway(format!("failed to create state dir: {err}")))?;
        }
        tokio::fs::write(&self.token_path, format!("{}\n", self.token))
            .await
            .map_err(|err| AppError::Gateway(format!("failed to write auth token: {err}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.token_path, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|err| AppError::Gateway(format!("failed to chmod auth token: {err}")))?;
        }
        Ok(())
    }

    /// Delete the token file and resolve in-flight hook calls as denials.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let pending = {
            let mut guard = self.pending.lock().await;
            guard.drain().count()
        };
        if pending > 0 {
            info!(pending, "in-flight hook calls resolved as deny at shutdown");
        }
        if let Err(err) = tokio::fs::remove_file(&self.token_path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(%err, "failed to delete auth token file");
            }
        }
    }

    /// Constant-time token verification. Length mismatches are rejected
    /// before any byte is inspected.
    #[must_use]
    pub fn verify_token(&self, presented: &str) -> bool {
        constant_time_eq(self.token.as_bytes(), presented.as_bytes())
    }

    /// Replace the task scope and clear the fingerprint allow-set.
    pub async fn set_current_task(
        &self,
        task_id: &str,
        metadata: Option<TaskMetadata>,
        requested_by: Option<String>,
    ) {
        let mut scope = self.scope.lock().await;
        scope.current = Some(CurrentTask {
            task_id: task_id.to_owned(),
            metadata,
            requested_by,
        });
        scope.allowed_keys.clear();
        info!(task_id, "gateway task scope set");
    }

    /// Clear the task scope, fingerprint allow-set, auto-approve counters,
    /// and the work-log throttle.
    pub async fn clear_current_task(&self) {
        let mut scope = self.scope.lock().await;
        scope.current = None;
        scope.allowed_keys.clear();
        scope.auto_counter.clear();
        scope.last_work_log = None;
    }

    /// Snapshot of the current task scope.
    pub async fn current_task(&self) -> Option<CurrentTask> {
        self.scope.lock().await.current.clone()
    }

    /// Whether a tool-use progress post is due; arms the throttle when so.
    pub async fn work_log_due(&self) -> bool {
        let mut scope = self.scope.lock().await;
        let due = scope
            .last_work_log
            .is_none_or(|last| last.elapsed().as_secs() >= WORK_LOG_THROTTLE_SECS);
        if due {
            scope.last_work_log = Some(Instant::now());
        }
        due
    }

    /// In-flight hook calls, for observability.
    pub async fn pending_calls(&self) -> Vec<PendingHookCall> {
        self.pending.lock().await.values().cloned().collect()
    }

    /// Decide one `/approve` hook call. See the approval algorithm in the
    /// module docs: pass-through for non-dangerous tools, fingerprint
    /// auto-approval, channel round-trip otherwise. Any internal failure
    /// resolves as a denial.
    pub async fn approve(&self, tool_name: &str, tool_input: &Value) -> ApproveReply {
        match self.approve_inner(tool_name, tool_input).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(%err, tool = tool_name, "approval pipeline failed");
                ApproveReply {
                    decision: ApprovalDecision::Deny,
                    message: Some("Approval request failed".into()),
                }
            }
        }
    }

    async fn approve_inner(&self, tool_name: &str, tool_input: &Value) -> Result<ApproveReply> {
        if !APPROVAL_TOOLS.contains(&tool_name) {
            return Ok(ApproveReply {
                decision: ApprovalDecision::Allow,
                message: None,
            });
        }

        let fingerprint = fingerprint(tool_name, tool_input);

        let (current, auto_approved) = {
            let mut scope = self.scope.lock().await;
            let Some(current) = scope.current.clone() else {
                return Ok(ApproveReply {
                    decision: ApprovalDecision::Deny,
                    message: Some("No active task".into()),
                });
            };
            if scope.allowed_keys.contains(&fingerprint) {
                let count = scope.auto_counter.entry(fingerprint.clone()).or_insert(0);
                *count += 1;
                if *count <= AUTO_APPROVE_LOG_CAP {
                    info!(task_id = %current.task_id, %fingerprint, count = *count, "auto-approved repeat tool use");
                } else if *count == AUTO_APPROVE_LOG_CAP + 1 {
                    info!(%fingerprint, "suppressing further auto-approve logs for this fingerprint");
                }
                (current, true)
            } else {
                (current, false)
            }
        };

        if auto_approved {
            return Ok(ApproveReply {
                decision: ApprovalDecision::Allow,
                message: Some(format!("Auto-approved {tool_name} (repeat within task)")),
            });
        }

        let command = command_preview(tool_name, tool_input);
        let request_id = Uuid::new_v4().to_string();

        let ctx = NotificationContext {
            task_id: current.task_id.clone(),
            metadata: current.metadata.clone().unwrap_or_else(|| {
                // Bare /set-task scope: route to the default adapter via an
                // http-shaped placeholder carrying the task id.
                TaskMetadata::Http {
                    correlation_id: current.task_id.clone(),
                    device_id: None,
                    text: String::new(),
                    target_repo: None,
                }
            }),
        };

        self.pending.lock().await.insert(
            request_id.clone(),
            PendingHookCall {
                request_id: request_id.clone(),
                task_id: current.task_id.clone(),
                tool: tool_name.to_owned(),
                command: command.clone(),
                created_at: Utc::now(),
            },
        );

        let outcome = tokio::select! {
            outcome = self.router.request_approval(
                &ctx,
                &request_id,
                tool_name,
                &command,
                current.requested_by.as_deref(),
            ) => outcome,
            () = self.cancel.cancelled() => {
                Err(AppError::Gateway("gateway shutting down".into()))
            }
        };
        self.pending.lock().await.remove(&request_id);

        let outcome = outcome?;
        if outcome.decision == ApprovalDecision::Allow {
            self.scope.lock().await.allowed_keys.insert(fingerprint);
        }
        let message = match &outcome.comment {
            Some(comment) => format!("{}: {comment}", outcome.decision),
            None => outcome.decision.to_string(),
        };
        Ok(ApproveReply {
            decision: outcome.decision,
            message: Some(message),
        })
    }

    /// Forward a question from the agent to the originating channel.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Gateway` when no task is in scope or the channel
    /// round-trip fails.
    pub async fn ask(&self, question: &str, options: &[String], context: Option<&str>) -> Result<String> {
        let current = self
            .current_task()
            .await
            .ok_or_else(|| AppError::Gateway("no active task".into()))?;
        let metadata = current.metadata.clone().unwrap_or_else(|| TaskMetadata::Http {
            correlation_id: current.task_id.clone(),
            device_id: None,
            text: String::new(),
            target_repo: None,
        });
        let ctx = NotificationContext {
            task_id: current.task_id.clone(),
            metadata,
        };
        let options: Vec<String> = if options.is_empty() {
            DEFAULT_ASK_OPTIONS.iter().map(|s| (*s).to_string()).collect()
        } else {
            options.to_vec()
        };
        let question = match context {
            Some(context) if !context.is_empty() => format!("{question}\n\n{context}"),
            _ => question.to_owned(),
        };
        let request_id = Uuid::new_v4().to_string();

        self.pending.lock().await.insert(
            request_id.clone(),
            PendingHookCall {
                request_id: request_id.clone(),
                task_id: current.task_id.clone(),
                tool: "AskUser".into(),
                command: question.clone(),
                created_at: Utc::now(),
            },
        );
        let answer = tokio::select! {
            answer = self.router.ask_question(&ctx, &request_id, &question, &options) => answer,
            () = self.cancel.cancelled() => Err(AppError::Gateway("gateway shutting down".into())),
        };
        self.pending.lock().await.remove(&request_id);
        answer
    }

    /// Post a throttled tool-use progress notification. Fire-and-forget.
    pub async fn notify_tool(&self, tool_name: &str, tool_input: &Value) {
        if !self.work_log_due().await {
            return;
        }
        let Some(current) = self.current_task().await else {
            return;
        };
        let Some(metadata) = current.metadata else {
            return;
        };
        let ctx = NotificationContext {
            task_id: current.task_id,
            metadata,
        };
        let details = crate::runner::tool_details(tool_name, tool_input);
        let line = if details.is_empty() {
            format!("🔧 {tool_name}")
        } else {
            format!("🔧 {tool_name}: {details}")
        };
        if let Err(err) = self.router.notify_progress(&ctx, &line).await {
            warn!(%err, "tool-use notification failed");
        }
    }
}

/// Fingerprint for auto-approval: the command for `Bash`, the file path
/// for `Write`/`Edit`, and the bare tool name otherwise.
#[must_use]
pub fn fingerprint(tool_name: &str, tool_input: &Value) -> String {
    match tool_name {
        "Bash" => format!("Bash:{}", tool_input["command"].as_str().unwrap_or("")),
        "Write" => format!("Write:{}", tool_input["file_path"].as_str().unwrap_or("")),
        "Edit" => format!("Edit:{}", tool_input["file_path"].as_str().unwrap_or("")),
        other => other.to_owned(),
    }
}

/// Human-readable preview of a tool invocation for the approval message.
#[must_use]
pub fn command_preview(tool_name: &str, tool_input: &Value) -> String {
    match tool_name {
        "Bash" => tool_input["command"].as_str().unwrap_or("").to_owned(),
        "Write" => {
            let path = tool_input["file_path"].as_str().unwrap_or("");
            let content = tool_input["content"].as_str().unwrap_or("");
            let preview: String = content.chars().take(WRITE_PREVIEW_CHARS).collect();
            let ellipsis = if content.chars().count() > WRITE_PREVIEW_CHARS {
                "…"
            } else {
                ""
            };
            format!("Write to: {path}\n\nContent preview:\n{preview}{ellipsis}")
        }
        "Edit" => {
            let path = tool_input["file_path"].as_str().unwrap_or("");
            let old: String = tool_input["old_string"]
                .as_str()
                .unwrap_or("")
                .chars()
                .take(EDIT_PREVIEW_CHARS)
                .collect();
            let new: String = tool_input["new_string"]
                .as_str()
                .unwrap_or("")
                .chars()
                .take(EDIT_PREVIEW_CHARS)
                .collect();
            format!("Edit: {path}\n\nOld:\n{old}\n\nNew:\n{new}")
        }
        _ => serde_json::to_string_pretty(tool_input).unwrap_or_default(),
    }
}

/// Compare two byte strings in constant time for equal lengths; a length
/// mismatch is rejected without indexing into either value.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0_u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
