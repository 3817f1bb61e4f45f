//! Task engine: the single-worker loop composing queue, sessions,
//! worktrees, the agent runner, the gateway scope, and the router.
//!
//! Exactly one task runs at a time. Adapter callbacks enqueue tasks, the
//! queue fires `Added`, and the engine pumps `process_next_task` until the
//! pending queue is empty. The engine never lets an error escape the pump:
//! failures become failed task results and error notifications.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::channels::NotificationContext;
use crate::config::GlobalConfig;
use crate::git::github::GithubClient;
use crate::git::repo;
use crate::history::HistoryStore;
use crate::identity::IdentityResolver;
use crate::models::session::SessionKey;
use crate::models::task::{Task, TaskMetadata, TaskResult};
use crate::queue::{TaskEvent, TaskQueue};
use crate::router::NotificationRouter;
use crate::runner::{AgentInvocation, AgentRunner};
use crate::session::SessionStore;
use crate::worktree::WorktreeManager;
use crate::{AppError, Result};

/// Characters of output included in a completion notification.
const COMPLETION_OUTPUT_CAP: usize = 3000;

/// Posted when the agent finished without producing output.
const EMPTY_OUTPUT_PLACEHOLDER: &str = "The agent finished without producing any output.";

/// Work performed after a successful run, before finalization.
enum PostRunAction {
    /// Commit and push follow-up changes for a thread-linked issue.
    CommitIssueFollowUp { dir: PathBuf, issue_number: u64 },
}

/// Everything resolved ahead of one agent invocation.
struct RunPlan {
    working_directory: PathBuf,
    resume_session_id: Option<String>,
    session_keys: Vec<SessionKey>,
    prompt: String,
    metadata: TaskMetadata,
    post_run: Option<PostRunAction>,
}

/// The engine wiring everything together.
pub struct TaskEngine {
    config: Arc<GlobalConfig>,
    queue: Arc<TaskQueue>,
    sessions: Arc<SessionStore>,
    worktrees: Arc<WorktreeManager>,
    runner: Arc<AgentRunner>,
    router: Arc<NotificationRouter>,
    gateway: Arc<crate::gateway::GatewayState>,
    identity: IdentityResolver,
    github: GithubClient,
    history: HistoryStore,
    processing: AtomicBool,
}

impl TaskEngine {
    /// Assemble the engine from its collaborators.
    #[allow(clippy::too_many_arguments)] // Composition root; mirrors startup wiring.
    #[must_use]
    pub fn new(
        config: Arc<GlobalConfig>,
        queue: Arc<TaskQueue>,
        sessions: Arc<SessionStore>,
        worktrees: Arc<WorktreeManager>,
        runner: Arc<AgentRunner>,
        router: Arc<NotificationRouter>,
        gateway: Arc<crate::gateway::GatewayState>,
        identity: IdentityResolver,
        github: GithubClient,
        history: HistoryStore,
    ) -> Self {
        Self {
            config,
            queue,
            sessions,
            worktrees,
            runner,
            router,
            gateway,
            identity,
            github,
            history,
            processing: AtomicBool::new(false),
        }
    }

    /// Spawn the dispatch loop: pump on startup, then on every `Added`
    /// event until cancelled.
    #[must_use]
    pub fn spawn_loop(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut events = engine.queue.subscribe().await;
            engine.pump().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("task engine shutting down");
                        break;
                    }
                    event = events.recv() => match event {
                        Some(TaskEvent::Added(_)) => engine.pump().await,
                        Some(_) => {}
                        None => break,
                    }
                }
            }
        })
    }

    /// Process queued tasks one at a time until the queue is empty. The
    /// single-flight flag makes concurrent pumps no-ops.
    pub async fn pump(&self) {
        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        loop {
            let Some(task) = self.queue.next_pending().await else {
                break;
            };
            let task_id = task.id.clone();
            self.process_task(task)
                .instrument(info_span!("process_task", task_id = %task_id))
                .await;
        }
        self.processing.store(false, Ordering::SeqCst);
    }

    /// Run one task end to end. Never propagates errors — every failure
    /// path records a failed result and posts an error notification.
    async fn process_task(&self, task: Task) {
        let start_ctx = NotificationContext {
            task_id: task.id.clone(),
            metadata: task.metadata.clone(),
        };
        if let Err(err) = self.router.notify_task_started(&start_ctx).await {
            warn!(%err, "task-started notification failed");
        }

        let plan = match self.plan_workspace(&task).await {
            Ok(plan) => plan,
            Err(err) => {
                error!(%err, "workspace preparation failed");
                let result = TaskResult {
                    success: false,
                    error: Some(err.to_string()),
                    ..TaskResult::default()
                };
                self.finalize(&task.id, start_ctx, result).await;
                return;
            }
        };

        let ctx = NotificationContext {
            task_id: task.id.clone(),
            metadata: plan.metadata.clone(),
        };

        let requested_by = self.identity.requested_by(&plan.metadata);
        self.gateway
            .set_current_task(&task.id, Some(plan.metadata.clone()), requested_by)
            .await;

        let (work_log_tx, work_log_rx) = mpsc::unbounded_channel();
        let forwarder = spawn_work_log_forwarder(Arc::clone(&self.router), ctx.clone(), work_log_rx);

        let invocation = AgentInvocation {
            task_id: task.id.clone(),
            prompt: plan.prompt.clone(),
            working_directory: plan.working_directory.clone(),
            resume_session_id: plan.resume_session_id.clone(),
        };
        let result = self.runner.run(&invocation, work_log_tx).await;
        let _ = forwarder.await;

        // Approval scope is cleared whatever the outcome.
        self.gateway.clear_current_task().await;

        // Session writes happen strictly after the process exits, and only
        // when the agent actually returned a session id.
        if let Some(session_id) = &result.session_id {
            let directory = plan.working_directory.to_string_lossy();
            for key in &plan.session_keys {
                if let Err(err) = self.sessions.put(key, session_id, &directory).await {
                    warn!(%err, key = %key, "failed to persist session");
                }
            }
        }

        if result.success {
            if let Some(PostRunAction::CommitIssueFollowUp { dir, issue_number }) = &plan.post_run {
                self.push_follow_up(&ctx, dir, *issue_number).await;
            }
        }

        self.finalize(&task.id, ctx, result).await;
    }

    /// Commit and push changes an agent left in a linked-issue worktree.
    async fn push_follow_up(&self, ctx: &NotificationContext, dir: &std::path::Path, issue_number: u64) {
        let message = format!("fix: Issue #{issue_number} - additional changes");
        match repo::commit_and_push(dir, &message).await {
            Ok(true) => {
                if let Err(err) = self
                    .router
                    .send_message(ctx, &format!("📤 Pushed follow-up changes for issue #{issue_number}"))
                    .await
                {
                    warn!(%err, "follow-up push notification failed");
                }
            }
            Ok(false) => {}
            Err(err) => warn!(%err, "follow-up commit-and-push failed"),
        }
    }

    /// Record the result, notify the originating channel, comment on the
    /// issue for GitHub tasks, append history, and re-pump the queue.
    async fn finalize(&self, task_id: &str, ctx: NotificationContext, result: TaskResult) {
        let completed = match self.queue.complete(task_id, result.clone()).await {
            Ok(task) => task,
            Err(err) => {
                error!(%err, "failed to record task result");
                return;
            }
        };

        if result.success {
            let output = render_completion_output(&result.output);
            if let Err(err) = self
                .router
                .notify_task_completed(&ctx, &output, result.pr_url.as_deref())
                .await
            {
                warn!(%err, "completion notification failed");
            }
            if let TaskMetadata::Github {
                owner,
                repo,
                issue_number,
                ..
            } = &ctx.metadata
            {
                let mut comment = output;
                if let Some(pr_url) = &result.pr_url {
                    comment.push_str(&format!("\n\nPull Request: {pr_url}"));
                }
                if let Err(err) = self
                    .github
                    .post_issue_comment(owner, repo, *issue_number, &comment)
                    .await
                {
                    warn!(%err, "issue comment failed");
                }
            }
        } else {
            let message = result
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".into());
            if let Err(err) = self.router.notify_task_error(&ctx, &message).await {
                warn!(%err, "error notification failed");
            }
        }

        self.history.record(&completed).await;
    }

    /// Resolve the workspace, session, and prompt for a task, per source.
    async fn plan_workspace(&self, task: &Task) -> Result<RunPlan> {
        match &task.metadata {
            TaskMetadata::Github {
                owner,
                repo,
                issue_number,
                issue_title,
                issue_url,
                thread_id,
                ..
            } => {
                let repo_dir = repo::clone_or_fetch(
                    &self.config.repos_dir(),
                    owner,
                    repo,
                    &self.config.github.token,
                )
                .await?;
                let worktree = self
                    .worktrees
                    .get_or_create_worktree(&repo_dir, owner, repo, *issue_number)
                    .await?;

                // Bind a notification thread on first dispatch.
                let mut metadata = task.metadata.clone();
                if thread_id.is_none() {
                    match self
                        .router
                        .create_issue_thread(owner, repo, *issue_number, issue_title, issue_url)
                        .await
                    {
                        Ok(ts) if !ts.is_empty() => {
                            self.sessions
                                .link_thread_issue(&ts, owner, repo, *issue_number)
                                .await?;
                            if let TaskMetadata::Github { thread_id, .. } = &mut metadata {
                                *thread_id = Some(ts);
                            }
                        }
                        Ok(_) => {}
                        Err(err) => warn!(%err, "issue thread creation failed"),
                    }
                }

                let target = format!("{owner}/{repo}");
                let primary = SessionKey::github(owner, repo, *issue_number);
                let (session_keys, record) =
                    self.resolve_session(primary, &metadata, Some(&target)).await;
                let working_directory = record
                    .as_ref()
                    .map_or_else(|| worktree.path.clone(), |r| PathBuf::from(&r.working_directory));

                let prompt = format!(
                    "{}\n\nRepository: {owner}/{repo}\nIssue: #{issue_number} {issue_title}\n{issue_url}\nBranch: {}\n\nCommit your changes and open a pull request when the work is done.",
                    task.prompt, worktree.branch,
                );

                Ok(RunPlan {
                    working_directory,
                    resume_session_id: record.map(|r| r.session_id),
                    session_keys,
                    prompt,
                    metadata,
                    post_run: None,
                })
            }

            TaskMetadata::Slack {
                thread_ts, user_id, ..
            } => {
                // A thread previously bound to an issue continues that
                // issue's session in that issue's worktree.
                if let Some(link) = self.sessions.issue_for_thread(thread_ts).await {
                    let repo_dir = repo::clone_or_fetch(
                        &self.config.repos_dir(),
                        &link.owner,
                        &link.repo,
                        &self.config.github.token,
                    )
                    .await?;
                    let worktree = self
                        .worktrees
                        .get_or_create_worktree(
                            &repo_dir,
                            &link.owner,
                            &link.repo,
                            link.issue_number,
                        )
                        .await?;

                    let target = format!("{}/{}", link.owner, link.repo);
                    let primary =
                        SessionKey::github(&link.owner, &link.repo, link.issue_number);
                    let (session_keys, record) = self
                        .resolve_session(primary, &task.metadata, Some(&target))
                        .await;
                    let working_directory = record.as_ref().map_or_else(
                        || worktree.path.clone(),
                        |r| PathBuf::from(&r.working_directory),
                    );

                    let prompt = format!(
                        "{}\n\nThis conversation continues work on {target}#{}.",
                        task.prompt, link.issue_number,
                    );

                    return Ok(RunPlan {
                        working_directory: working_directory.clone(),
                        resume_session_id: record.map(|r| r.session_id),
                        session_keys,
                        prompt,
                        metadata: task.metadata.clone(),
                        post_run: Some(PostRunAction::CommitIssueFollowUp {
                            dir: working_directory,
                            issue_number: link.issue_number,
                        }),
                    });
                }

                let target_repo = match task.metadata.target_repo() {
                    Some(repo) => Some(repo.to_owned()),
                    None => self.sessions.repo_for_thread(thread_ts).await,
                };
                let primary = SessionKey::slack(thread_ts, user_id);
                self.plan_channel_workspace(task, primary, target_repo, thread_ts)
                    .await
            }

            TaskMetadata::Line { user_id, .. } => {
                let primary = SessionKey::line(user_id);
                let target_repo = task.metadata.target_repo().map(ToOwned::to_owned);
                let key_seed = user_id.clone();
                self.plan_channel_workspace(task, primary, target_repo, &key_seed)
                    .await
            }

            TaskMetadata::Http { correlation_id, .. } => {
                let primary = SessionKey::http(correlation_id);
                let target_repo = task.metadata.target_repo().map(ToOwned::to_owned);
                let key_seed = correlation_id.clone();
                self.plan_channel_workspace(task, primary, target_repo, &key_seed)
                    .await
            }
        }
    }

    /// Common planning for Slack/LINE/HTTP tasks: an explicit target repo
    /// gets a keyed worktree, everything else runs in the shared workspace.
    async fn plan_channel_workspace(
        &self,
        task: &Task,
        primary: SessionKey,
        target_repo: Option<String>,
        key_seed: &str,
    ) -> Result<RunPlan> {
        if let Some(target) = target_repo {
            let (owner, repo_name) = target
                .split_once('/')
                .ok_or_else(|| AppError::Config(format!("invalid target repo '{target}'")))?;
            let repo_dir = repo::clone_or_fetch(
                &self.config.repos_dir(),
                owner,
                repo_name,
                &self.config.github.token,
            )
            .await?;
            let key = derive_worktree_key(key_seed);
            let worktree = self
                .worktrees
                .get_or_create_worktree(&repo_dir, owner, repo_name, key)
                .await?;

            if let TaskMetadata::Slack { thread_ts, .. } = &task.metadata {
                self.sessions.set_thread_repo(thread_ts, &target).await?;
            }

            let (session_keys, record) = self
                .resolve_session(primary, &task.metadata, Some(&target))
                .await;
            let working_directory = record
                .as_ref()
                .map_or_else(|| worktree.path.clone(), |r| PathBuf::from(&r.working_directory));

            return Ok(RunPlan {
                working_directory,
                resume_session_id: record.map(|r| r.session_id),
                session_keys,
                prompt: format!("{}\n\nRepository: {target}", task.prompt),
                metadata: task.metadata.clone(),
                post_run: None,
            });
        }

        let workspace = self.config.shared_workspace_dir();
        self.worktrees.initialize_workspace(&workspace).await?;
        let (session_keys, record) = self.resolve_session(primary, &task.metadata, None).await;
        let working_directory = record
            .as_ref()
            .map_or_else(|| workspace.clone(), |r| PathBuf::from(&r.working_directory));

        Ok(RunPlan {
            working_directory,
            resume_session_id: record.map(|r| r.session_id),
            session_keys,
            prompt: task.prompt.clone(),
            metadata: task.metadata.clone(),
            post_run: None,
        })
    }

    /// Look up the session for a task: channel-specific key first, then the
    /// cross-channel `user:{canonical}:{repo|default}` fallback. Returns
    /// the keys a new session id should be written under, and the matched
    /// record, if any.
    async fn resolve_session(
        &self,
        primary: SessionKey,
        metadata: &TaskMetadata,
        target_repo: Option<&str>,
    ) -> (Vec<SessionKey>, Option<crate::models::session::SessionRecord>) {
        let mut keys = vec![primary.clone()];
        let fallback = self
            .identity
            .canonical_user(metadata)
            .map(|canonical| SessionKey::user(&canonical, target_repo));
        if let Some(fallback) = &fallback {
            keys.push(fallback.clone());
        }

        if let Some(record) = self.sessions.get(&primary).await {
            info!(key = %primary, "resuming session from channel key");
            return (keys, Some(record));
        }
        if let Some(fallback) = &fallback {
            if let Some(record) = self.sessions.get(fallback).await {
                info!(key = %fallback, "resuming session from cross-channel fallback");
                return (keys, Some(record));
            }
        }
        (keys, None)
    }

    /// Issue-closed lifecycle: unlink thread bindings, delete the session
    /// record, and remove the worktree. Idempotent.
    pub async fn handle_issue_closed(&self, owner: &str, repo: &str, issue_number: u64) {
        info!(owner, repo, issue_number, "issue closed; cleaning up");
        if let Err(err) = self.sessions.unlink_issue(owner, repo, issue_number).await {
            warn!(%err, "failed to unlink issue thread");
        }
        let key = SessionKey::github(owner, repo, issue_number);
        if let Err(err) = self.sessions.remove(&key).await {
            warn!(%err, "failed to delete issue session");
        }
        self.worktrees.remove_worktree(owner, repo, issue_number).await;
    }
}

/// Forward agent work-log events to the originating channel until the
/// runner drops its sender.
fn spawn_work_log_forwarder(
    router: Arc<NotificationRouter>,
    ctx: NotificationContext,
    mut rx: mpsc::UnboundedReceiver<crate::models::worklog::WorkLogEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Err(err) = router.notify_work_log(&ctx, &event).await {
                warn!(%err, "work-log notification failed");
            }
        }
    })
}

/// Worktree key for a channel conversation: the last 8 characters of the
/// conversation id read as a decimal integer, falling back to the current
/// wall-clock millisecond when non-numeric. Collisions across conversations
/// are accepted as-is.
#[must_use]
pub fn derive_worktree_key(id: &str) -> u64 {
    let chars: Vec<char> = id.chars().collect();
    let tail: String = chars[chars.len().saturating_sub(8)..].iter().collect();
    tail.parse::<u64>().unwrap_or_else(|_| {
        u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default()
    })
}

/// Truncate completion output at the notification cap, substituting the
/// placeholder when the agent produced nothing.
#[must_use]
pub fn render_completion_output(output: &str) -> String {
    if output.trim().is_empty() {
        return EMPTY_OUTPUT_PLACEHOLDER.to_owned();
    }
    let count = output.chars().count();
    if count <= COMPLETION_OUTPUT_CAP {
        return output.to_owned();
    }
    let truncated: String = output.chars().take(COMPLETION_OUTPUT_CAP).collect();
    format!("{truncated}…")
}
