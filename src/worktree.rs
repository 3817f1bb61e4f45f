//! Per-(repo, key) Git worktree lifecycle and hook configuration.
//!
//! Worktrees live under `<clone>/.worktrees/issue-<key>` on branch
//! `claps/issue-<key>`. Each worktree carries the agent's `PreToolUse` hook
//! wiring in `.claude/settings.json` so every tool call of the agent
//! round-trips through the authorization gateway.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::GlobalConfig;
use crate::git::repo;
use crate::models::worktree::WorktreeInfo;
use crate::{AppError, Result};

/// Authorization hook script installed into each worktree.
///
/// Forwards the tool payload to the gateway `/approve` endpoint and maps
/// the returned `permissionDecision` onto the hook protocol.
const APPROVE_HOOK: &str = r#"#!/bin/sh
# PreToolUse authorization hook: ask the claps gateway before any tool runs.
INPUT=$(cat)
TOKEN=$(cat "$HOME/.claps/auth-token" 2>/dev/null)
URL="${APPROVAL_SERVER_URL:-http://localhost:3001}"
RESPONSE=$(printf '%s' "$INPUT" | curl -sS --max-time 310 \
  -X POST "$URL/approve" \
  -H "Content-Type: application/json" \
  -H "X-Auth-Token: $TOKEN" \
  --data-binary @-)
DECISION=$(printf '%s' "$RESPONSE" | sed -n 's/.*"permissionDecision"[[:space:]]*:[[:space:]]*"\([a-z]*\)".*/\1/p')
if [ "$DECISION" = "allow" ]; then
  printf '{"hookSpecificOutput":{"hookEventName":"PreToolUse","permissionDecision":"allow"}}'
else
  printf '{"hookSpecificOutput":{"hookEventName":"PreToolUse","permissionDecision":"deny","permissionDecisionReason":"denied by claps"}}'
fi
"#;

/// Notification hook script installed into each worktree.
///
/// Fire-and-forget mirror of the tool payload to `/notify-tool` so the
/// originating channel sees progress.
const NOTIFY_HOOK: &str = r#"#!/bin/sh
# PreToolUse notification hook: mirror the tool payload to the gateway.
INPUT=$(cat)
TOKEN=$(cat "$HOME/.claps/auth-token" 2>/dev/null)
URL="${APPROVAL_SERVER_URL:-http://localhost:3001}"
printf '%s' "$INPUT" | curl -sS --max-time 4 \
  -X POST "$URL/notify-tool" \
  -H "Content-Type: application/json" \
  -H "X-Auth-Token: $TOKEN" \
  --data-binary @- >/dev/null 2>&1 || true
exit 0
"#;

const APPROVE_HOOK_NAME: &str = "claps-approve.sh";
const NOTIFY_HOOK_NAME: &str = "claps-notify.sh";
const WARMED_MARKER: &str = ".claps-warmed";

/// Manages worktree creation, reuse, removal, and hook injection.
pub struct WorktreeManager {
    config: Arc<GlobalConfig>,
    /// Worktrees created or reused during this run, keyed by worktree
    /// path with the owning clone directory as value. Drained by
    /// [`WorktreeManager::cleanup_all`] at shutdown.
    active: Mutex<HashMap<PathBuf, PathBuf>>,
}

impl WorktreeManager {
    /// Bind the manager to the global configuration.
    #[must_use]
    pub fn new(config: Arc<GlobalConfig>) -> Self {
        Self {
            config,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Branch name for a worktree key.
    #[must_use]
    pub fn branch_name(key: u64) -> String {
        format!("claps/issue-{key}")
    }

    /// On-disk path of a worktree under its clone root.
    #[must_use]
    pub fn worktree_path(repo_dir: &Path, key: u64) -> PathBuf {
        repo_dir.join(".worktrees").join(format!("issue-{key}"))
    }

    /// Get or create the worktree for `(owner, repo, key)`.
    ///
    /// An existing directory is reused (hooks re-injected); otherwise the
    /// default branch is fetched, stale branches and directories are
    /// best-effort removed, and a fresh worktree is added from
    /// `origin/<default>`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Git` or `AppError::Worktree` when git operations
    /// or hook injection fail.
    pub async fn get_or_create_worktree(
        &self,
        repo_dir: &Path,
        owner: &str,
        repo: &str,
        key: u64,
    ) -> Result<WorktreeInfo> {
        let branch = Self::branch_name(key);
        let path = Self::worktree_path(repo_dir, key);

        if path.exists() {
            debug!(path = %path.display(), "reusing existing worktree");
            self.inject_hooks(&path).await?;
            self.warm_up(&path).await;
            self.track(&path, repo_dir).await;
            return Ok(WorktreeInfo {
                branch,
                path,
                key,
                owner: owner.to_owned(),
                repo: repo.to_owned(),
                is_existing: true,
            });
        }

        let default = repo::default_branch(repo_dir).await;
        repo::fetch_branch(repo_dir, &default).await?;

        // Stale state from a previous run of the same key.
        repo::run_git_best_effort(Some(repo_dir), &["push", "origin", "--delete", &branch]).await;
        repo::run_git_best_effort(Some(repo_dir), &["branch", "-D", &branch]).await;
        if path.exists() {
            let _ = tokio::fs::remove_dir_all(&path).await;
        }
        repo::run_git_best_effort(Some(repo_dir), &["worktree", "prune"]).await;

        let start_point = format!("origin/{default}");
        repo::worktree_add(repo_dir, &branch, &path, &start_point).await?;
        info!(owner, repo, key, branch, "worktree created");

        self.inject_hooks(&path).await?;
        self.warm_up(&path).await;
        self.track(&path, repo_dir).await;

        Ok(WorktreeInfo {
            branch,
            path,
            key,
            owner: owner.to_owned(),
            repo: repo.to_owned(),
            is_existing: false,
        })
    }

    /// Remove the worktree for an issue. Idempotent.
    pub async fn remove_worktree(&self, owner: &str, repo: &str, issue: u64) {
        let repo_dir = self.config.repo_dir(owner, repo);
        let path = Self::worktree_path(&repo_dir, issue);
        self.active.lock().await.remove(&path);
        if !repo_dir.exists() {
            return;
        }
        repo::worktree_remove(&repo_dir, &path).await;
        info!(owner, repo, issue, "worktree removed");
    }

    /// Remove every worktree known to this run. Part of the shutdown
    /// sequence; worktree paths are deterministic, so a follow-up after a
    /// restart recreates the same directory before its session resumes.
    pub async fn cleanup_all(&self) {
        let known: Vec<(PathBuf, PathBuf)> = self.active.lock().await.drain().collect();
        if known.is_empty() {
            return;
        }
        info!(count = known.len(), "cleaning up worktrees at shutdown");
        for (path, repo_dir) in known {
            repo::worktree_remove(&repo_dir, &path).await;
            debug!(path = %path.display(), "worktree cleaned up");
        }
    }

    async fn track(&self, path: &Path, repo_dir: &Path) {
        self.active
            .lock()
            .await
            .insert(path.to_path_buf(), repo_dir.to_path_buf());
    }

    /// Prepare the shared workspace: init a repository if absent, inject
    /// hook configuration, write the starter marker document, and warm up.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Git` or `AppError::Worktree` on failure.
    pub async fn initialize_workspace(&self, path: &Path) -> Result<()> {
        repo::init_if_absent(path).await?;
        self.inject_hooks(path).await?;

        let marker = path.join("CLAPS.md");
        if !marker.exists() {
            let body = "# claps workspace\n\nShared workspace for tasks without a target repository.\n";
            tokio::fs::write(&marker, body)
                .await
                .map_err(|err| AppError::Worktree(format!("failed to write marker: {err}")))?;
        }
        self.warm_up(path).await;
        Ok(())
    }

    /// Merge the gateway hook entries into `<path>/.claude/settings.json`
    /// and install the hook scripts. Idempotent: entries are detected by a
    /// substring match on the command path and never duplicated.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Worktree` when the settings file cannot be read,
    /// merged, or written.
    pub async fn inject_hooks(&self, path: &Path) -> Result<()> {
        let claude_dir = path.join(".claude");
        let hooks_dir = claude_dir.join("hooks");
        tokio::fs::create_dir_all(&hooks_dir)
            .await
            .map_err(|err| AppError::Worktree(format!("failed to create hooks dir: {err}")))?;

        install_hook_script(&hooks_dir.join(APPROVE_HOOK_NAME), APPROVE_HOOK).await?;
        install_hook_script(&hooks_dir.join(NOTIFY_HOOK_NAME), NOTIFY_HOOK).await?;

        let settings_path = claude_dir.join("settings.json");
        let mut settings: Value = match tokio::fs::read_to_string(&settings_path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                warn!(%err, "unparseable settings.json; rebuilding");
                json!({})
            }),
            Err(_) => json!({}),
        };

        let approve_cmd = hooks_dir.join(APPROVE_HOOK_NAME).display().to_string();
        let notify_cmd = hooks_dir.join(NOTIFY_HOOK_NAME).display().to_string();

        let pre_tool_use = settings
            .as_object_mut()
            .ok_or_else(|| AppError::Worktree("settings.json is not an object".into()))?
            .entry("hooks")
            .or_insert_with(|| json!({}))
            .as_object_mut()
            .ok_or_else(|| AppError::Worktree("hooks is not an object".into()))?
            .entry("PreToolUse")
            .or_insert_with(|| json!([]));
        let entries = pre_tool_use
            .as_array_mut()
            .ok_or_else(|| AppError::Worktree("PreToolUse is not an array".into()))?;

        // Authorization hook is prepended so it fires before anything else.
        if !has_hook_entry(entries, APPROVE_HOOK_NAME) {
            entries.insert(
                0,
                json!({
                    "matcher": "",
                    "hooks": [{ "type": "command", "command": approve_cmd, "timeout": 320 }],
                }),
            );
        }
        if !has_hook_entry(entries, NOTIFY_HOOK_NAME) {
            entries.push(json!({
                "matcher": ".*",
                "hooks": [{ "type": "command", "command": notify_cmd, "timeout": 5 }],
            }));
        }

        let serialized = serde_json::to_string_pretty(&settings)
            .map_err(|err| AppError::Worktree(format!("failed to serialize settings: {err}")))?;
        tokio::fs::write(&settings_path, serialized)
            .await
            .map_err(|err| AppError::Worktree(format!("failed to write settings: {err}")))?;
        Ok(())
    }

    /// One-time warm-up: drive the agent CLI through its first-run trust
    /// dialog inside a tmux session, recording a marker file on success.
    /// Best-effort — a host without tmux logs a warning and records the
    /// marker so task runs are never blocked on an interactive dialog.
    pub async fn warm_up(&self, path: &Path) {
        let marker = path.join(WARMED_MARKER);
        if marker.exists() {
            return;
        }

        let session = format!("claps-warmup-{}", std::process::id());
        let cwd = path.to_string_lossy().to_string();
        let launch = Command::new("tmux")
            .args([
                "new-session",
                "-d",
                "-s",
                session.as_str(),
                "-c",
                cwd.as_str(),
                self.config.agent.binary.as_str(),
            ])
            .output()
            .await;

        match launch {
            Ok(output) if output.status.success() => {
                // Accept the trust prompt, then tear the session down.
                tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
                let _ = Command::new("tmux")
                    .args(["send-keys", "-t", session.as_str(), "Enter"])
                    .output()
                    .await;
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                let _ = Command::new("tmux")
                    .args(["kill-session", "-t", session.as_str()])
                    .output()
                    .await;
                info!(path = %path.display(), "workspace warm-up complete");
            }
            Ok(output) => {
                warn!(
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "tmux warm-up failed; continuing without it"
                );
            }
            Err(err) => {
                warn!(%err, "tmux unavailable; skipping warm-up");
            }
        }

        if let Err(err) = tokio::fs::write(&marker, b"warmed\n").await {
            warn!(%err, "failed to record warm-up marker");
        }
    }
}

fn content_digest(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

fn has_hook_entry(entries: &[Value], script_name: &str) -> bool {
    entries.iter().any(|entry| {
        entry["hooks"]
            .as_array()
            .is_some_and(|hooks| {
                hooks.iter().any(|hook| {
                    hook["command"]
                        .as_str()
                        .is_some_and(|cmd| cmd.contains(script_name))
                })
            })
    })
}

async fn install_hook_script(target: &Path, contents: &str) -> Result<()> {
    // Skip the rewrite when the installed script already matches.
    if let Ok(existing) = tokio::fs::read(target).await {
        if content_digest(&existing) == content_digest(contents.as_bytes()) {
            return Ok(());
        }
    }
    tokio::fs::write(target, contents)
        .await
        .map_err(|err| AppError::Worktree(format!("failed to write hook script: {err}")))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(target, std::fs::Permissions::from_mode(0o755))
            .await
            .map_err(|err| AppError::Worktree(format!("failed to chmod hook script: {err}")))?;
    }
    Ok(())
}
