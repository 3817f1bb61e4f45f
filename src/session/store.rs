//! Persistent mapping from conversation keys to agent sessions.
//!
//! The whole store is one JSON document rewritten atomically
//! (write-temp-then-rename) on every mutation. Records past the TTL are
//! dropped at load and skipped on lookup; malformed files are replaced with
//! an empty store rather than aborting startup.

use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::models::session::{IssueLink, SessionKey, SessionRecord, SessionStoreFile};
use crate::{AppError, Result};

/// Conversation-key → session store backed by `sessions.json`.
pub struct SessionStore {
    path: PathBuf,
    max_age: Duration,
    state: Mutex<SessionStoreFile>,
}

impl SessionStore {
    /// Load the store from `path`, evicting records whose `last_used` is
    /// past the TTL. A missing file yields an empty store; a malformed one
    /// is logged and replaced.
    pub async fn load(path: PathBuf, max_age_hours: u64) -> Self {
        let max_age = Duration::hours(i64::try_from(max_age_hours).unwrap_or(24));
        let mut file = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str::<SessionStoreFile>(&raw) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(path = %path.display(), %err, "malformed session store; starting empty");
                    SessionStoreFile::default()
                }
            },
            Err(_) => SessionStoreFile::default(),
        };

        let cutoff = Utc::now() - max_age;
        let before = file.sessions.len();
        file.sessions.retain(|_, record| record.last_used > cutoff);
        if file.sessions.len() < before {
            info!(
                evicted = before - file.sessions.len(),
                "expired sessions dropped at load"
            );
        }

        Self {
            path,
            max_age,
            state: Mutex::new(file),
        }
    }

    /// Look up the session for a conversation key.
    ///
    /// Expired records are evicted on access and reported as a miss.
    pub async fn get(&self, key: &SessionKey) -> Option<SessionRecord> {
        let mut state = self.state.lock().await;
        let record = state.sessions.get(key.as_str())?.clone();
        if Utc::now() - record.last_used > self.max_age {
            state.sessions.remove(key.as_str());
            return None;
        }
        Some(record)
    }

    /// Record a session id under a conversation key.
    ///
    /// An existing record keeps its creation timestamp and its working
    /// directory — the directory stored with a session is immutable so
    /// follow-ups resume against the same filesystem state.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Session` if persistence fails.
    pub async fn put(
        &self,
        key: &SessionKey,
        session_id: &str,
        working_directory: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.sessions.get_mut(key.as_str()) {
            Some(existing) => {
                existing.session_id = session_id.to_owned();
                existing.last_used = Utc::now();
            }
            None => {
                state.sessions.insert(
                    key.as_str().to_owned(),
                    SessionRecord::new(session_id.to_owned(), working_directory.to_owned()),
                );
            }
        }
        Self::persist(&self.path, &state).await
    }

    /// Delete the record for a conversation key. Missing keys are a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Session` if persistence fails.
    pub async fn remove(&self, key: &SessionKey) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.sessions.remove(key.as_str()).is_none() {
            return Ok(());
        }
        Self::persist(&self.path, &state).await
    }

    /// Bind a notification thread to the GitHub issue it tracks.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Session` if persistence fails.
    pub async fn link_thread_issue(
        &self,
        thread_id: &str,
        owner: &str,
        repo: &str,
        issue_number: u64,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.thread_issues.insert(
            thread_id.to_owned(),
            IssueLink {
                owner: owner.to_owned(),
                repo: repo.to_owned(),
                issue_number,
            },
        );
        Self::persist(&self.path, &state).await
    }

    /// The issue a thread is bound to, if any.
    pub async fn issue_for_thread(&self, thread_id: &str) -> Option<IssueLink> {
        self.state
            .lock()
            .await
            .thread_issues
            .get(thread_id)
            .cloned()
    }

    /// Remove every thread binding that points at the given issue.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Session` if persistence fails.
    pub async fn unlink_issue(&self, owner: &str, repo: &str, issue_number: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        let before = state.thread_issues.len();
        state.thread_issues.retain(|_, link| {
            !(link.owner == owner && link.repo == repo && link.issue_number == issue_number)
        });
        if state.thread_issues.len() == before {
            return Ok(());
        }
        Self::persist(&self.path, &state).await
    }

    /// Bind a thread to an explicit target repository.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Session` if persistence fails.
    pub async fn set_thread_repo(&self, thread_id: &str, target_repo: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .thread_repos
            .insert(thread_id.to_owned(), target_repo.to_owned());
        Self::persist(&self.path, &state).await
    }

    /// The target repository a thread was bound to, if any.
    pub async fn repo_for_thread(&self, thread_id: &str) -> Option<String> {
        self.state.lock().await.thread_repos.get(thread_id).cloned()
    }

    /// Rewrite the backing file atomically: serialize into a temp file in
    /// the same directory, fsync, then rename over the target.
    async fn persist(path: &Path, state: &SessionStoreFile) -> Result<()> {
        let serialized = serde_json::to_string_pretty(state)
            .map_err(|err| AppError::Session(format!("failed to serialize sessions: {err}")))?;
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || write_atomic(&path, &serialized))
            .await
            .map_err(|err| AppError::Session(format!("persist task failed: {err}")))?
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    use std::io::Write;

    let dir = path
        .parent()
        .ok_or_else(|| AppError::Session("session path has no parent".into()))?;
    std::fs::create_dir_all(dir)
        .map_err(|err| AppError::Session(format!("failed to create state dir: {err}")))?;

    let mut temp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|err| AppError::Session(format!("failed to create temp file: {err}")))?;
    temp.write_all(contents.as_bytes())
        .map_err(|err| AppError::Session(format!("failed to write sessions: {err}")))?;
    temp.flush()
        .map_err(|err| AppError::Session(format!("failed to flush sessions: {err}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        if let Err(err) = std::fs::set_permissions(temp.path(), perms) {
            warn!(%err, "failed to restrict session file mode");
        }
    }

    temp.persist(path)
        .map_err(|err| AppError::Session(format!("failed to replace sessions: {err}")))?;
    Ok(())
}
