//! Session records and the conversation keys they are filed under.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A conversation key addressing one persisted agent session.
///
/// Rendered forms:
///
/// - `slack:{thread}:{user}`
/// - `github:{owner}/{repo}#{issue}`
/// - `line:{user}`
/// - `http:{correlationId}`
/// - `user:{canonicalUserId}:{targetRepo|default}` (cross-channel fallback)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SessionKey(String);

impl SessionKey {
    /// Key for a Slack thread/user pair.
    #[must_use]
    pub fn slack(thread_ts: &str, user_id: &str) -> Self {
        Self(format!("slack:{thread_ts}:{user_id}"))
    }

    /// Key for a GitHub issue.
    #[must_use]
    pub fn github(owner: &str, repo: &str, issue: u64) -> Self {
        Self(format!("github:{owner}/{repo}#{issue}"))
    }

    /// Key for a LINE user.
    #[must_use]
    pub fn line(user_id: &str) -> Self {
        Self(format!("line:{user_id}"))
    }

    /// Key for an HTTP correlation id.
    #[must_use]
    pub fn http(correlation_id: &str) -> Self {
        Self(format!("http:{correlation_id}"))
    }

    /// Cross-channel fallback key for a canonical user, scoped by target
    /// repository (or `default` when the task has none).
    #[must_use]
    pub fn user(canonical_user: &str, target_repo: Option<&str>) -> Self {
        let scope = target_repo.unwrap_or("default");
        Self(format!("user:{canonical_user}:{scope}"))
    }

    /// The rendered key string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One persisted agent session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionRecord {
    /// Agent-assigned session id, used with `--resume`.
    pub session_id: String,
    /// Working directory the agent ran in. Immutable for the record's
    /// lifetime; follow-ups reuse it verbatim.
    pub working_directory: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-used timestamp, advanced on every lookup hit and write.
    pub last_used: DateTime<Utc>,
}

impl SessionRecord {
    /// Construct a fresh record stamped with the current time.
    #[must_use]
    pub fn new(session_id: String, working_directory: String) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            working_directory,
            created_at: now,
            last_used: now,
        }
    }
}

/// A thread's binding to the GitHub issue it tracks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct IssueLink {
    /// Repository owner.
    pub owner: String,
    /// Repository name.
    pub repo: String,
    /// Issue number.
    pub issue_number: u64,
}

/// On-disk layout of `sessions.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionStoreFile {
    /// Conversation key → session record.
    #[serde(default)]
    pub sessions: HashMap<String, SessionRecord>,
    /// Notification thread id → linked issue.
    #[serde(default)]
    pub thread_issues: HashMap<String, IssueLink>,
    /// Thread id → explicit target repository (`owner/repo`).
    #[serde(default)]
    pub thread_repos: HashMap<String, String>,
}
