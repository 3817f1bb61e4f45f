//! Canonical user identity resolution across channel ids.
//!
//! The admin-maintained mapping table ties GitHub logins, LINE user ids and
//! HTTP device ids to a canonical Slack user id, enabling session continuity
//! when the same person switches channels.

use std::sync::{Arc, RwLock};

use crate::config::AdminConfig;
use crate::models::task::{TaskMetadata, TaskSource};

/// Resolves canonical identities and per-channel allowances from the shared
/// hot-reloadable [`AdminConfig`].
#[derive(Clone)]
pub struct IdentityResolver {
    admin: Arc<RwLock<AdminConfig>>,
}

impl IdentityResolver {
    /// Wrap a shared admin configuration.
    #[must_use]
    pub fn new(admin: Arc<RwLock<AdminConfig>>) -> Self {
        Self { admin }
    }

    /// The shared admin configuration handle.
    #[must_use]
    pub fn admin(&self) -> Arc<RwLock<AdminConfig>> {
        Arc::clone(&self.admin)
    }

    /// Resolve the canonical (Slack) user id for a task's origin.
    ///
    /// Slack users are canonical by themselves; other channels resolve
    /// through the mapping table. `None` means no cross-channel identity is
    /// known and the fallback session key cannot be formed.
    #[must_use]
    pub fn canonical_user(&self, metadata: &TaskMetadata) -> Option<String> {
        let Ok(admin) = self.admin.read() else {
            return None;
        };
        match metadata {
            TaskMetadata::Slack { user_id, .. } => Some(user_id.clone()),
            TaskMetadata::Github { requested_by, .. } => requested_by.as_ref().and_then(|login| {
                admin
                    .user_mappings
                    .iter()
                    .find(|m| m.github_handle.as_deref() == Some(login))
                    .and_then(|m| m.slack_id.clone())
            }),
            TaskMetadata::Line { user_id, .. } => admin
                .user_mappings
                .iter()
                .find(|m| m.line_id.as_deref() == Some(user_id))
                .and_then(|m| m.slack_id.clone()),
            TaskMetadata::Http { device_id, .. } => device_id.as_ref().and_then(|device| {
                admin
                    .user_mappings
                    .iter()
                    .find(|m| m.http_device_id.as_deref() == Some(device))
                    .and_then(|m| m.slack_id.clone())
            }),
        }
    }

    /// Derive the user id an approval request should be attributed to.
    ///
    /// Slack tasks use the posting user; GitHub tasks use the mapped Slack
    /// id, falling back to the configured administrator; LINE and HTTP tasks
    /// use the channel-native id.
    #[must_use]
    pub fn requested_by(&self, metadata: &TaskMetadata) -> Option<String> {
        match metadata {
            TaskMetadata::Slack { user_id, .. } => Some(user_id.clone()),
            TaskMetadata::Github { .. } => self.canonical_user(metadata).or_else(|| {
                self.admin
                    .read()
                    .ok()
                    .and_then(|admin| admin.admin_slack_id.clone())
            }),
            TaskMetadata::Line { user_id, .. } => Some(user_id.clone()),
            TaskMetadata::Http { device_id, .. } => device_id.clone(),
        }
    }

    /// Whether a channel-native user id is allowed to create tasks.
    ///
    /// An empty whitelist for a channel allows everyone on it.
    #[must_use]
    pub fn is_user_allowed(&self, source: TaskSource, id: &str) -> bool {
        let Ok(admin) = self.admin.read() else {
            return false;
        };
        let list = match source {
            TaskSource::Slack => &admin.allowed_users.slack,
            TaskSource::Line => &admin.allowed_users.line,
            TaskSource::Http => &admin.allowed_users.http,
            TaskSource::Github => return true,
        };
        list.is_empty() || list.iter().any(|allowed| allowed == id)
    }
}
