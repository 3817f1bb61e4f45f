//! Worktree descriptor returned by the worktree manager.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A Git worktree dedicated to one logical task stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WorktreeInfo {
    /// Branch checked out in the worktree (`claps/issue-<key>`).
    pub branch: String,
    /// On-disk path, nested under the clone root.
    pub path: PathBuf,
    /// Identifying key (issue number or thread-derived integer).
    pub key: u64,
    /// Repository owner.
    pub owner: String,
    /// Repository name.
    pub repo: String,
    /// Whether an existing worktree was reused rather than created.
    pub is_existing: bool,
}
