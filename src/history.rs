//! Append-only JSONL task history.

use std::path::PathBuf;

use serde::Serialize;
use tracing::warn;

use crate::models::task::Task;

/// One history line per finalized task.
#[derive(Debug, Serialize)]
struct HistoryEntry<'a> {
    task_id: &'a str,
    source: String,
    status: &'a crate::models::task::TaskStatus,
    prompt: &'a str,
    output: Option<&'a str>,
    error: Option<&'a str>,
    pr_url: Option<&'a str>,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Appends finalized tasks to `history.jsonl`. Write failures are logged
/// and never surface to the engine.
pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    /// Bind the store to its backing file.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Append one record for a finalized task.
    pub async fn record(&self, task: &Task) {
        let entry = HistoryEntry {
            task_id: &task.id,
            source: task.source.to_string(),
            status: &task.status,
            prompt: &task.prompt,
            output: task.result.as_ref().map(|r| r.output.as_str()),
            error: task.result.as_ref().and_then(|r| r.error.as_deref()),
            pr_url: task.result.as_ref().and_then(|r| r.pr_url.as_deref()),
            started_at: task.started_at,
            completed_at: task.completed_at,
        };
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(err) => {
                warn!(%err, "failed to serialize history entry");
                return;
            }
        };

        if let Some(parent) = self.path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let result = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await;
        match result {
            Ok(mut file) => {
                use tokio::io::AsyncWriteExt;
                if let Err(err) = file.write_all(format!("{line}\n").as_bytes()).await {
                    warn!(%err, "failed to append history entry");
                }
            }
            Err(err) => warn!(%err, "failed to open history log"),
        }
    }
}
