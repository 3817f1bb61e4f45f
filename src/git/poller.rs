//! GitHub issue intake poller.
//!
//! A long-lived background task that polls each configured repository for
//! open issues carrying the trigger label and enqueues them as tasks, and
//! watches previously-enqueued issues for closure so the engine can run the
//! issue-closed lifecycle. API errors are logged and the loop continues.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::GithubConfig;
use crate::git::github::GithubClient;
use crate::models::task::TaskMetadata;
use crate::queue::TaskQueue;

/// Lifecycle signal emitted when a tracked issue closes.
#[derive(Debug, Clone)]
pub struct IssueClosed {
    /// Repository owner.
    pub owner: String,
    /// Repository name.
    pub repo: String,
    /// Issue number.
    pub issue_number: u64,
}

/// Spawn the issue polling task.
///
/// Enqueued issues are tracked in-memory for the life of the task; closure
/// signals go to `closed_tx` for the engine to consume.
#[must_use]
pub fn spawn_issue_poller(
    config: GithubConfig,
    client: GithubClient,
    queue: Arc<TaskQueue>,
    closed_tx: UnboundedSender<IssueClosed>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(config.poll_interval_seconds.max(5));
        let mut tracked: HashSet<(String, String, u64)> = HashSet::new();
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("github poller shutting down");
                    break;
                }
                () = tokio::time::sleep(interval) => {}
            }

            for spec in &config.repos {
                let Some((owner, repo)) = spec.split_once('/') else {
                    continue;
                };
                poll_repo(
                    &client,
                    &queue,
                    &config.trigger_label,
                    owner,
                    repo,
                    &mut tracked,
                )
                .await;
                check_closed(&client, &closed_tx, &mut tracked).await;
            }
        }
    })
}

async fn poll_repo(
    client: &GithubClient,
    queue: &TaskQueue,
    label: &str,
    owner: &str,
    repo: &str,
    tracked: &mut HashSet<(String, String, u64)>,
) {
    let issues = match client.list_open_labeled_issues(owner, repo, label).await {
        Ok(issues) => issues,
        Err(err) => {
            warn!(owner, repo, %err, "issue listing failed; will retry");
            return;
        }
    };

    for issue in issues {
        if queue.is_issue_processed(owner, repo, issue.number).await {
            tracked.insert((owner.to_owned(), repo.to_owned(), issue.number));
            continue;
        }
        let prompt = match issue.body.as_deref() {
            Some(body) if !body.is_empty() => format!("{}\n\n{body}", issue.title),
            _ => issue.title.clone(),
        };
        let metadata = TaskMetadata::Github {
            owner: owner.to_owned(),
            repo: repo.to_owned(),
            issue_number: issue.number,
            issue_title: issue.title.clone(),
            issue_url: issue.html_url.clone(),
            requested_by: Some(issue.user.login.clone()),
            thread_id: None,
        };
        info!(owner, repo, issue = issue.number, "enqueueing trigger issue");
        queue.add(prompt, metadata).await;
        tracked.insert((owner.to_owned(), repo.to_owned(), issue.number));
    }
}

async fn check_closed(
    client: &GithubClient,
    closed_tx: &UnboundedSender<IssueClosed>,
    tracked: &mut HashSet<(String, String, u64)>,
) {
    let mut closed = Vec::new();
    for (owner, repo, number) in tracked.iter() {
        match client.issue_state(owner, repo, *number).await {
            Ok(state) if state == "closed" => {
                closed.push((owner.clone(), repo.clone(), *number));
            }
            Ok(_) => {}
            Err(err) => warn!(owner, repo, issue = number, %err, "issue state check failed"),
        }
    }
    for (owner, repo, number) in closed {
        tracked.remove(&(owner.clone(), repo.clone(), number));
        let signal = IssueClosed {
            owner,
            repo,
            issue_number: number,
        };
        if closed_tx.send(signal).is_err() {
            warn!("issue lifecycle consumer gone; closure signal dropped");
        }
    }
}
