//! In-memory FIFO task queue with event hooks.

use std::collections::{HashMap, VecDeque};

use chrono::Utc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::models::task::{Task, TaskMetadata, TaskResult, TaskStatus};
use crate::{AppError, Result};

/// Queue lifecycle notifications delivered to subscribers.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// A task was enqueued.
    Added(Task),
    /// A task transitioned pending→running.
    Started(Task),
    /// A task completed successfully.
    Completed(Task),
    /// A task completed with a failure result.
    Failed(Task),
}

struct QueueInner {
    tasks: HashMap<String, Task>,
    pending: VecDeque<String>,
    subscribers: Vec<UnboundedSender<TaskEvent>>,
}

/// FIFO queue owning every task from creation to completion.
///
/// Tasks are created by channel adapters via [`TaskQueue::add`]; once
/// completed they are read-only. A dead subscriber never affects the queue
/// or the remaining subscribers.
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                tasks: HashMap::new(),
                pending: VecDeque::new(),
                subscribers: Vec::new(),
            }),
        }
    }

    /// Subscribe to queue events. The receiver gets every event fired after
    /// this call; dropping it detaches the subscription.
    pub async fn subscribe(&self) -> UnboundedReceiver<TaskEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().await.subscribers.push(tx);
        rx
    }

    /// Enqueue a new task and fire [`TaskEvent::Added`].
    pub async fn add(&self, prompt: String, metadata: TaskMetadata) -> Task {
        let task = Task::new(prompt, metadata);
        let mut inner = self.inner.lock().await;
        inner.tasks.insert(task.id.clone(), task.clone());
        inner.pending.push_back(task.id.clone());
        info!(task_id = %task.id, source = %task.source, "task enqueued");
        Self::emit(&mut inner.subscribers, TaskEvent::Added(task.clone()));
        task
    }

    /// Pop the oldest pending task, atomically transitioning it to
    /// `running` and stamping `started_at`. Fires [`TaskEvent::Started`].
    pub async fn next_pending(&self) -> Option<Task> {
        let mut inner = self.inner.lock().await;
        let id = inner.pending.pop_front()?;
        let task = {
            let task = inner.tasks.get_mut(&id)?;
            task.status = TaskStatus::Running;
            task.started_at = Some(Utc::now());
            task.clone()
        };
        Self::emit(&mut inner.subscribers, TaskEvent::Started(task.clone()));
        Some(task)
    }

    /// Record the result of a running task, transitioning it to
    /// `completed` or `failed` and stamping `completed_at`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown task id.
    pub async fn complete(&self, id: &str, result: TaskResult) -> Result<Task> {
        let mut inner = self.inner.lock().await;
        let task = {
            let task = inner
                .tasks
                .get_mut(id)
                .ok_or_else(|| AppError::NotFound(format!("task {id}")))?;
            task.status = if result.success {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };
            task.completed_at = Some(Utc::now());
            task.result = Some(result);
            task.clone()
        };
        let event = if task.status == TaskStatus::Completed {
            TaskEvent::Completed(task.clone())
        } else {
            TaskEvent::Failed(task.clone())
        };
        Self::emit(&mut inner.subscribers, event);
        Ok(task)
    }

    /// Fetch a task snapshot by id.
    pub async fn get(&self, id: &str) -> Option<Task> {
        self.inner.lock().await.tasks.get(id).cloned()
    }

    /// List tasks currently in the given status, oldest first.
    pub async fn list_by_status(&self, status: TaskStatus) -> Vec<Task> {
        let inner = self.inner.lock().await;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Whether a task for the given GitHub issue has ever been enqueued.
    pub async fn is_issue_processed(&self, owner: &str, repo: &str, issue: u64) -> bool {
        let inner = self.inner.lock().await;
        inner.tasks.values().any(|t| {
            matches!(
                &t.metadata,
                TaskMetadata::Github {
                    owner: o,
                    repo: r,
                    issue_number,
                    ..
                } if o == owner && r == repo && *issue_number == issue
            )
        })
    }

    /// Number of tasks in the pending queue.
    pub async fn pending_len(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    /// Deliver an event to every live subscriber. Subscribers whose receiver
    /// is gone are dropped from the list; a dead listener never affects the
    /// queue or the other listeners.
    fn emit(subscribers: &mut Vec<UnboundedSender<TaskEvent>>, event: TaskEvent) {
        subscribers.retain(|tx| match tx.send(event.clone()) {
            Ok(()) => true,
            Err(_) => {
                debug!("queue subscriber gone; detaching");
                false
            }
        });
    }
}
