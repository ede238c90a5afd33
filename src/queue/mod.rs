//! Priority task queue
//!
//! Retryable, priority-ordered work items over a pluggable storage
//! backend. The [`TaskQueue`] wrapper owns retry policy and event
//! subscriptions; backends own ordering, visibility, and retention.

mod backend;
mod memory;
#[cfg(feature = "redis-queue")]
mod redis;
mod task;

pub use backend::{QueueBackend, QueueError, QueueStats};
pub use memory::{MemoryBackend, RetentionConfig};
#[cfg(feature = "redis-queue")]
pub use redis::RedisBackend;
pub use task::{Action, BackoffKind, BackoffPolicy, EnqueueOptions, Extractor, Task, TaskResult};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Queue behavior configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    /// Lease visibility timeout, ms.
    pub visibility_timeout_ms: u64,
    /// Poll interval while waiting for eligible work, ms.
    pub poll_interval_ms: u64,
    pub backoff: BackoffPolicy,
    pub retention: RetentionConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_ms: 60_000,
            poll_interval_ms: 100,
            backoff: BackoffPolicy::default(),
            retention: RetentionConfig::default(),
        }
    }
}

type CompletedHandler = Box<dyn Fn(&Task, &TaskResult) + Send + Sync>;
type FailedHandler = Box<dyn Fn(&Task, &str) + Send + Sync>;
type ProgressHandler = Box<dyn Fn(&str, u8) + Send + Sync>;

#[derive(Default)]
struct Subscriptions {
    completed: RwLock<Vec<CompletedHandler>>,
    failed: RwLock<Vec<FailedHandler>>,
    progress: RwLock<Vec<ProgressHandler>>,
}

/// The queue facade workers and clients use.
///
/// Ack/nack route through the retry policy exactly once: a nacked task
/// whose attempt budget remains is re-enqueued with backoff delay, anything
/// else lands in the failed set.
pub struct TaskQueue {
    backend: Arc<dyn QueueBackend>,
    config: QueueConfig,
    subscriptions: Subscriptions,
    cancel: CancellationToken,
}

impl TaskQueue {
    pub fn new(backend: Arc<dyn QueueBackend>, config: QueueConfig, cancel: CancellationToken) -> Self {
        Self {
            backend,
            config,
            subscriptions: Subscriptions::default(),
            cancel,
        }
    }

    pub fn in_memory(config: QueueConfig, cancel: CancellationToken) -> Self {
        let backend = Arc::new(MemoryBackend::new(config.retention.clone()));
        Self::new(backend, config, cancel)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Enqueue with per-call options; `options.id`/`options.priority`
    /// override the task's own, `options.delay` defers availability.
    pub async fn enqueue_with(&self, mut task: Task, options: EnqueueOptions) -> Result<(), QueueError> {
        if let Some(id) = options.id {
            task.id = id;
        }
        if let Some(priority) = options.priority {
            task.priority = priority;
        }
        let available_at = options
            .delay
            .map(|d| Utc::now() + chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero()));
        self.backend.enqueue(task, available_at).await
    }

    pub async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        self.enqueue_with(task, EnqueueOptions::default()).await
    }

    /// Atomic batch enqueue.
    pub async fn enqueue_bulk(&self, tasks: Vec<Task>) -> Result<(), QueueError> {
        self.backend
            .enqueue_bulk(tasks.into_iter().map(|t| (t, None)).collect())
            .await
    }

    /// Block until an eligible task is leased or the queue is cancelled.
    pub async fn lease(&self) -> Result<Task, QueueError> {
        let visibility = Duration::from_millis(self.config.visibility_timeout_ms);
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        loop {
            if self.cancel.is_cancelled() {
                return Err(QueueError::Cancelled);
            }
            if let Some(task) = self.backend.try_lease(visibility).await? {
                return Ok(task);
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(QueueError::Cancelled),
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Complete a leased task. A result carrying `failed = true` is
    /// terminal and lands in the failed set without retry.
    pub async fn ack(&self, id: &str, result: TaskResult) -> Result<(), QueueError> {
        if result.failed {
            let reason = result.reason.clone().unwrap_or_else(|| "task failed".into());
            let task = self.backend.fail(id, &reason).await?;
            self.emit_failed(&task, &reason);
            return Ok(());
        }
        let task = self.backend.complete(id, &result).await?;
        debug!(task = %id, "task completed");
        self.emit_completed(&task, &result);
        Ok(())
    }

    /// Negative-acknowledge a leased task. Retries with backoff while the
    /// attempt budget lasts, then fails permanently.
    pub async fn nack(&self, id: &str, reason: &str) -> Result<(), QueueError> {
        let task = self.backend.get_active(id).await?;
        if task.attempts + 1 < task.max_attempts {
            let attempt = task.attempts + 1;
            let delay = self.config.backoff.delay_for(attempt);
            let available_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            info!(task = %id, attempt, delay_ms = delay.as_millis() as u64, reason, "task retry scheduled");
            self.backend.retry(id, available_at).await?;
        } else {
            info!(task = %id, reason, "attempt budget exhausted, failing task");
            let task = self.backend.fail(id, reason).await?;
            self.emit_failed(&task, reason);
        }
        Ok(())
    }

    pub async fn pause(&self) -> Result<(), QueueError> {
        self.backend.pause().await
    }

    pub async fn resume(&self) -> Result<(), QueueError> {
        self.backend.resume().await
    }

    pub async fn drain(&self) -> Result<(), QueueError> {
        self.backend.drain().await
    }

    pub async fn obliterate(&self) -> Result<(), QueueError> {
        self.backend.obliterate().await
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.backend.stats().await
    }

    pub fn on_completed<F>(&self, handler: F)
    where
        F: Fn(&Task, &TaskResult) + Send + Sync + 'static,
    {
        self.subscriptions.completed.write().push(Box::new(handler));
    }

    pub fn on_failed<F>(&self, handler: F)
    where
        F: Fn(&Task, &str) + Send + Sync + 'static,
    {
        self.subscriptions.failed.write().push(Box::new(handler));
    }

    pub fn on_progress<F>(&self, handler: F)
    where
        F: Fn(&str, u8) + Send + Sync + 'static,
    {
        self.subscriptions.progress.write().push(Box::new(handler));
    }

    /// Report a task's progress milestone to subscribers.
    pub fn emit_progress(&self, id: &str, percent: u8) {
        for handler in self.subscriptions.progress.read().iter() {
            handler(id, percent);
        }
    }

    fn emit_completed(&self, task: &Task, result: &TaskResult) {
        for handler in self.subscriptions.completed.read().iter() {
            handler(task, result);
        }
    }

    fn emit_failed(&self, task: &Task, reason: &str) {
        for handler in self.subscriptions.failed.read().iter() {
            handler(task, reason);
        }
    }
}
