//! Queue backend seam
//!
//! The storage contract every queue backend honors: atomic lease with a
//! visibility timeout, priority-ordered scan, delayed availability, and
//! bounded retention of finished tasks. The in-memory backend is the
//! default; a Redis-backed one mirrors the same semantics for distributed
//! operation.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::task::{Task, TaskResult};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("duplicate task id: {0}")]
    Duplicate(String),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("queue is paused")]
    Paused,

    #[error("queue operation cancelled")]
    Cancelled,

    #[error("queue backend error: {0}")]
    Backend(String),

    #[error("task serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Queue counters
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
}

/// Storage semantics for the task queue.
///
/// Ordering: strictly by priority descending, FIFO by enqueue sequence
/// within equal priority. Delayed tasks become leasable at `available_at`.
/// Leases expire after the visibility timeout and the task becomes
/// leasable again (at-least-once delivery).
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Add one task. A colliding id among pending or active tasks is a
    /// `Duplicate` error.
    async fn enqueue(&self, task: Task, available_at: Option<DateTime<Utc>>)
        -> Result<(), QueueError>;

    /// Atomic batch add: either all tasks land or none.
    async fn enqueue_bulk(
        &self,
        tasks: Vec<(Task, Option<DateTime<Utc>>)>,
    ) -> Result<(), QueueError>;

    /// Lease the highest-priority eligible task, if any, marking it active
    /// for `visibility`.
    async fn try_lease(&self, visibility: Duration) -> Result<Option<Task>, QueueError>;

    /// Fetch an active (leased) task by id.
    async fn get_active(&self, id: &str) -> Result<Task, QueueError>;

    /// Move an active task to the completed set.
    async fn complete(&self, id: &str, result: &TaskResult) -> Result<Task, QueueError>;

    /// Move an active task to the failed set.
    async fn fail(&self, id: &str, reason: &str) -> Result<Task, QueueError>;

    /// Re-enqueue an active task for another attempt at `available_at`,
    /// incrementing its attempt count.
    async fn retry(&self, id: &str, available_at: DateTime<Utc>) -> Result<Task, QueueError>;

    async fn pause(&self) -> Result<(), QueueError>;

    async fn resume(&self) -> Result<(), QueueError>;

    /// Remove all waiting and delayed tasks; active tasks finish normally.
    async fn drain(&self) -> Result<(), QueueError>;

    /// Remove everything, including retention sets.
    async fn obliterate(&self) -> Result<(), QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;
}
