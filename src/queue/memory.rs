//! In-memory queue backend
//!
//! The reference implementation of the backend contract. All state lives
//! behind one mutex; promotion of due delayed tasks and expiry of stale
//! leases happen lazily on access.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::backend::{QueueBackend, QueueError, QueueStats};
use super::task::{Task, TaskResult};

/// Retention of finished tasks.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionConfig {
    pub completed_ttl_ms: u64,
    pub failed_ttl_ms: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            completed_ttl_ms: 3_600_000,
            failed_ttl_ms: 86_400_000,
        }
    }
}

/// Waiting-set ordering key: priority descending, then enqueue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct WaitKey {
    neg_priority: i64,
    seq: u64,
}

struct Finished {
    task: Task,
    at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    tasks: HashMap<String, Task>,
    waiting: BTreeMap<WaitKey, String>,
    delayed: BTreeMap<(i64, u64), String>,
    active: HashMap<String, Instant>,
    completed: VecDeque<Finished>,
    failed: VecDeque<Finished>,
    paused: bool,
    seq: u64,
}

impl State {
    fn contains_pending(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    fn promote_due(&mut self) {
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<(i64, u64)> = self
            .delayed
            .range(..=(now_ms, u64::MAX))
            .map(|(k, _)| *k)
            .collect();
        for key in due {
            if let Some(id) = self.delayed.remove(&key) {
                if let Some(task) = self.tasks.get(&id) {
                    let wait_key = WaitKey {
                        neg_priority: -(task.priority as i64),
                        seq: key.1,
                    };
                    self.waiting.insert(wait_key, id);
                }
            }
        }
    }

    fn expire_leases(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .active
            .iter()
            .filter(|(_, deadline)| now >= **deadline)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            self.active.remove(&id);
            if let Some(task) = self.tasks.get(&id) {
                warn!(task = %id, "lease expired, task eligible again");
                self.seq += 1;
                let key = WaitKey {
                    neg_priority: -(task.priority as i64),
                    seq: self.seq,
                };
                self.waiting.insert(key, id);
            }
        }
    }

    fn prune_retention(&mut self, retention: &RetentionConfig) {
        let completed_cutoff =
            Utc::now() - chrono::Duration::milliseconds(retention.completed_ttl_ms as i64);
        while self
            .completed
            .front()
            .is_some_and(|f| f.at < completed_cutoff)
        {
            self.completed.pop_front();
        }
        let failed_cutoff =
            Utc::now() - chrono::Duration::milliseconds(retention.failed_ttl_ms as i64);
        while self.failed.front().is_some_and(|f| f.at < failed_cutoff) {
            self.failed.pop_front();
        }
    }

    fn insert_pending(&mut self, task: Task, available_at: Option<DateTime<Utc>>) {
        self.seq += 1;
        let seq = self.seq;
        let id = task.id.clone();
        match available_at {
            Some(at) if at > Utc::now() => {
                self.delayed.insert((at.timestamp_millis(), seq), id.clone());
            }
            _ => {
                let key = WaitKey {
                    neg_priority: -(task.priority as i64),
                    seq,
                };
                self.waiting.insert(key, id.clone());
            }
        }
        self.tasks.insert(id, task);
    }

    fn take_active(&mut self, id: &str) -> Result<Task, QueueError> {
        if self.active.remove(id).is_none() {
            return Err(QueueError::NotFound(id.to_string()));
        }
        self.tasks
            .remove(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }
}

/// Mutex-protected in-memory backend.
pub struct MemoryBackend {
    state: Mutex<State>,
    retention: RetentionConfig,
}

impl MemoryBackend {
    pub fn new(retention: RetentionConfig) -> Self {
        Self {
            state: Mutex::new(State::default()),
            retention,
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(RetentionConfig::default())
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn enqueue(
        &self,
        task: Task,
        available_at: Option<DateTime<Utc>>,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        if state.contains_pending(&task.id) {
            return Err(QueueError::Duplicate(task.id));
        }
        debug!(task = %task.id, priority = task.priority, "task enqueued");
        state.insert_pending(task, available_at);
        Ok(())
    }

    async fn enqueue_bulk(
        &self,
        tasks: Vec<(Task, Option<DateTime<Utc>>)>,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        // Validate the whole batch before touching the queue.
        let mut seen = std::collections::HashSet::new();
        for (task, _) in &tasks {
            if state.contains_pending(&task.id) || !seen.insert(task.id.clone()) {
                return Err(QueueError::Duplicate(task.id.clone()));
            }
        }
        for (task, available_at) in tasks {
            state.insert_pending(task, available_at);
        }
        Ok(())
    }

    async fn try_lease(&self, visibility: Duration) -> Result<Option<Task>, QueueError> {
        let mut state = self.state.lock();
        state.promote_due();
        state.expire_leases();
        if state.paused {
            return Ok(None);
        }
        let Some((_, id)) = state.waiting.pop_first() else {
            return Ok(None);
        };
        state.active.insert(id.clone(), Instant::now() + visibility);
        let task = state
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| QueueError::NotFound(id))?;
        debug!(task = %task.id, "task leased");
        Ok(Some(task))
    }

    async fn get_active(&self, id: &str) -> Result<Task, QueueError> {
        let state = self.state.lock();
        if !state.active.contains_key(id) {
            return Err(QueueError::NotFound(id.to_string()));
        }
        state
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    async fn complete(&self, id: &str, _result: &TaskResult) -> Result<Task, QueueError> {
        let mut state = self.state.lock();
        let task = state.take_active(id)?;
        state.completed.push_back(Finished {
            task: task.clone(),
            at: Utc::now(),
        });
        state.prune_retention(&self.retention);
        Ok(task)
    }

    async fn fail(&self, id: &str, reason: &str) -> Result<Task, QueueError> {
        let mut state = self.state.lock();
        let task = state.take_active(id)?;
        debug!(task = %id, reason, "task failed permanently");
        state.failed.push_back(Finished {
            task: task.clone(),
            at: Utc::now(),
        });
        state.prune_retention(&self.retention);
        Ok(task)
    }

    async fn retry(&self, id: &str, available_at: DateTime<Utc>) -> Result<Task, QueueError> {
        let mut state = self.state.lock();
        let mut task = state.take_active(id)?;
        task.attempts += 1;
        let snapshot = task.clone();
        state.insert_pending(task, Some(available_at));
        Ok(snapshot)
    }

    async fn pause(&self) -> Result<(), QueueError> {
        self.state.lock().paused = true;
        Ok(())
    }

    async fn resume(&self) -> Result<(), QueueError> {
        self.state.lock().paused = false;
        Ok(())
    }

    async fn drain(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        let pending: Vec<String> = state
            .waiting
            .values()
            .chain(state.delayed.values())
            .cloned()
            .collect();
        for id in pending {
            state.tasks.remove(&id);
        }
        state.waiting.clear();
        state.delayed.clear();
        Ok(())
    }

    async fn obliterate(&self) -> Result<(), QueueError> {
        *self.state.lock() = State::default();
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut state = self.state.lock();
        state.promote_due();
        state.expire_leases();
        state.prune_retention(&self.retention);
        Ok(QueueStats {
            waiting: state.waiting.len(),
            active: state.active.len(),
            completed: state.completed.len(),
            failed: state.failed.len(),
            delayed: state.delayed.len(),
        })
    }
}
