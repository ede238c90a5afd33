//! Redis queue backend
//!
//! Mirrors the in-memory semantics on sorted sets for distributed
//! operation: waiting is ordered by a priority-composed score, delayed and
//! active by millisecond deadlines, and finished sets are pruned by TTL.
//! Promotion of due tasks and lease expiry happen lazily on access, the
//! same as the in-memory backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::Client;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::backend::{QueueBackend, QueueError, QueueStats};
use super::memory::RetentionConfig;
use super::task::{Task, TaskResult};

fn backend_err(e: redis::RedisError) -> QueueError {
    QueueError::Backend(e.to_string())
}

/// Redis-backed queue. All keys share one prefix so several queues can
/// coexist on one server.
pub struct RedisBackend {
    conn: Arc<Mutex<MultiplexedConnection>>,
    prefix: String,
    retention: RetentionConfig,
}

impl RedisBackend {
    pub async fn connect(
        url: &str,
        prefix: impl Into<String>,
        retention: RetentionConfig,
    ) -> Result<Self, QueueError> {
        let client = Client::open(url).map_err(backend_err)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            prefix: prefix.into(),
            retention,
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    fn task_key(&self, id: &str) -> String {
        format!("{}:task:{}", self.prefix, id)
    }

    /// Waiting-set score: priority descending, enqueue sequence ascending.
    fn wait_score(priority: i32, seq: u64) -> f64 {
        -(priority as f64) * 1e12 + seq as f64
    }

    async fn next_seq(&self, conn: &mut MultiplexedConnection) -> Result<u64, QueueError> {
        redis::cmd("INCR")
            .arg(self.key("seq"))
            .query_async::<_, u64>(conn)
            .await
            .map_err(backend_err)
    }

    async fn load_task(
        &self,
        conn: &mut MultiplexedConnection,
        id: &str,
    ) -> Result<Task, QueueError> {
        let json: Option<String> = redis::cmd("GET")
            .arg(self.task_key(id))
            .query_async(conn)
            .await
            .map_err(backend_err)?;
        let json = json.ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        Ok(serde_json::from_str(&json)?)
    }

    async fn store_task(
        &self,
        conn: &mut MultiplexedConnection,
        task: &Task,
    ) -> Result<(), QueueError> {
        let json = serde_json::to_string(task)?;
        redis::cmd("SET")
            .arg(self.task_key(&task.id))
            .arg(json)
            .query_async::<_, ()>(conn)
            .await
            .map_err(backend_err)
    }

    async fn push_waiting(
        &self,
        conn: &mut MultiplexedConnection,
        id: &str,
        priority: i32,
    ) -> Result<(), QueueError> {
        let seq = self.next_seq(conn).await?;
        redis::cmd("ZADD")
            .arg(self.key("waiting"))
            .arg(Self::wait_score(priority, seq))
            .arg(id)
            .query_async::<_, ()>(conn)
            .await
            .map_err(backend_err)
    }

    /// Move due delayed tasks and expired leases back into the waiting set.
    async fn promote(&self, conn: &mut MultiplexedConnection) -> Result<(), QueueError> {
        let now_ms = Utc::now().timestamp_millis();

        for set in ["delayed", "active"] {
            let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                .arg(self.key(set))
                .arg("-inf")
                .arg(now_ms)
                .query_async(conn)
                .await
                .map_err(backend_err)?;

            for id in due {
                let removed: u64 = redis::cmd("ZREM")
                    .arg(self.key(set))
                    .arg(&id)
                    .query_async(conn)
                    .await
                    .map_err(backend_err)?;
                if removed == 0 {
                    continue;
                }
                if set == "active" {
                    warn!(task = %id, "lease expired, task eligible again");
                }
                match self.load_task(conn, &id).await {
                    Ok(task) => self.push_waiting(conn, &id, task.priority).await?,
                    Err(QueueError::NotFound(_)) => {
                        debug!(task = %id, "dropping orphaned queue entry");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    async fn prune_finished(&self, conn: &mut MultiplexedConnection) -> Result<(), QueueError> {
        let now_ms = Utc::now().timestamp_millis();
        for (set, ttl_ms) in [
            ("completed", self.retention.completed_ttl_ms),
            ("failed", self.retention.failed_ttl_ms),
        ] {
            let cutoff = now_ms - ttl_ms as i64;
            let expired: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                .arg(self.key(set))
                .arg("-inf")
                .arg(cutoff)
                .query_async(conn)
                .await
                .map_err(backend_err)?;
            for id in &expired {
                redis::cmd("DEL")
                    .arg(self.task_key(id))
                    .query_async::<_, ()>(conn)
                    .await
                    .map_err(backend_err)?;
            }
            redis::cmd("ZREMRANGEBYSCORE")
                .arg(self.key(set))
                .arg("-inf")
                .arg(cutoff)
                .query_async::<_, ()>(conn)
                .await
                .map_err(backend_err)?;
        }
        Ok(())
    }

    async fn remove_active(
        &self,
        conn: &mut MultiplexedConnection,
        id: &str,
    ) -> Result<Task, QueueError> {
        let removed: u64 = redis::cmd("ZREM")
            .arg(self.key("active"))
            .arg(id)
            .query_async(conn)
            .await
            .map_err(backend_err)?;
        if removed == 0 {
            return Err(QueueError::NotFound(id.to_string()));
        }
        self.load_task(conn, id).await
    }

    async fn finish(
        &self,
        conn: &mut MultiplexedConnection,
        set: &str,
        id: &str,
    ) -> Result<Task, QueueError> {
        let task = self.remove_active(conn, id).await?;
        redis::cmd("ZADD")
            .arg(self.key(set))
            .arg(Utc::now().timestamp_millis())
            .arg(id)
            .query_async::<_, ()>(conn)
            .await
            .map_err(backend_err)?;
        self.prune_finished(conn).await?;
        Ok(task)
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    async fn enqueue(
        &self,
        task: Task,
        available_at: Option<DateTime<Utc>>,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.lock().await;

        let exists: bool = redis::cmd("EXISTS")
            .arg(self.task_key(&task.id))
            .query_async(&mut *conn)
            .await
            .map_err(backend_err)?;
        if exists {
            return Err(QueueError::Duplicate(task.id));
        }

        self.store_task(&mut conn, &task).await?;
        match available_at {
            Some(at) if at > Utc::now() => {
                redis::cmd("ZADD")
                    .arg(self.key("delayed"))
                    .arg(at.timestamp_millis())
                    .arg(&task.id)
                    .query_async::<_, ()>(&mut *conn)
                    .await
                    .map_err(backend_err)?;
            }
            _ => self.push_waiting(&mut conn, &task.id, task.priority).await?,
        }
        debug!(task = %task.id, "task enqueued");
        Ok(())
    }

    async fn enqueue_bulk(
        &self,
        tasks: Vec<(Task, Option<DateTime<Utc>>)>,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.lock().await;

        // Validate the batch up front so a duplicate leaves nothing behind.
        let mut seen = std::collections::HashSet::new();
        for (task, _) in &tasks {
            let exists: bool = redis::cmd("EXISTS")
                .arg(self.task_key(&task.id))
                .query_async(&mut *conn)
                .await
                .map_err(backend_err)?;
            if exists || !seen.insert(task.id.clone()) {
                return Err(QueueError::Duplicate(task.id.clone()));
            }
        }

        for (task, available_at) in tasks {
            self.store_task(&mut conn, &task).await?;
            match available_at {
                Some(at) if at > Utc::now() => {
                    redis::cmd("ZADD")
                        .arg(self.key("delayed"))
                        .arg(at.timestamp_millis())
                        .arg(&task.id)
                        .query_async::<_, ()>(&mut *conn)
                        .await
                        .map_err(backend_err)?;
                }
                _ => self.push_waiting(&mut conn, &task.id, task.priority).await?,
            }
        }
        Ok(())
    }

    async fn try_lease(&self, visibility: Duration) -> Result<Option<Task>, QueueError> {
        let mut conn = self.conn.lock().await;
        self.promote(&mut conn).await?;

        let paused: Option<String> = redis::cmd("GET")
            .arg(self.key("paused"))
            .query_async(&mut *conn)
            .await
            .map_err(backend_err)?;
        if paused.as_deref() == Some("1") {
            return Ok(None);
        }

        let popped: Vec<(String, f64)> = redis::cmd("ZPOPMIN")
            .arg(self.key("waiting"))
            .arg(1)
            .query_async(&mut *conn)
            .await
            .map_err(backend_err)?;
        let Some((id, _)) = popped.into_iter().next() else {
            return Ok(None);
        };

        let deadline = Utc::now().timestamp_millis() + visibility.as_millis() as i64;
        redis::cmd("ZADD")
            .arg(self.key("active"))
            .arg(deadline)
            .arg(&id)
            .query_async::<_, ()>(&mut *conn)
            .await
            .map_err(backend_err)?;

        let task = self.load_task(&mut conn, &id).await?;
        debug!(task = %task.id, "task leased");
        Ok(Some(task))
    }

    async fn get_active(&self, id: &str) -> Result<Task, QueueError> {
        let mut conn = self.conn.lock().await;
        let score: Option<f64> = redis::cmd("ZSCORE")
            .arg(self.key("active"))
            .arg(id)
            .query_async(&mut *conn)
            .await
            .map_err(backend_err)?;
        if score.is_none() {
            return Err(QueueError::NotFound(id.to_string()));
        }
        self.load_task(&mut conn, id).await
    }

    async fn complete(&self, id: &str, _result: &TaskResult) -> Result<Task, QueueError> {
        let mut conn = self.conn.lock().await;
        self.finish(&mut conn, "completed", id).await
    }

    async fn fail(&self, id: &str, reason: &str) -> Result<Task, QueueError> {
        let mut conn = self.conn.lock().await;
        debug!(task = %id, reason, "task failed permanently");
        self.finish(&mut conn, "failed", id).await
    }

    async fn retry(&self, id: &str, available_at: DateTime<Utc>) -> Result<Task, QueueError> {
        let mut conn = self.conn.lock().await;
        let mut task = self.remove_active(&mut conn, id).await?;
        task.attempts += 1;
        self.store_task(&mut conn, &task).await?;

        if available_at > Utc::now() {
            redis::cmd("ZADD")
                .arg(self.key("delayed"))
                .arg(available_at.timestamp_millis())
                .arg(id)
                .query_async::<_, ()>(&mut *conn)
                .await
                .map_err(backend_err)?;
        } else {
            self.push_waiting(&mut conn, id, task.priority).await?;
        }
        Ok(task)
    }

    async fn pause(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.lock().await;
        redis::cmd("SET")
            .arg(self.key("paused"))
            .arg("1")
            .query_async::<_, ()>(&mut *conn)
            .await
            .map_err(backend_err)
    }

    async fn resume(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.lock().await;
        redis::cmd("DEL")
            .arg(self.key("paused"))
            .query_async::<_, ()>(&mut *conn)
            .await
            .map_err(backend_err)
    }

    async fn drain(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.lock().await;
        for set in ["waiting", "delayed"] {
            let ids: Vec<String> = redis::cmd("ZRANGE")
                .arg(self.key(set))
                .arg(0)
                .arg(-1)
                .query_async(&mut *conn)
                .await
                .map_err(backend_err)?;
            for id in &ids {
                redis::cmd("DEL")
                    .arg(self.task_key(id))
                    .query_async::<_, ()>(&mut *conn)
                    .await
                    .map_err(backend_err)?;
            }
            redis::cmd("DEL")
                .arg(self.key(set))
                .query_async::<_, ()>(&mut *conn)
                .await
                .map_err(backend_err)?;
        }
        Ok(())
    }

    async fn obliterate(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.lock().await;
        let pattern = format!("{}:*", self.prefix);
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(&pattern)
            .query_async(&mut *conn)
            .await
            .map_err(backend_err)?;
        if !keys.is_empty() {
            redis::cmd("DEL")
                .arg(&keys)
                .query_async::<_, ()>(&mut *conn)
                .await
                .map_err(backend_err)?;
        }
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.conn.lock().await;
        self.promote(&mut conn).await?;
        self.prune_finished(&mut conn).await?;

        let mut counts = [0usize; 5];
        for (i, set) in ["waiting", "active", "completed", "failed", "delayed"]
            .iter()
            .enumerate()
        {
            counts[i] = redis::cmd("ZCARD")
                .arg(self.key(set))
                .query_async(&mut *conn)
                .await
                .map_err(backend_err)?;
        }
        Ok(QueueStats {
            waiting: counts[0],
            active: counts[1],
            completed: counts[2],
            failed: counts[3],
            delayed: counts[4],
        })
    }
}
