//! Worker pool
//!
//! Each worker loops: lease task, acquire a rate slot, lease a session,
//! navigate, classify, run actions, extract, ack. Errors are categorized
//! exactly once here; everything else propagates. Guards (rate slot,
//! session lease) release on every exit path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::detect::{has_block, Detection, DetectionAggregator, DetectionKind};
use crate::metrics::{MetricsHub, RequestLog};
use crate::queue::{Action, Extractor, Task, TaskQueue, TaskResult};
use crate::rate::{RateError, RateLimiter};
use crate::session::{BrowserError, LeaseOptions, SessionLease, SessionPool};

/// Worker pool configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    pub workers: usize,
    /// How long `stop` waits for in-flight tasks before hard-cancelling, ms.
    pub grace_period_ms: u64,
    /// Whether sessions leased by workers go through the proxy pool.
    pub use_proxy: bool,
    /// Task execution cap when the task carries none, ms.
    pub default_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            grace_period_ms: 15_000,
            use_proxy: false,
            default_timeout_ms: 60_000,
        }
    }
}

/// Shared collaborators every worker uses.
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: Arc<TaskQueue>,
    pub limiter: Arc<RateLimiter>,
    pub sessions: Arc<SessionPool>,
    pub aggregator: Arc<DetectionAggregator>,
    pub metrics: Arc<MetricsHub>,
}

/// How one execution attempt ended, before queue policy is applied.
enum ExecError {
    /// A block or captcha detection stopped the attempt.
    Blocked(Vec<Detection>),
    /// Worth retrying: navigation failures, timeouts, lost sessions.
    Transient(String),
    /// Terminal: the page loaded but extraction could not produce data.
    Extraction(String),
}

fn categorize(err: BrowserError) -> ExecError {
    match err {
        BrowserError::JavaScriptError(e) => ExecError::Extraction(e),
        BrowserError::ElementNotFound(e) => ExecError::Extraction(e),
        other => ExecError::Transient(other.to_string()),
    }
}

/// Fixed pool of queue-draining workers.
pub struct WorkerPool {
    config: WorkerConfig,
    ctx: WorkerContext,
    cancel: CancellationToken,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(config: WorkerConfig, ctx: WorkerContext, cancel: CancellationToken) -> Self {
        Self {
            config,
            ctx,
            cancel,
            handles: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Launch the configured number of workers.
    pub async fn start(&self) {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            warn!("worker pool already started");
            return;
        }
        info!(workers = self.config.workers, "starting worker pool");
        for worker_id in 0..self.config.workers {
            let ctx = self.ctx.clone();
            let config = self.config.clone();
            let cancel = self.cancel.child_token();
            handles.push(tokio::spawn(async move {
                run_worker(worker_id, ctx, config, cancel).await;
            }));
        }
    }

    /// Drain gracefully: stop leasing, let in-flight tasks finish within
    /// the grace period, then hard-cancel stragglers.
    pub async fn stop(&self) {
        info!("stopping worker pool");
        self.cancel.cancel();

        let mut handles = self.handles.lock().await;
        let grace = Duration::from_millis(self.config.grace_period_ms);
        for mut handle in handles.drain(..) {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!("worker exceeded grace period, aborting");
                handle.abort();
            }
        }
        info!("worker pool stopped");
    }
}

async fn run_worker(
    worker_id: usize,
    ctx: WorkerContext,
    config: WorkerConfig,
    cancel: CancellationToken,
) {
    info!(worker = worker_id, "worker started");
    loop {
        let task = tokio::select! {
            _ = cancel.cancelled() => break,
            leased = ctx.queue.lease() => match leased {
                Ok(task) => task,
                Err(crate::queue::QueueError::Cancelled) => break,
                Err(e) => {
                    error!(worker = worker_id, "queue lease error: {e}");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
            },
        };
        process_task(worker_id, &ctx, &config, &cancel, task).await;
    }
    info!(worker = worker_id, "worker stopped");
}

async fn process_task(
    worker_id: usize,
    ctx: &WorkerContext,
    config: &WorkerConfig,
    cancel: &CancellationToken,
    task: Task,
) {
    let started = Instant::now();
    debug!(worker = worker_id, task = %task.id, url = %task.url, "task picked up");
    ctx.queue.emit_progress(&task.id, 10);

    // A deadline that already passed is terminal, not retryable.
    if task.deadline.is_some_and(|d| d <= Utc::now()) {
        let _ = ctx
            .queue
            .ack(
                &task.id,
                TaskResult {
                    failed: true,
                    reason: Some("deadline exceeded before execution".into()),
                    ..Default::default()
                },
            )
            .await;
        return;
    }

    let rate_deadline = task.deadline.and_then(|d| {
        let remaining = (d - Utc::now()).to_std().ok()?;
        Some(Instant::now() + remaining)
    });
    let slot = match ctx.limiter.acquire_until(&task.url, rate_deadline).await {
        Ok(slot) => slot,
        Err(RateError::Cancelled) => {
            // Shutdown while waiting; the lease will expire and requeue.
            return;
        }
        Err(RateError::DeadlineExceeded) => {
            let _ = ctx
                .queue
                .ack(
                    &task.id,
                    TaskResult {
                        failed: true,
                        reason: Some("deadline exceeded waiting for rate slot".into()),
                        ..Default::default()
                    },
                )
                .await;
            return;
        }
    };

    let lease = match ctx
        .sessions
        .lease(LeaseOptions {
            use_proxy: Some(config.use_proxy),
            ..Default::default()
        })
        .await
    {
        Ok(lease) => lease,
        Err(BrowserError::Cancelled) => {
            drop(slot);
            return;
        }
        Err(e) => {
            warn!(task = %task.id, "session lease failed: {e}");
            drop(slot);
            let _ = ctx.queue.nack(&task.id, &format!("session unavailable: {e}")).await;
            log_request(ctx, &task, started, false, false, false);
            return;
        }
    };

    let timeout = Duration::from_millis(task.timeout_ms.unwrap_or(config.default_timeout_ms));
    let outcome = cancel
        .run_until_cancelled(tokio::time::timeout(timeout, execute_task(ctx, &lease, &task)))
        .await;
    let Some(outcome) = outcome else {
        // Unwind order on shutdown: the in-flight navigation is abandoned,
        // the guards release the session and slot, and the expired lease
        // requeues the task.
        drop(lease);
        drop(slot);
        return;
    };
    let outcome =
        outcome.unwrap_or_else(|_| Err(ExecError::Transient("task timed out".into())));

    match outcome {
        Ok(result) => {
            let blocked = result
                .detections
                .iter()
                .any(|d| d.kind == DetectionKind::Block);
            let captcha = result
                .detections
                .iter()
                .any(|d| d.kind == DetectionKind::Captcha);
            log_request(ctx, &task, started, true, blocked, captcha);
            ctx.queue.emit_progress(&task.id, 100);
            if let Err(e) = ctx.queue.ack(&task.id, result).await {
                warn!(task = %task.id, "ack failed: {e}");
            }
            lease.release();
        }
        Err(ExecError::Blocked(detections)) => {
            let blocked = detections
                .iter()
                .any(|d| d.kind == DetectionKind::Block);
            let captcha = detections
                .iter()
                .any(|d| d.kind == DetectionKind::Captcha);
            warn!(task = %task.id, detections = detections.len(), "attempt blocked, rotating session");
            ctx.limiter.trigger_backoff();
            match lease.rotate().await {
                // The replacement session goes straight back to the idle
                // set, warmed with a fresh identity and proxy.
                Ok(fresh) => fresh.release(),
                Err(e) => warn!("session rotation failed: {e}"),
            }
            log_request(ctx, &task, started, false, blocked, captcha);
            if let Err(e) = ctx.queue.nack(&task.id, "blocked").await {
                warn!(task = %task.id, "nack failed: {e}");
            }
        }
        Err(ExecError::Transient(reason)) => {
            debug!(task = %task.id, reason, "transient failure");
            log_request(ctx, &task, started, false, false, false);
            if let Err(e) = ctx.queue.nack(&task.id, &reason).await {
                warn!(task = %task.id, "nack failed: {e}");
            }
            lease.release();
        }
        Err(ExecError::Extraction(reason)) => {
            debug!(task = %task.id, reason, "extraction failed, not retrying");
            log_request(ctx, &task, started, false, false, false);
            let _ = ctx
                .queue
                .ack(
                    &task.id,
                    TaskResult {
                        failed: true,
                        reason: Some(reason),
                        ..Default::default()
                    },
                )
                .await;
            lease.release();
        }
    }
    drop(slot);
}

async fn execute_task(
    ctx: &WorkerContext,
    lease: &SessionLease,
    task: &Task,
) -> Result<TaskResult, ExecError> {
    let page = lease.navigate(&task.url).await.map_err(categorize)?;
    let detections = ctx.aggregator.observe(lease, &task.url, &page);
    ctx.queue.emit_progress(&task.id, 50);

    if has_block(&detections) {
        return Err(ExecError::Blocked(detections));
    }

    // Actions run strictly in declared order.
    for action in &task.actions {
        run_action(lease, action).await.map_err(categorize)?;
    }
    ctx.queue.emit_progress(&task.id, 90);

    let data = extract(lease, &task.extractors).await?;
    Ok(TaskResult {
        data,
        detections,
        ..Default::default()
    })
}

async fn run_action(lease: &SessionLease, action: &Action) -> Result<(), BrowserError> {
    match action {
        Action::Click { selector } => {
            let script = format!(
                "document.querySelector({}).click()",
                serde_json::to_string(selector).unwrap_or_default()
            );
            lease.evaluate(&script).await?;
        }
        Action::TypeText { selector, text } => {
            let script = format!(
                r#"(() => {{
  const el = document.querySelector({sel});
  el.value = {text};
  el.dispatchEvent(new Event('input', {{ bubbles: true }}));
}})()"#,
                sel = serde_json::to_string(selector).unwrap_or_default(),
                text = serde_json::to_string(text).unwrap_or_default(),
            );
            lease.evaluate(&script).await?;
        }
        Action::Scroll { delta_y } => {
            lease
                .evaluate(&format!("window.scrollBy(0, {delta_y})"))
                .await?;
        }
        Action::Wait { ms } => {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
        }
        Action::Evaluate { script } => {
            lease.evaluate(script).await?;
        }
    }
    Ok(())
}

async fn extract(
    lease: &SessionLease,
    extractors: &[Extractor],
) -> Result<serde_json::Value, ExecError> {
    let mut data = serde_json::Map::new();
    for extractor in extractors {
        let script = format!(
            r#"(() => {{
  const el = document.querySelector({sel});
  if (!el) return null;
  return {attr} ? el.getAttribute({attr}) : el.textContent;
}})()"#,
            sel = serde_json::to_string(&extractor.selector).unwrap_or_default(),
            attr = serde_json::to_string(&extractor.attribute).unwrap_or_default(),
        );
        let value = lease
            .evaluate(&script)
            .await
            .map_err(|e| ExecError::Extraction(format!("{}: {e}", extractor.name)))?;
        data.insert(extractor.name.clone(), value);
    }
    Ok(json!(data))
}

fn log_request(
    ctx: &WorkerContext,
    task: &Task,
    started: Instant,
    success: bool,
    blocked: bool,
    captcha: bool,
) {
    ctx.metrics.log_request(RequestLog {
        timestamp: Utc::now(),
        duration_ms: started.elapsed().as_millis() as u64,
        success,
        blocked,
        captcha,
        url: task.url.clone(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityAssembler;
    use crate::metrics::MetricsConfig;
    use crate::proxy::{ProxyPool, ProxyPoolConfig};
    use crate::queue::{BackoffKind, BackoffPolicy, QueueConfig};
    use crate::rate::RateLimiterConfig;
    use crate::session::SessionPoolConfig;
    use crate::testing::MockLauncher;
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::sync::Mutex as StdMutex;

    struct Harness {
        pool: WorkerPool,
        ctx: WorkerContext,
        launcher: Arc<MockLauncher>,
        cancel: CancellationToken,
    }

    fn harness(launcher: Arc<MockLauncher>) -> Harness {
        let cancel = CancellationToken::new();
        let limiter = Arc::new(RateLimiter::new(
            RateLimiterConfig {
                requests_per_second: 0,
                requests_per_minute: 0,
                requests_per_hour: 0,
                max_concurrent: 0,
                backoff_initial_ms: 50,
                ..Default::default()
            },
            cancel.child_token(),
        ));
        let proxies = Arc::new(ProxyPool::new(ProxyPoolConfig::default()));
        let metrics = Arc::new(MetricsHub::new(MetricsConfig::default()));
        let sessions = Arc::new(SessionPool::new(
            SessionPoolConfig::default(),
            launcher.clone(),
            Arc::new(IdentityAssembler::new()),
            proxies.clone(),
            cancel.child_token(),
        ));
        let queue = Arc::new(TaskQueue::in_memory(
            QueueConfig {
                poll_interval_ms: 10,
                backoff: BackoffPolicy {
                    kind: BackoffKind::Fixed,
                    delay_ms: 10,
                },
                ..Default::default()
            },
            cancel.child_token(),
        ));
        let aggregator = Arc::new(DetectionAggregator::new(
            limiter.clone(),
            proxies.clone(),
            metrics.clone(),
        ));
        let ctx = WorkerContext {
            queue,
            limiter,
            sessions,
            aggregator,
            metrics,
        };
        Harness {
            pool: WorkerPool::new(
                WorkerConfig {
                    workers: 1,
                    grace_period_ms: 1000,
                    ..Default::default()
                },
                ctx.clone(),
                cancel.child_token(),
            ),
            ctx,
            launcher,
            cancel,
        }
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    async fn wait_for_failed(queue: &TaskQueue, expected: usize) {
        for _ in 0..200 {
            if queue.stats().await.map(|s| s.failed).unwrap_or(0) == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("failed count did not reach {expected} within 2s");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn completes_a_clean_task_end_to_end() {
        let h = harness(Arc::new(MockLauncher::with_html("<h1>Welcome</h1>")));
        h.launcher.state.push_eval(json!("Welcome"));

        let done = Arc::new(StdMutex::new(None::<TaskResult>));
        let sink = done.clone();
        h.ctx.queue.on_completed(move |_, result| {
            *sink.lock().unwrap() = Some(result.clone());
        });

        h.ctx
            .queue
            .enqueue(
                Task::new("https://example.com")
                    .with_id("clean")
                    .with_extractors(vec![Extractor {
                        name: "title".into(),
                        selector: "h1".into(),
                        attribute: None,
                    }]),
            )
            .await
            .unwrap();

        h.pool.start().await;
        wait_for(|| done.lock().unwrap().is_some()).await;
        h.pool.stop().await;

        let result = done.lock().unwrap().clone().unwrap();
        assert!(!result.failed);
        assert_eq!(result.data["title"], json!("Welcome"));
        assert!(result.detections.is_empty());

        let report = h.ctx.metrics.metrics(Duration::from_secs(300));
        assert_eq!(report.requests.total, 1);
        assert_eq!(report.requests.successful, 1);
        h.cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blocked_task_backs_off_rotates_and_retries_to_failure() {
        let h = harness(Arc::new(MockLauncher::with_html("<h1>Access Denied</h1>")));

        h.ctx
            .queue
            .enqueue(
                Task::new("https://example.com")
                    .with_id("blocked")
                    .with_max_attempts(2),
            )
            .await
            .unwrap();

        h.pool.start().await;
        wait_for_failed(&h.ctx.queue, 1).await;
        h.pool.stop().await;

        // Backoff escalated and at least one session was rotated out.
        assert!(h.ctx.limiter.stats().backoff_delay_ms > 0);
        assert!(h.launcher.state.closed() >= 1);

        let report = h.ctx.metrics.metrics(Duration::from_secs(300));
        assert!(report.requests.blocked >= 1);
        h.cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn progress_milestones_fire_in_order() {
        let h = harness(Arc::new(MockLauncher::with_html("<p>ok</p>")));

        let milestones = Arc::new(StdMutex::new(Vec::new()));
        let sink = milestones.clone();
        h.ctx.queue.on_progress(move |_, pct| {
            sink.lock().unwrap().push(pct);
        });
        let done = Arc::new(AtomicU8::new(0));
        let flag = done.clone();
        h.ctx.queue.on_completed(move |_, _| {
            flag.store(1, Ordering::Relaxed);
        });

        h.ctx
            .queue
            .enqueue(Task::new("https://example.com").with_id("p"))
            .await
            .unwrap();
        h.pool.start().await;
        wait_for(|| done.load(Ordering::Relaxed) == 1).await;
        h.pool.stop().await;

        let seen = milestones.lock().unwrap().clone();
        assert_eq!(seen, vec![10, 50, 90, 100]);
        h.cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn navigation_failures_retry_then_fail() {
        let launcher = Arc::new(MockLauncher::default());
        launcher.state.fail_navigations(true);
        let h = harness(launcher);

        h.ctx
            .queue
            .enqueue(
                Task::new("https://example.com")
                    .with_id("nav-fail")
                    .with_max_attempts(2),
            )
            .await
            .unwrap();

        h.pool.start().await;
        wait_for_failed(&h.ctx.queue, 1).await;
        h.pool.stop().await;
        h.cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_drains_gracefully() {
        let h = harness(Arc::new(MockLauncher::with_html("<p>ok</p>")));
        h.pool.start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.pool.stop().await;
        // A second stop is a no-op, not a hang.
        h.pool.stop().await;
        h.cancel.cancel();
    }
}
