//! Sliding-window rate limiter with exponential backoff
//!
//! Admission is gated on three wall-clock windows (second, minute, hour),
//! a concurrent-slot cap, and the backoff window. Acquisition blocks until
//! all gates pass; it never fails for rate reasons.

use std::time::{Duration, Instant};

use std::collections::VecDeque;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Rate limiter configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterConfig {
    /// Max requests admitted in any 1-second window (0 = unlimited)
    pub requests_per_second: u32,
    /// Max requests admitted in any 60-second window (0 = unlimited)
    pub requests_per_minute: u32,
    /// Max requests admitted in any 3600-second window (0 = unlimited)
    pub requests_per_hour: u32,
    /// Max concurrently held slots (0 = unlimited)
    pub max_concurrent: u32,
    /// First backoff delay in milliseconds
    pub backoff_initial_ms: u64,
    /// Backoff escalation factor per trigger
    pub backoff_multiplier: f64,
    /// Backoff delay ceiling in milliseconds
    pub backoff_max_ms: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 5,
            requests_per_minute: 120,
            requests_per_hour: 3000,
            max_concurrent: 10,
            backoff_initial_ms: 1000,
            backoff_multiplier: 2.0,
            backoff_max_ms: 300_000,
        }
    }
}

/// Acquisition errors. Rate pressure never surfaces here; it blocks.
#[derive(Error, Debug)]
pub enum RateError {
    #[error("rate limiter acquisition cancelled")]
    Cancelled,

    #[error("rate limiter acquisition exceeded its deadline")]
    DeadlineExceeded,
}

/// Snapshot of the limiter state
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateStats {
    pub requests_last_second: usize,
    pub requests_last_minute: usize,
    pub requests_last_hour: usize,
    pub inflight: u32,
    pub backoff_delay_ms: u64,
    pub backoff_remaining_ms: u64,
}

struct Windows {
    second: VecDeque<Instant>,
    minute: VecDeque<Instant>,
    hour: VecDeque<Instant>,
    inflight: u32,
    backoff_delay: Duration,
    backoff_until: Option<Instant>,
}

impl Windows {
    fn new() -> Self {
        Self {
            second: VecDeque::new(),
            minute: VecDeque::new(),
            hour: VecDeque::new(),
            inflight: 0,
            backoff_delay: Duration::ZERO,
            backoff_until: None,
        }
    }

    fn prune(&mut self, now: Instant) {
        prune_window(&mut self.second, now, Duration::from_secs(1));
        prune_window(&mut self.minute, now, Duration::from_secs(60));
        prune_window(&mut self.hour, now, Duration::from_secs(3600));
        if let Some(until) = self.backoff_until {
            if now >= until {
                self.backoff_until = None;
            }
        }
    }
}

fn prune_window(window: &mut VecDeque<Instant>, now: Instant, span: Duration) {
    while let Some(front) = window.front() {
        if now.duration_since(*front) >= span {
            window.pop_front();
        } else {
            break;
        }
    }
}

enum Gate {
    Admit,
    /// Earliest instant at which a window or backoff gate may pass.
    /// `None` means the only blocker is the concurrency cap, which has no
    /// known expiry; wait for a release notification.
    Wait(Option<Instant>),
}

/// Multi-window rate limiter shared across workers.
///
/// One mutex serializes the counters; waiters park on a notifier and are
/// woken by releases and resets. Fairness is first-wakeup-wins.
pub struct RateLimiter {
    config: RateLimiterConfig,
    state: Mutex<Windows>,
    notify: Notify,
    cancel: CancellationToken,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig, cancel: CancellationToken) -> Self {
        Self {
            config,
            state: Mutex::new(Windows::new()),
            notify: Notify::new(),
            cancel,
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Block until every admission gate passes, then claim a slot.
    ///
    /// The returned [`RateSlot`] releases its concurrency slot on drop.
    /// The `url` is diagnostic context only; admission is global.
    pub async fn acquire(&self, url: &str) -> Result<RateSlot<'_>, RateError> {
        self.acquire_until(url, None).await
    }

    /// [`acquire`](Self::acquire) with an absolute deadline.
    pub async fn acquire_until(
        &self,
        url: &str,
        deadline: Option<Instant>,
    ) -> Result<RateSlot<'_>, RateError> {
        loop {
            // Register interest before checking so a release landing between
            // the check and the await still wakes us.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Instant::now();
            if let Some(d) = deadline {
                if now >= d {
                    return Err(RateError::DeadlineExceeded);
                }
            }

            let gate = {
                let mut w = self.state.lock();
                w.prune(now);
                let gate = self.check(&w, now);
                if matches!(gate, Gate::Admit) {
                    w.second.push_back(now);
                    w.minute.push_back(now);
                    w.hour.push_back(now);
                    w.inflight += 1;
                    debug!(url, inflight = w.inflight, "rate slot acquired");
                    return Ok(RateSlot { limiter: self });
                }
                gate
            };

            let wake = match gate {
                Gate::Admit => unreachable!(),
                Gate::Wait(at) => at,
            };
            // When both a timed gate and the deadline apply, sleep to the
            // earlier of the two and re-evaluate.
            let wake = match (wake, deadline) {
                (Some(w), Some(d)) => Some(w.min(d)),
                (Some(w), None) => Some(w),
                (None, Some(d)) => Some(d),
                (None, None) => None,
            };

            match wake {
                Some(at) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(RateError::Cancelled),
                        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(at)) => {}
                        _ = &mut notified => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(RateError::Cancelled),
                        _ = &mut notified => {}
                    }
                }
            }
        }
    }

    /// Evaluate all gates; on refusal, report the latest instant any timed
    /// gate may open (the most restrictive window wins, and backoff wins
    /// over windows when it expires later).
    fn check(&self, w: &Windows, now: Instant) -> Gate {
        let mut wake: Option<Instant> = None;
        let mut blocked = false;

        if let Some(until) = w.backoff_until {
            blocked = true;
            wake = Some(wake.map_or(until, |t: Instant| t.max(until)));
        }

        for (window, limit, span) in [
            (&w.second, self.config.requests_per_second, Duration::from_secs(1)),
            (&w.minute, self.config.requests_per_minute, Duration::from_secs(60)),
            (&w.hour, self.config.requests_per_hour, Duration::from_secs(3600)),
        ] {
            if limit > 0 && window.len() >= limit as usize {
                blocked = true;
                // The window frees a slot when its oldest entry ages out.
                let surplus = window.len() - limit as usize;
                if let Some(entry) = window.get(surplus) {
                    let opens = *entry + span;
                    wake = Some(wake.map_or(opens, |t| t.max(opens)));
                }
            }
        }

        if self.config.max_concurrent > 0 && w.inflight >= self.config.max_concurrent {
            // No expiry to sleep toward; a release will notify.
            return Gate::Wait(None);
        }

        if blocked {
            Gate::Wait(wake)
        } else {
            Gate::Admit
        }
    }

    /// Escalate the backoff window.
    ///
    /// `delay = min(max(delay * multiplier, initial), max)`; the window ends
    /// at `now + delay`. The escalated delay survives window expiry and is
    /// only cleared by [`reset`](Self::reset).
    pub fn trigger_backoff(&self) {
        let mut w = self.state.lock();
        let initial = Duration::from_millis(self.config.backoff_initial_ms);
        let cap = Duration::from_millis(self.config.backoff_max_ms);
        let escalated =
            Duration::from_secs_f64(w.backoff_delay.as_secs_f64() * self.config.backoff_multiplier);
        let delay = escalated.max(initial).min(cap);
        w.backoff_delay = delay;
        w.backoff_until = Some(Instant::now() + delay);
        info!(delay_ms = delay.as_millis() as u64, "backoff triggered");
    }

    /// Zero all counters and clear backoff. Waiters are re-evaluated.
    pub fn reset(&self) {
        {
            let mut w = self.state.lock();
            w.second.clear();
            w.minute.clear();
            w.hour.clear();
            w.backoff_delay = Duration::ZERO;
            w.backoff_until = None;
        }
        self.notify.notify_waiters();
        info!("rate limiter reset");
    }

    pub fn stats(&self) -> RateStats {
        let now = Instant::now();
        let mut w = self.state.lock();
        w.prune(now);
        RateStats {
            requests_last_second: w.second.len(),
            requests_last_minute: w.minute.len(),
            requests_last_hour: w.hour.len(),
            inflight: w.inflight,
            backoff_delay_ms: w.backoff_delay.as_millis() as u64,
            backoff_remaining_ms: w
                .backoff_until
                .map(|until| until.saturating_duration_since(now).as_millis() as u64)
                .unwrap_or(0),
        }
    }

    fn release(&self) {
        let mut w = self.state.lock();
        w.inflight = w.inflight.saturating_sub(1);
        drop(w);
        self.notify.notify_waiters();
    }
}

/// A held concurrency slot. Dropping it releases the slot and wakes waiters,
/// so release is guaranteed on every exit path.
pub struct RateSlot<'a> {
    limiter: &'a RateLimiter,
}

impl std::fmt::Debug for RateSlot<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateSlot").finish()
    }
}

impl Drop for RateSlot<'_> {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

/// Run `f` under an acquired slot. The explicit-combinator replacement for
/// wrapping arbitrary async calls in acquire/release.
pub async fn with_rate_limit<F, Fut, T>(
    limiter: &RateLimiter,
    url: &str,
    f: F,
) -> Result<T, RateError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = T>,
{
    let _slot = limiter.acquire(url).await?;
    Ok(f().await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(config: RateLimiterConfig) -> RateLimiter {
        RateLimiter::new(config, CancellationToken::new())
    }

    #[tokio::test(start_paused = true)]
    async fn enforces_per_second_window() {
        let rl = limiter(RateLimiterConfig {
            requests_per_second: 2,
            requests_per_minute: 10,
            requests_per_hour: 0,
            max_concurrent: 0,
            ..Default::default()
        });

        let start = tokio::time::Instant::now();
        for _ in 0..2 {
            let slot = rl.acquire("https://example.com").await.unwrap();
            drop(slot);
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        let slot = rl.acquire("https://example.com").await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(900));
        let stats = rl.stats();
        assert!((1..=3).contains(&stats.requests_last_second));
        drop(slot);
    }

    #[tokio::test(start_paused = true)]
    async fn most_restrictive_window_wins() {
        let rl = limiter(RateLimiterConfig {
            requests_per_second: 10,
            requests_per_minute: 1,
            requests_per_hour: 0,
            max_concurrent: 0,
            ..Default::default()
        });

        let start = tokio::time::Instant::now();
        drop(rl.acquire("u").await.unwrap());
        drop(rl.acquire("u").await.unwrap());
        assert!(start.elapsed() >= Duration::from_secs(59));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_escalates_to_cap() {
        let rl = limiter(RateLimiterConfig {
            backoff_initial_ms: 100,
            backoff_multiplier: 2.0,
            backoff_max_ms: 1000,
            ..Default::default()
        });

        let mut last = 0;
        for i in 0..10 {
            rl.trigger_backoff();
            let delay = rl.stats().backoff_delay_ms;
            if last < 1000 {
                assert!(delay > last, "trigger {i}: {delay} <= {last}");
            } else {
                assert_eq!(delay, 1000);
            }
            assert!(delay <= 1000);
            last = delay;
        }
        assert_eq!(last, 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_blocks_until_expiry() {
        let rl = limiter(RateLimiterConfig {
            requests_per_second: 0,
            requests_per_minute: 0,
            requests_per_hour: 0,
            max_concurrent: 0,
            backoff_initial_ms: 500,
            ..Default::default()
        });

        rl.trigger_backoff();
        let start = tokio::time::Instant::now();
        drop(rl.acquire("u").await.unwrap());
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_cap_waits_for_release() {
        let rl = std::sync::Arc::new(limiter(RateLimiterConfig {
            requests_per_second: 0,
            requests_per_minute: 0,
            requests_per_hour: 0,
            max_concurrent: 2,
            ..Default::default()
        }));

        let a = rl.acquire("u").await.unwrap();
        let _b = rl.acquire("u").await.unwrap();

        // Third acquirer must park until a slot frees.
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), rl.acquire("u")).await;
        assert!(blocked.is_err());

        drop(a);
        let admitted =
            tokio::time::timeout(Duration::from_millis(50), rl.acquire("u")).await;
        assert!(admitted.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_returns_stats_to_zero() {
        let rl = limiter(RateLimiterConfig::default());
        drop(rl.acquire("u").await.unwrap());
        rl.trigger_backoff();
        rl.reset();

        let stats = rl.stats();
        assert_eq!(stats.requests_last_second, 0);
        assert_eq!(stats.requests_last_minute, 0);
        assert_eq!(stats.requests_last_hour, 0);
        assert_eq!(stats.inflight, 0);
        assert_eq!(stats.backoff_delay_ms, 0);
        assert_eq!(stats.backoff_remaining_ms, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_unblocks_waiters() {
        let cancel = CancellationToken::new();
        let rl = RateLimiter::new(
            RateLimiterConfig {
                max_concurrent: 1,
                requests_per_second: 0,
                requests_per_minute: 0,
                requests_per_hour: 0,
                ..Default::default()
            },
            cancel.clone(),
        );

        let _held = rl.acquire("u").await.unwrap();
        cancel.cancel();
        match rl.acquire("u").await {
            Err(RateError::Cancelled) => {}
            other => panic!("expected Cancelled, got {other:?}"),
        };
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_exceeded_surfaces() {
        let rl = limiter(RateLimiterConfig {
            max_concurrent: 1,
            requests_per_second: 0,
            requests_per_minute: 0,
            requests_per_hour: 0,
            ..Default::default()
        });

        let _held = rl.acquire("u").await.unwrap();
        let deadline = Instant::now() + Duration::from_millis(100);
        match rl.acquire_until("u", Some(deadline)).await {
            Err(RateError::DeadlineExceeded) => {}
            other => panic!("expected DeadlineExceeded, got {other:?}"),
        };
    }
}
