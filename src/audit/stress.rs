//! Stress test mode
//!
//! Launches N parallel worker-like sequences against one URL and reports
//! aggregate counters. The mean response time is wall-clock elapsed over
//! total requests, overhead included.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tracing::{info, warn};

use crate::detect::DetectionAggregator;
use crate::metrics::{MetricsHub, RequestLog};
use crate::rate::RateLimiter;
use crate::session::{LeaseOptions, SessionPool};

use super::AuditError;

/// Stress test parameters
#[derive(Debug, Clone)]
pub struct StressTestConfig {
    pub url: String,
    pub concurrent_sessions: usize,
    pub requests_per_session: usize,
    pub use_proxies: bool,
}

impl Default for StressTestConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            concurrent_sessions: 5,
            requests_per_session: 10,
            use_proxies: false,
        }
    }
}

/// Aggregate stress outcome.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StressReport {
    pub total_requests: u64,
    pub successful: u64,
    pub failed: u64,
    pub detections: u64,
    pub wall_clock_ms: u64,
    /// Wall-clock elapsed divided by total requests, not per-request
    /// latency.
    pub avg_response_time_ms: f64,
}

/// Run the stress test. Session slots are leased up front and every
/// sequence runs through the shared rate limiter.
pub async fn run_stress_test(
    sessions: &Arc<SessionPool>,
    limiter: &Arc<RateLimiter>,
    aggregator: &Arc<DetectionAggregator>,
    metrics: &Arc<MetricsHub>,
    config: &StressTestConfig,
) -> Result<StressReport, AuditError> {
    info!(
        url = %config.url,
        sessions = config.concurrent_sessions,
        requests = config.requests_per_session,
        "stress test started"
    );

    let successful = Arc::new(AtomicU64::new(0));
    let failed = Arc::new(AtomicU64::new(0));
    let detections = Arc::new(AtomicU64::new(0));
    let wall_start = Instant::now();

    let mut tasks = Vec::with_capacity(config.concurrent_sessions);
    for sequence in 0..config.concurrent_sessions {
        let sessions = sessions.clone();
        let limiter = limiter.clone();
        let aggregator = aggregator.clone();
        let metrics = metrics.clone();
        let successful = successful.clone();
        let failed = failed.clone();
        let detections = detections.clone();
        let url = config.url.clone();
        let requests = config.requests_per_session;
        let use_proxies = config.use_proxies;

        tasks.push(tokio::spawn(async move {
            let lease = match sessions
                .lease(LeaseOptions {
                    use_proxy: Some(use_proxies),
                    fresh: true,
                    ..Default::default()
                })
                .await
            {
                Ok(lease) => lease,
                Err(e) => {
                    warn!(sequence, "session unavailable for stress sequence: {e}");
                    failed.fetch_add(requests as u64, Ordering::Relaxed);
                    return;
                }
            };

            for _ in 0..requests {
                let slot = match limiter.acquire(&url).await {
                    Ok(slot) => slot,
                    Err(_) => break,
                };
                let started = Instant::now();
                let (ok, observed) = match lease.navigate(&url).await {
                    Ok(page) => {
                        let found = aggregator.observe(&lease, &url, &page);
                        (true, found.len() as u64)
                    }
                    Err(_) => (false, 0),
                };
                drop(slot);

                if ok {
                    successful.fetch_add(1, Ordering::Relaxed);
                } else {
                    failed.fetch_add(1, Ordering::Relaxed);
                }
                detections.fetch_add(observed, Ordering::Relaxed);
                metrics.log_request(RequestLog {
                    timestamp: chrono::Utc::now(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    success: ok,
                    blocked: false,
                    captcha: false,
                    url: url.clone(),
                });
            }

            lease.close().await;
        }));
    }

    join_all(tasks).await;

    let wall_clock_ms = wall_start.elapsed().as_millis() as u64;
    let total_requests = (config.concurrent_sessions * config.requests_per_session) as u64;
    let report = StressReport {
        total_requests,
        successful: successful.load(Ordering::Relaxed),
        failed: failed.load(Ordering::Relaxed),
        detections: detections.load(Ordering::Relaxed),
        wall_clock_ms,
        avg_response_time_ms: if total_requests == 0 {
            0.0
        } else {
            wall_clock_ms as f64 / total_requests as f64
        },
    };
    info!(
        successful = report.successful,
        failed = report.failed,
        avg_ms = report.avg_response_time_ms,
        "stress test finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityAssembler;
    use crate::metrics::MetricsConfig;
    use crate::proxy::{ProxyPool, ProxyPoolConfig};
    use crate::rate::RateLimiterConfig;
    use crate::session::{SessionPool, SessionPoolConfig};
    use crate::testing::MockLauncher;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[tokio::test(flavor = "multi_thread")]
    async fn counts_and_formula_hold() {
        let launcher = Arc::new(MockLauncher::with_html("<p>ok</p>"));
        let limiter = Arc::new(RateLimiter::new(
            RateLimiterConfig {
                requests_per_second: 0,
                requests_per_minute: 0,
                requests_per_hour: 0,
                max_concurrent: 0,
                ..Default::default()
            },
            CancellationToken::new(),
        ));
        let proxies = Arc::new(ProxyPool::new(ProxyPoolConfig::default()));
        let metrics = Arc::new(MetricsHub::new(MetricsConfig::default()));
        let sessions = Arc::new(SessionPool::new(
            SessionPoolConfig {
                max_sessions: 3,
                ..Default::default()
            },
            launcher.clone(),
            Arc::new(IdentityAssembler::new()),
            proxies.clone(),
            CancellationToken::new(),
        ));
        let aggregator = Arc::new(DetectionAggregator::new(
            limiter.clone(),
            proxies,
            metrics.clone(),
        ));

        let config = StressTestConfig {
            url: "https://example.com".into(),
            concurrent_sessions: 3,
            requests_per_session: 4,
            use_proxies: false,
        };
        let report = run_stress_test(&sessions, &limiter, &aggregator, &metrics, &config)
            .await
            .unwrap();

        assert_eq!(report.total_requests, 12);
        assert_eq!(report.successful, 12);
        assert_eq!(report.failed, 0);
        assert_eq!(report.detections, 0);
        let expected = report.wall_clock_ms as f64 / report.total_requests as f64;
        assert!((report.avg_response_time_ms - expected).abs() < f64::EPSILON);

        assert_eq!(launcher.state.navigations(), 12);
        assert_eq!(
            metrics.metrics(Duration::from_secs(300)).requests.total,
            12
        );
    }
}
