//! Detection aggregation and feedback
//!
//! Stamps classifier hits into detections, appends them to the owning
//! session before the worker inspects them, and feeds the outcome back
//! into the rate limiter and the bound proxy's health score.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::metrics::MetricsHub;
use crate::proxy::ProxyPool;
use crate::rate::RateLimiter;
use crate::session::{PageSnapshot, Session};

use super::classifiers::classify;
use super::{Detection, DetectionKind};

/// Owns the global detection log (through the metrics hub) and the feedback
/// edges. Sessions and metrics keep copies, never back-references.
pub struct DetectionAggregator {
    limiter: Arc<RateLimiter>,
    proxies: Arc<ProxyPool>,
    metrics: Arc<MetricsHub>,
}

impl DetectionAggregator {
    pub fn new(limiter: Arc<RateLimiter>, proxies: Arc<ProxyPool>, metrics: Arc<MetricsHub>) -> Self {
        Self {
            limiter,
            proxies,
            metrics,
        }
    }

    /// Classify a page and stamp URL and timestamp onto the hits.
    pub fn collect(&self, url: &str, page: &PageSnapshot) -> Vec<Detection> {
        let now = Utc::now();
        classify(page)
            .into_iter()
            .map(|hit| Detection {
                kind: hit.kind,
                url: url.to_string(),
                timestamp: now,
                classifier: hit.classifier.to_string(),
                details: hit.details,
            })
            .collect()
    }

    /// Full per-navigation pass: classify, append to the session record,
    /// log to metrics, and apply feedback.
    ///
    /// Feedback: a `rateLimit` detection triggers limiter backoff here (a
    /// `block` does so in the worker's blocked path); the bound proxy's EMA
    /// is updated with failure iff any detection is a block or captcha.
    pub fn observe(&self, session: &Session, url: &str, page: &PageSnapshot) -> Vec<Detection> {
        let detections = self.collect(url, page);
        session.record_detections(&detections);

        for detection in &detections {
            self.metrics.log_detection(detection.clone());
        }

        if detections.iter().any(|d| d.kind == DetectionKind::RateLimit) {
            debug!(url, "rate-limit detection, triggering backoff");
            self.limiter.trigger_backoff();
        }

        if let Some(key) = session.proxy_key() {
            let failed = detections
                .iter()
                .any(|d| matches!(d.kind, DetectionKind::Block | DetectionKind::Captcha));
            let _ = self.proxies.update(key, !failed);
        }

        detections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityAssembler;
    use crate::metrics::MetricsConfig;
    use crate::proxy::{Proxy, ProxyPoolConfig};
    use crate::rate::RateLimiterConfig;
    use crate::session::{LeaseOptions, SessionPool, SessionPoolConfig};
    use crate::testing::MockLauncher;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        limiter: Arc<RateLimiter>,
        proxies: Arc<ProxyPool>,
        metrics: Arc<MetricsHub>,
        aggregator: DetectionAggregator,
        pool: Arc<SessionPool>,
    }

    fn fixture() -> Fixture {
        let limiter = Arc::new(RateLimiter::new(
            RateLimiterConfig::default(),
            CancellationToken::new(),
        ));
        let proxies = Arc::new(ProxyPool::new(ProxyPoolConfig::default()));
        let metrics = Arc::new(MetricsHub::new(MetricsConfig::default()));
        let launcher = Arc::new(MockLauncher::default());
        let pool = Arc::new(SessionPool::new(
            SessionPoolConfig::default(),
            launcher.clone(),
            Arc::new(IdentityAssembler::new()),
            proxies.clone(),
            CancellationToken::new(),
        ));
        Fixture {
            aggregator: DetectionAggregator::new(limiter.clone(), proxies.clone(), metrics.clone()),
            limiter,
            proxies,
            metrics,
            pool,
        }
    }

    fn page(html: &str, status: u16) -> PageSnapshot {
        PageSnapshot {
            url: "https://example.com/".into(),
            status: Some(status),
            html: html.into(),
            cookies: Vec::new(),
        }
    }

    #[test]
    fn collect_stamps_url_and_timestamp() {
        let f = fixture();
        let detections = f
            .aggregator
            .collect("https://example.com/login", &page("<h1>Access Denied</h1>", 200));
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].url, "https://example.com/login");
        assert_eq!(detections[0].kind, DetectionKind::Block);
    }

    #[tokio::test]
    async fn observe_appends_to_session_and_triggers_backoff() {
        let f = fixture();
        let lease = f.pool.lease(LeaseOptions::default()).await.unwrap();

        let detections =
            f.aggregator
                .observe(&lease, "https://example.com", &page("<html></html>", 429));
        assert_eq!(detections[0].kind, DetectionKind::RateLimit);
        assert_eq!(lease.detections().len(), 1);
        assert!(f.limiter.stats().backoff_remaining_ms > 0);
        assert_eq!(
            f.metrics
                .metrics(Duration::from_secs(300))
                .detections
                .total,
            1
        );
    }

    #[tokio::test]
    async fn observe_updates_bound_proxy_health() {
        let f = fixture();
        f.proxies.add(Proxy::new("10.0.0.1", 8080));
        let lease = f
            .pool
            .lease(LeaseOptions {
                use_proxy: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        let key = lease.proxy_key().unwrap().to_string();
        let before = f.proxies.score(&key).unwrap();

        f.aggregator
            .observe(&lease, "https://example.com", &page("<h1>Access Denied</h1>", 403));
        let after = f.proxies.score(&key).unwrap();
        assert!(after < before, "block detection must lower proxy score");

        f.aggregator
            .observe(&lease, "https://example.com", &page("<p>welcome</p>", 200));
        assert!(f.proxies.score(&key).unwrap() > after);
    }
}
