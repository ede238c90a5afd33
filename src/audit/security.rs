//! Security test mode
//!
//! Runs N sequential navigation attempts against one target, a fresh
//! session per attempt, and synthesizes a rule-based vulnerability verdict
//! from the aggregate detections.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use rand::Rng;
use tracing::{debug, info};

use crate::detect::{Detection, DetectionAggregator, DetectionKind};
use crate::rate::RateLimiter;
use crate::session::{LeaseOptions, SessionPool};

use super::report::{VulnSeverity, Vulnerability, VulnerabilityReport};
use super::AuditError;

/// Security test parameters
#[derive(Debug, Clone)]
pub struct SecurityTestConfig {
    pub url: String,
    pub attempts: usize,
    pub use_proxies: bool,
    pub human_behavior: bool,
    pub output_dir: Option<PathBuf>,
}

impl Default for SecurityTestConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            attempts: 5,
            use_proxies: false,
            human_behavior: false,
            output_dir: None,
        }
    }
}

/// One attempt's observation.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub index: usize,
    pub detections: Vec<Detection>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl AttemptOutcome {
    fn stopped(&self) -> bool {
        self.detections
            .iter()
            .any(|d| matches!(d.kind, DetectionKind::Block | DetectionKind::Captcha))
    }
}

/// Run the security test and write the report if an output directory is
/// configured.
pub async fn run_security_test(
    sessions: &Arc<SessionPool>,
    limiter: &Arc<RateLimiter>,
    aggregator: &DetectionAggregator,
    config: &SecurityTestConfig,
) -> Result<VulnerabilityReport, AuditError> {
    info!(url = %config.url, attempts = config.attempts, "security test started");
    let mut outcomes = Vec::with_capacity(config.attempts);

    for index in 0..config.attempts {
        let lease = sessions
            .lease(LeaseOptions {
                use_proxy: Some(config.use_proxies),
                fresh: true,
                ..Default::default()
            })
            .await?;
        let slot = limiter.acquire(&config.url).await?;
        let started = Instant::now();

        let outcome = match lease.navigate(&config.url).await {
            Ok(page) => {
                let detections = aggregator.observe(&lease, &config.url, &page);
                if config.human_behavior && detections.is_empty() {
                    let (scroll, pause_ms) = {
                        let mut rng = rand::thread_rng();
                        (rng.gen_range(200..900), rng.gen_range(200..800u64))
                    };
                    let _ = lease
                        .evaluate(&format!("window.scrollBy(0, {scroll})"))
                        .await;
                    tokio::time::sleep(std::time::Duration::from_millis(pause_ms)).await;
                }
                AttemptOutcome {
                    index,
                    detections,
                    duration_ms: started.elapsed().as_millis() as u64,
                    error: None,
                }
            }
            Err(e) => AttemptOutcome {
                index,
                detections: Vec::new(),
                duration_ms: started.elapsed().as_millis() as u64,
                error: Some(e.to_string()),
            },
        };

        debug!(
            attempt = index + 1,
            detections = outcome.detections.len(),
            error = outcome.error.as_deref().unwrap_or(""),
            "attempt finished"
        );
        outcomes.push(outcome);

        drop(slot);
        lease.close().await;
    }

    let report = synthesize(&config.url, &outcomes);
    if let Some(dir) = &config.output_dir {
        report.write_json(dir)?;
        report.write_markdown(dir)?;
    }
    info!(
        bypass = report.bypass_success,
        detection_rate = report.detection_rate,
        vulnerabilities = report.vulnerabilities.len(),
        "security test finished"
    );
    Ok(report)
}

/// Rule-based verdict synthesis over the attempt outcomes.
fn synthesize(url: &str, outcomes: &[AttemptOutcome]) -> VulnerabilityReport {
    let attempts = outcomes.len();
    let successful: Vec<&AttemptOutcome> =
        outcomes.iter().filter(|o| o.error.is_none()).collect();
    let bypass_success = successful.iter().any(|o| !o.stopped());
    let with_detection = outcomes
        .iter()
        .filter(|o| !o.detections.is_empty())
        .count();
    let detection_rate = if attempts == 0 {
        0.0
    } else {
        with_detection as f64 / attempts as f64
    };

    let mut detections_by_kind: HashMap<String, usize> = HashMap::new();
    for outcome in outcomes {
        for detection in &outcome.detections {
            *detections_by_kind
                .entry(detection.kind.as_str().to_string())
                .or_default() += 1;
        }
    }

    let mut vulnerabilities = Vec::new();
    let mut recommendations = Vec::new();

    let total_detections: usize = detections_by_kind.values().sum();
    if total_detections == 0 && !successful.is_empty() {
        // Nothing pushed back at all; every other rule is subsumed.
        vulnerabilities.push(Vulnerability {
            severity: VulnSeverity::Critical,
            title: "No Bot Detection Mechanisms Found".into(),
            category: "Bot Detection".into(),
            description: format!(
                "{} automated sessions completed against {url} without a single \
                 challenge, captcha, or block.",
                successful.len()
            ),
            recommendation: "Deploy bot detection (behavioral analysis, fingerprinting, \
                             challenge pages) in front of this endpoint."
                .into(),
        });
        recommendations
            .push("Deploy layered bot detection before this endpoint sees production traffic.".into());
        return VulnerabilityReport {
            url: url.to_string(),
            timestamp: Utc::now(),
            attempts,
            bypass_success,
            detection_rate,
            detections_by_kind,
            vulnerabilities,
            recommendations,
        };
    }

    let blocks = *detections_by_kind.get("block").unwrap_or(&0);
    let captchas = *detections_by_kind.get("captcha").unwrap_or(&0);
    let challenges = *detections_by_kind.get("challenge").unwrap_or(&0);
    let rate_limits = *detections_by_kind.get("rateLimit").unwrap_or(&0);

    if blocks > 0 && captchas == 0 && challenges == 0 {
        vulnerabilities.push(Vulnerability {
            severity: VulnSeverity::High,
            title: "IP-Only Blocking".into(),
            category: "Bot Detection".into(),
            description: "The target relies on outright blocking without challenges; \
                          rotating egress IPs defeats this defense."
                .into(),
            recommendation: "Add fingerprint- and behavior-based detection so blocking \
                             does not depend on the client address alone."
                .into(),
        });
    }

    if captchas > 0 && blocks == 0 && challenges == 0 {
        vulnerabilities.push(Vulnerability {
            severity: VulnSeverity::Medium,
            title: "CAPTCHA-Only Defense".into(),
            category: "Bot Detection".into(),
            description: "Every defense observed was a captcha; solver services make \
                          captcha-only protection routinely bypassable."
                .into(),
            recommendation: "Back captchas with risk scoring and rate controls.".into(),
        });
    }

    if challenges > 0 && blocks == 0 && captchas == 0 {
        vulnerabilities.push(Vulnerability {
            severity: VulnSeverity::Medium,
            title: "Challenge-Only Defense".into(),
            category: "Bot Detection".into(),
            description: "JavaScript challenges were the only defense observed; headless \
                          browsers with consistent fingerprints pass them."
                .into(),
            recommendation: "Combine challenges with behavioral signals and blocking.".into(),
        });
    }

    if bypass_success {
        vulnerabilities.push(Vulnerability {
            severity: VulnSeverity::High,
            title: "Bypassable Bot Detection".into(),
            category: "Bot Detection".into(),
            description: "At least one automated session completed with no block or \
                          captcha despite detection being present."
                .into(),
            recommendation: "Tighten detection thresholds; correlate TLS, header, and \
                             behavioral signals per session."
                .into(),
        });
    }

    if rate_limits == 0 && attempts > 1 {
        vulnerabilities.push(Vulnerability {
            severity: VulnSeverity::Low,
            title: "No Rate Limiting Observed".into(),
            category: "Rate Limiting".into(),
            description: format!(
                "{attempts} rapid sequential attempts completed without any rate-limit \
                 response."
            ),
            recommendation: "Rate-limit per client identity, not only per IP.".into(),
        });
    }

    for v in &vulnerabilities {
        recommendations.push(v.recommendation.clone());
    }
    recommendations.dedup();

    VulnerabilityReport {
        url: url.to_string(),
        timestamp: Utc::now(),
        attempts,
        bypass_success,
        detection_rate,
        detections_by_kind,
        vulnerabilities,
        recommendations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityAssembler;
    use crate::metrics::{MetricsConfig, MetricsHub};
    use crate::proxy::{ProxyPool, ProxyPoolConfig};
    use crate::rate::RateLimiterConfig;
    use crate::session::SessionPoolConfig;
    use crate::testing::MockLauncher;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        sessions: Arc<SessionPool>,
        limiter: Arc<RateLimiter>,
        aggregator: DetectionAggregator,
    }

    fn fixture(launcher: Arc<MockLauncher>) -> Fixture {
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
            SessionPoolConfig::default(),
            launcher,
            Arc::new(IdentityAssembler::new()),
            proxies.clone(),
            CancellationToken::new(),
        ));
        Fixture {
            sessions,
            limiter: limiter.clone(),
            aggregator: DetectionAggregator::new(limiter, proxies, metrics),
        }
    }

    fn config(attempts: usize) -> SecurityTestConfig {
        SecurityTestConfig {
            url: "https://example.com".into(),
            attempts,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn undefended_target_yields_critical_verdict() {
        let launcher = Arc::new(MockLauncher::with_html("<h1>Welcome</h1>"));
        let f = fixture(launcher.clone());

        let report =
            run_security_test(&f.sessions, &f.limiter, &f.aggregator, &config(5))
                .await
                .unwrap();

        assert!(report.bypass_success);
        assert_eq!(report.detection_rate, 0.0);
        assert_eq!(report.vulnerabilities.len(), 1);
        assert_eq!(report.vulnerabilities[0].severity, VulnSeverity::Critical);
        assert_eq!(
            report.vulnerabilities[0].title,
            "No Bot Detection Mechanisms Found"
        );
        // A fresh session per attempt.
        assert_eq!(launcher.state.launched(), 5);
        assert_eq!(launcher.state.closed(), 5);
    }

    #[tokio::test]
    async fn fully_blocked_target_reports_ip_only_blocking() {
        let launcher = Arc::new(MockLauncher::with_html("<h1>Access Denied</h1>"));
        let f = fixture(launcher);

        let report =
            run_security_test(&f.sessions, &f.limiter, &f.aggregator, &config(5))
                .await
                .unwrap();

        assert!(!report.bypass_success);
        assert_eq!(report.detection_rate, 1.0);
        assert!(report
            .vulnerabilities
            .iter()
            .any(|v| v.title == "IP-Only Blocking" && v.category == "Bot Detection"));
    }

    #[tokio::test]
    async fn captcha_only_target_reports_medium() {
        let launcher = Arc::new(MockLauncher::with_html(
            "<div class=\"g-recaptcha\"></div>",
        ));
        let f = fixture(launcher);

        let report =
            run_security_test(&f.sessions, &f.limiter, &f.aggregator, &config(3))
                .await
                .unwrap();

        assert!(report
            .vulnerabilities
            .iter()
            .any(|v| v.title == "CAPTCHA-Only Defense" && v.severity == VulnSeverity::Medium));
    }
}
