//! Sliding-window metrics hub
//!
//! Append-only ring buffers with bounded capacity; FIFO eviction. All
//! consumers receive snapshots; the hub holds no references into the rest
//! of the system.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::detect::Detection;

/// Retention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsConfig {
    pub max_history: usize,
    pub max_detections: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            max_history: 10_000,
            max_detections: 1_000,
        }
    }
}

/// One completed request observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestLog {
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub blocked: bool,
    pub captcha: bool,
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestCounts {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub blocked: usize,
    pub captcha: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceReport {
    pub avg_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub rps: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionReport {
    pub total: usize,
    pub by_kind: HashMap<String, usize>,
    pub recent: Vec<Detection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    pub requests: RequestCounts,
    pub performance: PerformanceReport,
    pub detections: DetectionReport,
}

/// Health evaluation thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthThresholds {
    pub min_success_rate: f64,
    pub max_detection_rate: f64,
    pub max_avg_ms: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            min_success_rate: 0.8,
            max_detection_rate: 0.3,
            max_avg_ms: 15_000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub healthy: bool,
    pub issues: Vec<String>,
}

#[derive(Default)]
struct Inner {
    requests: VecDeque<RequestLog>,
    detections: VecDeque<Detection>,
}

/// Shared metrics sink. Writers append; readers snapshot over a window.
pub struct MetricsHub {
    inner: Mutex<Inner>,
    config: MetricsConfig,
}

impl MetricsHub {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            config,
        }
    }

    pub fn log_request(&self, log: RequestLog) {
        let mut inner = self.inner.lock();
        if inner.requests.len() == self.config.max_history {
            inner.requests.pop_front();
        }
        inner.requests.push_back(log);
    }

    pub fn log_detection(&self, detection: Detection) {
        let mut inner = self.inner.lock();
        if inner.detections.len() == self.config.max_detections {
            inner.detections.pop_front();
        }
        inner.detections.push_back(detection);
    }

    /// Aggregate over the trailing `window`.
    pub fn metrics(&self, window: Duration) -> MetricsReport {
        let cutoff = Utc::now() - chrono::Duration::from_std(window).unwrap_or(chrono::Duration::minutes(5));
        let inner = self.inner.lock();

        let mut counts = RequestCounts::default();
        let mut min_ms = u64::MAX;
        let mut max_ms = 0u64;
        let mut sum_ms = 0u64;
        for log in inner.requests.iter().filter(|l| l.timestamp >= cutoff) {
            counts.total += 1;
            if log.success {
                counts.successful += 1;
            } else {
                counts.failed += 1;
            }
            if log.blocked {
                counts.blocked += 1;
            }
            if log.captcha {
                counts.captcha += 1;
            }
            min_ms = min_ms.min(log.duration_ms);
            max_ms = max_ms.max(log.duration_ms);
            sum_ms += log.duration_ms;
        }

        let performance = if counts.total == 0 {
            PerformanceReport::default()
        } else {
            PerformanceReport {
                avg_ms: sum_ms as f64 / counts.total as f64,
                min_ms,
                max_ms,
                rps: counts.total as f64 / window.as_secs_f64().max(f64::EPSILON),
            }
        };

        let window_detections: Vec<&Detection> = inner
            .detections
            .iter()
            .filter(|d| d.timestamp >= cutoff)
            .collect();
        let mut by_kind: HashMap<String, usize> = HashMap::new();
        for d in &window_detections {
            *by_kind.entry(d.kind.as_str().to_string()).or_default() += 1;
        }
        let recent = window_detections
            .iter()
            .rev()
            .take(10)
            .map(|d| (*d).clone())
            .collect();

        MetricsReport {
            requests: counts,
            performance,
            detections: DetectionReport {
                total: window_detections.len(),
                by_kind,
                recent,
            },
        }
    }

    /// Per-bucket success rate over the trailing `buckets * bucket_ms`
    /// span, oldest bucket first. Empty buckets report 1.0 (nothing
    /// failed).
    pub fn success_rate_trend(&self, buckets: usize, bucket_ms: u64) -> Vec<f64> {
        self.trend(buckets, bucket_ms, |logs| {
            if logs.is_empty() {
                1.0
            } else {
                logs.iter().filter(|l| l.success).count() as f64 / logs.len() as f64
            }
        })
    }

    /// Per-bucket fraction of requests that saw a block or captcha. Empty
    /// buckets report 0.0.
    pub fn detection_rate_trend(&self, buckets: usize, bucket_ms: u64) -> Vec<f64> {
        self.trend(buckets, bucket_ms, |logs| {
            if logs.is_empty() {
                0.0
            } else {
                logs.iter().filter(|l| l.blocked || l.captcha).count() as f64 / logs.len() as f64
            }
        })
    }

    fn trend(&self, buckets: usize, bucket_ms: u64, f: impl Fn(&[&RequestLog]) -> f64) -> Vec<f64> {
        let now = Utc::now();
        let bucket_span = chrono::Duration::milliseconds(bucket_ms as i64);
        let inner = self.inner.lock();

        (0..buckets)
            .map(|i| {
                let end = now - bucket_span * (buckets - 1 - i) as i32;
                let start = end - bucket_span;
                let logs: Vec<&RequestLog> = inner
                    .requests
                    .iter()
                    .filter(|l| l.timestamp > start && l.timestamp <= end)
                    .collect();
                f(&logs)
            })
            .collect()
    }

    /// Threshold health over the trailing five minutes.
    pub fn health(&self, thresholds: &HealthThresholds) -> HealthReport {
        let report = self.metrics(Duration::from_secs(300));
        let mut issues = Vec::new();

        if report.requests.total > 0 {
            let success_rate = report.requests.successful as f64 / report.requests.total as f64;
            if success_rate < thresholds.min_success_rate {
                issues.push(format!(
                    "success rate {:.2} below minimum {:.2}",
                    success_rate, thresholds.min_success_rate
                ));
            }
            let detection_rate =
                (report.requests.blocked + report.requests.captcha) as f64 / report.requests.total as f64;
            if detection_rate > thresholds.max_detection_rate {
                issues.push(format!(
                    "detection rate {:.2} above maximum {:.2}",
                    detection_rate, thresholds.max_detection_rate
                ));
            }
            if report.performance.avg_ms > thresholds.max_avg_ms {
                issues.push(format!(
                    "average response {:.0}ms above maximum {:.0}ms",
                    report.performance.avg_ms, thresholds.max_avg_ms
                ));
            }
        }

        HealthReport {
            healthy: issues.is_empty(),
            issues,
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.requests.clear();
        inner.detections.clear();
    }
}

impl Default for MetricsHub {
    fn default() -> Self {
        Self::new(MetricsConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::DetectionKind;

    fn request(success: bool, blocked: bool, duration_ms: u64) -> RequestLog {
        RequestLog {
            timestamp: Utc::now(),
            duration_ms,
            success,
            blocked,
            captcha: false,
            url: "https://example.com".into(),
        }
    }

    #[test]
    fn aggregates_window_counts_and_performance() {
        let hub = MetricsHub::default();
        hub.log_request(request(true, false, 100));
        hub.log_request(request(true, false, 300));
        hub.log_request(request(false, true, 200));

        let report = hub.metrics(Duration::from_secs(300));
        assert_eq!(report.requests.total, 3);
        assert_eq!(report.requests.successful, 2);
        assert_eq!(report.requests.failed, 1);
        assert_eq!(report.requests.blocked, 1);
        assert_eq!(report.performance.min_ms, 100);
        assert_eq!(report.performance.max_ms, 300);
        assert!((report.performance.avg_ms - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn old_entries_fall_out_of_window() {
        let hub = MetricsHub::default();
        let mut old = request(true, false, 50);
        old.timestamp = Utc::now() - chrono::Duration::minutes(10);
        hub.log_request(old);
        hub.log_request(request(true, false, 50));

        let report = hub.metrics(Duration::from_secs(300));
        assert_eq!(report.requests.total, 1);
    }

    #[test]
    fn history_is_bounded_fifo() {
        let hub = MetricsHub::new(MetricsConfig {
            max_history: 5,
            max_detections: 2,
        });
        for i in 0..10 {
            hub.log_request(request(true, false, i));
        }
        let report = hub.metrics(Duration::from_secs(300));
        assert_eq!(report.requests.total, 5);
        // Oldest entries evicted: the max duration kept is 9, min is 5.
        assert_eq!(report.performance.min_ms, 5);
        assert_eq!(report.performance.max_ms, 9);
    }

    #[test]
    fn detections_report_by_kind() {
        let hub = MetricsHub::default();
        for kind in [DetectionKind::Block, DetectionKind::Block, DetectionKind::Captcha] {
            hub.log_detection(Detection {
                kind,
                url: "https://example.com".into(),
                timestamp: Utc::now(),
                classifier: "test".into(),
                details: String::new(),
            });
        }
        let report = hub.metrics(Duration::from_secs(300));
        assert_eq!(report.detections.total, 3);
        assert_eq!(report.detections.by_kind.get("block"), Some(&2));
        assert_eq!(report.detections.by_kind.get("captcha"), Some(&1));
        assert!(report.detections.recent.len() <= 10);
    }

    #[test]
    fn health_flags_threshold_breaches() {
        let hub = MetricsHub::default();
        for _ in 0..8 {
            hub.log_request(request(false, true, 100));
        }
        hub.log_request(request(true, false, 100));

        let report = hub.health(&HealthThresholds::default());
        assert!(!report.healthy);
        assert_eq!(report.issues.len(), 2);
    }

    #[test]
    fn reset_clears_everything() {
        let hub = MetricsHub::default();
        hub.log_request(request(true, false, 10));
        hub.reset();
        assert_eq!(hub.metrics(Duration::from_secs(300)).requests.total, 0);
    }

    #[test]
    fn trends_have_requested_bucket_count() {
        let hub = MetricsHub::default();
        hub.log_request(request(true, false, 10));
        let trend = hub.success_rate_trend(6, 1000);
        assert_eq!(trend.len(), 6);
        // The newest bucket holds the single successful request.
        assert!((trend[5] - 1.0).abs() < f64::EPSILON);

        let detections = hub.detection_rate_trend(6, 1000);
        assert_eq!(detections.len(), 6);
        assert!((detections[5]).abs() < f64::EPSILON);
    }
}
