//! Background health monitor
//!
//! Periodically evaluates the metrics hub against the configured
//! thresholds and raises alerts on degradation transitions.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::alerts::{Alerting, Severity};
use super::hub::{HealthThresholds, MetricsHub};

/// Spawns and owns the periodic health evaluation task.
pub struct HealthMonitor {
    interval: Duration,
    thresholds: HealthThresholds,
}

impl HealthMonitor {
    pub fn new(interval: Duration, thresholds: HealthThresholds) -> Self {
        Self {
            interval,
            thresholds,
        }
    }

    /// Run until cancelled. Alerts fire only on healthy/degraded
    /// transitions, not on every degraded tick.
    pub fn start(
        self,
        hub: Arc<MetricsHub>,
        alerting: Arc<Alerting>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        info!(interval_secs = self.interval.as_secs(), "health monitor started");
        tokio::spawn(async move {
            let mut was_healthy = true;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.interval) => {}
                }

                let report = hub.health(&self.thresholds);
                debug!(healthy = report.healthy, issues = report.issues.len(), "health tick");

                if !report.healthy && was_healthy {
                    alerting.alert(
                        Severity::Warning,
                        format!("health degraded: {}", report.issues.join("; ")),
                    );
                } else if report.healthy && !was_healthy {
                    alerting.alert(Severity::Info, "health recovered");
                }
                was_healthy = report.healthy;
            }
            info!("health monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::hub::RequestLog;
    use chrono::Utc;

    #[tokio::test(start_paused = true)]
    async fn alerts_on_degradation_transition() {
        let hub = Arc::new(MetricsHub::default());
        let alerting = Arc::new(Alerting::new());
        let cancel = CancellationToken::new();

        for _ in 0..10 {
            hub.log_request(RequestLog {
                timestamp: Utc::now(),
                duration_ms: 100,
                success: false,
                blocked: true,
                captcha: false,
                url: "https://example.com".into(),
            });
        }

        let monitor = HealthMonitor::new(Duration::from_secs(1), HealthThresholds::default());
        let handle = monitor.start(hub, alerting.clone(), cancel.clone());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        cancel.cancel();
        let _ = handle.await;

        let alerts = alerting.recent();
        assert_eq!(alerts.len(), 1, "one transition, one alert");
        assert_eq!(alerts[0].severity, Severity::Warning);
    }
}
