//! Metrics, health, and alerting
//!
//! Bounded sliding-window logs of requests and detections, trend and health
//! computation over them, and a severity-tagged alert dispatcher.

mod alerts;
mod hub;
mod monitor;

pub use alerts::{Alert, Alerting, Severity};
pub use hub::{
    DetectionReport, HealthReport, HealthThresholds, MetricsConfig, MetricsHub, MetricsReport,
    PerformanceReport, RequestCounts, RequestLog,
};
pub use monitor::HealthMonitor;
