//! Security-test and stress-test drivers
//!
//! Modes that synthesize their own work against one target and aggregate
//! the observed detections into a verdict: a vulnerability report for the
//! security test, raw throughput counters for the stress test.

mod report;
mod security;
mod stress;

pub use report::{Vulnerability, VulnerabilityReport, VulnSeverity};
pub use security::{run_security_test, AttemptOutcome, SecurityTestConfig};
pub use stress::{run_stress_test, StressReport, StressTestConfig};

use thiserror::Error;

use crate::rate::RateError;
use crate::session::BrowserError;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("browser error: {0}")]
    Browser(#[from] BrowserError),

    #[error("rate limiter error: {0}")]
    Rate(#[from] RateError),

    #[error("report output error: {0}")]
    Io(#[from] std::io::Error),

    #[error("report serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
