//! Alert dispatch
//!
//! Severity-tagged handlers registered at runtime; every alert is
//! broadcast to the handlers whose minimum severity it meets and kept in a
//! bounded recent-alert ring.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const RECENT_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

type Handler = Box<dyn Fn(&Alert) + Send + Sync>;

struct Registration {
    min_severity: Severity,
    handler: Handler,
}

/// Alert broadcaster. Injected where needed; never a module-level global.
#[derive(Default)]
pub struct Alerting {
    handlers: RwLock<Vec<Registration>>,
    recent: Mutex<VecDeque<Alert>>,
}

impl Alerting {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler fired for alerts at or above `min_severity`.
    pub fn register<F>(&self, min_severity: Severity, handler: F)
    where
        F: Fn(&Alert) + Send + Sync + 'static,
    {
        self.handlers.write().push(Registration {
            min_severity,
            handler: Box::new(handler),
        });
    }

    /// Broadcast an alert and retain it in the recent ring.
    pub fn alert(&self, severity: Severity, message: impl Into<String>) {
        let alert = Alert {
            severity,
            message: message.into(),
            timestamp: Utc::now(),
        };

        match severity {
            Severity::Info => info!(%severity, "{}", alert.message),
            _ => warn!(%severity, "{}", alert.message),
        }

        {
            let mut recent = self.recent.lock();
            if recent.len() == RECENT_CAPACITY {
                recent.pop_front();
            }
            recent.push_back(alert.clone());
        }

        for registration in self.handlers.read().iter() {
            if severity >= registration.min_severity {
                (registration.handler)(&alert);
            }
        }
    }

    /// Most recent alerts, oldest first.
    pub fn recent(&self) -> Vec<Alert> {
        self.recent.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn handlers_filter_by_severity() {
        let alerting = Alerting::new();
        let critical_hits = Arc::new(AtomicUsize::new(0));
        let all_hits = Arc::new(AtomicUsize::new(0));

        let c = critical_hits.clone();
        alerting.register(Severity::Critical, move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        });
        let a = all_hits.clone();
        alerting.register(Severity::Info, move |_| {
            a.fetch_add(1, Ordering::Relaxed);
        });

        alerting.alert(Severity::Info, "low");
        alerting.alert(Severity::Warning, "mid");
        alerting.alert(Severity::Critical, "high");

        assert_eq!(critical_hits.load(Ordering::Relaxed), 1);
        assert_eq!(all_hits.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn recent_ring_is_bounded() {
        let alerting = Alerting::new();
        for i in 0..150 {
            alerting.alert(Severity::Info, format!("alert {i}"));
        }
        let recent = alerting.recent();
        assert_eq!(recent.len(), RECENT_CAPACITY);
        assert_eq!(recent[0].message, "alert 50");
        assert_eq!(recent.last().unwrap().message, "alert 149");
    }
}
