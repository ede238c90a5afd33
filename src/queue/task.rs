//! Task model
//!
//! A task is one unit of navigation work: a URL, an opaque list of page
//! actions, and extractors to run after the actions. Enqueueing transfers
//! ownership to the queue; leasing transfers it to a worker until ack.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::detect::Detection;

/// An opaque page interaction executed by the worker, in declared order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Action {
    Click { selector: String },
    TypeText { selector: String, text: String },
    Scroll { delta_y: i64 },
    Wait { ms: u64 },
    Evaluate { script: String },
}

/// A named data extraction run after all actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extractor {
    pub name: String,
    pub selector: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

/// A unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub extractors: Vec<Extractor>,
    /// Higher leases first.
    pub priority: i32,
    /// Attempts made so far.
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// Caps navigate + actions + extract, ms.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Task {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            url: url.into(),
            method: "GET".to_string(),
            headers: HashMap::new(),
            body: None,
            actions: Vec::new(),
            extractors: Vec::new(),
            priority: 0,
            attempts: 0,
            max_attempts: 3,
            deadline: None,
            timeout_ms: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_actions(mut self, actions: Vec<Action>) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_extractors(mut self, extractors: Vec<Extractor>) -> Self {
        self.extractors = extractors;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// What a finished task reports back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub detections: Vec<Detection>,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub screenshot: Option<String>,
}

/// Retry backoff policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackoffKind {
    Exponential,
    Fixed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffPolicy {
    pub kind: BackoffKind,
    pub delay_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay_ms: 1000,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the given (1-based) retry attempt.
    pub fn delay_for(&self, attempt: u32) -> std::time::Duration {
        let ms = match self.kind {
            BackoffKind::Fixed => self.delay_ms,
            BackoffKind::Exponential => {
                self.delay_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(16))
            }
        };
        std::time::Duration::from_millis(ms)
    }
}

/// Options applied at enqueue time.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: Option<i32>,
    pub delay: Option<std::time::Duration>,
    pub id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles() {
        let policy = BackoffPolicy {
            kind: BackoffKind::Exponential,
            delay_ms: 100,
        };
        assert_eq!(policy.delay_for(1).as_millis(), 100);
        assert_eq!(policy.delay_for(2).as_millis(), 200);
        assert_eq!(policy.delay_for(3).as_millis(), 400);
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = BackoffPolicy {
            kind: BackoffKind::Fixed,
            delay_ms: 250,
        };
        assert_eq!(policy.delay_for(1).as_millis(), 250);
        assert_eq!(policy.delay_for(5).as_millis(), 250);
    }

    #[test]
    fn task_round_trips_through_json() {
        let task = Task::new("https://example.com")
            .with_priority(5)
            .with_actions(vec![Action::Click {
                selector: "#go".into(),
            }])
            .with_extractors(vec![Extractor {
                name: "title".into(),
                selector: "h1".into(),
                attribute: None,
            }]);
        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, task.id);
        assert_eq!(back.priority, 5);
        assert_eq!(back.actions.len(), 1);
    }
}
