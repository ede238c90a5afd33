//! Anti-bot signal classification
//!
//! A registry of independent probes runs over a loaded page; each yields at
//! most one detection. Classification is pure: the same page always yields
//! the same multiset of kinds. The aggregator stamps URL and timestamp and
//! feeds the results back into rate limiting and proxy health.

mod aggregator;
mod classifiers;

pub use aggregator::DetectionAggregator;
pub use classifiers::{classifiers, classify, Classifier, ClassifierHit};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Detection category. Drives all downstream policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DetectionKind {
    Captcha,
    Challenge,
    Block,
    RateLimit,
    Fingerprint,
    Unknown,
}

impl DetectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionKind::Captcha => "captcha",
            DetectionKind::Challenge => "challenge",
            DetectionKind::Block => "block",
            DetectionKind::RateLimit => "rateLimit",
            DetectionKind::Fingerprint => "fingerprint",
            DetectionKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for DetectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed anti-bot signal. Immutable once emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    pub kind: DetectionKind,
    pub url: String,
    pub timestamp: DateTime<Utc>,
    /// Name of the classifier that produced the signal.
    pub classifier: String,
    pub details: String,
}

/// True when any detection in the slice means the attempt was stopped.
pub fn has_block(detections: &[Detection]) -> bool {
    detections
        .iter()
        .any(|d| matches!(d.kind, DetectionKind::Block | DetectionKind::Captcha))
}
