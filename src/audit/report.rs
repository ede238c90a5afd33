//! Vulnerability report model and writers
//!
//! The JSON report is the canonical artifact; the Markdown sibling is a
//! human-readable rendering of the same data.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VulnSeverity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for VulnSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VulnSeverity::Info => "info",
            VulnSeverity::Low => "low",
            VulnSeverity::Medium => "medium",
            VulnSeverity::High => "high",
            VulnSeverity::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vulnerability {
    pub severity: VulnSeverity,
    pub title: String,
    pub category: String,
    pub description: String,
    pub recommendation: String,
}

/// The security-test verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VulnerabilityReport {
    pub url: String,
    pub timestamp: DateTime<Utc>,
    pub attempts: usize,
    pub bypass_success: bool,
    /// Fraction of attempts that produced at least one detection.
    pub detection_rate: f64,
    pub detections_by_kind: HashMap<String, usize>,
    pub vulnerabilities: Vec<Vulnerability>,
    pub recommendations: Vec<String>,
}

impl VulnerabilityReport {
    /// A target is vulnerable when an automated session got through, or a
    /// high-or-worse weakness was found.
    pub fn vulnerable(&self) -> bool {
        self.bypass_success
            || self
                .vulnerabilities
                .iter()
                .any(|v| v.severity >= VulnSeverity::High)
    }

    pub fn write_json(&self, dir: &Path) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!(
            "vulnerability-report-{}.json",
            self.timestamp.format("%Y%m%d-%H%M%S")
        ));
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        info!(path = %path.display(), "vulnerability report written");
        Ok(path)
    }

    pub fn write_markdown(&self, dir: &Path) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!(
            "vulnerability-report-{}.md",
            self.timestamp.format("%Y%m%d-%H%M%S")
        ));

        let mut out = String::new();
        out.push_str(&format!("# Bot Detection Assessment: {}\n\n", self.url));
        out.push_str(&format!("Generated: {}\n\n", self.timestamp.to_rfc3339()));
        out.push_str(&format!(
            "- Attempts: {}\n- Bypass success: {}\n- Detection rate: {:.0}%\n\n",
            self.attempts,
            self.bypass_success,
            self.detection_rate * 100.0
        ));

        if !self.detections_by_kind.is_empty() {
            out.push_str("## Detections\n\n");
            let mut kinds: Vec<_> = self.detections_by_kind.iter().collect();
            kinds.sort();
            for (kind, count) in kinds {
                out.push_str(&format!("- {kind}: {count}\n"));
            }
            out.push('\n');
        }

        out.push_str("## Vulnerabilities\n\n");
        if self.vulnerabilities.is_empty() {
            out.push_str("None found.\n\n");
        }
        for v in &self.vulnerabilities {
            out.push_str(&format!("### [{}] {}\n\n", v.severity, v.title));
            out.push_str(&format!("Category: {}\n\n{}\n\n", v.category, v.description));
            out.push_str(&format!("Recommendation: {}\n\n", v.recommendation));
        }

        if !self.recommendations.is_empty() {
            out.push_str("## Recommendations\n\n");
            for r in &self.recommendations {
                out.push_str(&format!("- {r}\n"));
            }
        }

        std::fs::write(&path, out)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> VulnerabilityReport {
        VulnerabilityReport {
            url: "https://example.com".into(),
            timestamp: Utc::now(),
            attempts: 5,
            bypass_success: false,
            detection_rate: 1.0,
            detections_by_kind: HashMap::from([("block".to_string(), 5)]),
            vulnerabilities: vec![Vulnerability {
                severity: VulnSeverity::High,
                title: "IP-Only Blocking".into(),
                category: "Bot Detection".into(),
                description: "desc".into(),
                recommendation: "rec".into(),
            }],
            recommendations: vec!["layer defenses".into()],
        }
    }

    #[test]
    fn vulnerable_on_high_severity_or_bypass() {
        let mut r = report();
        assert!(r.vulnerable());

        r.vulnerabilities.clear();
        assert!(!r.vulnerable());

        r.bypass_success = true;
        assert!(r.vulnerable());
    }

    #[test]
    fn writes_json_and_markdown() {
        let dir = std::env::temp_dir().join(format!("gauntlet-report-{}", uuid::Uuid::new_v4()));
        let r = report();

        let json_path = r.write_json(&dir).unwrap();
        let parsed: VulnerabilityReport =
            serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(parsed.attempts, 5);

        let md_path = r.write_markdown(&dir).unwrap();
        let md = std::fs::read_to_string(&md_path).unwrap();
        assert!(md.contains("IP-Only Blocking"));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
