//! Detection probes
//!
//! Each probe inspects the page DOM, cookies, and script references for one
//! vendor or generic signature and yields at most one hit. Probes are
//! independent; all hits are returned.

use std::sync::LazyLock;

use regex::Regex;

use crate::session::PageSnapshot;

use super::DetectionKind;

/// An un-stamped classification hit; the caller attaches URL and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifierHit {
    pub classifier: &'static str,
    pub kind: DetectionKind,
    pub details: String,
}

type ProbeFn = fn(&PageSnapshot) -> Option<ClassifierHit>;

/// A named, independent detection probe.
pub struct Classifier {
    pub name: &'static str,
    probe: ProbeFn,
}

fn regex(pattern: &str) -> Regex {
    Regex::new(pattern).expect("classifier pattern must compile")
}

static CLOUDFLARE: LazyLock<Regex> = LazyLock::new(|| {
    regex(r#"(?i)cf-chl|cf-wrapper|cf_chl_opt|cdn-cgi/challenge-platform|<title>\s*Just a moment"#)
});
static PX_ELEMENT: LazyLock<Regex> =
    LazyLock::new(|| regex(r#"(?i)px-captcha|window\._pxAppId"#));
static DATADOME_SCRIPT: LazyLock<Regex> =
    LazyLock::new(|| regex(r#"(?i)js\.datadome\.co|/dd\.js|ddjskey"#));
static RECAPTCHA: LazyLock<Regex> =
    LazyLock::new(|| regex(r#"(?i)g-recaptcha|www\.google\.com/recaptcha|grecaptcha"#));
static HCAPTCHA: LazyLock<Regex> =
    LazyLock::new(|| regex(r#"(?i)h-captcha|hcaptcha\.com"#));
static BLOCK_TEXT: LazyLock<Regex> =
    LazyLock::new(|| regex(r#"(?i)access denied|forbidden|you have been blocked"#));
static RATE_LIMIT_TEXT: LazyLock<Regex> =
    LazyLock::new(|| regex(r#"(?i)rate limit|too many requests"#));
static HUMAN_TEXT: LazyLock<Regex> =
    LazyLock::new(|| regex(r#"(?i)verify (you are|that you are|you're) (a )?human"#));

fn has_cookie(page: &PageSnapshot, prefix: &str) -> bool {
    page.cookies
        .iter()
        .any(|c| c.name.to_ascii_lowercase().starts_with(prefix))
}

fn probe_cloudflare(page: &PageSnapshot) -> Option<ClassifierHit> {
    if CLOUDFLARE.is_match(&page.html) || has_cookie(page, "__cf_bm") || has_cookie(page, "cf_clearance")
    {
        return Some(ClassifierHit {
            classifier: "cloudflare",
            kind: DetectionKind::Challenge,
            details: "Cloudflare challenge markers present".into(),
        });
    }
    None
}

fn probe_perimeterx(page: &PageSnapshot) -> Option<ClassifierHit> {
    if has_cookie(page, "_px") || PX_ELEMENT.is_match(&page.html) {
        return Some(ClassifierHit {
            classifier: "perimeterx",
            kind: DetectionKind::Challenge,
            details: "PerimeterX cookie or captcha element present".into(),
        });
    }
    None
}

fn probe_datadome(page: &PageSnapshot) -> Option<ClassifierHit> {
    if has_cookie(page, "datadome") || DATADOME_SCRIPT.is_match(&page.html) {
        return Some(ClassifierHit {
            classifier: "datadome",
            kind: DetectionKind::Challenge,
            details: "DataDome cookie or script present".into(),
        });
    }
    None
}

fn probe_recaptcha(page: &PageSnapshot) -> Option<ClassifierHit> {
    if RECAPTCHA.is_match(&page.html) {
        return Some(ClassifierHit {
            classifier: "recaptcha",
            kind: DetectionKind::Captcha,
            details: "reCAPTCHA element or script present".into(),
        });
    }
    None
}

fn probe_hcaptcha(page: &PageSnapshot) -> Option<ClassifierHit> {
    if HCAPTCHA.is_match(&page.html) {
        return Some(ClassifierHit {
            classifier: "hcaptcha",
            kind: DetectionKind::Captcha,
            details: "hCaptcha element or iframe present".into(),
        });
    }
    None
}

fn probe_block_text(page: &PageSnapshot) -> Option<ClassifierHit> {
    if page.status == Some(403) || BLOCK_TEXT.is_match(&page.html) {
        return Some(ClassifierHit {
            classifier: "generic-block",
            kind: DetectionKind::Block,
            details: "access-denied response".into(),
        });
    }
    None
}

fn probe_rate_limit(page: &PageSnapshot) -> Option<ClassifierHit> {
    if page.status == Some(429) || RATE_LIMIT_TEXT.is_match(&page.html) {
        return Some(ClassifierHit {
            classifier: "generic-rate-limit",
            kind: DetectionKind::RateLimit,
            details: "rate-limit response".into(),
        });
    }
    None
}

fn probe_human_check(page: &PageSnapshot) -> Option<ClassifierHit> {
    if HUMAN_TEXT.is_match(&page.html) {
        return Some(ClassifierHit {
            classifier: "generic-human-check",
            kind: DetectionKind::Captcha,
            details: "verify-human interstitial".into(),
        });
    }
    None
}

static CLASSIFIERS: &[Classifier] = &[
    Classifier { name: "cloudflare", probe: probe_cloudflare },
    Classifier { name: "perimeterx", probe: probe_perimeterx },
    Classifier { name: "datadome", probe: probe_datadome },
    Classifier { name: "recaptcha", probe: probe_recaptcha },
    Classifier { name: "hcaptcha", probe: probe_hcaptcha },
    Classifier { name: "generic-block", probe: probe_block_text },
    Classifier { name: "generic-rate-limit", probe: probe_rate_limit },
    Classifier { name: "generic-human-check", probe: probe_human_check },
];

/// The registered probe set, in evaluation order.
pub fn classifiers() -> &'static [Classifier] {
    CLASSIFIERS
}

/// Run every probe over a page. Pure: repeat calls on the same page yield
/// the same hits in the same order.
pub fn classify(page: &PageSnapshot) -> Vec<ClassifierHit> {
    CLASSIFIERS.iter().filter_map(|c| (c.probe)(page)).collect()
}
