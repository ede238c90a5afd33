//! Scored proxy pool
//!
//! Proxies are referenced by `host:port` key everywhere outside the pool;
//! sessions never own them. Health is an exponential moving average of
//! per-use outcomes, and proxies falling below the eviction threshold are
//! removed automatically.

use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

/// EMA weight kept from the previous score on every update.
const EMA_RETAIN: f64 = 0.9;
/// Score below which a proxy is auto-evicted.
const EVICT_THRESHOLD: f64 = 0.2;
/// Score assigned to a freshly added proxy.
const INITIAL_SCORE: f64 = 0.5;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("invalid proxy line {line_no}: {reason}")]
    InvalidLine { line_no: usize, reason: String },

    #[error("proxy pool is empty")]
    Empty,

    #[error("proxy not found: {0}")]
    NotFound(String),
}

/// Proxy transport scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyScheme {
    Http,
    Https,
    Socks4,
    Socks5,
}

impl std::fmt::Display for ProxyScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProxyScheme::Http => "http",
            ProxyScheme::Https => "https",
            ProxyScheme::Socks4 => "socks4",
            ProxyScheme::Socks5 => "socks5",
        };
        f.write_str(s)
    }
}

/// Proxy credentials
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

/// A network egress point
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proxy {
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
    pub auth: Option<ProxyAuth>,
    pub country: Option<String>,
    #[serde(default)]
    pub residential: bool,
}

impl Proxy {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: ProxyScheme::Http,
            host: host.into(),
            port,
            auth: None,
            country: None,
            residential: false,
        }
    }

    /// Stable identity used by sessions and metrics instead of references.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Full server URL, `scheme://host:port`.
    pub fn server_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// The opaque handoff format for the browser driver.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverProxy {
    pub server: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Pool configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyPoolConfig {
    /// Minimum interval before `next()` advances to another proxy, ms.
    pub rotation_interval_ms: u64,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            rotation_interval_ms: 30_000,
        }
    }
}

/// Pool snapshot
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyPoolStats {
    pub total: usize,
    pub residential: usize,
    pub average_score: f64,
    pub best: Option<String>,
    pub evicted_total: u64,
}

struct Entry {
    proxy: Proxy,
    score: f64,
    last_used: Option<Instant>,
    inflight: u32,
}

struct Inner {
    entries: Vec<Entry>,
    cursor: usize,
    last_rotation: Instant,
    evicted_total: u64,
}

/// Thread-safe proxy pool.
///
/// Readers take snapshots of the descriptor; writers hold the lock only for
/// the mutation, so `next()` can never hand out a proxy a racing `remove`
/// already deleted.
pub struct ProxyPool {
    inner: RwLock<Inner>,
    config: ProxyPoolConfig,
}

impl ProxyPool {
    pub fn new(config: ProxyPoolConfig) -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: Vec::new(),
                cursor: 0,
                last_rotation: Instant::now(),
                evicted_total: 0,
            }),
            config,
        }
    }

    pub fn with_proxies(config: ProxyPoolConfig, proxies: Vec<Proxy>) -> Self {
        let pool = Self::new(config);
        for proxy in proxies {
            pool.add(proxy);
        }
        pool
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Round-robin selection. The cursor advances only when the rotation
    /// interval has elapsed since the last advance; rapid successive calls
    /// return the same proxy. `last_used` is stamped either way.
    pub fn next(&self) -> Result<Proxy, ProxyError> {
        let mut inner = self.inner.write();
        if inner.entries.is_empty() {
            return Err(ProxyError::Empty);
        }

        let interval = Duration::from_millis(self.config.rotation_interval_ms);
        if inner.last_rotation.elapsed() >= interval {
            inner.cursor = (inner.cursor + 1) % inner.entries.len();
            inner.last_rotation = Instant::now();
            debug!(cursor = inner.cursor, "proxy rotation advanced");
        }

        let cursor = inner.cursor.min(inner.entries.len() - 1);
        inner.cursor = cursor;
        let entry = &mut inner.entries[cursor];
        entry.last_used = Some(Instant::now());
        Ok(entry.proxy.clone())
    }

    /// Uniformly random selection.
    pub fn random(&self) -> Result<Proxy, ProxyError> {
        let mut inner = self.inner.write();
        if inner.entries.is_empty() {
            return Err(ProxyError::Empty);
        }
        let idx = rand::thread_rng().gen_range(0..inner.entries.len());
        let entry = &mut inner.entries[idx];
        entry.last_used = Some(Instant::now());
        Ok(entry.proxy.clone())
    }

    /// Highest-scored proxy.
    pub fn best(&self) -> Result<Proxy, ProxyError> {
        let mut inner = self.inner.write();
        if inner.entries.is_empty() {
            return Err(ProxyError::Empty);
        }
        let idx = inner
            .entries
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.score.total_cmp(&b.score))
            .map(|(i, _)| i)
            .expect("non-empty pool");
        let entry = &mut inner.entries[idx];
        entry.last_used = Some(Instant::now());
        Ok(entry.proxy.clone())
    }

    /// All proxies registered for a country code.
    pub fn by_country(&self, cc: &str) -> Vec<Proxy> {
        let cc = cc.to_ascii_lowercase();
        self.inner
            .read()
            .entries
            .iter()
            .filter(|e| {
                e.proxy
                    .country
                    .as_deref()
                    .is_some_and(|c| c.eq_ignore_ascii_case(&cc))
            })
            .map(|e| e.proxy.clone())
            .collect()
    }

    /// All residential proxies.
    pub fn residential(&self) -> Vec<Proxy> {
        self.inner
            .read()
            .entries
            .iter()
            .filter(|e| e.proxy.residential)
            .map(|e| e.proxy.clone())
            .collect()
    }

    /// Add a proxy at the initial score. Re-adding an existing key is a
    /// no-op.
    pub fn add(&self, proxy: Proxy) {
        let mut inner = self.inner.write();
        if inner.entries.iter().any(|e| e.proxy.key() == proxy.key()) {
            debug!(key = %proxy.key(), "proxy already pooled, skipping");
            return;
        }
        info!(key = %proxy.key(), scheme = %proxy.scheme, "proxy added");
        inner.entries.push(Entry {
            proxy,
            score: INITIAL_SCORE,
            last_used: None,
            inflight: 0,
        });
    }

    pub fn remove(&self, key: &str) -> Result<(), ProxyError> {
        let mut inner = self.inner.write();
        let idx = inner
            .entries
            .iter()
            .position(|e| e.proxy.key() == key)
            .ok_or_else(|| ProxyError::NotFound(key.to_string()))?;
        inner.entries.remove(idx);
        if inner.cursor >= idx && inner.cursor > 0 {
            inner.cursor -= 1;
        }
        info!(key, "proxy removed");
        Ok(())
    }

    /// EMA health update. A proxy whose score drops below the eviction
    /// threshold is removed and a warning emitted.
    pub fn update(&self, key: &str, ok: bool) -> Result<f64, ProxyError> {
        let mut inner = self.inner.write();
        let idx = inner
            .entries
            .iter()
            .position(|e| e.proxy.key() == key)
            .ok_or_else(|| ProxyError::NotFound(key.to_string()))?;

        let outcome = if ok { 1.0 } else { 0.0 };
        let entry = &mut inner.entries[idx];
        entry.score = (EMA_RETAIN * entry.score + (1.0 - EMA_RETAIN) * outcome).clamp(0.0, 1.0);
        let score = entry.score;
        debug!(key, score, ok, "proxy score updated");

        if score < EVICT_THRESHOLD {
            warn!(key, score, "proxy score below threshold, evicting");
            inner.entries.remove(idx);
            if inner.cursor >= idx && inner.cursor > 0 {
                inner.cursor -= 1;
            }
            inner.evicted_total += 1;
        }
        Ok(score)
    }

    /// Current score for a key, if pooled.
    pub fn score(&self, key: &str) -> Option<f64> {
        self.inner
            .read()
            .entries
            .iter()
            .find(|e| e.proxy.key() == key)
            .map(|e| e.score)
    }

    pub fn mark_inflight(&self, key: &str, delta: i32) {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.entries.iter_mut().find(|e| e.proxy.key() == key) {
            if delta >= 0 {
                entry.inflight = entry.inflight.saturating_add(delta as u32);
            } else {
                entry.inflight = entry.inflight.saturating_sub((-delta) as u32);
            }
        }
    }

    pub fn stats(&self) -> ProxyPoolStats {
        let inner = self.inner.read();
        let total = inner.entries.len();
        let average_score = if total == 0 {
            0.0
        } else {
            inner.entries.iter().map(|e| e.score).sum::<f64>() / total as f64
        };
        let best = inner
            .entries
            .iter()
            .max_by(|a, b| a.score.total_cmp(&b.score))
            .map(|e| e.proxy.key());
        ProxyPoolStats {
            total,
            residential: inner.entries.iter().filter(|e| e.proxy.residential).count(),
            average_score,
            best,
            evicted_total: inner.evicted_total,
        }
    }

    /// Produce the opaque driver handoff form for a proxy.
    pub fn to_driver_form(proxy: &Proxy) -> DriverProxy {
        DriverProxy {
            server: proxy.server_url(),
            username: proxy.auth.as_ref().map(|a| a.username.clone()),
            password: proxy.auth.as_ref().map(|a| a.password.clone()),
        }
    }

    /// Seed an entry at an explicit score. Test and bootstrap hook.
    pub fn add_with_score(&self, proxy: Proxy, score: f64) {
        self.add(proxy.clone());
        let mut inner = self.inner.write();
        if let Some(entry) = inner
            .entries
            .iter_mut()
            .find(|e| e.proxy.key() == proxy.key())
        {
            entry.score = score.clamp(0.0, 1.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> ProxyPool {
        ProxyPool::new(ProxyPoolConfig::default())
    }

    #[test]
    fn ema_update_moves_score_toward_outcome() {
        let p = pool();
        p.add(Proxy::new("10.0.0.1", 8080));
        let up = p.update("10.0.0.1:8080", true).unwrap();
        assert!(up > INITIAL_SCORE && up <= 1.0);
        let down = p.update("10.0.0.1:8080", false).unwrap();
        assert!(down < up && down >= 0.0);
    }

    #[test]
    fn best_returns_top_scored_and_failures_evict() {
        let p = pool();
        p.add_with_score(Proxy::new("10.0.0.1", 8080), 0.9);
        p.add_with_score(Proxy::new("10.0.0.2", 8080), 0.7);
        p.add_with_score(Proxy::new("10.0.0.3", 8080), 0.8);

        assert_eq!(p.best().unwrap().key(), "10.0.0.1:8080");

        let bumped = p.update("10.0.0.2:8080", true).unwrap();
        assert!(bumped > 0.7);

        // Repeated failures drive p1 under the eviction threshold.
        for _ in 0..10 {
            match p.update("10.0.0.1:8080", false) {
                Ok(_) => {}
                Err(_) => break,
            }
        }
        assert!(p.score("10.0.0.1:8080").is_none());
        assert_eq!(p.stats().total, 2);
        assert_eq!(p.stats().evicted_total, 1);
    }

    #[test]
    fn next_holds_proxy_within_rotation_interval() {
        let p = ProxyPool::new(ProxyPoolConfig {
            rotation_interval_ms: 60_000,
        });
        p.add(Proxy::new("10.0.0.1", 8080));
        p.add(Proxy::new("10.0.0.2", 8080));

        let first = p.next().unwrap();
        for _ in 0..5 {
            assert_eq!(p.next().unwrap().key(), first.key());
        }
    }

    #[test]
    fn next_advances_after_interval_elapses() {
        let p = ProxyPool::new(ProxyPoolConfig {
            rotation_interval_ms: 0,
        });
        p.add(Proxy::new("10.0.0.1", 8080));
        p.add(Proxy::new("10.0.0.2", 8080));

        let a = p.next().unwrap();
        let b = p.next().unwrap();
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn selection_filters() {
        let p = pool();
        let mut de = Proxy::new("10.0.0.1", 1080);
        de.country = Some("de".into());
        let mut us = Proxy::new("10.0.0.2", 1080);
        us.country = Some("us".into());
        us.residential = true;
        p.add(de);
        p.add(us);

        assert_eq!(p.by_country("DE").len(), 1);
        assert_eq!(p.residential().len(), 1);
        assert_eq!(p.residential()[0].key(), "10.0.0.2:1080");
    }

    #[test]
    fn empty_pool_errors() {
        let p = pool();
        assert!(matches!(p.next(), Err(ProxyError::Empty)));
        assert!(matches!(p.best(), Err(ProxyError::Empty)));
        assert!(matches!(p.random(), Err(ProxyError::Empty)));
    }

    #[test]
    fn driver_form_carries_credentials() {
        let mut proxy = Proxy::new("proxy.example.net", 3128);
        proxy.auth = Some(ProxyAuth {
            username: "user".into(),
            password: "pass".into(),
        });
        let form = ProxyPool::to_driver_form(&proxy);
        assert_eq!(form.server, "http://proxy.example.net:3128");
        assert_eq!(form.username.as_deref(), Some("user"));
        assert_eq!(form.password.as_deref(), Some("pass"));
    }
}
