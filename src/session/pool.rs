//! Bounded browser session pool
//!
//! Sessions are opened against the driver seam, bound to one identity (and
//! optionally one proxy) at creation, reused while idle, LRU-evicted on
//! overflow, and closed definitively on rotation or shutdown. Leases are
//! exclusive: a session has at most one owner at a time, and an unreleased
//! lease returns its session to the idle set on drop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::detect::Detection;
use crate::identity::{Identity, IdentityConfig, IdentityGenerator, Platform};
use crate::proxy::{Proxy, ProxyPool};

use super::context::{
    identity_headers, stealth_init_script, BrowserContext, BrowserLauncher, LaunchRequest,
    PageSnapshot,
};
use super::errors::BrowserError;

/// Session pool configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPoolConfig {
    /// Hard cap on open sessions, counting ones still opening.
    pub max_sessions: usize,
    /// Idle sessions older than this are closed on the next pool touch, ms.
    pub max_idle_ms: u64,
    pub headless: bool,
    /// Default for leases that do not specify `use_proxy`.
    pub use_proxy: bool,
    pub launch_timeout_ms: u64,
    /// Template for identities bound to new sessions.
    pub identity: IdentityConfig,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: 5,
            max_idle_ms: 300_000,
            headless: true,
            use_proxy: false,
            launch_timeout_ms: 45_000,
            identity: IdentityConfig::default(),
        }
    }
}

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Opening,
    Idle,
    InUse,
    Closing,
    Closed,
}

/// One live browser context bound to an identity and optional proxy.
///
/// The proxy is referenced by `host:port` key, never owned; the browser
/// handle is owned exclusively and closed with the session.
pub struct Session {
    pub id: Uuid,
    identity: Identity,
    proxy_key: Option<String>,
    persist_cookies: bool,
    started_at: Instant,
    last_used: Mutex<Instant>,
    request_count: AtomicU64,
    detections: Mutex<Vec<Detection>>,
    state: Mutex<SessionState>,
    closed: AtomicBool,
    context: Box<dyn BrowserContext>,
}

impl Session {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn proxy_key(&self) -> Option<&str> {
        self.proxy_key.as_deref()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Snapshot of all detections observed on this session.
    pub fn detections(&self) -> Vec<Detection> {
        self.detections.lock().clone()
    }

    /// Append detections atomically, before the caller inspects them.
    pub fn record_detections(&self, detections: &[Detection]) {
        self.detections.lock().extend_from_slice(detections);
    }

    /// Navigate through the owned context. Fails with `SessionClosed` when
    /// the session was closed externally while held.
    pub async fn navigate(&self, url: &str) -> Result<PageSnapshot, BrowserError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrowserError::SessionClosed(self.id.to_string()));
        }
        self.request_count.fetch_add(1, Ordering::Relaxed);
        *self.last_used.lock() = Instant::now();
        self.context.navigate(url).await
    }

    pub async fn evaluate(&self, script: &str) -> Result<serde_json::Value, BrowserError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrowserError::SessionClosed(self.id.to_string()));
        }
        self.context.evaluate(script).await
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    async fn close_context(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_state(SessionState::Closing);
        if let Err(e) = self.context.close().await {
            warn!(session = %self.id, "error closing browser context: {e}");
        }
        self.set_state(SessionState::Closed);
        debug!(session = %self.id, "session closed");
    }
}

/// Lease options
#[derive(Debug, Clone, Default)]
pub struct LeaseOptions {
    /// Override the pool's default proxy policy.
    pub use_proxy: Option<bool>,
    /// Bind exactly this proxy instead of drawing from the pool.
    pub specific_proxy: Option<Proxy>,
    pub persist_cookies: bool,
    /// Prefer reusing an idle session on this platform.
    pub prefer_identity: Option<Platform>,
    /// Skip idle reuse and always open a fresh session.
    pub fresh: bool,
}

/// Pool snapshot
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPoolStats {
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
    pub max_sessions: usize,
}

#[derive(Default)]
struct PoolInner {
    idle: Vec<Arc<Session>>,
    in_use: HashMap<Uuid, Arc<Session>>,
    opening: usize,
}

impl PoolInner {
    fn total(&self) -> usize {
        self.idle.len() + self.in_use.len() + self.opening
    }
}

enum Plan {
    Reuse(Arc<Session>),
    Open,
    Evict(Arc<Session>),
    Wait,
}

struct Shared {
    inner: Mutex<PoolInner>,
    notify: Notify,
    launcher: Arc<dyn BrowserLauncher>,
    identities: Arc<dyn IdentityGenerator>,
    proxies: Arc<ProxyPool>,
    config: SessionPoolConfig,
    cancel: CancellationToken,
}

impl Shared {
    fn plan_lease(&self, inner: &mut PoolInner, opts: &LeaseOptions) -> Plan {
        if !opts.fresh {
            if let Some(pos) = inner.idle.iter().position(|s| self.reusable(s, opts)) {
                let session = inner.idle.remove(pos);
                session.set_state(SessionState::InUse);
                *session.last_used.lock() = Instant::now();
                inner.in_use.insert(session.id, session.clone());
                return Plan::Reuse(session);
            }
        }

        if inner.total() < self.config.max_sessions {
            inner.opening += 1;
            return Plan::Open;
        }

        // At capacity: evict the idle session with the earliest last use.
        if let Some(pos) = inner
            .idle
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.last_used())
            .map(|(i, _)| i)
        {
            let session = inner.idle.remove(pos);
            return Plan::Evict(session);
        }

        Plan::Wait
    }

    fn reusable(&self, session: &Session, opts: &LeaseOptions) -> bool {
        if session.persist_cookies != opts.persist_cookies {
            return false;
        }
        if let Some(platform) = opts.prefer_identity {
            if session.identity.platform != platform {
                return false;
            }
        }
        if let Some(proxy) = &opts.specific_proxy {
            if session.proxy_key.as_deref() != Some(proxy.key().as_str()) {
                return false;
            }
        }
        true
    }

    fn take_stale(&self, inner: &mut PoolInner) -> Vec<Arc<Session>> {
        let max_idle = Duration::from_millis(self.config.max_idle_ms);
        let mut stale = Vec::new();
        let mut i = 0;
        while i < inner.idle.len() {
            if inner.idle[i].last_used().elapsed() >= max_idle {
                stale.push(inner.idle.remove(i));
            } else {
                i += 1;
            }
        }
        stale
    }

    /// Open a browser context and bind a freshly assembled identity to it.
    /// Binding happens exactly once; re-application is unsupported, rotate
    /// instead.
    async fn open_session(&self, opts: &LeaseOptions) -> Result<Arc<Session>, BrowserError> {
        let mut identity_config = self.config.identity.clone();
        if let Some(platform) = opts.prefer_identity {
            identity_config.platform = Some(platform);
        }
        let identity = self.identities.generate(&identity_config);

        let use_proxy = opts.use_proxy.unwrap_or(self.config.use_proxy);
        let proxy = if let Some(specific) = &opts.specific_proxy {
            Some(specific.clone())
        } else if use_proxy {
            match self.proxies.next() {
                Ok(p) => Some(p),
                Err(e) => {
                    debug!("no proxy available, opening direct session: {e}");
                    None
                }
            }
        } else {
            None
        };
        let proxy_key = proxy.as_ref().map(|p| p.key());

        let request = LaunchRequest {
            identity: identity.clone(),
            proxy: proxy.as_ref().map(ProxyPool::to_driver_form),
            persist_cookies: opts.persist_cookies,
            headless: self.config.headless,
            timeout: Duration::from_millis(self.config.launch_timeout_ms),
        };

        let context = tokio::time::timeout(
            Duration::from_millis(self.config.launch_timeout_ms),
            self.launcher.launch(&request),
        )
        .await
        .map_err(|_| BrowserError::Timeout("browser launch".into()))??;

        context.set_init_script(&stealth_init_script(&identity)).await?;
        context.set_extra_headers(identity_headers(&identity)).await?;

        if let Some(key) = &proxy_key {
            self.proxies.mark_inflight(key, 1);
        }

        let session = Arc::new(Session {
            id: Uuid::new_v4(),
            identity,
            proxy_key,
            persist_cookies: opts.persist_cookies,
            started_at: Instant::now(),
            last_used: Mutex::new(Instant::now()),
            request_count: AtomicU64::new(0),
            detections: Mutex::new(Vec::new()),
            state: Mutex::new(SessionState::InUse),
            closed: AtomicBool::new(false),
            context,
        });
        info!(session = %session.id, platform = %session.identity.platform,
              proxy = session.proxy_key.as_deref().unwrap_or("direct"),
              "session opened");
        Ok(session)
    }

    /// Return a leased session to the idle set. Sync so it can run from a
    /// lease guard's drop.
    fn reclaim(&self, session: Arc<Session>) {
        if session.closed.load(Ordering::Acquire) {
            let mut inner = self.inner.lock();
            inner.in_use.remove(&session.id);
            drop(inner);
            self.notify.notify_waiters();
            return;
        }
        session.set_state(SessionState::Idle);
        *session.last_used.lock() = Instant::now();
        let mut inner = self.inner.lock();
        inner.in_use.remove(&session.id);
        inner.idle.push(session);
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Close a session's context and release its proxy reference.
    async fn close_session(&self, session: &Arc<Session>) {
        if let Some(key) = session.proxy_key.as_deref() {
            self.proxies.mark_inflight(key, -1);
        }
        session.close_context().await;
        self.notify.notify_waiters();
    }

    async fn discard(&self, session: Arc<Session>) {
        {
            let mut inner = self.inner.lock();
            inner.in_use.remove(&session.id);
        }
        self.close_session(&session).await;
    }

}

async fn lease_shared(shared: &Arc<Shared>, opts: LeaseOptions) -> Result<SessionLease, BrowserError> {
    loop {
        let notified = shared.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let (plan, stale) = {
            let mut inner = shared.inner.lock();
            let stale = shared.take_stale(&mut inner);
            let plan = shared.plan_lease(&mut inner, &opts);
            (plan, stale)
        };

        for session in stale {
            debug!(session = %session.id, "closing stale idle session");
            shared.close_session(&session).await;
        }

        match plan {
            Plan::Reuse(session) => {
                debug!(session = %session.id, "idle session reused");
                return Ok(SessionLease {
                    shared: shared.clone(),
                    session: Some(session),
                });
            }
            Plan::Open => {
                return match shared.open_session(&opts).await {
                    Ok(session) => {
                        let mut inner = shared.inner.lock();
                        inner.opening -= 1;
                        inner.in_use.insert(session.id, session.clone());
                        Ok(SessionLease {
                            shared: shared.clone(),
                            session: Some(session),
                        })
                    }
                    Err(e) => {
                        let mut inner = shared.inner.lock();
                        inner.opening -= 1;
                        drop(inner);
                        shared.notify.notify_waiters();
                        Err(e)
                    }
                };
            }
            Plan::Evict(session) => {
                info!(session = %session.id, "evicting LRU idle session");
                shared.close_session(&session).await;
            }
            Plan::Wait => {
                tokio::select! {
                    _ = shared.cancel.cancelled() => return Err(BrowserError::Cancelled),
                    _ = &mut notified => {}
                }
            }
        }
    }
}

/// Bounded pool of live browser sessions. Cheap to clone; all clones share
/// one pool.
#[derive(Clone)]
pub struct SessionPool {
    shared: Arc<Shared>,
}

impl SessionPool {
    pub fn new(
        config: SessionPoolConfig,
        launcher: Arc<dyn BrowserLauncher>,
        identities: Arc<dyn IdentityGenerator>,
        proxies: Arc<ProxyPool>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(PoolInner::default()),
                notify: Notify::new(),
                launcher,
                identities,
                proxies,
                config,
                cancel,
            }),
        }
    }

    pub fn config(&self) -> &SessionPoolConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> SessionPoolStats {
        let inner = self.shared.inner.lock();
        SessionPoolStats {
            total: inner.total(),
            idle: inner.idle.len(),
            in_use: inner.in_use.len(),
            max_sessions: self.shared.config.max_sessions,
        }
    }

    /// Lease a session for exclusive use.
    ///
    /// Reuses a suitable idle session when one exists, opens a new one under
    /// the cap, evicts the least-recently-used idle session when the cap is
    /// reached, and otherwise blocks until a release or cancellation.
    pub async fn lease(&self, opts: LeaseOptions) -> Result<SessionLease, BrowserError> {
        lease_shared(&self.shared, opts).await
    }

    /// Close every session, idle and in-use. Workers holding a lease see
    /// `SessionClosed` on their next operation.
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut inner = self.shared.inner.lock();
            let idle: Vec<Arc<Session>> = inner.idle.drain(..).collect();
            let in_use: Vec<Arc<Session>> = inner.in_use.drain().map(|(_, s)| s).collect();
            idle.into_iter().chain(in_use.into_iter()).collect()
        };
        for session in sessions {
            self.shared.close_session(&session).await;
        }
        info!("all sessions closed");
    }
}

/// Exclusive ownership of one pooled session.
///
/// Dropping the lease returns the session to the idle set; `rotate` and
/// `close` consume it. The scoped guard guarantees release on every exit
/// path, panics included.
pub struct SessionLease {
    shared: Arc<Shared>,
    session: Option<Arc<Session>>,
}

impl SessionLease {
    pub fn session(&self) -> &Arc<Session> {
        self.session.as_ref().expect("lease holds a session until consumed")
    }

    /// Return the session to the pool's idle set.
    pub fn release(mut self) {
        if let Some(session) = self.session.take() {
            self.shared.reclaim(session);
        }
    }

    /// Close this session and lease a fresh one with a new identity and
    /// proxy.
    pub async fn rotate(mut self) -> Result<SessionLease, BrowserError> {
        let shared = self.shared.clone();
        let opts = if let Some(session) = self.session.take() {
            let opts = LeaseOptions {
                use_proxy: Some(session.proxy_key.is_some()),
                persist_cookies: session.persist_cookies,
                fresh: true,
                ..Default::default()
            };
            shared.discard(session).await;
            opts
        } else {
            LeaseOptions {
                fresh: true,
                ..Default::default()
            }
        };
        lease_shared(&shared, opts).await
    }

    /// Close the session definitively.
    pub async fn close(mut self) {
        if let Some(session) = self.session.take() {
            self.shared.discard(session).await;
        }
    }
}

impl std::ops::Deref for SessionLease {
    type Target = Session;

    fn deref(&self) -> &Self::Target {
        self.session()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.shared.reclaim(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityAssembler;
    use crate::proxy::ProxyPoolConfig;
    use crate::testing::MockLauncher;

    fn pool_with(max_sessions: usize, launcher: Arc<MockLauncher>) -> SessionPool {
        SessionPool::new(
            SessionPoolConfig {
                max_sessions,
                ..Default::default()
            },
            launcher,
            Arc::new(IdentityAssembler::new()),
            Arc::new(ProxyPool::new(ProxyPoolConfig::default())),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn lease_opens_and_binds_identity_once() {
        let launcher = Arc::new(MockLauncher::default());
        let pool = pool_with(2, launcher.clone());

        let lease = pool.lease(LeaseOptions::default()).await.unwrap();
        assert_eq!(lease.state(), SessionState::InUse);
        assert_eq!(launcher.state.launched(), 1);
        assert_eq!(launcher.state.init_scripts(), 1);
        lease.release();
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn release_then_lease_reuses_idle_session() {
        let launcher = Arc::new(MockLauncher::default());
        let pool = pool_with(2, launcher.clone());

        let first = pool.lease(LeaseOptions::default()).await.unwrap();
        let id = first.id;
        first.release();

        let second = pool.lease(LeaseOptions::default()).await.unwrap();
        assert_eq!(second.id, id);
        assert_eq!(launcher.state.launched(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn single_slot_pool_blocks_second_lease() {
        let launcher = Arc::new(MockLauncher::default());
        let pool = pool_with(1, launcher.clone());

        let held = pool.lease(LeaseOptions::default()).await.unwrap();
        assert_eq!(pool.stats().total, 1);

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            pool.lease(LeaseOptions::default()),
        )
        .await;
        assert!(blocked.is_err(), "second lease must wait");

        held.release();
        let lease = tokio::time::timeout(
            Duration::from_millis(50),
            pool.lease(LeaseOptions::default()),
        )
        .await
        .expect("lease after release")
        .unwrap();
        assert_eq!(pool.stats().total, 1);
        lease.release();
    }

    #[tokio::test]
    async fn fresh_lease_evicts_lru_idle_at_capacity() {
        let launcher = Arc::new(MockLauncher::default());
        let pool = pool_with(1, launcher.clone());

        let first = pool.lease(LeaseOptions::default()).await.unwrap();
        let first_id = first.id;
        first.release();

        let rotated = pool
            .lease(LeaseOptions {
                fresh: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_ne!(rotated.id, first_id);
        assert_eq!(launcher.state.closed(), 1);
        assert_eq!(pool.stats().total, 1);
        rotated.release();
    }

    #[tokio::test]
    async fn rotate_swaps_session() {
        let launcher = Arc::new(MockLauncher::default());
        let pool = pool_with(2, launcher.clone());

        let lease = pool.lease(LeaseOptions::default()).await.unwrap();
        let old_id = lease.id;
        let rotated = lease.rotate().await.unwrap();
        assert_ne!(rotated.id, old_id);
        assert_eq!(launcher.state.closed(), 1);
        rotated.release();
    }

    #[tokio::test]
    async fn external_close_propagates_to_holder() {
        let launcher = Arc::new(MockLauncher::default());
        let pool = pool_with(1, launcher.clone());

        let lease = pool.lease(LeaseOptions::default()).await.unwrap();
        pool.close_all().await;

        match lease.navigate("https://example.com").await {
            Err(BrowserError::SessionClosed(_)) => {}
            other => panic!("expected SessionClosed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_lease_returns_session_to_idle() {
        let launcher = Arc::new(MockLauncher::default());
        let pool = pool_with(1, launcher.clone());

        {
            let _lease = pool.lease(LeaseOptions::default()).await.unwrap();
            assert_eq!(pool.stats().in_use, 1);
        }
        assert_eq!(pool.stats().idle, 1);
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test]
    async fn capacity_never_exceeded() {
        let launcher = Arc::new(MockLauncher::default());
        let pool = pool_with(2, launcher.clone());

        let a = pool.lease(LeaseOptions::default()).await.unwrap();
        let b = pool.lease(LeaseOptions::default()).await.unwrap();
        assert_eq!(pool.stats().total, 2);
        assert!(pool.stats().total <= pool.config().max_sessions);
        a.release();
        b.release();
        assert_eq!(pool.stats().total, 2);
    }

    #[tokio::test]
    async fn launch_failure_frees_the_opening_slot() {
        let launcher = Arc::new(MockLauncher::default());
        launcher.state.fail_launches(true);
        let pool = pool_with(1, launcher.clone());

        assert!(pool.lease(LeaseOptions::default()).await.is_err());
        assert_eq!(pool.stats().total, 0);

        launcher.state.fail_launches(false);
        let lease = pool.lease(LeaseOptions::default()).await.unwrap();
        lease.release();
    }
}
