//! Scripted browser driver for tests
//!
//! Implements the driver seam without a real browser. Pages returned by
//! `navigate` come from a scripted queue, falling back to a configurable
//! default; counters expose what the code under test did to the driver.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::session::{
    BrowserContext, BrowserError, BrowserLauncher, Cookie, LaunchRequest, PageSnapshot,
};

/// Shared observable state for one mock driver.
#[derive(Default)]
pub struct MockState {
    launched: AtomicUsize,
    closed: AtomicUsize,
    navigations: AtomicUsize,
    init_scripts: AtomicUsize,
    fail_launches: AtomicBool,
    fail_navigations: AtomicBool,
    default_html: Mutex<String>,
    default_status: Mutex<Option<u16>>,
    cookies: Mutex<Vec<Cookie>>,
    page_queue: Mutex<VecDeque<PageSnapshot>>,
    eval_queue: Mutex<VecDeque<serde_json::Value>>,
    last_request: Mutex<Option<LaunchRequest>>,
}

impl MockState {
    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::Relaxed)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn navigations(&self) -> usize {
        self.navigations.load(Ordering::Relaxed)
    }

    pub fn init_scripts(&self) -> usize {
        self.init_scripts.load(Ordering::Relaxed)
    }

    pub fn set_html(&self, html: &str) {
        *self.default_html.lock() = html.to_string();
    }

    pub fn set_status(&self, status: u16) {
        *self.default_status.lock() = Some(status);
    }

    pub fn set_cookies(&self, cookies: Vec<Cookie>) {
        *self.cookies.lock() = cookies;
    }

    /// Queue one page to be returned by the next navigation, ahead of the
    /// default.
    pub fn push_page(&self, page: PageSnapshot) {
        self.page_queue.lock().push_back(page);
    }

    /// Queue one value to be returned by the next `evaluate`.
    pub fn push_eval(&self, value: serde_json::Value) {
        self.eval_queue.lock().push_back(value);
    }

    pub fn fail_launches(&self, fail: bool) {
        self.fail_launches.store(fail, Ordering::Relaxed);
    }

    pub fn fail_navigations(&self, fail: bool) {
        self.fail_navigations.store(fail, Ordering::Relaxed);
    }

    pub fn last_request(&self) -> Option<LaunchRequest> {
        self.last_request.lock().clone()
    }
}

/// Launcher handing out contexts that share one [`MockState`].
#[derive(Default)]
pub struct MockLauncher {
    pub state: Arc<MockState>,
}

impl MockLauncher {
    pub fn with_html(html: &str) -> Self {
        let launcher = Self::default();
        launcher.state.set_html(html);
        launcher
    }
}

#[async_trait]
impl BrowserLauncher for MockLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<Box<dyn BrowserContext>, BrowserError> {
        if self.state.fail_launches.load(Ordering::Relaxed) {
            return Err(BrowserError::LaunchFailed("scripted launch failure".into()));
        }
        self.state.launched.fetch_add(1, Ordering::Relaxed);
        *self.state.last_request.lock() = Some(request.clone());
        Ok(Box::new(MockContext {
            state: self.state.clone(),
        }))
    }
}

struct MockContext {
    state: Arc<MockState>,
}

#[async_trait]
impl BrowserContext for MockContext {
    async fn navigate(&self, url: &str) -> Result<PageSnapshot, BrowserError> {
        if self.state.fail_navigations.load(Ordering::Relaxed) {
            return Err(BrowserError::NavigationFailed {
                url: url.to_string(),
                reason: "scripted navigation failure".into(),
            });
        }
        self.state.navigations.fetch_add(1, Ordering::Relaxed);
        if let Some(mut page) = self.state.page_queue.lock().pop_front() {
            page.url = url.to_string();
            return Ok(page);
        }
        Ok(PageSnapshot {
            url: url.to_string(),
            status: Some((*self.state.default_status.lock()).unwrap_or(200)),
            html: self.state.default_html.lock().clone(),
            cookies: self.state.cookies.lock().clone(),
        })
    }

    async fn evaluate(&self, _script: &str) -> Result<serde_json::Value, BrowserError> {
        Ok(self
            .state
            .eval_queue
            .lock()
            .pop_front()
            .unwrap_or(serde_json::Value::Null))
    }

    async fn set_init_script(&self, _script: &str) -> Result<(), BrowserError> {
        self.state.init_scripts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn set_extra_headers(
        &self,
        _headers: std::collections::HashMap<String, String>,
    ) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), BrowserError> {
        self.state.closed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
