//! Fetch-based fallback driver
//!
//! Implements the browser seam over a plain HTTP client so the CLI works
//! without a browser installation. Navigations are real requests carrying
//! the identity's headers and the bound proxy; page scripts do not run, so
//! `evaluate` is a no-op returning null and init scripts are accepted but
//! inert. Wire a real browser driver through [`BrowserLauncher`] for full
//! fidelity.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::session::{
    BrowserContext, BrowserError, BrowserLauncher, Cookie, LaunchRequest, PageSnapshot,
};

/// Launcher producing HTTP-client contexts.
#[derive(Debug, Default)]
pub struct HttpLauncher;

impl HttpLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrowserLauncher for HttpLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<Box<dyn BrowserContext>, BrowserError> {
        let mut builder = reqwest::Client::builder()
            .timeout(request.timeout)
            .redirect(reqwest::redirect::Policy::limited(10));

        if let Some(proxy) = &request.proxy {
            let mut p = reqwest::Proxy::all(&proxy.server)
                .map_err(|e| BrowserError::LaunchFailed(format!("invalid proxy: {e}")))?;
            if let (Some(username), Some(password)) = (&proxy.username, &proxy.password) {
                p = p.basic_auth(username, password);
            }
            builder = builder.proxy(p);
        }

        let client = builder
            .build()
            .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;

        debug!(platform = %request.identity.platform, "http context opened");
        Ok(Box::new(HttpContext {
            client,
            headers: Mutex::new(HashMap::new()),
        }))
    }
}

struct HttpContext {
    client: reqwest::Client,
    headers: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl BrowserContext for HttpContext {
    async fn navigate(&self, url: &str) -> Result<PageSnapshot, BrowserError> {
        let mut request = self.client.get(url);
        for (name, value) in self.headers.lock().iter() {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                BrowserError::Timeout(format!("navigation to {url}"))
            } else if e.is_connect() {
                BrowserError::ConnectionLost(e.to_string())
            } else {
                BrowserError::NavigationFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let cookies = response
            .headers()
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|value| {
                let raw = value.to_str().ok()?;
                let pair = raw.split(';').next()?;
                let (name, value) = pair.split_once('=')?;
                Some(Cookie {
                    name: name.trim().to_string(),
                    value: value.trim().to_string(),
                    domain: String::new(),
                })
            })
            .collect();
        let html = response
            .text()
            .await
            .map_err(|e| BrowserError::NavigationFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        Ok(PageSnapshot {
            url: final_url,
            status: Some(status),
            html,
            cookies,
        })
    }

    async fn evaluate(&self, _script: &str) -> Result<serde_json::Value, BrowserError> {
        // No JS engine behind this driver.
        debug!("evaluate is a no-op on the http driver");
        Ok(serde_json::Value::Null)
    }

    async fn set_init_script(&self, _script: &str) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn set_extra_headers(
        &self,
        headers: HashMap<String, String>,
    ) -> Result<(), BrowserError> {
        self.headers.lock().extend(headers);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrowserError> {
        Ok(())
    }
}
