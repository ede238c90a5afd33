//! Residential proxy provider
//!
//! Synthesizes proxy descriptors whose username encodes provider session
//! parameters (customer, country, session id, session time). Each
//! descriptor carries a fresh random session id so each browser session
//! egresses from a different residential IP. Session ids are never reused
//! within a provider instance.

use std::collections::HashSet;

use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;
use urlencoding::encode;

use super::pool::{Proxy, ProxyAuth, ProxyScheme};

/// Provider gateway configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResidentialProviderConfig {
    pub customer: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub scheme: ProxyScheme,
    /// Two-letter country code requested from the provider
    pub country: String,
    /// Minutes the provider pins one session to one IP
    pub session_duration_mins: u16,
    /// Consecutive failures after which rotation is forced
    pub max_failures: u32,
}

impl Default for ResidentialProviderConfig {
    fn default() -> Self {
        Self {
            customer: String::new(),
            password: String::new(),
            host: "pr.oxylabs.io".to_string(),
            port: 7777,
            scheme: ProxyScheme::Http,
            country: "us".to_string(),
            session_duration_mins: 30,
            max_failures: 3,
        }
    }
}

impl ResidentialProviderConfig {
    pub fn is_configured(&self) -> bool {
        !self.customer.is_empty() && !self.password.is_empty()
    }
}

/// Residential proxy descriptor factory.
///
/// The produced descriptors are ordinary [`Proxy`] values as far as the
/// pool is concerned; the provider semantics live entirely in the encoded
/// username.
pub struct ResidentialProvider {
    config: ResidentialProviderConfig,
    used_session_ids: Mutex<HashSet<u64>>,
}

impl ResidentialProvider {
    pub fn new(config: ResidentialProviderConfig) -> Self {
        Self {
            config,
            used_session_ids: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &ResidentialProviderConfig {
        &self.config
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    /// Consecutive-failure budget before rotation is forced externally.
    pub fn max_failures(&self) -> u32 {
        self.config.max_failures
    }

    /// Allocate a random session id, never reusing one from this instance.
    fn allocate_session_id(&self) -> u64 {
        let mut rng = rand::thread_rng();
        let mut used = self.used_session_ids.lock();
        loop {
            let id: u64 = rng.gen_range(100_000_000..999_999_999);
            if used.insert(id) {
                debug!(session_id = id, "allocated residential session id");
                return id;
            }
            // Collision: retry with a fresh draw.
        }
    }

    fn build_username(&self, session_id: u64) -> String {
        format!(
            "customer-{}-cc-{}-sessid-{}-sesstime-{}",
            self.config.customer, self.config.country, session_id, self.config.session_duration_mins
        )
    }

    /// Synthesize a fresh descriptor bound to a new provider session.
    pub fn synthesize(&self) -> Proxy {
        let session_id = self.allocate_session_id();
        Proxy {
            scheme: self.config.scheme,
            host: self.config.host.clone(),
            port: self.config.port,
            auth: Some(ProxyAuth {
                username: self.build_username(session_id),
                password: encode(&self.config.password).into_owned(),
            }),
            country: Some(self.config.country.clone()),
            residential: true,
        }
    }

    /// Synthesize one descriptor per requested slot.
    pub fn synthesize_batch(&self, count: usize) -> Vec<Proxy> {
        (0..count).map(|_| self.synthesize()).collect()
    }
}
