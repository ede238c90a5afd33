//! Browser session lifecycle
//!
//! A bounded pool of live browser contexts, each bound to one identity and
//! optionally one proxy. The concrete browser lives behind the
//! [`BrowserContext`]/[`BrowserLauncher`] seam; the pool never constructs
//! one directly.

mod context;
mod errors;
mod pool;

pub use context::{
    identity_headers, stealth_init_script, BrowserContext, BrowserLauncher, Cookie, LaunchRequest,
    PageSnapshot,
};
pub use errors::BrowserError;
pub use pool::{
    LeaseOptions, Session, SessionLease, SessionPool, SessionPoolConfig, SessionPoolStats,
    SessionState,
};
