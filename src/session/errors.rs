//! Browser and session error types

use thiserror::Error;

/// Errors crossing the browser driver seam and the session pool.
#[derive(Error, Debug)]
pub enum BrowserError {
    #[error("failed to launch browser context: {0}")]
    LaunchFailed(String),

    #[error("navigation failed for {url}: {reason}")]
    NavigationFailed { url: String, reason: String },

    #[error("JavaScript error: {0}")]
    JavaScriptError(String),

    #[error("connection to browser lost: {0}")]
    ConnectionLost(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("session {0} is closed")]
    SessionClosed(String),

    #[error("session pool error: {0}")]
    PoolError(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
