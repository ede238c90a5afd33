//! Adaptive rate limiting
//!
//! Multi-window request admission with a concurrency cap and escalating
//! backoff, shared by every worker in the pool.

mod limiter;

pub use limiter::{with_rate_limit, RateError, RateLimiter, RateLimiterConfig, RateSlot, RateStats};
