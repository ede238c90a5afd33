//! Worker scheduling
//!
//! A fixed pool of long-running workers drains the task queue. Each worker
//! is sequential internally; all cross-worker coordination happens through
//! the rate limiter, the session pool, and the queue.

mod workers;

pub use workers::{WorkerConfig, WorkerContext, WorkerPool};
