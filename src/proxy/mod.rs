//! Proxy rotation and health tracking
//!
//! A scored pool of egress proxies with EMA-based health, rotation-interval
//! round-robin, list-file loading, and a residential provider that encodes
//! session parameters into the proxy username.

mod check;
mod list;
mod pool;
mod residential;

pub use check::{probe_proxy, ProbeResult};
pub use list::{format_proxy_line, load_proxy_list, parse_proxy_line};
pub use pool::{DriverProxy, Proxy, ProxyAuth, ProxyError, ProxyPool, ProxyPoolConfig, ProxyPoolStats, ProxyScheme};
pub use residential::{ResidentialProvider, ResidentialProviderConfig};
