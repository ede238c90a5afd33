//! gauntlet
//!
//! Bot-detection resilience testing through orchestrated headless-browser
//! sessions: a priority task queue feeding a worker pool, a bounded session
//! pool with synthesized identities and rotating proxies, multi-window rate
//! limiting with backoff, and detection-driven feedback between all three.

pub mod audit;
pub mod detect;
pub mod driver;
pub mod identity;
pub mod metrics;
pub mod proxy;
pub mod queue;
pub mod rate;
pub mod scheduler;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use detect::DetectionAggregator;
use identity::{IdentityAssembler, IdentityConfig};
use metrics::{Alerting, HealthMonitor, HealthThresholds, MetricsConfig, MetricsHub};
use proxy::{load_proxy_list, ProxyPool, ProxyPoolConfig};
use queue::{QueueConfig, Task, TaskQueue, TaskResult};
use rate::{RateLimiter, RateLimiterConfig};
use scheduler::{WorkerConfig, WorkerContext, WorkerPool};
use session::{BrowserLauncher, SessionPool, SessionPoolConfig};

/// Configuration errors are fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration for {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Redis connection parameters, recognized for distributed queue backends.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedisConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_redis_port() -> u16 {
    6379
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_redis_port(),
            password: None,
        }
    }
}

impl RedisConfig {
    /// Connection URL when a host is configured.
    pub fn url(&self) -> Option<String> {
        let host = self.host.as_deref()?;
        Some(match &self.password {
            Some(password) => format!("redis://:{password}@{host}:{}", self.port),
            None => format!("redis://{host}:{}", self.port),
        })
    }
}

/// Application configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub proxy_enabled: bool,
    #[serde(default)]
    pub proxy_list_file: Option<PathBuf>,
    #[serde(default = "default_max_browsers")]
    pub max_concurrent_browsers: usize,
    /// Default per-task execution cap, ms.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_headless")]
    pub headless: bool,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub report_dir: Option<PathBuf>,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub rate: RateLimiterConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
}

fn default_max_browsers() -> usize {
    5
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_headless() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            proxy_enabled: false,
            proxy_list_file: None,
            max_concurrent_browsers: default_max_browsers(),
            default_timeout_ms: default_timeout_ms(),
            headless: default_headless(),
            log_dir: None,
            report_dir: None,
            redis: RedisConfig::default(),
            rate: RateLimiterConfig::default(),
            queue: QueueConfig::default(),
            workers: WorkerConfig::default(),
            identity: IdentityConfig::default(),
        }
    }
}

impl AppConfig {
    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("gauntlet").join("config.json"))
    }

    /// Load from the config file when present, else defaults. A malformed
    /// file is fatal.
    pub fn load() -> Result<Self, ConfigError> {
        match Self::config_path() {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(&path)?;
                let config = serde_json::from_str(&content)?;
                info!(path = %path.display(), "config loaded");
                Ok(config)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let Some(path) = Self::config_path() else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        info!(path = %path.display(), "config saved");
        Ok(())
    }

    /// File config overlaid with the recognized environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::load()?;
        config.apply_env()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(value) = std::env::var("PROXY_ENABLED") {
            self.proxy_enabled = parse_bool("PROXY_ENABLED", &value)?;
        }
        if let Ok(value) = std::env::var("PROXY_LIST_FILE") {
            self.proxy_list_file = Some(PathBuf::from(value));
        }
        if let Ok(value) = std::env::var("MAX_CONCURRENT_BROWSERS") {
            self.max_concurrent_browsers =
                parse_number("MAX_CONCURRENT_BROWSERS", &value)? as usize;
        }
        if let Ok(value) = std::env::var("DEFAULT_TIMEOUT") {
            self.default_timeout_ms = parse_number("DEFAULT_TIMEOUT", &value)?;
        }
        if let Ok(value) = std::env::var("LOG_DIR") {
            self.log_dir = Some(PathBuf::from(value));
        }
        if let Ok(value) = std::env::var("VULNERABILITY_REPORT_DIR") {
            self.report_dir = Some(PathBuf::from(value));
        }
        if let Ok(value) = std::env::var("REDIS_HOST") {
            self.redis.host = Some(value);
        }
        if let Ok(value) = std::env::var("REDIS_PORT") {
            self.redis.port = parse_number("REDIS_PORT", &value)? as u16;
        }
        if let Ok(value) = std::env::var("REDIS_PASSWORD") {
            self.redis.password = Some(value);
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_browsers == 0 {
            return Err(ConfigError::Invalid {
                field: "maxConcurrentBrowsers".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.rate.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid {
                field: "rate.backoffMultiplier".into(),
                reason: "must be >= 1.0".into(),
            });
        }
        Ok(())
    }
}

fn parse_bool(field: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::Invalid {
            field: field.into(),
            reason: format!("not a boolean: {value}"),
        }),
    }
}

fn parse_number(field: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        field: field.into(),
        reason: format!("not a number: {value}"),
    })
}

/// Resolve the log directory: config first, else the platform config dir.
pub fn log_dir(config: &AppConfig) -> Option<PathBuf> {
    config
        .log_dir
        .clone()
        .or_else(|| dirs::config_dir().map(|p| p.join("gauntlet").join("logs")))
}

/// Initialize logging: console layer always, daily-rolling file layer when
/// a log directory resolves. `LOG_LEVEL` drives the filter (default info).
pub fn init_logging(config: &AppConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_env("LOG_LEVEL")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let console_layer = tracing_subscriber::fmt::layer().with_target(true);

    if let Some(dir) = log_dir(config) {
        let _ = std::fs::create_dir_all(&dir);
        let file_appender = tracing_appender::rolling::daily(&dir, "gauntlet.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_writer(non_blocking);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
        None
    }
}

/// The single handle owning all subsystem state. No module-level mutable
/// state exists anywhere; everything is reachable from here.
pub struct Runtime {
    pub config: AppConfig,
    pub proxies: Arc<ProxyPool>,
    pub limiter: Arc<RateLimiter>,
    pub sessions: Arc<SessionPool>,
    pub metrics: Arc<MetricsHub>,
    pub alerting: Arc<Alerting>,
    pub aggregator: Arc<DetectionAggregator>,
    pub queue: Arc<TaskQueue>,
    pub workers: WorkerPool,
    cancel: CancellationToken,
}

impl Runtime {
    /// Wire the full subsystem graph over the in-memory queue backend.
    pub fn new(config: AppConfig, launcher: Arc<dyn BrowserLauncher>) -> Result<Self, ConfigError> {
        config.validate()?;
        let cancel = CancellationToken::new();

        let proxies = Arc::new(ProxyPool::new(ProxyPoolConfig::default()));
        if let Some(path) = &config.proxy_list_file {
            for proxy in load_proxy_list(path)? {
                proxies.add(proxy);
            }
        }
        if config.proxy_enabled && proxies.is_empty() {
            warn!("proxying enabled but the pool is empty; sessions will run direct");
        }

        let limiter = Arc::new(RateLimiter::new(config.rate.clone(), cancel.child_token()));
        let metrics = Arc::new(MetricsHub::new(MetricsConfig::default()));
        let alerting = Arc::new(Alerting::new());
        let sessions = Arc::new(SessionPool::new(
            SessionPoolConfig {
                max_sessions: config.max_concurrent_browsers,
                headless: config.headless,
                use_proxy: config.proxy_enabled,
                identity: config.identity.clone(),
                ..Default::default()
            },
            launcher,
            Arc::new(IdentityAssembler::new()),
            proxies.clone(),
            cancel.child_token(),
        ));
        let aggregator = Arc::new(DetectionAggregator::new(
            limiter.clone(),
            proxies.clone(),
            metrics.clone(),
        ));
        let queue = Arc::new(TaskQueue::in_memory(
            config.queue.clone(),
            cancel.child_token(),
        ));

        let worker_config = WorkerConfig {
            use_proxy: config.proxy_enabled,
            default_timeout_ms: config.default_timeout_ms,
            ..config.workers.clone()
        };
        let workers = WorkerPool::new(
            worker_config,
            WorkerContext {
                queue: queue.clone(),
                limiter: limiter.clone(),
                sessions: sessions.clone(),
                aggregator: aggregator.clone(),
                metrics: metrics.clone(),
            },
            cancel.child_token(),
        );

        Ok(Self {
            config,
            proxies,
            limiter,
            sessions,
            metrics,
            alerting,
            aggregator,
            queue,
            workers,
            cancel,
        })
    }

    /// Spawn the periodic health monitor against this runtime's metrics.
    pub fn spawn_health_monitor(
        &self,
        interval: Duration,
        thresholds: HealthThresholds,
    ) -> tokio::task::JoinHandle<()> {
        HealthMonitor::new(interval, thresholds).start(
            self.metrics.clone(),
            self.alerting.clone(),
            self.cancel.child_token(),
        )
    }

    /// Run one task through the full pipeline and wait for its outcome.
    /// Workers must be started.
    pub async fn run_task(&self, task: Task) -> Result<TaskResult, queue::QueueError> {
        let (tx, rx) = tokio::sync::oneshot::channel::<TaskResult>();
        let slot = Arc::new(parking_lot::Mutex::new(Some(tx)));

        let sender = slot.clone();
        let wanted = task.id.clone();
        self.queue.on_completed(move |done, result| {
            if done.id == wanted {
                if let Some(tx) = sender.lock().take() {
                    let _ = tx.send(result.clone());
                }
            }
        });
        let sender = slot;
        let wanted = task.id.clone();
        self.queue.on_failed(move |done, reason| {
            if done.id == wanted {
                if let Some(tx) = sender.lock().take() {
                    let _ = tx.send(TaskResult {
                        failed: true,
                        reason: Some(reason.to_string()),
                        ..Default::default()
                    });
                }
            }
        });

        self.queue.enqueue(task).await?;
        rx.await.map_err(|_| queue::QueueError::Cancelled)
    }

    /// Tear everything down. Safe to call in any state and idempotent:
    /// stop leasing, cancel in-flight work, close sessions, then cancel
    /// the root token.
    pub async fn shutdown(&self) {
        info!("runtime shutting down");
        self.workers.stop().await;
        self.sessions.close_all().await;
        self.cancel.cancel();
        let report = self.metrics.metrics(Duration::from_secs(300));
        info!(
            requests = report.requests.total,
            detections = report.detections.total,
            "final metrics window flushed"
        );
    }
}
