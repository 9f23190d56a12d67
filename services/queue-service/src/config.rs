//! Configuration for the queue service.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;
use std::time::Duration;

/// Service configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueServiceConfig {
    /// Network configuration.
    #[serde(default)]
    pub service: ServiceConfig,
    /// Job store configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Message broker configuration.
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Retry policy.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Enrollment cache settings.
    #[serde(default)]
    pub access: AccessConfig,
    /// Code execution engine.
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Service network configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL.
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Maximum pooled connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connections kept open while idle.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Pool acquire timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    /// How long a writer waits for the database lock, in seconds.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_seconds: default_connect_timeout(),
            busy_timeout_seconds: default_busy_timeout(),
        }
    }
}

/// Message broker configuration.
///
/// Without a URL the service runs degraded: jobs are still created and can
/// be processed manually, but nothing is published or consumed.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Broker URL (`redis://...` or `memory://`).
    #[serde(default)]
    pub url: Option<String>,
    /// Queue that carries job-created events.
    #[serde(default = "default_queue_name")]
    pub queue: String,
    /// Connection attempts at startup.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// Delay between startup connection attempts, in milliseconds.
    #[serde(default = "default_connect_retry_delay")]
    pub connect_retry_delay_ms: u64,
    /// Attempts per published event.
    #[serde(default = "default_publish_attempts")]
    pub publish_attempts: u32,
    /// First publish retry delay, in milliseconds.
    #[serde(default = "default_publish_backoff")]
    pub publish_backoff_ms: u64,
    /// Upper bound on the publish retry delay, in milliseconds.
    #[serde(default = "default_publish_max_backoff")]
    pub publish_max_backoff_ms: u64,
    /// Consumer idle poll interval, in seconds.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_seconds: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: None,
            queue: default_queue_name(),
            connect_attempts: default_connect_attempts(),
            connect_retry_delay_ms: default_connect_retry_delay(),
            publish_attempts: default_publish_attempts(),
            publish_backoff_ms: default_publish_backoff(),
            publish_max_backoff_ms: default_publish_max_backoff(),
            poll_timeout_seconds: default_poll_timeout(),
        }
    }
}

impl BrokerConfig {
    /// Consumer poll interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_seconds)
    }
}

/// Retry policy.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Minimum job age before a retry is allowed, in hours.
    #[serde(default = "default_min_age_hours")]
    pub min_age_hours: i64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_age_hours: default_min_age_hours(),
        }
    }
}

impl RetryConfig {
    /// Minimum age as a duration. Negative values count as zero and values
    /// beyond chrono's range as the maximum; [`QueueServiceConfig::from_figment`]
    /// rejects both.
    #[must_use]
    pub fn min_age(&self) -> chrono::Duration {
        chrono::Duration::try_hours(self.min_age_hours.max(0)).unwrap_or(chrono::Duration::MAX)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.min_age_hours < 0 {
            anyhow::bail!(
                "retry.min_age_hours must not be negative (got {})",
                self.min_age_hours
            );
        }
        if chrono::Duration::try_hours(self.min_age_hours).is_none() {
            anyhow::bail!(
                "retry.min_age_hours is out of range (got {})",
                self.min_age_hours
            );
        }
        Ok(())
    }
}

/// Enrollment cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessConfig {
    /// Lifetime of cached TA lookups, in seconds.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_seconds: u64,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: default_cache_ttl(),
        }
    }
}

/// Code execution engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// Endpoint that runs submitted code. Absent means manual processing only.
    #[serde(default)]
    pub url: Option<String>,
    /// Request timeout in seconds.
    #[serde(default = "default_executor_timeout")]
    pub timeout_seconds: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_seconds: default_executor_timeout(),
        }
    }
}

/// Log output configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    8085
}

fn default_database_url() -> String {
    "sqlite://queue.db".to_string()
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_min_connections() -> u32 {
    1
}

const fn default_connect_timeout() -> u64 {
    30
}

const fn default_busy_timeout() -> u64 {
    5
}

fn default_queue_name() -> String {
    "queue:job_created".to_string()
}

const fn default_connect_attempts() -> u32 {
    5
}

const fn default_connect_retry_delay() -> u64 {
    2000
}

const fn default_publish_attempts() -> u32 {
    3
}

const fn default_publish_backoff() -> u64 {
    200
}

const fn default_publish_max_backoff() -> u64 {
    5000
}

const fn default_poll_timeout() -> u64 {
    1
}

const fn default_min_age_hours() -> i64 {
    24
}

const fn default_cache_ttl() -> u64 {
    30
}

const fn default_executor_timeout() -> u64 {
    60
}

impl QueueServiceConfig {
    /// Load configuration from files and environment.
    ///
    /// # Errors
    ///
    /// Returns error if configuration cannot be loaded or parsed.
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Toml::file("config/default.toml"))
                .merge(Toml::file("config/local.toml"))
                .merge(Env::prefixed("QUEUE_SERVICE_").split("__")),
        )
    }

    /// Extract configuration from an already assembled figment.
    ///
    /// # Errors
    ///
    /// Returns error if the figment cannot be deserialized or holds values
    /// outside their valid range.
    pub fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let config: Self = figment.extract()?;
        config.retry.validate()?;
        Ok(config)
    }
}
