//! Per-pool configuration.

use std::time::Duration;

use poolgrid_core::config::{ConfigError, PoolSection, duration_or};
use poolgrid_core::RetryPolicy;

/// Connection parameters handed to the handle factory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionParams {
    /// Backend endpoint URL.
    pub endpoint: String,
    /// Credential presented by the backend client.
    pub api_key: String,
    /// Region the handles are expected to live in, if known.
    pub region: Option<String>,
}

/// Configuration for a single named pool.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolConfig {
    pub pool_id: String,
    /// Entries kept warm (default: 1).
    pub min: usize,
    /// Hard cap on entries, including ones being created (default: 10).
    pub max: usize,
    /// Maximum time `acquire()` waits for an eligible entry (default: 5s).
    pub acquire_timeout: Duration,
    /// Idle entries beyond `min` are evicted after this long (default: 300s).
    pub idle_timeout: Duration,
    /// Entries older than this are evicted when idle (default: 30m).
    pub max_lifetime: Duration,
    /// Interval between health sweeps of idle entries (default: 30s).
    pub health_check_interval: Duration,
    /// Upper bound on a single probe (default: 2s).
    pub probe_timeout: Duration,
    /// Attempts made by `execute()` and warm-up creation (default: 3).
    pub retry_attempts: u32,
    /// Base backoff between attempts (default: 100ms).
    pub retry_delay: Duration,
    pub connection: ConnectionParams,
}

impl PoolConfig {
    /// Defaults for a pool talking to `connection`.
    pub fn new(pool_id: &str, connection: ConnectionParams) -> Self {
        Self {
            pool_id: pool_id.to_string(),
            min: 1,
            max: 10,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(30 * 60),
            health_check_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(2),
            retry_attempts: 3,
            retry_delay: Duration::from_millis(100),
            connection,
        }
    }

    /// Merge a `[pools.<id>]` section over the defaults and validate it.
    pub fn from_section(pool_id: &str, section: &PoolSection) -> Result<Self, ConfigError> {
        let endpoint = required("endpoint", section.endpoint.as_deref())?;
        let api_key = required("api_key", section.api_key.as_deref())?;

        let defaults = Self::new(
            pool_id,
            ConnectionParams {
                endpoint,
                api_key,
                region: section.region.clone(),
            },
        );

        let config = Self {
            min: section.min.unwrap_or(defaults.min),
            max: section.max.unwrap_or(defaults.max),
            acquire_timeout: duration_or(
                "acquire_timeout",
                section.acquire_timeout.as_deref(),
                defaults.acquire_timeout,
            )?,
            idle_timeout: duration_or(
                "idle_timeout",
                section.idle_timeout.as_deref(),
                defaults.idle_timeout,
            )?,
            max_lifetime: duration_or(
                "max_lifetime",
                section.max_lifetime.as_deref(),
                defaults.max_lifetime,
            )?,
            health_check_interval: duration_or(
                "health_check_interval",
                section.health_check_interval.as_deref(),
                defaults.health_check_interval,
            )?,
            probe_timeout: duration_or(
                "probe_timeout",
                section.probe_timeout.as_deref(),
                defaults.probe_timeout,
            )?,
            retry_attempts: section.retry_attempts.unwrap_or(defaults.retry_attempts),
            retry_delay: duration_or(
                "retry_delay",
                section.retry_delay.as_deref(),
                defaults.retry_delay,
            )?,
            ..defaults
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_id.trim().is_empty() {
            return Err(ConfigError::Missing("pool_id".to_string()));
        }
        if self.connection.endpoint.trim().is_empty() {
            return Err(ConfigError::Missing("endpoint".to_string()));
        }
        if self.connection.api_key.trim().is_empty() {
            return Err(ConfigError::Missing("api_key".to_string()));
        }
        if self.min > self.max {
            return Err(ConfigError::Invalid(format!(
                "pool {}: min ({}) exceeds max ({})",
                self.pool_id, self.min, self.max
            )));
        }
        if self.acquire_timeout.is_zero() {
            return Err(ConfigError::Invalid(format!(
                "pool {}: acquire_timeout must be non-zero",
                self.pool_id
            )));
        }
        if self.probe_timeout.is_zero() {
            return Err(ConfigError::Invalid(format!(
                "pool {}: probe_timeout must be non-zero",
                self.pool_id
            )));
        }
        Ok(())
    }

    /// Retry policy derived from `retry_attempts` and `retry_delay`.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_attempts(self.retry_attempts)
            .with_base_delay(self.retry_delay)
    }
}

fn required(field: &str, value: Option<&str>) -> Result<String, ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.to_string()),
        _ => Err(ConfigError::Missing(field.to_string())),
    }
}
