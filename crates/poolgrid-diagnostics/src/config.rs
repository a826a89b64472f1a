//! Query diagnostics configuration.

use std::time::Duration;

use poolgrid_core::config::{ConfigError, DiagnosticsSection, duration_or};

#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticsConfig {
    /// Fraction of queries traced, 0.0 - 1.0 (default: 1.0).
    pub sampling_rate: f64,
    /// Duration (ms) at which a finished query raises a warning (default: 1000).
    pub slow_query_ms: u64,
    /// Duration (ms) at which a finished query raises a critical alert
    /// (default: 5000).
    pub very_slow_query_ms: u64,
    /// Finished traces older than this are purged (default: 1h).
    pub retention: Duration,
    /// Interval of the purge task (default: 5m).
    pub purge_interval: Duration,
    /// Hard cap on stored traces (default: 10000).
    pub max_traces: usize,
    pub max_alerts: usize,
    /// `LIMIT` values above this are flagged (default: 1000).
    pub max_limit: u64,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            sampling_rate: 1.0,
            slow_query_ms: 1_000,
            very_slow_query_ms: 5_000,
            retention: Duration::from_secs(3600),
            purge_interval: Duration::from_secs(300),
            max_traces: 10_000,
            max_alerts: 100,
            max_limit: 1_000,
        }
    }
}

impl DiagnosticsConfig {
    /// Merge a `[diagnostics]` section over the defaults.
    pub fn from_section(section: &DiagnosticsSection) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            sampling_rate: section.sampling_rate.unwrap_or(defaults.sampling_rate),
            slow_query_ms: section.slow_query_ms.unwrap_or(defaults.slow_query_ms),
            very_slow_query_ms: section
                .very_slow_query_ms
                .unwrap_or(defaults.very_slow_query_ms),
            retention: duration_or(
                "diagnostics.retention",
                section.retention.as_deref(),
                defaults.retention,
            )?,
            purge_interval: duration_or(
                "diagnostics.purge_interval",
                section.purge_interval.as_deref(),
                defaults.purge_interval,
            )?,
            max_traces: section.max_traces.unwrap_or(defaults.max_traces),
            max_alerts: section.max_alerts.unwrap_or(defaults.max_alerts),
            max_limit: section.max_limit.unwrap_or(defaults.max_limit),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.sampling_rate) {
            return Err(ConfigError::Invalid(format!(
                "diagnostics.sampling_rate must be within 0.0-1.0, got {}",
                self.sampling_rate
            )));
        }
        if self.slow_query_ms > self.very_slow_query_ms {
            return Err(ConfigError::Invalid(
                "diagnostics.slow_query_ms exceeds very_slow_query_ms".to_string(),
            ));
        }
        if self.max_traces == 0 || self.purge_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "diagnostics.max_traces and purge_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
