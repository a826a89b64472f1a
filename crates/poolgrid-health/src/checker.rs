//! Health check thresholds and sub-check evaluation.
//!
//! Each sub-check (connection, latency, error rate, capacity) is graded
//! on its own as pass/warn/fail. The aggregate verdict is the worst of
//! the four.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;

use poolgrid_core::config::{ConfigError, HealthSection, duration_or};

/// Health monitor configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthConfig {
    /// Sweep interval. `None` uses the smallest `health_check_interval`
    /// among the monitored pools.
    pub interval: Option<Duration>,
    /// Latency (ms) at which a single sample raises a warning.
    pub latency_warning_ms: u64,
    /// Latency (ms) at which a single sample raises a critical alert.
    pub latency_critical_ms: u64,
    pub error_rate_warning: f64,
    pub error_rate_critical: f64,
    /// In-use / max ratio that degrades the capacity check.
    pub capacity_warning: f64,
    pub capacity_critical: f64,
    /// Latency samples kept in the ring buffer.
    pub sample_size: usize,
    pub max_alerts: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: None,
            latency_warning_ms: 1_000,
            latency_critical_ms: 3_000,
            error_rate_warning: 0.05,
            error_rate_critical: 0.2,
            capacity_warning: 0.8,
            capacity_critical: 0.95,
            sample_size: 100,
            max_alerts: 100,
        }
    }
}

impl HealthConfig {
    /// Merge a `[health]` section over the defaults.
    pub fn from_section(section: &HealthSection) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let interval = match section.interval.as_deref() {
            Some(raw) => Some(duration_or("health.interval", Some(raw), Duration::ZERO)?),
            None => None,
        };

        let config = Self {
            interval,
            latency_warning_ms: section
                .latency_warning_ms
                .unwrap_or(defaults.latency_warning_ms),
            latency_critical_ms: section
                .latency_critical_ms
                .unwrap_or(defaults.latency_critical_ms),
            error_rate_warning: section
                .error_rate_warning
                .unwrap_or(defaults.error_rate_warning),
            error_rate_critical: section
                .error_rate_critical
                .unwrap_or(defaults.error_rate_critical),
            capacity_warning: section.capacity_warning.unwrap_or(defaults.capacity_warning),
            capacity_critical: section
                .capacity_critical
                .unwrap_or(defaults.capacity_critical),
            sample_size: section.sample_size.unwrap_or(defaults.sample_size),
            max_alerts: section.max_alerts.unwrap_or(defaults.max_alerts),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::Invalid("health.interval must be non-zero".into()));
        }
        if self.latency_warning_ms > self.latency_critical_ms {
            return Err(ConfigError::Invalid(
                "health.latency_warning_ms exceeds latency_critical_ms".into(),
            ));
        }
        if self.error_rate_warning > self.error_rate_critical {
            return Err(ConfigError::Invalid(
                "health.error_rate_warning exceeds error_rate_critical".into(),
            ));
        }
        if self.capacity_warning > self.capacity_critical {
            return Err(ConfigError::Invalid(
                "health.capacity_warning exceeds capacity_critical".into(),
            ));
        }
        if self.sample_size == 0 {
            return Err(ConfigError::Invalid("health.sample_size must be positive".into()));
        }
        Ok(())
    }
}

/// Bounded ring buffer of latency samples in milliseconds.
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, dropping the oldest once full.
    pub fn push(&mut self, ms: u64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(ms);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<u64>() as f64 / self.samples.len() as f64)
    }

    pub fn max(&self) -> Option<u64> {
        self.samples.iter().copied().max()
    }
}

/// Grade of a single sub-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

/// Aggregate health verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthVerdict {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthVerdict {
    /// Worst-of aggregation: any fail is unhealthy, else any warn is
    /// degraded.
    pub fn from_checks(checks: &[SubCheck]) -> Self {
        match checks.iter().map(|c| c.status).max() {
            Some(CheckStatus::Fail) => HealthVerdict::Unhealthy,
            Some(CheckStatus::Warn) => HealthVerdict::Degraded,
            _ => HealthVerdict::Healthy,
        }
    }
}

impl std::fmt::Display for HealthVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthVerdict::Healthy => write!(f, "healthy"),
            HealthVerdict::Degraded => write!(f, "degraded"),
            HealthVerdict::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// One graded sub-check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubCheck {
    pub name: &'static str,
    pub status: CheckStatus,
    /// The measured value the grade is based on.
    pub value: f64,
    pub message: String,
}

/// Grade the share of healthy entries across all pools.
///
/// No entries at all is a warning: nothing has been proven reachable.
pub fn connection_check(healthy: usize, total: usize) -> SubCheck {
    if total == 0 {
        return SubCheck {
            name: "connection",
            status: CheckStatus::Warn,
            value: 0.0,
            message: "no pooled connections".to_string(),
        };
    }
    let ratio = healthy as f64 / total as f64;
    let status = if ratio < 0.5 {
        CheckStatus::Fail
    } else if ratio < 0.8 {
        CheckStatus::Warn
    } else {
        CheckStatus::Pass
    };
    SubCheck {
        name: "connection",
        status,
        value: ratio,
        message: format!("{healthy}/{total} connections healthy"),
    }
}

/// Grade the average probe latency.
pub fn latency_check(window: &LatencyWindow, config: &HealthConfig) -> SubCheck {
    let Some(avg) = window.average() else {
        return SubCheck {
            name: "latency",
            status: CheckStatus::Pass,
            value: 0.0,
            message: "no latency samples yet".to_string(),
        };
    };
    let status = if avg >= config.latency_critical_ms as f64 {
        CheckStatus::Fail
    } else if avg >= config.latency_warning_ms as f64 {
        CheckStatus::Warn
    } else {
        CheckStatus::Pass
    };
    SubCheck {
        name: "latency",
        status,
        value: avg,
        message: format!("average latency {avg:.1}ms over {} samples", window.len()),
    }
}

/// Grade the share of failed observations.
pub fn error_rate_check(errors: u64, observations: u64, config: &HealthConfig) -> SubCheck {
    let rate = if observations == 0 {
        0.0
    } else {
        errors as f64 / observations as f64
    };
    let status = if rate >= config.error_rate_critical {
        CheckStatus::Fail
    } else if rate >= config.error_rate_warning {
        CheckStatus::Warn
    } else {
        CheckStatus::Pass
    };
    SubCheck {
        name: "error_rate",
        status,
        value: rate,
        message: format!("{errors} errors in {observations} observations"),
    }
}

/// Grade in-use entries against the summed pool maxima.
pub fn capacity_check(in_use: usize, capacity: usize, config: &HealthConfig) -> SubCheck {
    if capacity == 0 {
        return SubCheck {
            name: "capacity",
            status: CheckStatus::Pass,
            value: 0.0,
            message: "no pool capacity configured".to_string(),
        };
    }
    let usage = in_use as f64 / capacity as f64;
    let status = if usage >= config.capacity_critical {
        CheckStatus::Fail
    } else if usage >= config.capacity_warning {
        CheckStatus::Warn
    } else {
        CheckStatus::Pass
    };
    SubCheck {
        name: "capacity",
        status,
        value: usage,
        message: format!("{in_use}/{capacity} connections in use"),
    }
}
