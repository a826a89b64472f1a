//! Leak detector configuration.

use std::time::Duration;

use poolgrid_core::config::{ConfigError, LeakSection, duration_or};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakConfig {
    /// A handle held longer than this is reported as leaked (default: 5m).
    pub threshold: Duration,
    /// A handle with no recorded activity for this long counts as idle
    /// (default: 1m).
    pub idle_threshold: Duration,
    /// Interval of the leak sweep started by `start()` (default: 30s).
    pub sweep_interval: Duration,
    /// Capture a backtrace at every `track_acquisition` (default: false).
    pub capture_traces: bool,
    /// Force-release leaked handles during the sweep (default: false).
    pub auto_cleanup: bool,
}

impl Default for LeakConfig {
    fn default() -> Self {
        Self {
            threshold: Duration::from_secs(5 * 60),
            idle_threshold: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            capture_traces: false,
            auto_cleanup: false,
        }
    }
}

impl LeakConfig {
    /// Merge a `[leak]` section over the defaults.
    pub fn from_section(section: &LeakSection) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            threshold: duration_or("leak.threshold", section.threshold.as_deref(), defaults.threshold)?,
            idle_threshold: duration_or(
                "leak.idle_threshold",
                section.idle_threshold.as_deref(),
                defaults.idle_threshold,
            )?,
            sweep_interval: duration_or(
                "leak.sweep_interval",
                section.sweep_interval.as_deref(),
                defaults.sweep_interval,
            )?,
            capture_traces: section.capture_traces.unwrap_or(defaults.capture_traces),
            auto_cleanup: section.auto_cleanup.unwrap_or(defaults.auto_cleanup),
        };

        if config.threshold.is_zero() || config.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "leak.threshold and leak.sweep_interval must be non-zero".to_string(),
            ));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_section_uses_defaults() {
        let config = LeakConfig::from_section(&LeakSection::default()).unwrap();
        assert_eq!(config, LeakConfig::default());
    }

    #[test]
    fn section_overrides() {
        let config = LeakConfig::from_section(&LeakSection {
            threshold: Some("2m".to_string()),
            capture_traces: Some(true),
            ..LeakSection::default()
        })
        .unwrap();
        assert_eq!(config.threshold, Duration::from_secs(120));
        assert!(config.capture_traces);
        assert!(!config.auto_cleanup);
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let err = LeakConfig::from_section(&LeakSection {
            threshold: Some("0s".to_string()),
            ..LeakSection::default()
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
