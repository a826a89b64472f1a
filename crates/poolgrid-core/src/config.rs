//! poolgrid.toml configuration parser.
//!
//! Every field is optional; each manager merges its section over its own
//! defaults. Durations are written as strings: `"500ms"`, `"5s"`, `"2m"`.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while turning a config section into a manager config.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required field `{0}`")]
    Missing(String),

    #[error("invalid duration for `{field}`: {value:?}")]
    InvalidDuration { field: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolgridConfig {
    pub health: Option<HealthSection>,
    pub leak: Option<LeakSection>,
    pub diagnostics: Option<DiagnosticsSection>,
    #[serde(default)]
    pub pools: BTreeMap<String, PoolSection>,
}

/// `[pools.<id>]`: per-pool overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolSection {
    pub min: Option<usize>,
    pub max: Option<usize>,
    pub acquire_timeout: Option<String>,
    pub idle_timeout: Option<String>,
    pub max_lifetime: Option<String>,
    pub health_check_interval: Option<String>,
    pub probe_timeout: Option<String>,
    pub retry_attempts: Option<u32>,
    pub retry_delay: Option<String>,
    /// Backend endpoint URL. Required.
    pub endpoint: Option<String>,
    /// Backend API key. Required.
    pub api_key: Option<String>,
    pub region: Option<String>,
}

/// `[health]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthSection {
    pub interval: Option<String>,
    pub latency_warning_ms: Option<u64>,
    pub latency_critical_ms: Option<u64>,
    pub error_rate_warning: Option<f64>,
    pub error_rate_critical: Option<f64>,
    pub capacity_warning: Option<f64>,
    pub capacity_critical: Option<f64>,
    pub sample_size: Option<usize>,
    pub max_alerts: Option<usize>,
}

/// `[leak]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeakSection {
    pub threshold: Option<String>,
    pub idle_threshold: Option<String>,
    pub sweep_interval: Option<String>,
    pub capture_traces: Option<bool>,
    pub auto_cleanup: Option<bool>,
}

/// `[diagnostics]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsSection {
    pub sampling_rate: Option<f64>,
    pub slow_query_ms: Option<u64>,
    pub very_slow_query_ms: Option<u64>,
    pub retention: Option<String>,
    pub purge_interval: Option<String>,
    pub max_traces: Option<usize>,
    pub max_alerts: Option<usize>,
    pub max_limit: Option<u64>,
}

impl PoolgridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: PoolgridConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Scaffold a minimal config with one pool.
    pub fn scaffold(pool_id: &str, endpoint: &str, api_key: &str) -> Self {
        let mut pools = BTreeMap::new();
        pools.insert(
            pool_id.to_string(),
            PoolSection {
                min: Some(2),
                max: Some(10),
                acquire_timeout: Some("5s".to_string()),
                endpoint: Some(endpoint.to_string()),
                api_key: Some(api_key.to_string()),
                ..PoolSection::default()
            },
        );

        PoolgridConfig {
            health: Some(HealthSection {
                interval: Some("30s".to_string()),
                ..HealthSection::default()
            }),
            leak: Some(LeakSection {
                threshold: Some("5m".to_string()),
                ..LeakSection::default()
            }),
            diagnostics: Some(DiagnosticsSection {
                sampling_rate: Some(1.0),
                ..DiagnosticsSection::default()
            }),
            pools,
        }
    }
}

/// Parse a duration string like "5s", "500ms", "1m".
///
/// A plain number is read as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.trim().parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

/// Resolve an optional duration field against its default.
pub fn duration_or(
    field: &str,
    value: Option<&str>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => parse_duration(raw).ok_or_else(|| ConfigError::InvalidDuration {
            field: field.to_string(),
            value: raw.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration(" 30s "), Some(Duration::from_secs(30)));
    }

    #[test]
    fn parse_duration_rejects_garbage() {
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration("-5s"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn duration_or_uses_default_when_absent() {
        let d = duration_or("idle_timeout", None, Duration::from_secs(7)).unwrap();
        assert_eq!(d, Duration::from_secs(7));
    }

    #[test]
    fn duration_or_reports_field_name() {
        let err = duration_or("idle_timeout", Some("forever"), Duration::ZERO).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidDuration {
                field: "idle_timeout".to_string(),
                value: "forever".to_string(),
            }
        );
        assert!(err.to_string().contains("idle_timeout"));
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[health]
interval = "10s"
latency_warning_ms = 250

[leak]
threshold = "2m"
capture_traces = true

[diagnostics]
sampling_rate = 0.5
slow_query_ms = 800

[pools.primary]
min = 2
max = 5
acquire_timeout = "3s"
endpoint = "https://db.example.test"
api_key = "anon-key"
region = "eu-west-1"

[pools.analytics]
max = 2
endpoint = "https://analytics.example.test"
api_key = "service-key"
"#;
        let config = PoolgridConfig::parse(toml_str).unwrap();
        assert_eq!(config.pools.len(), 2);

        let primary = &config.pools["primary"];
        assert_eq!(primary.min, Some(2));
        assert_eq!(primary.max, Some(5));
        assert_eq!(primary.region.as_deref(), Some("eu-west-1"));

        assert_eq!(config.health.unwrap().latency_warning_ms, Some(250));
        assert_eq!(config.leak.unwrap().capture_traces, Some(true));
        assert_eq!(config.diagnostics.unwrap().sampling_rate, Some(0.5));
    }

    #[test]
    fn parse_empty_config() {
        let config = PoolgridConfig::parse("").unwrap();
        assert!(config.pools.is_empty());
        assert!(config.health.is_none());
    }

    #[test]
    fn scaffold_round_trips_through_toml() {
        let config = PoolgridConfig::scaffold("main", "https://db.example.test", "key");
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("[pools.main]"));

        let parsed = PoolgridConfig::parse(&toml_str).unwrap();
        assert_eq!(parsed.pools["main"], config.pools["main"]);
    }

    #[test]
    fn from_file_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("poolgrid.toml");
        std::fs::write(&path, "[pools.p1]\nmax = 3\n").unwrap();

        let config = PoolgridConfig::from_file(&path).unwrap();
        assert_eq!(config.pools["p1"].max, Some(3));
    }

    #[test]
    fn from_file_missing_is_error() {
        assert!(PoolgridConfig::from_file(Path::new("/nonexistent/poolgrid.toml")).is_err());
    }
}
