//! Capped alert log.
//!
//! Alerts are appended unresolved. Once the log grows past its capacity the
//! oldest resolved alert is dropped first; unresolved alerts are only dropped
//! when nothing resolved is left.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// Alert severity, ordered from least to most severe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// A single diagnostic or health alert.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub severity: Severity,
    /// Machine-readable alert category, e.g. `high_latency`, `slow_query`.
    pub kind: String,
    pub message: String,
    /// Set once the alert is acknowledged or resolved.
    pub resolved: bool,
    pub resolved_at: Option<u64>,
}

/// Append-only alert log with a retention cap.
#[derive(Debug)]
pub struct AlertLog {
    alerts: VecDeque<Alert>,
    capacity: usize,
    next_id: u64,
    prefix: &'static str,
}

impl AlertLog {
    /// `prefix` namespaces alert ids (`health-3`, `query-17`).
    pub fn new(prefix: &'static str, capacity: usize) -> Self {
        Self {
            alerts: VecDeque::new(),
            capacity: capacity.max(1),
            next_id: 1,
            prefix,
        }
    }

    /// Append an unresolved alert and return its id.
    pub fn raise(
        &mut self,
        now_ms: u64,
        severity: Severity,
        kind: &str,
        message: impl Into<String>,
    ) -> String {
        let id = format!("{}-{}", self.prefix, self.next_id);
        self.next_id += 1;
        let message = message.into();

        match severity {
            Severity::Info => info!(alert_id = %id, %kind, %message, "alert raised"),
            Severity::Warning => warn!(alert_id = %id, %kind, %message, "alert raised"),
            Severity::Error | Severity::Critical => {
                error!(alert_id = %id, %kind, %severity, %message, "alert raised")
            }
        }

        self.alerts.push_back(Alert {
            id: id.clone(),
            timestamp: now_ms,
            severity,
            kind: kind.to_string(),
            message,
            resolved: false,
            resolved_at: None,
        });
        self.prune();
        id
    }

    /// Mark an alert resolved. Returns `false` for unknown or already
    /// resolved alerts.
    pub fn resolve(&mut self, id: &str, now_ms: u64) -> bool {
        match self.alerts.iter_mut().find(|a| a.id == id) {
            Some(alert) if !alert.resolved => {
                alert.resolved = true;
                alert.resolved_at = Some(now_ms);
                true
            }
            _ => false,
        }
    }

    /// Enforce the retention cap. Returns the number of alerts dropped.
    pub fn prune(&mut self) -> usize {
        let mut dropped = 0;
        while self.alerts.len() > self.capacity {
            match self.alerts.iter().position(|a| a.resolved) {
                Some(pos) => {
                    self.alerts.remove(pos);
                }
                None => {
                    self.alerts.pop_front();
                }
            }
            dropped += 1;
        }
        dropped
    }

    pub fn all(&self) -> Vec<Alert> {
        self.alerts.iter().cloned().collect()
    }

    pub fn unresolved(&self) -> Vec<Alert> {
        self.alerts.iter().filter(|a| !a.resolved).cloned().collect()
    }

    pub fn unresolved_count(&self) -> usize {
        self.alerts.iter().filter(|a| !a.resolved).count()
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }
}
