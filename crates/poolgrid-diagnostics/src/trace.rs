//! Query traces and their state machine.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use poolgrid_core::Metadata;

use crate::analyzer::QueryWarning;

/// Lifecycle of a traced query.
///
/// ```text
/// Pending ──► Running ──► Completed
///    │           ├──────► Failed
///    └───────────┴──────► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TraceState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TraceState::Completed | TraceState::Failed | TraceState::Cancelled
        )
    }

    fn can_move_to(&self, to: TraceState) -> bool {
        matches!(
            (self, to),
            (TraceState::Pending, TraceState::Running)
                | (TraceState::Pending, TraceState::Cancelled)
                | (TraceState::Running, TraceState::Completed)
                | (TraceState::Running, TraceState::Failed)
                | (TraceState::Running, TraceState::Cancelled)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid trace transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: TraceState,
    pub to: TraceState,
}

/// Kind of resource a query consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// CPU time in milliseconds.
    Cpu,
    /// Memory in bytes.
    Memory,
    /// Disk I/O in bytes.
    Io,
    /// Network transfer in bytes.
    Network,
}

/// One resource measurement attached to a running trace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub kind: ResourceKind,
    pub amount: f64,
    pub recorded_at: u64,
}

/// A traced query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryTrace {
    pub id: String,
    pub sql: String,
    pub normalized_sql: String,
    pub params: Vec<Value>,
    pub metadata: Metadata,
    pub state: TraceState,
    pub start_time: u64,
    pub end_time: Option<u64>,
    pub duration_ms: Option<u64>,
    pub row_count: Option<u64>,
    pub error: Option<String>,
    pub resources: Vec<ResourceUsage>,
    pub warnings: Vec<QueryWarning>,
}

impl QueryTrace {
    /// Move to `to`. Terminal states never change again.
    pub fn transition(&mut self, to: TraceState) -> Result<(), TransitionError> {
        if !self.state.can_move_to(to) {
            return Err(TransitionError {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Close the trace at `now`, moving it to `to`.
    pub(crate) fn finish(&mut self, to: TraceState, now: u64) -> Result<(), TransitionError> {
        self.transition(to)?;
        self.end_time = Some(now);
        self.duration_ms = Some(now.saturating_sub(self.start_time));
        Ok(())
    }
}
