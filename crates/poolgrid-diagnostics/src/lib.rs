//! poolgrid-diagnostics — per-query tracing and static SQL analysis.
//!
//! ```text
//! start_query ──► analyze + normalize ──► trace (Running)
//!                                             │
//! end_query / cancel_query ──► Completed | Failed | Cancelled
//!                                             │
//!                          slow / failed ──► alert log
//!                                             │
//! get_report ◄── latency percentiles, slow shapes, findings
//! ```
//!
//! Sampling decides at `start_query` whether a trace is stored at all.
//! Finished traces are purged once they age past the retention window.

pub mod analyzer;
pub mod config;
pub mod diagnostics;
pub mod report;
pub mod trace;

pub use analyzer::{QueryWarning, WarningCode, analyze_query, normalize_sql};
pub use config::DiagnosticsConfig;
pub use diagnostics::QueryDiagnostics;
pub use report::{DiagnosticsReport, LatencySummary, SlowQuery, TraceCounts, percentile};
pub use trace::{QueryTrace, ResourceKind, ResourceUsage, TraceState, TransitionError};
