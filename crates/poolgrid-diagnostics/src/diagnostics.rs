//! Query tracer.
//!
//! Callers bracket each query-shaped call with `start_query` and
//! `end_query`. Traces are analyzed on entry, graded against the slow-query
//! thresholds on exit, and dropped after the retention window.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use poolgrid_core::metadata::sanitize;
use poolgrid_core::rand::unit_f64;
use poolgrid_core::{Alert, AlertLog, Metadata, Severity, SharedClock, TaskHandle, spawn_periodic};

use crate::analyzer::{QueryWarning, analyze_query, normalize_sql};
use crate::config::DiagnosticsConfig;
use crate::report::{DiagnosticsReport, build_report};
use crate::trace::{QueryTrace, ResourceKind, ResourceUsage, TraceState};

/// One fifth of the trace cap is evicted at once when the cap is exceeded.
const EVICTION_DIVISOR: usize = 5;

#[derive(Debug)]
struct TracerState {
    traces: HashMap<String, QueryTrace>,
    alerts: AlertLog,
    next_id: u64,
    sampled_out: u64,
}

pub struct QueryDiagnostics {
    config: DiagnosticsConfig,
    clock: SharedClock,
    state: Mutex<TracerState>,
}

impl QueryDiagnostics {
    pub fn new(config: DiagnosticsConfig, clock: SharedClock) -> Self {
        let state = TracerState {
            traces: HashMap::new(),
            alerts: AlertLog::new("query", config.max_alerts),
            next_id: 1,
            sampled_out: 0,
        };
        Self {
            config,
            clock,
            state: Mutex::new(state),
        }
    }

    pub fn config(&self) -> &DiagnosticsConfig {
        &self.config
    }

    fn sampled(&self) -> bool {
        let rate = self.config.sampling_rate;
        if rate >= 1.0 {
            true
        } else if rate <= 0.0 {
            false
        } else {
            unit_f64() < rate
        }
    }

    /// Begin tracing a query and return its id.
    ///
    /// A query skipped by sampling still gets an id; later calls with it
    /// are no-ops.
    pub async fn start_query(
        &self,
        sql: &str,
        params: Option<Vec<Value>>,
        metadata: Option<Metadata>,
    ) -> String {
        let now = self.clock.now_ms();
        let mut state = self.state.lock().await;
        let id = format!("q-{}", state.next_id);
        state.next_id += 1;

        if !self.sampled() {
            state.sampled_out += 1;
            return id;
        }

        let warnings = analyze_query(sql, self.config.max_limit);
        for warning in &warnings {
            debug!(query_id = %id, code = %warning.code, severity = %warning.severity, "{}", warning.message);
        }

        let mut trace = QueryTrace {
            id: id.clone(),
            sql: sql.to_string(),
            normalized_sql: normalize_sql(sql),
            params: params.unwrap_or_default(),
            metadata: metadata.map(sanitize).unwrap_or_default(),
            state: TraceState::Pending,
            start_time: now,
            end_time: None,
            duration_ms: None,
            row_count: None,
            error: None,
            resources: Vec::new(),
            warnings,
        };
        // Pending -> Running is always valid for a new trace.
        let _ = trace.transition(TraceState::Running);
        state.traces.insert(id.clone(), trace);

        if state.traces.len() > self.config.max_traces {
            let evicted = evict_oldest(&mut state.traces, self.config.max_traces);
            debug!(evicted, cap = self.config.max_traces, "trace cap exceeded");
        }
        id
    }

    /// Finish a running trace. An `error` marks it failed.
    ///
    /// Returns the finished trace, or `None` for unknown, sampled-out, or
    /// already finished ids.
    pub async fn end_query(
        &self,
        id: &str,
        row_count: Option<u64>,
        error: Option<String>,
    ) -> Option<QueryTrace> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock().await;
        let trace = state.traces.get_mut(id)?;

        let to = if error.is_some() {
            TraceState::Failed
        } else {
            TraceState::Completed
        };
        trace.finish(to, now).ok()?;
        trace.row_count = row_count;
        trace.error = error;
        let finished = trace.clone();

        let duration = finished.duration_ms.unwrap_or(0);
        if let Some(err) = &finished.error {
            state.alerts.raise(
                now,
                Severity::Error,
                "query_failed",
                format!("query {id} failed: {err}"),
            );
        }
        if duration > self.config.very_slow_query_ms {
            state.alerts.raise(
                now,
                Severity::Critical,
                "very_slow_query",
                format!("query {id} took {duration}ms: {}", finished.normalized_sql),
            );
        } else if duration > self.config.slow_query_ms {
            state.alerts.raise(
                now,
                Severity::Warning,
                "slow_query",
                format!("query {id} took {duration}ms: {}", finished.normalized_sql),
            );
        }

        debug!(query_id = %id, state = ?finished.state, duration_ms = duration, "query finished");
        Some(finished)
    }

    /// Cancel a pending or running trace. Returns `false` otherwise.
    pub async fn cancel_query(&self, id: &str) -> bool {
        let now = self.clock.now_ms();
        let mut state = self.state.lock().await;
        match state.traces.get_mut(id) {
            Some(trace) => trace.finish(TraceState::Cancelled, now).is_ok(),
            None => false,
        }
    }

    /// Attach a resource measurement to a running trace.
    pub async fn record_resource(&self, id: &str, kind: ResourceKind, amount: f64) -> bool {
        let now = self.clock.now_ms();
        let mut state = self.state.lock().await;
        match state.traces.get_mut(id) {
            Some(trace) if trace.state == TraceState::Running => {
                trace.resources.push(ResourceUsage {
                    kind,
                    amount,
                    recorded_at: now,
                });
                true
            }
            _ => false,
        }
    }

    /// Analyze `sql` without tracing it.
    pub fn analyze_query(&self, sql: &str) -> Vec<QueryWarning> {
        analyze_query(sql, self.config.max_limit)
    }

    pub async fn get_trace(&self, id: &str) -> Option<QueryTrace> {
        self.state.lock().await.traces.get(id).cloned()
    }

    pub async fn get_report(&self) -> DiagnosticsReport {
        let now = self.clock.now_ms();
        let state = self.state.lock().await;
        build_report(
            state.traces.values(),
            state.sampled_out,
            state.alerts.unresolved_count(),
            &self.config,
            now,
        )
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.state.lock().await.alerts.all()
    }

    /// Resolve an alert. Returns `false` for unknown or resolved ids.
    pub async fn resolve_alert(&self, id: &str) -> bool {
        let now = self.clock.now_ms();
        self.state.lock().await.alerts.resolve(id, now)
    }

    // ── Retention ──────────────────────────────────────────────────

    /// Drop finished traces older than the retention window.
    pub async fn purge(&self) -> usize {
        let now = self.clock.now_ms();
        let retention = self.config.retention.as_millis() as u64;
        let mut state = self.state.lock().await;

        let before = state.traces.len();
        state
            .traces
            .retain(|_, t| !t.state.is_terminal() || now.saturating_sub(t.start_time) <= retention);
        let purged = before - state.traces.len();
        if purged > 0 {
            info!(purged, remaining = state.traces.len(), "purged expired query traces");
        }
        purged
    }

    /// Start the periodic purge task.
    pub fn start(self: &Arc<Self>) -> TaskHandle {
        let diagnostics = Arc::clone(self);
        spawn_periodic("trace-purge", self.config.purge_interval, move || {
            let diagnostics = Arc::clone(&diagnostics);
            async move {
                diagnostics.purge().await;
                Ok::<(), anyhow::Error>(())
            }
        })
    }
}

/// Evict the oldest finished traces. Running traces are never evicted.
fn evict_oldest(traces: &mut HashMap<String, QueryTrace>, cap: usize) -> usize {
    let batch = cap.div_ceil(EVICTION_DIVISOR).max(1);
    let mut candidates: Vec<(u64, String)> = traces
        .values()
        .filter(|t| t.state.is_terminal())
        .map(|t| (t.start_time, t.id.clone()))
        .collect();
    candidates.sort();

    let mut evicted = 0;
    for (_, id) in candidates.into_iter().take(batch) {
        traces.remove(&id);
        evicted += 1;
    }
    evicted
}

impl std::fmt::Debug for QueryDiagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryDiagnostics")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
