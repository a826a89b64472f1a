//! Aggregate diagnostics report.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::analyzer::WarningCode;
use crate::config::DiagnosticsConfig;
use crate::trace::{QueryTrace, ResourceKind, TraceState};

/// Nearest-rank percentile over an ascending slice: index
/// `ceil(p / 100 * n) - 1`, clamped to the slice.
pub fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (p / 100.0 * sorted.len() as f64).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

/// Latency statistics over finished queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: usize,
    pub avg_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

impl LatencySummary {
    pub fn from_durations(mut durations: Vec<u64>) -> Self {
        if durations.is_empty() {
            return Self::default();
        }
        durations.sort_unstable();
        let sum: u64 = durations.iter().sum();
        Self {
            count: durations.len(),
            avg_ms: sum as f64 / durations.len() as f64,
            min_ms: durations[0],
            max_ms: durations[durations.len() - 1],
            p50_ms: percentile(&durations, 50.0),
            p95_ms: percentile(&durations, 95.0),
            p99_ms: percentile(&durations, 99.0),
        }
    }
}

/// A query shape that ran slow at least once.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlowQuery {
    pub normalized_sql: String,
    pub count: usize,
    pub avg_ms: f64,
    pub max_ms: u64,
}

/// Counts of traces by state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TraceCounts {
    pub stored: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Queries skipped by sampling since startup.
    pub sampled_out: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticsReport {
    pub generated_at: u64,
    pub traces: TraceCounts,
    pub latency: LatencySummary,
    /// failed / (completed + failed).
    pub error_rate: f64,
    pub slow_queries: Vec<SlowQuery>,
    /// How often each analysis code was raised across stored traces.
    pub warning_counts: BTreeMap<WarningCode, usize>,
    pub resource_totals: BTreeMap<ResourceKind, f64>,
    pub recommendations: Vec<String>,
    pub unresolved_alerts: usize,
}

/// Slow query shapes reported, worst first.
const SLOW_QUERY_LIMIT: usize = 10;

pub(crate) fn build_report<'a>(
    traces: impl Iterator<Item = &'a QueryTrace>,
    sampled_out: u64,
    unresolved_alerts: usize,
    config: &DiagnosticsConfig,
    now: u64,
) -> DiagnosticsReport {
    let mut counts = TraceCounts {
        sampled_out,
        ..TraceCounts::default()
    };
    let mut durations = Vec::new();
    let mut warning_counts: BTreeMap<WarningCode, usize> = BTreeMap::new();
    let mut resource_totals: BTreeMap<ResourceKind, f64> = BTreeMap::new();
    let mut slow: HashMap<&str, (usize, u64, u64)> = HashMap::new();

    for trace in traces {
        counts.stored += 1;
        match trace.state {
            TraceState::Pending | TraceState::Running => counts.running += 1,
            TraceState::Completed => counts.completed += 1,
            TraceState::Failed => counts.failed += 1,
            TraceState::Cancelled => counts.cancelled += 1,
        }

        for warning in &trace.warnings {
            *warning_counts.entry(warning.code).or_default() += 1;
        }
        for usage in &trace.resources {
            *resource_totals.entry(usage.kind).or_default() += usage.amount;
        }

        if matches!(trace.state, TraceState::Completed | TraceState::Failed) {
            if let Some(ms) = trace.duration_ms {
                durations.push(ms);
                if ms > config.slow_query_ms {
                    let entry = slow.entry(trace.normalized_sql.as_str()).or_default();
                    entry.0 += 1;
                    entry.1 += ms;
                    entry.2 = entry.2.max(ms);
                }
            }
        }
    }

    let finished = counts.completed + counts.failed;
    let error_rate = if finished == 0 {
        0.0
    } else {
        counts.failed as f64 / finished as f64
    };

    let mut slow_queries: Vec<SlowQuery> = slow
        .into_iter()
        .map(|(sql, (count, total, max))| SlowQuery {
            normalized_sql: sql.to_string(),
            count,
            avg_ms: total as f64 / count as f64,
            max_ms: max,
        })
        .collect();
    slow_queries.sort_by(|a, b| {
        b.avg_ms
            .total_cmp(&a.avg_ms)
            .then_with(|| a.normalized_sql.cmp(&b.normalized_sql))
    });
    slow_queries.truncate(SLOW_QUERY_LIMIT);

    let latency = LatencySummary::from_durations(durations);
    let recommendations = recommendations(&latency, error_rate, &warning_counts, config);

    DiagnosticsReport {
        generated_at: now,
        traces: counts,
        latency,
        error_rate,
        slow_queries,
        warning_counts,
        resource_totals,
        recommendations,
        unresolved_alerts,
    }
}

fn recommendations(
    latency: &LatencySummary,
    error_rate: f64,
    warning_counts: &BTreeMap<WarningCode, usize>,
    config: &DiagnosticsConfig,
) -> Vec<String> {
    let mut out = Vec::new();

    if latency.count > 0 && latency.p95_ms > config.slow_query_ms {
        out.push(format!(
            "p95 latency is {}ms (slow threshold {}ms); review indexes and query plans for the slowest shapes",
            latency.p95_ms, config.slow_query_ms
        ));
    }
    if error_rate > 0.05 {
        out.push(format!(
            "{:.1}% of queries failed; inspect query errors and connection health",
            error_rate * 100.0
        ));
    }

    // Most frequent findings first.
    let mut codes: Vec<(&WarningCode, &usize)> = warning_counts.iter().collect();
    codes.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
    for (code, _) in codes {
        out.push(code.recommendation().to_string());
    }

    out
}
