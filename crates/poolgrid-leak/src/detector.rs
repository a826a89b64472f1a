//! Acquisition ledger and leak sweep.

use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use poolgrid_core::metadata::sanitize;
use poolgrid_core::{Metadata, SharedClock, TaskHandle, spawn_periodic};

use crate::config::LeakConfig;

/// Forced-release hook called by `cleanup_leaks()` for each leaked record.
pub type ReleaseHook = Arc<dyn Fn(AcquisitionRecord) -> BoxFuture + Send + Sync>;

type BoxFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

/// Usage state of a tracked acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordState {
    /// Checked out, nothing recorded yet.
    Acquired,
    /// At least one activity recorded.
    Active,
    /// A failure was recorded.
    Error,
}

/// One checked-out handle as seen by the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcquisitionRecord {
    pub connection_id: String,
    /// Caller-supplied label for where the handle was acquired.
    pub source: String,
    pub acquired_at: u64,
    pub last_activity_at: u64,
    pub state: RecordState,
    pub query_count: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub metadata: Metadata,
    /// Call-site backtrace, when trace capture is enabled.
    pub trace: Option<String>,
    #[serde(skip)]
    reported: bool,
}

/// A record held past the leak threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeakReport {
    pub connection_id: String,
    pub source: String,
    pub held_ms: u64,
    pub idle_ms: u64,
    pub state: RecordState,
    pub query_count: u64,
    pub trace: Option<String>,
}

/// Outcome of `cleanup_leaks()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupSummary {
    pub cleaned: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LeakVerdict {
    Healthy,
    Warning,
    Critical,
}

/// Counts of the currently tracked acquisitions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeakHealth {
    pub tracked: usize,
    /// Not leaked, with recent activity.
    pub active: usize,
    /// Not leaked, but quiet for at least `idle_threshold`.
    pub idle: usize,
    pub leaked: usize,
    /// `leaked / active`; with nothing active, the leaked count itself.
    pub leak_ratio: f64,
    pub verdict: LeakVerdict,
}

/// Cumulative ledger counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LeakStats {
    pub acquisitions: u64,
    pub releases: u64,
    pub activities: u64,
    pub errors: u64,
    /// Distinct leaks found by sweeps.
    pub leaks_detected: u64,
    pub leaks_cleaned: u64,
    pub cleanup_failures: u64,
    pub currently_tracked: usize,
    pub peak_tracked: usize,
}

#[derive(Debug, Default)]
struct Ledger {
    records: HashMap<String, AcquisitionRecord>,
    stats: LeakStats,
}

/// Tracks caller-side handle acquisitions and flags the ones held too long.
///
/// The ledger is independent of the pool's own bookkeeping: it only knows
/// what callers tell it. Every tracking call is infallible; empty or
/// unknown ids are ignored.
pub struct LeakDetector {
    config: LeakConfig,
    clock: SharedClock,
    ledger: Mutex<Ledger>,
    release_hook: Option<ReleaseHook>,
}

impl LeakDetector {
    pub fn new(config: LeakConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            ledger: Mutex::new(Ledger::default()),
            release_hook: None,
        }
    }

    /// Install the hook `cleanup_leaks()` uses to force-release handles.
    pub fn with_release_hook(mut self, hook: ReleaseHook) -> Self {
        self.release_hook = Some(hook);
        self
    }

    pub fn config(&self) -> &LeakConfig {
        &self.config
    }

    // ── Tracking ───────────────────────────────────────────────────

    /// Start tracking `id`. Tracking an id twice replaces the old record.
    pub async fn track_acquisition(&self, id: &str, source: &str, metadata: Option<Metadata>) {
        if id.trim().is_empty() {
            debug!("ignoring acquisition with empty id");
            return;
        }

        let now = self.clock.now_ms();
        let trace = self
            .config
            .capture_traces
            .then(|| Backtrace::force_capture().to_string());

        let record = AcquisitionRecord {
            connection_id: id.to_string(),
            source: source.to_string(),
            acquired_at: now,
            last_activity_at: now,
            state: RecordState::Acquired,
            query_count: 0,
            error_count: 0,
            last_error: None,
            metadata: metadata.map(sanitize).unwrap_or_default(),
            trace,
            reported: false,
        };

        let mut ledger = self.ledger.lock().await;
        if ledger.records.insert(id.to_string(), record).is_some() {
            warn!(connection_id = %id, "acquisition tracked twice, replacing record");
        }
        ledger.stats.acquisitions += 1;
        ledger.stats.peak_tracked = ledger.stats.peak_tracked.max(ledger.records.len());
        debug!(connection_id = %id, %source, "tracking acquisition");
    }

    /// Record one use of `id`.
    pub async fn track_activity(&self, id: &str, success: bool) {
        let now = self.clock.now_ms();
        let mut ledger = self.ledger.lock().await;
        let Some(record) = ledger.records.get_mut(id) else {
            return;
        };

        record.last_activity_at = now;
        record.query_count += 1;
        if success {
            if record.state == RecordState::Acquired {
                record.state = RecordState::Active;
            }
        } else {
            record.error_count += 1;
            record.state = RecordState::Error;
        }
        ledger.stats.activities += 1;
    }

    /// Record a failure on `id`. The record stays until released.
    pub async fn track_error(&self, id: &str, message: &str) {
        let now = self.clock.now_ms();
        let mut ledger = self.ledger.lock().await;
        let Some(record) = ledger.records.get_mut(id) else {
            return;
        };

        record.last_activity_at = now;
        record.error_count += 1;
        record.last_error = Some(message.to_string());
        record.state = RecordState::Error;
        ledger.stats.errors += 1;
    }

    /// Stop tracking `id`. Returns whether a record was removed.
    pub async fn track_release(&self, id: &str) -> bool {
        let mut ledger = self.ledger.lock().await;
        let removed = ledger.records.remove(id).is_some();
        if removed {
            ledger.stats.releases += 1;
            debug!(connection_id = %id, "acquisition released");
        }
        removed
    }

    // ── Detection ──────────────────────────────────────────────────

    /// Records held longer than `threshold`, longest-held first. Read only.
    pub async fn detect_leaks(&self) -> Vec<LeakReport> {
        let now = self.clock.now_ms();
        let ledger = self.ledger.lock().await;
        let mut leaks: Vec<LeakReport> = ledger
            .records
            .values()
            .filter(|r| self.is_leaked(r, now))
            .map(|r| LeakReport {
                connection_id: r.connection_id.clone(),
                source: r.source.clone(),
                held_ms: now.saturating_sub(r.acquired_at),
                idle_ms: now.saturating_sub(r.last_activity_at),
                state: r.state,
                query_count: r.query_count,
                trace: r.trace.clone(),
            })
            .collect();
        leaks.sort_by(|a, b| b.held_ms.cmp(&a.held_ms).then(a.connection_id.cmp(&b.connection_id)));
        leaks
    }

    fn is_leaked(&self, record: &AcquisitionRecord, now: u64) -> bool {
        now.saturating_sub(record.acquired_at) > self.config.threshold.as_millis() as u64
    }

    /// Force-release every leaked record.
    ///
    /// With a release hook, a record is dropped only if the hook succeeds;
    /// failed records stay tracked. Without a hook, leaked records are
    /// simply dropped from the ledger.
    pub async fn cleanup_leaks(&self) -> CleanupSummary {
        let now = self.clock.now_ms();
        let leaked: Vec<AcquisitionRecord> = {
            let ledger = self.ledger.lock().await;
            ledger
                .records
                .values()
                .filter(|r| self.is_leaked(r, now))
                .cloned()
                .collect()
        };

        let mut released = Vec::with_capacity(leaked.len());
        let mut summary = CleanupSummary::default();
        for record in leaked {
            let id = record.connection_id.clone();
            let outcome = match &self.release_hook {
                Some(hook) => hook(record).await,
                None => Ok(()),
            };
            match outcome {
                Ok(()) => {
                    released.push(id);
                    summary.cleaned += 1;
                }
                Err(e) => {
                    warn!(connection_id = %id, error = %e, "forced release failed");
                    summary.failed += 1;
                }
            }
        }

        let mut ledger = self.ledger.lock().await;
        for id in &released {
            ledger.records.remove(id);
        }
        ledger.stats.leaks_cleaned += summary.cleaned as u64;
        ledger.stats.cleanup_failures += summary.failed as u64;

        if summary.cleaned + summary.failed > 0 {
            info!(cleaned = summary.cleaned, failed = summary.failed, "leak cleanup finished");
        }
        summary
    }

    // ── Read surface ───────────────────────────────────────────────

    /// Active, idle, and leaked counts with a verdict from the leaked-to-active
    /// ratio: no leaks is healthy, up to 10% is a warning, above that critical.
    pub async fn get_pool_health(&self) -> LeakHealth {
        let now = self.clock.now_ms();
        let idle_ms = self.config.idle_threshold.as_millis() as u64;
        let ledger = self.ledger.lock().await;

        let (mut active, mut idle, mut leaked) = (0, 0, 0);
        for record in ledger.records.values() {
            if self.is_leaked(record, now) {
                leaked += 1;
            } else if now.saturating_sub(record.last_activity_at) >= idle_ms {
                idle += 1;
            } else {
                active += 1;
            }
        }

        let tracked = ledger.records.len();
        let leak_ratio = leaked as f64 / active.max(1) as f64;
        let verdict = if leaked == 0 {
            LeakVerdict::Healthy
        } else if leak_ratio <= 0.1 {
            LeakVerdict::Warning
        } else {
            LeakVerdict::Critical
        };

        LeakHealth {
            tracked,
            active,
            idle,
            leaked,
            leak_ratio,
            verdict,
        }
    }

    pub async fn get_connection(&self, id: &str) -> Option<AcquisitionRecord> {
        self.ledger.lock().await.records.get(id).cloned()
    }

    pub async fn stats(&self) -> LeakStats {
        let ledger = self.ledger.lock().await;
        LeakStats {
            currently_tracked: ledger.records.len(),
            ..ledger.stats
        }
    }

    // ── Sweep ──────────────────────────────────────────────────────

    /// One sweep: log newly found leaks, then force-release them if
    /// `auto_cleanup` is set. Returns the number of leaks currently held.
    pub async fn sweep(&self) -> usize {
        let leaks = self.detect_leaks().await;

        {
            let mut ledger = self.ledger.lock().await;
            let mut fresh = 0;
            for leak in &leaks {
                let Some(record) = ledger.records.get_mut(&leak.connection_id) else {
                    continue;
                };
                if !record.reported {
                    record.reported = true;
                    fresh += 1;
                    warn!(
                        connection_id = %leak.connection_id,
                        source = %leak.source,
                        held_ms = leak.held_ms,
                        state = ?leak.state,
                        trace = leak.trace.as_deref().unwrap_or("<not captured>"),
                        "possible handle leak"
                    );
                }
            }
            ledger.stats.leaks_detected += fresh;
        }

        if self.config.auto_cleanup && !leaks.is_empty() {
            self.cleanup_leaks().await;
        }
        leaks.len()
    }

    /// Start the periodic leak sweep.
    pub fn start(self: &Arc<Self>) -> TaskHandle {
        let detector = Arc::clone(self);
        spawn_periodic("leak-sweep", self.config.sweep_interval, move || {
            let detector = Arc::clone(&detector);
            async move {
                detector.sweep().await;
                Ok::<(), anyhow::Error>(())
            }
        })
    }
}

impl std::fmt::Debug for LeakDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeakDetector")
            .field("config", &self.config)
            .field("has_release_hook", &self.release_hook.is_some())
            .finish_non_exhaustive()
    }
}
