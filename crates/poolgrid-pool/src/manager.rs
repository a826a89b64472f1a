//! Connection pool manager.
//!
//! # Architecture
//!
//! ```text
//! Caller calls acquire(pool_id, hint)
//!   → scan pool for an idle, healthy entry → claim it, return handle
//!   → none idle but size < max → reserve a slot, create + probe → return handle
//!   → pool full → poll every 100ms until acquire_timeout → PoolExhausted
//! ```
//!
//! All pool state lives behind one mutex. Finding an eligible entry and
//! marking it in use happen under a single guard, so two concurrent
//! `acquire()` calls can never claim the same entry. Slow work (handle
//! creation, probes) happens with the lock released; a creation in flight
//! holds a reserved slot so `size <= max` holds throughout.
//!
//! Reservations and probe marks are guards that undo themselves on drop,
//! so a caller that cancels `acquire()` (a `timeout`, a `select!`, an
//! aborted task) mid-creation or mid-probe gives the slot back.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use poolgrid_core::config::PoolSection;
use poolgrid_core::signal::sleep;
use poolgrid_core::{AbortSignal, RetryExecutor, SharedClock, TaskHandle, spawn_periodic};

use crate::config::PoolConfig;
use crate::error::{ExecuteError, PoolError, PoolResult};
use crate::factory::{HandleFactory, Probe, run_probe};

/// Fixed interval between capacity checks while `acquire()` waits.
pub const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Manager-wide tuning that is not per-pool.
#[derive(Clone, Debug)]
pub struct ManagerOptions {
    /// Poll attempts made by `shutdown()` while waiting for in-use entries.
    pub drain_attempts: u32,
    /// Delay between drain polls.
    pub drain_poll_interval: Duration,
    /// Interval of the idle-cleanup task started by `start_maintenance()`.
    pub cleanup_interval: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            drain_attempts: 50,
            drain_poll_interval: Duration::from_millis(100),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// A pooled handle with tracking metadata.
#[derive(Debug)]
struct PoolEntry<H> {
    id: String,
    handle: Arc<H>,
    created_at: u64,
    last_used_at: u64,
    healthy: bool,
    in_use: bool,
    region: Option<String>,
    request_count: u64,
    error_count: u64,
    last_error: Option<String>,
    /// Held by a health probe; not eligible for acquire until it finishes.
    probing: Arc<AtomicBool>,
}

impl<H> PoolEntry<H> {
    fn eligible(&self) -> bool {
        !self.in_use && self.healthy && !self.is_probing()
    }

    fn is_probing(&self) -> bool {
        self.probing.load(Ordering::Acquire)
    }

    fn info(&self) -> EntryInfo {
        EntryInfo {
            id: self.id.clone(),
            created_at: self.created_at,
            last_used_at: self.last_used_at,
            healthy: self.healthy,
            in_use: self.in_use,
            region: self.region.clone(),
            request_count: self.request_count,
            error_count: self.error_count,
            last_error: self.last_error.clone(),
        }
    }
}

/// Read-only view of a pool entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EntryInfo {
    pub id: String,
    pub created_at: u64,
    pub last_used_at: u64,
    pub healthy: bool,
    pub in_use: bool,
    pub region: Option<String>,
    pub request_count: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
}

/// One named pool.
#[derive(Debug)]
struct Pool<H> {
    config: PoolConfig,
    entries: Vec<PoolEntry<H>>,
    /// Slots reserved by creations still in flight.
    pending: Arc<AtomicUsize>,
}

impl<H> Pool<H> {
    fn new(config: PoolConfig) -> Self {
        Self {
            config,
            entries: Vec::new(),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn size(&self) -> usize {
        self.entries.len() + self.pending()
    }

    /// Reserve `slots` creation slots. Caller holds the pool lock.
    fn reserve(&self, slots: usize) -> Reservation {
        self.pending.fetch_add(slots, Ordering::AcqRel);
        Reservation {
            pending: Arc::clone(&self.pending),
            slots,
        }
    }

    fn in_use(&self) -> usize {
        self.entries.iter().filter(|e| e.in_use).count()
    }

    /// Index of the entry `acquire()` should claim. A region hint only
    /// breaks ties between eligible entries.
    fn select(&self, hint: Option<&str>) -> Option<usize> {
        if let Some(region) = hint {
            let preferred = self
                .entries
                .iter()
                .position(|e| e.eligible() && e.region.as_deref() == Some(region));
            if preferred.is_some() {
                return preferred;
            }
        }
        self.entries.iter().position(|e| e.eligible())
    }
}

/// Creation slots counted in `Pool::pending` until dropped.
///
/// Dropped under the pool lock right after the created entries are pushed,
/// or wherever the creating future is cancelled.
#[derive(Debug)]
struct Reservation {
    pending: Arc<AtomicUsize>,
    slots: usize,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.pending.fetch_sub(self.slots, Ordering::AcqRel);
    }
}

/// Probe marks set by `probe_idle`, cleared on drop.
struct ProbeMarks(Vec<Arc<AtomicBool>>);

impl Drop for ProbeMarks {
    fn drop(&mut self) {
        for mark in &self.0 {
            mark.store(false, Ordering::Release);
        }
    }
}

/// Snapshot of a single pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub pool_id: String,
    pub min: usize,
    pub max: usize,
    /// Entries in the pool (in use + idle).
    pub total: usize,
    pub in_use: usize,
    pub idle: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    /// Creations in flight.
    pub pending: usize,
    pub entries: Vec<EntryInfo>,
}

/// Manager-wide counters plus current totals across all pools.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolMetrics {
    pub pools: usize,
    pub total: usize,
    pub in_use: usize,
    pub idle: usize,
    pub unhealthy: usize,
    pub capacity: usize,
    pub acquired: u64,
    pub released: u64,
    pub created: u64,
    pub creation_failures: u64,
    pub exhausted: u64,
    pub waits: u64,
    pub evicted: u64,
}

#[derive(Debug, Default)]
struct Counters {
    acquired: AtomicU64,
    released: AtomicU64,
    created: AtomicU64,
    creation_failures: AtomicU64,
    exhausted: AtomicU64,
    waits: AtomicU64,
    evicted: AtomicU64,
}

/// Result of one probe run by a health sweep.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeReport {
    pub pool_id: String,
    pub entry_id: String,
    pub healthy: bool,
    pub latency: Option<Duration>,
    pub error: Option<String>,
}

/// Options for a single `execute()` call.
#[derive(Clone, Debug, Default)]
pub struct ExecuteOptions {
    /// Overrides the pool's `retry_attempts`.
    pub retry_attempts: Option<u32>,
    /// Soft region preference passed to `acquire()`.
    pub hint: Option<String>,
    /// Aborts acquire waits and backoff delays.
    pub signal: Option<AbortSignal>,
}

enum Claim<H> {
    Handle(Arc<H>),
    Reserved(PoolConfig, Reservation),
    Full,
}

/// Owns named pools of opaque handles.
///
/// Each pool id gets its own bounded collection of entries. Handles are
/// reused when returned via `release()` and evicted by `cleanup_pool()`
/// when unhealthy, too old, or idle beyond `min`.
pub struct ConnectionPoolManager<H> {
    pools: Mutex<HashMap<String, Pool<H>>>,
    factory: Arc<dyn HandleFactory<H>>,
    probe: Arc<dyn Probe<H>>,
    clock: SharedClock,
    options: ManagerOptions,
    counters: Counters,
    next_entry: AtomicU64,
    /// When true, new `acquire()` calls are rejected.
    draining: AtomicBool,
}

impl<H> ConnectionPoolManager<H>
where
    H: Send + Sync + 'static,
{
    pub fn new(
        factory: Arc<dyn HandleFactory<H>>,
        probe: Arc<dyn Probe<H>>,
        clock: SharedClock,
    ) -> Self {
        Self::with_options(factory, probe, clock, ManagerOptions::default())
    }

    pub fn with_options(
        factory: Arc<dyn HandleFactory<H>>,
        probe: Arc<dyn Probe<H>>,
        clock: SharedClock,
        options: ManagerOptions,
    ) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            factory,
            probe,
            clock,
            options,
            counters: Counters::default(),
            next_entry: AtomicU64::new(1),
            draining: AtomicBool::new(false),
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Relaxed)
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    fn next_entry_id(&self, pool_id: &str) -> String {
        let n = self.next_entry.fetch_add(1, Ordering::Relaxed);
        format!("{pool_id}-{n}")
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Merge `overrides` over the defaults, create the pool, and warm it
    /// up to `min` entries.
    ///
    /// Warm-up failures are logged and swallowed; only configuration
    /// problems fail initialization. Re-initializing an existing pool
    /// replaces its configuration and keeps its entries.
    pub async fn initialize_pool(&self, pool_id: &str, overrides: &PoolSection) -> PoolResult<()> {
        let config = PoolConfig::from_section(pool_id, overrides)?;
        self.add_pool(config).await
    }

    /// Register an already-built configuration and warm the pool up.
    pub async fn add_pool(&self, config: PoolConfig) -> PoolResult<()> {
        config.validate()?;
        let pool_id = config.pool_id.clone();

        {
            let mut pools = self.pools.lock().await;
            match pools.get_mut(&pool_id) {
                Some(pool) => {
                    info!(pool_id = %pool_id, "pool reconfigured");
                    pool.config = config.clone();
                }
                None => {
                    pools.insert(pool_id.clone(), Pool::new(config.clone()));
                }
            }
        }

        info!(
            pool_id = %pool_id,
            min = config.min,
            max = config.max,
            endpoint = %config.connection.endpoint,
            "pool initialized"
        );

        match self.ensure_minimum_connections(&pool_id).await {
            Ok(created) => debug!(pool_id = %pool_id, created, "pool warm-up finished"),
            Err(e) => warn!(pool_id = %pool_id, error = %e, "pool warm-up failed"),
        }
        Ok(())
    }

    /// Configuration of a pool, if it exists.
    pub async fn pool_config(&self, pool_id: &str) -> Option<PoolConfig> {
        self.pools.lock().await.get(pool_id).map(|p| p.config.clone())
    }

    /// Ids of all pools, sorted.
    pub async fn pool_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pools.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    // ── Acquire / release ──────────────────────────────────────────

    /// Check out a handle from `pool_id`.
    pub async fn acquire(&self, pool_id: &str, hint: Option<&str>) -> PoolResult<Arc<H>> {
        self.acquire_with_signal(pool_id, hint, None).await
    }

    /// Check out a handle, giving up early if `signal` is aborted.
    ///
    /// An idle healthy entry is returned immediately. Otherwise a new one
    /// is created if the pool is under `max`. Otherwise the pool is polled
    /// every 100ms until `acquire_timeout` elapses.
    pub async fn acquire_with_signal(
        &self,
        pool_id: &str,
        hint: Option<&str>,
        signal: Option<&AbortSignal>,
    ) -> PoolResult<Arc<H>> {
        if self.is_draining() {
            return Err(PoolError::Draining);
        }

        let timeout = self
            .pool_config(pool_id)
            .await
            .ok_or_else(|| PoolError::UnknownPool(pool_id.to_string()))?
            .acquire_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        let mut waited = false;

        loop {
            match self.claim_or_reserve(pool_id, hint).await? {
                Claim::Handle(handle) => return Ok(handle),
                Claim::Reserved(config, slot) => {
                    return self.create_reserved(config, slot, true).await;
                }
                Claim::Full => {}
            }

            if !waited {
                waited = true;
                self.counters.waits.fetch_add(1, Ordering::Relaxed);
                debug!(pool_id = %pool_id, "pool at capacity, waiting for a release");
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                warn!(pool_id = %pool_id, ?timeout, "pool exhausted");
                return Err(PoolError::Exhausted {
                    pool_id: pool_id.to_string(),
                    timeout,
                });
            }

            sleep(ACQUIRE_POLL_INTERVAL.min(deadline - now), signal).await?;

            if self.is_draining() {
                return Err(PoolError::Draining);
            }
        }
    }

    /// Claim an eligible entry, or reserve a creation slot, under one guard.
    async fn claim_or_reserve(&self, pool_id: &str, hint: Option<&str>) -> PoolResult<Claim<H>> {
        let mut pools = self.pools.lock().await;
        let pool = pools
            .get_mut(pool_id)
            .ok_or_else(|| PoolError::UnknownPool(pool_id.to_string()))?;

        if let Some(idx) = pool.select(hint) {
            let entry = &mut pool.entries[idx];
            entry.in_use = true;
            entry.last_used_at = self.clock.now_ms();
            entry.request_count += 1;
            self.counters.acquired.fetch_add(1, Ordering::Relaxed);
            debug!(
                pool_id = %pool_id,
                entry_id = %entry.id,
                region = ?entry.region,
                "reused idle entry from pool"
            );
            return Ok(Claim::Handle(Arc::clone(&entry.handle)));
        }

        if pool.size() < pool.config.max {
            let slot = pool.reserve(1);
            return Ok(Claim::Reserved(pool.config.clone(), slot));
        }

        Ok(Claim::Full)
    }

    /// Create an entry for a slot reserved by `claim_or_reserve`.
    async fn create_reserved(
        &self,
        config: PoolConfig,
        slot: Reservation,
        claim: bool,
    ) -> PoolResult<Arc<H>> {
        let pool_id = config.pool_id.clone();
        let entry_id = self.next_entry_id(&pool_id);
        let result = create_entry(
            Arc::clone(&self.factory),
            Arc::clone(&self.probe),
            config,
            Arc::clone(&self.clock),
            entry_id,
        )
        .await;

        let mut pools = self.pools.lock().await;
        let Some(pool) = pools.get_mut(&pool_id) else {
            if let Ok(entry) = &result {
                self.factory.close(&entry.handle);
            }
            return Err(PoolError::UnknownPool(pool_id));
        };

        let outcome = match result {
            Ok(mut entry) => {
                if claim {
                    entry.in_use = true;
                    entry.request_count = 1;
                    self.counters.acquired.fetch_add(1, Ordering::Relaxed);
                }
                self.counters.created.fetch_add(1, Ordering::Relaxed);
                debug!(
                    pool_id = %pool_id,
                    entry_id = %entry.id,
                    size = pool.entries.len() + 1,
                    "created new entry"
                );
                let handle = Arc::clone(&entry.handle);
                pool.entries.push(entry);
                Ok(handle)
            }
            Err(e) => {
                self.counters.creation_failures.fetch_add(1, Ordering::Relaxed);
                warn!(pool_id = %pool_id, error = %e, "handle creation failed");
                Err(e)
            }
        };
        drop(slot);
        outcome
    }

    /// Return a handle to its pool.
    ///
    /// Unknown pools, unknown handles, and handles that are already
    /// released are ignored, so this is safe to call defensively.
    pub async fn release(&self, pool_id: &str, handle: &Arc<H>) {
        let mut pools = self.pools.lock().await;
        let Some(pool) = pools.get_mut(pool_id) else {
            debug!(pool_id = %pool_id, "release for unknown pool ignored");
            return;
        };
        let Some(entry) = pool.entries.iter_mut().find(|e| Arc::ptr_eq(&e.handle, handle)) else {
            debug!(pool_id = %pool_id, "release for unknown handle ignored");
            return;
        };
        if !entry.in_use {
            return;
        }

        entry.in_use = false;
        entry.last_used_at = self.clock.now_ms();
        self.counters.released.fetch_add(1, Ordering::Relaxed);
        debug!(pool_id = %pool_id, entry_id = %entry.id, "returned entry to pool");
    }

    /// Record a failure observed while using `handle`.
    pub async fn report_error(&self, pool_id: &str, handle: &Arc<H>, message: &str) {
        let mut pools = self.pools.lock().await;
        if let Some(entry) = pools
            .get_mut(pool_id)
            .and_then(|p| p.entries.iter_mut().find(|e| Arc::ptr_eq(&e.handle, handle)))
        {
            entry.error_count += 1;
            entry.last_error = Some(message.to_string());
        }
    }

    // ── Execute ────────────────────────────────────────────────────

    /// Acquire a handle, run `operation` with it, and release it.
    ///
    /// Failures are retried with exponential backoff up to the pool's
    /// `retry_attempts` (or `options.retry_attempts`). The error of the
    /// last attempt is returned; an operation error comes back untouched
    /// in `ExecuteError::Operation`.
    pub async fn execute<T, E, F, Fut>(
        &self,
        pool_id: &str,
        options: ExecuteOptions,
        operation: F,
    ) -> Result<T, ExecuteError<E>>
    where
        F: Fn(Arc<H>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let config = self
            .pool_config(pool_id)
            .await
            .ok_or_else(|| PoolError::UnknownPool(pool_id.to_string()))?;

        let mut policy = config.retry_policy();
        if let Some(attempts) = options.retry_attempts {
            policy = policy.with_attempts(attempts);
        }
        let executor = RetryExecutor::new(policy);

        let this = self;
        let op = &operation;
        let hint = options.hint.as_deref();
        let signal = options.signal.as_ref();

        executor
            .run_if(
                signal,
                move |attempt| async move {
                    let handle = this.acquire_with_signal(pool_id, hint, signal).await?;
                    let result = op(Arc::clone(&handle)).await;
                    if let Err(e) = &result {
                        debug!(pool_id = %pool_id, attempt, error = %e, "operation failed");
                        this.report_error(pool_id, &handle, &e.to_string()).await;
                    }
                    this.release(pool_id, &handle).await;
                    result.map_err(ExecuteError::Operation)
                },
                |err: &ExecuteError<E>| match err {
                    ExecuteError::Operation(_) => true,
                    ExecuteError::Pool(e) => e.is_retryable(),
                },
            )
            .await
    }

    // ── Maintenance ────────────────────────────────────────────────

    /// Create entries until the pool holds `min`.
    ///
    /// All missing entries are created in parallel; failures are logged
    /// and the successes are kept. Returns the number created.
    pub async fn ensure_minimum_connections(&self, pool_id: &str) -> PoolResult<usize> {
        let (deficit, config, slots) = {
            let mut pools = self.pools.lock().await;
            let pool = pools
                .get_mut(pool_id)
                .ok_or_else(|| PoolError::UnknownPool(pool_id.to_string()))?;
            let deficit = pool.config.min.saturating_sub(pool.size());
            (deficit, pool.config.clone(), pool.reserve(deficit))
        };

        if deficit == 0 {
            return Ok(0);
        }

        let mut set = JoinSet::new();
        for _ in 0..deficit {
            let factory = Arc::clone(&self.factory);
            let probe = Arc::clone(&self.probe);
            let clock = Arc::clone(&self.clock);
            let config = config.clone();
            let entry_id = self.next_entry_id(pool_id);
            let retry = RetryExecutor::new(config.retry_policy());

            set.spawn(async move {
                retry
                    .run(None, |_| {
                        create_entry(
                            Arc::clone(&factory),
                            Arc::clone(&probe),
                            config.clone(),
                            Arc::clone(&clock),
                            entry_id.clone(),
                        )
                    })
                    .await
            });
        }

        let mut results = Vec::with_capacity(deficit);
        while let Some(joined) = set.join_next().await {
            results.push(joined.unwrap_or_else(|e| {
                Err(PoolError::Creation {
                    pool_id: pool_id.to_string(),
                    message: format!("creation task failed: {e}"),
                })
            }));
        }

        let mut pools = self.pools.lock().await;
        let Some(pool) = pools.get_mut(pool_id) else {
            for entry in results.into_iter().flatten() {
                self.factory.close(&entry.handle);
            }
            return Err(PoolError::UnknownPool(pool_id.to_string()));
        };

        let mut created = 0;
        let mut failed = 0;
        for result in results {
            match result {
                Ok(entry) => {
                    pool.entries.push(entry);
                    created += 1;
                }
                Err(e) => {
                    failed += 1;
                    warn!(pool_id = %pool_id, error = %e, "replenish attempt failed");
                }
            }
        }
        drop(slots);
        self.counters.created.fetch_add(created as u64, Ordering::Relaxed);
        self.counters
            .creation_failures
            .fetch_add(failed as u64, Ordering::Relaxed);

        info!(pool_id = %pool_id, created, failed, size = pool.entries.len(), "replenished pool");
        Ok(created)
    }

    /// Evict idle entries that are unhealthy, past `max_lifetime`, or idle
    /// past `idle_timeout` while the pool is above `min`.
    ///
    /// Entries in use or being probed are never touched. Returns the
    /// number evicted.
    pub async fn cleanup_pool(&self, pool_id: &str) -> PoolResult<usize> {
        let now = self.clock.now_ms();
        let mut evicted = Vec::new();

        {
            let mut pools = self.pools.lock().await;
            let pool = pools
                .get_mut(pool_id)
                .ok_or_else(|| PoolError::UnknownPool(pool_id.to_string()))?;

            let min = pool.config.min;
            let idle_ms = pool.config.idle_timeout.as_millis() as u64;
            let lifetime_ms = pool.config.max_lifetime.as_millis() as u64;

            let mut i = 0;
            while i < pool.entries.len() {
                let size = pool.size();
                let entry = &pool.entries[i];
                let reason = if entry.in_use || entry.is_probing() {
                    None
                } else if !entry.healthy {
                    Some("unhealthy")
                } else if now.saturating_sub(entry.created_at) > lifetime_ms {
                    Some("max lifetime exceeded")
                } else if now.saturating_sub(entry.last_used_at) > idle_ms && size > min {
                    Some("idle timeout")
                } else {
                    None
                };

                match reason {
                    Some(reason) => {
                        let entry = pool.entries.remove(i);
                        debug!(pool_id = %pool_id, entry_id = %entry.id, reason, "evicting entry");
                        evicted.push(entry);
                    }
                    None => i += 1,
                }
            }
        }

        for entry in &evicted {
            self.factory.close(&entry.handle);
        }
        if !evicted.is_empty() {
            self.counters
                .evicted
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
            info!(pool_id = %pool_id, evicted = evicted.len(), "cleaned up pool");
        }
        Ok(evicted.len())
    }

    /// Probe every idle entry of `pool_id` and record the verdicts.
    ///
    /// Entries are marked as being probed under the lock before any probe
    /// runs, so a probe never overlaps with a caller using the handle. The
    /// marks are cleared even if this future is dropped mid-probe.
    pub async fn probe_idle(&self, pool_id: &str) -> PoolResult<Vec<ProbeReport>> {
        let (targets, marks, timeout) = {
            let mut pools = self.pools.lock().await;
            let pool = pools
                .get_mut(pool_id)
                .ok_or_else(|| PoolError::UnknownPool(pool_id.to_string()))?;
            let mut marks = Vec::new();
            let targets: Vec<(String, Arc<H>)> = pool
                .entries
                .iter()
                .filter(|e| !e.in_use && !e.is_probing())
                .map(|e| {
                    e.probing.store(true, Ordering::Release);
                    marks.push(Arc::clone(&e.probing));
                    (e.id.clone(), Arc::clone(&e.handle))
                })
                .collect();
            (targets, ProbeMarks(marks), pool.config.probe_timeout)
        };

        let mut reports = Vec::with_capacity(targets.len());
        for (entry_id, handle) in targets {
            let outcome = run_probe(self.probe.as_ref(), handle.as_ref(), timeout).await;
            reports.push(ProbeReport {
                pool_id: pool_id.to_string(),
                entry_id,
                healthy: outcome.is_ok(),
                latency: outcome.as_ref().ok().copied(),
                error: outcome.err().map(|e| e.to_string()),
            });
        }

        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get_mut(pool_id) {
            for report in &reports {
                if let Some(entry) = pool.entries.iter_mut().find(|e| e.id == report.entry_id) {
                    if entry.healthy && !report.healthy {
                        warn!(
                            pool_id = %pool_id,
                            entry_id = %entry.id,
                            error = ?report.error,
                            "entry failed health probe"
                        );
                    }
                    entry.healthy = report.healthy;
                    if let Some(error) = &report.error {
                        entry.error_count += 1;
                        entry.last_error = Some(error.clone());
                    }
                }
            }
        }
        drop(marks);

        Ok(reports)
    }

    /// One maintenance pass over every pool: cleanup, then replenish.
    pub async fn run_maintenance(&self) -> anyhow::Result<()> {
        for pool_id in self.pool_ids().await {
            if let Err(e) = self.cleanup_pool(&pool_id).await {
                warn!(pool_id = %pool_id, error = %e, "cleanup failed");
            }
            if let Err(e) = self.ensure_minimum_connections(&pool_id).await {
                warn!(pool_id = %pool_id, error = %e, "replenish failed");
            }
        }
        Ok(())
    }

    /// Start the periodic idle-cleanup task.
    pub fn start_maintenance(self: &Arc<Self>) -> TaskHandle {
        let manager = Arc::clone(self);
        spawn_periodic("pool-maintenance", self.options.cleanup_interval, move || {
            let manager = Arc::clone(&manager);
            async move { manager.run_maintenance().await }
        })
    }

    /// Stop issuing handles, wait a bounded time for in-use entries to be
    /// released, then close every handle.
    ///
    /// Returns the number of in-use entries that were force-closed.
    pub async fn shutdown(&self) -> usize {
        self.draining.store(true, Ordering::Relaxed);
        info!(attempts = self.options.drain_attempts, "connection pool draining started");

        for _ in 0..self.options.drain_attempts {
            let in_use: usize = self.pools.lock().await.values().map(|p| p.in_use()).sum();
            if in_use == 0 {
                info!("all in-use entries drained gracefully");
                break;
            }
            debug!(remaining = in_use, "waiting for in-use entries");
            tokio::time::sleep(self.options.drain_poll_interval).await;
        }

        let mut pools = self.pools.lock().await;
        let mut force_closed = 0;
        for (pool_id, pool) in pools.drain() {
            for entry in pool.entries {
                if entry.in_use {
                    force_closed += 1;
                    debug!(pool_id = %pool_id, entry_id = %entry.id, "force-closed in-use entry");
                }
                self.factory.close(&entry.handle);
            }
        }

        if force_closed > 0 {
            warn!(force_closed, "drain incomplete, in-use entries were force-closed");
        }
        info!(force_closed, "connection pool shut down");
        force_closed
    }

    // ── Read surface ───────────────────────────────────────────────

    /// Snapshot of one pool.
    pub async fn get_pool_status(&self, pool_id: &str) -> Option<PoolStatus> {
        let pools = self.pools.lock().await;
        pools.get(pool_id).map(|pool| {
            let in_use = pool.in_use();
            let healthy = pool.entries.iter().filter(|e| e.healthy).count();
            PoolStatus {
                pool_id: pool_id.to_string(),
                min: pool.config.min,
                max: pool.config.max,
                total: pool.entries.len(),
                in_use,
                idle: pool.entries.len() - in_use,
                healthy,
                unhealthy: pool.entries.len() - healthy,
                pending: pool.pending(),
                entries: pool.entries.iter().map(PoolEntry::info).collect(),
            }
        })
    }

    /// Manager-wide metrics.
    pub async fn get_metrics(&self) -> PoolMetrics {
        let pools = self.pools.lock().await;
        let mut metrics = PoolMetrics {
            pools: pools.len(),
            acquired: self.counters.acquired.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            created: self.counters.created.load(Ordering::Relaxed),
            creation_failures: self.counters.creation_failures.load(Ordering::Relaxed),
            exhausted: self.counters.exhausted.load(Ordering::Relaxed),
            waits: self.counters.waits.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            ..PoolMetrics::default()
        };

        for pool in pools.values() {
            let in_use = pool.in_use();
            metrics.total += pool.entries.len();
            metrics.in_use += in_use;
            metrics.idle += pool.entries.len() - in_use;
            metrics.unhealthy += pool.entries.iter().filter(|e| !e.healthy).count();
            metrics.capacity += pool.config.max;
        }
        metrics
    }

    /// Log statistics for all pools at `info` level.
    pub async fn log_stats(&self) {
        let pools = self.pools.lock().await;
        for (pool_id, pool) in pools.iter() {
            info!(
                pool_id = %pool_id,
                in_use = pool.in_use(),
                total = pool.entries.len(),
                pending = pool.pending(),
                max = pool.config.max,
                "pool statistics"
            );
        }
    }
}

/// Create one entry: factory call bounded by `acquire_timeout`, then an
/// immediate probe.
async fn create_entry<H>(
    factory: Arc<dyn HandleFactory<H>>,
    probe: Arc<dyn Probe<H>>,
    config: PoolConfig,
    clock: SharedClock,
    entry_id: String,
) -> PoolResult<PoolEntry<H>> {
    let creation_error = |message: String| PoolError::Creation {
        pool_id: config.pool_id.clone(),
        message,
    };

    let handle = match tokio::time::timeout(config.acquire_timeout, factory.create(&config.connection))
        .await
    {
        Ok(Ok(handle)) => handle,
        Ok(Err(message)) => return Err(creation_error(message)),
        Err(_) => {
            return Err(creation_error(format!(
                "factory did not respond within {:?}",
                config.acquire_timeout
            )));
        }
    };

    if let Err(e) = run_probe(probe.as_ref(), &handle, config.probe_timeout).await {
        factory.close(&handle);
        return Err(creation_error(format!("initial probe failed: {e}")));
    }

    let now = clock.now_ms();
    let region = factory
        .region_of(&handle)
        .or_else(|| config.connection.region.clone());

    Ok(PoolEntry {
        id: entry_id,
        handle: Arc::new(handle),
        created_at: now,
        last_used_at: now,
        healthy: true,
        in_use: false,
        region,
        request_count: 0,
        error_count: 0,
        last_error: None,
        probing: Arc::new(AtomicBool::new(false)),
    })
}

// ── Debug impl (cannot auto-derive due to dyn trait) ────────────────

impl<H> std::fmt::Debug for ConnectionPoolManager<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPoolManager")
            .field("options", &self.options)
            .field("draining", &self.draining.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
