//! Health monitor: periodic probe sweep over every pool.
//!
//! The `HealthMonitor` probes idle entries of each pool, feeds probe
//! latencies and failures into its statistics, evicts what failed, and
//! refills pools to their minimum. `get_health_status()` turns the
//! statistics and the pool snapshot into a graded verdict.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use poolgrid_core::{Alert, AlertLog, Severity, SharedClock, TaskHandle, spawn_periodic};
use poolgrid_pool::ConnectionPoolManager;

use crate::checker::{
    HealthConfig, HealthVerdict, LatencyWindow, SubCheck, capacity_check, connection_check,
    error_rate_check, latency_check,
};

/// Callback invoked when the aggregate verdict changes: `(previous, new)`.
pub type HealthCallback = Arc<dyn Fn(HealthVerdict, HealthVerdict) -> BoxFuture + Send + Sync>;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Sweep interval used when neither the monitor nor any pool sets one.
const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct MonitorState {
    latencies: LatencyWindow,
    /// Probe failures plus errors reported via `record_error`.
    errors: u64,
    /// Latency samples plus errors.
    observations: u64,
    alerts: AlertLog,
    last_verdict: Option<HealthVerdict>,
    last_check_at: Option<u64>,
    sweeps: u64,
}

/// Graded health of the whole pool manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub verdict: HealthVerdict,
    pub checks: Vec<SubCheck>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub last_check_at: Option<u64>,
    pub sweeps: u64,
    pub pools: usize,
    pub unresolved_alerts: usize,
}

/// Outcome of one `run_health_check()` sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub pools: usize,
    pub probed: usize,
    pub unhealthy: usize,
    pub evicted: usize,
    pub replenished: usize,
}

/// Probes pools and grades their health.
pub struct HealthMonitor<H> {
    pool: Arc<ConnectionPoolManager<H>>,
    config: HealthConfig,
    clock: SharedClock,
    state: Mutex<MonitorState>,
    on_status_change: Option<HealthCallback>,
}

impl<H> HealthMonitor<H>
where
    H: Send + Sync + 'static,
{
    /// Create a monitor over `pool`, sharing its clock.
    pub fn new(pool: Arc<ConnectionPoolManager<H>>, config: HealthConfig) -> Self {
        let clock = Arc::clone(pool.clock());
        let state = MonitorState {
            latencies: LatencyWindow::new(config.sample_size),
            errors: 0,
            observations: 0,
            alerts: AlertLog::new("health", config.max_alerts),
            last_verdict: None,
            last_check_at: None,
            sweeps: 0,
        };
        Self {
            pool,
            config,
            clock,
            state: Mutex::new(state),
            on_status_change: None,
        }
    }

    /// Set a callback for verdict changes observed by the sweep.
    pub fn with_callback(mut self, callback: HealthCallback) -> Self {
        self.on_status_change = Some(callback);
        self
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    // ── Statistics ─────────────────────────────────────────────────

    /// Record one latency sample. A sample at or above the critical
    /// threshold raises a critical alert; at or above the warning
    /// threshold, a warning.
    pub async fn record_latency(&self, ms: u64) {
        let now = self.clock.now_ms();
        let mut state = self.state.lock().await;
        state.latencies.push(ms);
        state.observations += 1;

        if ms >= self.config.latency_critical_ms {
            state.alerts.raise(
                now,
                Severity::Critical,
                "high_latency",
                format!(
                    "latency {ms}ms exceeds critical threshold {}ms",
                    self.config.latency_critical_ms
                ),
            );
        } else if ms >= self.config.latency_warning_ms {
            state.alerts.raise(
                now,
                Severity::Warning,
                "high_latency",
                format!(
                    "latency {ms}ms exceeds warning threshold {}ms",
                    self.config.latency_warning_ms
                ),
            );
        }
    }

    /// Record one failure and raise an error alert for it.
    pub async fn record_error(&self, error: &str) {
        let now = self.clock.now_ms();
        let mut state = self.state.lock().await;
        state.errors += 1;
        state.observations += 1;
        state.alerts.raise(now, Severity::Error, "error", error);
    }

    // ── Sweep ──────────────────────────────────────────────────────

    /// Probe idle entries of every pool, record the outcomes, then evict
    /// and replenish.
    ///
    /// Per-pool failures are logged and the sweep moves on.
    pub async fn run_health_check(&self) -> SweepSummary {
        let mut summary = SweepSummary::default();

        for pool_id in self.pool.pool_ids().await {
            summary.pools += 1;

            match self.pool.probe_idle(&pool_id).await {
                Ok(reports) => {
                    for report in reports {
                        summary.probed += 1;
                        match report.latency {
                            Some(latency) if report.healthy => {
                                self.record_latency(latency.as_millis() as u64).await;
                            }
                            _ => {
                                summary.unhealthy += 1;
                                let reason = report.error.as_deref().unwrap_or("probe failed");
                                self.record_error(&format!(
                                    "pool {pool_id}: entry {} unhealthy: {reason}",
                                    report.entry_id
                                ))
                                .await;
                            }
                        }
                    }
                }
                Err(e) => warn!(pool_id = %pool_id, error = %e, "health probe sweep failed"),
            }

            match self.pool.cleanup_pool(&pool_id).await {
                Ok(evicted) => summary.evicted += evicted,
                Err(e) => warn!(pool_id = %pool_id, error = %e, "cleanup failed"),
            }
            match self.pool.ensure_minimum_connections(&pool_id).await {
                Ok(created) => summary.replenished += created,
                Err(e) => warn!(pool_id = %pool_id, error = %e, "replenish failed"),
            }
        }

        let report = self.get_health_status().await;
        let previous = {
            let mut state = self.state.lock().await;
            state.sweeps += 1;
            state.last_check_at = Some(self.clock.now_ms());
            state.last_verdict.replace(report.verdict)
        };

        debug!(
            pools = summary.pools,
            probed = summary.probed,
            unhealthy = summary.unhealthy,
            evicted = summary.evicted,
            replenished = summary.replenished,
            verdict = %report.verdict,
            "health sweep finished"
        );

        if let Some(previous) = previous.filter(|p| *p != report.verdict) {
            info!(from = %previous, to = %report.verdict, "health verdict changed");
            if let Some(ref cb) = self.on_status_change {
                cb(previous, report.verdict).await;
            }
        }

        summary
    }

    /// Grade connection, latency, error-rate, and capacity health.
    pub async fn get_health_status(&self) -> HealthReport {
        let metrics = self.pool.get_metrics().await;
        let state = self.state.lock().await;

        let checks = vec![
            connection_check(metrics.total - metrics.unhealthy, metrics.total),
            latency_check(&state.latencies, &self.config),
            error_rate_check(state.errors, state.observations, &self.config),
            capacity_check(metrics.in_use, metrics.capacity, &self.config),
        ];

        HealthReport {
            verdict: HealthVerdict::from_checks(&checks),
            checks,
            timestamp: self.clock.now_ms(),
            last_check_at: state.last_check_at,
            sweeps: state.sweeps,
            pools: metrics.pools,
            unresolved_alerts: state.alerts.unresolved_count(),
        }
    }

    // ── Alerts ─────────────────────────────────────────────────────

    /// Acknowledge an alert. Returns `false` for unknown or already
    /// acknowledged ids.
    pub async fn acknowledge_alert(&self, id: &str) -> bool {
        let now = self.clock.now_ms();
        self.state.lock().await.alerts.resolve(id, now)
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.state.lock().await.alerts.all()
    }

    pub async fn unresolved_alerts(&self) -> Vec<Alert> {
        self.state.lock().await.alerts.unresolved()
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Interval the sweep runs on.
    pub async fn interval(&self) -> Duration {
        if let Some(interval) = self.config.interval {
            return interval;
        }
        let mut smallest: Option<Duration> = None;
        for pool_id in self.pool.pool_ids().await {
            if let Some(config) = self.pool.pool_config(&pool_id).await {
                let d = config.health_check_interval;
                smallest = Some(smallest.map_or(d, |s| s.min(d)));
            }
        }
        smallest.unwrap_or(DEFAULT_INTERVAL)
    }

    /// Start the periodic sweep. Stop it through the returned handle.
    pub async fn start(self: &Arc<Self>) -> TaskHandle {
        let interval = self.interval().await;
        let monitor = Arc::clone(self);
        info!(?interval, "health monitor started");

        spawn_periodic("health-sweep", interval, move || {
            let monitor = Arc::clone(&monitor);
            async move {
                monitor.run_health_check().await;
                Ok::<(), anyhow::Error>(())
            }
        })
    }
}

impl<H> std::fmt::Debug for HealthMonitor<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("has_callback", &self.on_status_change.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::CheckStatus;
    use poolgrid_core::ManualClock;
    use poolgrid_core::config::PoolSection;
    use poolgrid_pool::{BoxFuture as PoolFuture, ConnectionParams, HandleFactory, Probe};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct CountingFactory {
        next: AtomicU32,
    }

    impl HandleFactory<u32> for CountingFactory {
        fn create<'a>(&'a self, _params: &'a ConnectionParams) -> PoolFuture<'a, Result<u32, String>> {
            Box::pin(async move { Ok(self.next.fetch_add(1, Ordering::SeqCst)) })
        }
    }

    struct SwitchProbe {
        healthy: AtomicBool,
    }

    impl Probe<u32> for SwitchProbe {
        fn probe<'a>(&'a self, _handle: &'a u32) -> PoolFuture<'a, Result<bool, String>> {
            Box::pin(async move { Ok(self.healthy.load(Ordering::SeqCst)) })
        }
    }

    type Setup = (
        Arc<HealthMonitor<u32>>,
        Arc<ConnectionPoolManager<u32>>,
        Arc<SwitchProbe>,
    );

    async fn setup(min: usize, max: usize) -> Setup {
        let probe = Arc::new(SwitchProbe {
            healthy: AtomicBool::new(true),
        });
        let pool = Arc::new(ConnectionPoolManager::new(
            Arc::new(CountingFactory {
                next: AtomicU32::new(0),
            }),
            probe.clone(),
            Arc::new(ManualClock::new(5_000)),
        ));
        pool.initialize_pool(
            "p1",
            &PoolSection {
                min: Some(min),
                max: Some(max),
                acquire_timeout: Some("200ms".to_string()),
                health_check_interval: Some("10s".to_string()),
                endpoint: Some("https://db.example.test".to_string()),
                api_key: Some("anon".to_string()),
                ..PoolSection::default()
            },
        )
        .await
        .unwrap();

        let monitor = Arc::new(HealthMonitor::new(pool.clone(), HealthConfig::default()));
        (monitor, pool, probe)
    }

    // ── Statistics ─────────────────────────────────────────────────

    #[tokio::test]
    async fn latency_alerts_are_two_tier() {
        let (monitor, _pool, _probe) = setup(1, 5).await;

        monitor.record_latency(50).await;
        assert!(monitor.alerts().await.is_empty());

        monitor.record_latency(1_200).await;
        monitor.record_latency(4_000).await;

        let alerts = monitor.alerts().await;
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].severity, Severity::Warning);
        assert_eq!(alerts[1].severity, Severity::Critical);
        assert!(alerts.iter().all(|a| a.kind == "high_latency"));
    }

    #[tokio::test]
    async fn record_error_raises_error_alert() {
        let (monitor, _pool, _probe) = setup(1, 5).await;

        monitor.record_error("connection reset").await;

        let alerts = monitor.unresolved_alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Error);
        assert_eq!(alerts[0].message, "connection reset");
        assert_eq!(alerts[0].timestamp, 5_000);
    }

    #[tokio::test]
    async fn acknowledge_alert_resolves_once() {
        let (monitor, _pool, _probe) = setup(1, 5).await;
        monitor.record_error("boom").await;
        let id = monitor.alerts().await[0].id.clone();

        assert!(monitor.acknowledge_alert(&id).await);
        assert!(!monitor.acknowledge_alert(&id).await);
        assert!(!monitor.acknowledge_alert("health-404").await);
        assert!(monitor.unresolved_alerts().await.is_empty());
    }

    // ── Verdicts ───────────────────────────────────────────────────

    #[tokio::test]
    async fn fresh_pool_is_healthy() {
        let (monitor, _pool, _probe) = setup(2, 5).await;
        let report = monitor.get_health_status().await;

        assert_eq!(report.verdict, HealthVerdict::Healthy);
        assert_eq!(report.checks.len(), 4);
        assert_eq!(report.pools, 1);
    }

    #[tokio::test]
    async fn errors_degrade_then_fail() {
        let (monitor, _pool, _probe) = setup(2, 5).await;
        for _ in 0..18 {
            monitor.record_latency(10).await;
        }
        monitor.record_error("e1").await;
        monitor.record_error("e2").await;
        // 2 errors / 20 observations = 10%.
        assert_eq!(monitor.get_health_status().await.verdict, HealthVerdict::Degraded);

        for _ in 0..5 {
            monitor.record_error("more").await;
        }
        let report = monitor.get_health_status().await;
        assert_eq!(report.verdict, HealthVerdict::Unhealthy);
        let error_rate = report.checks.iter().find(|c| c.name == "error_rate").unwrap();
        assert_eq!(error_rate.status, CheckStatus::Fail);
    }

    #[tokio::test]
    async fn full_pool_fails_capacity() {
        let (monitor, pool, _probe) = setup(0, 2).await;
        let _a = pool.acquire("p1", None).await.unwrap();
        let _b = pool.acquire("p1", None).await.unwrap();

        let report = monitor.get_health_status().await;
        let capacity = report.checks.iter().find(|c| c.name == "capacity").unwrap();
        assert_eq!(capacity.status, CheckStatus::Fail);
        assert_eq!(report.verdict, HealthVerdict::Unhealthy);
    }

    // ── Sweep ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn sweep_probes_idle_entries_only() {
        let (monitor, pool, _probe) = setup(3, 5).await;
        let _held = pool.acquire("p1", None).await.unwrap();

        let summary = monitor.run_health_check().await;

        assert_eq!(summary.pools, 1);
        assert_eq!(summary.probed, 2);
        assert_eq!(summary.unhealthy, 0);
        assert_eq!(monitor.get_health_status().await.sweeps, 1);
    }

    #[tokio::test]
    async fn sweep_evicts_failed_entries_and_replenishes() {
        let (monitor, pool, probe) = setup(2, 5).await;

        probe.healthy.store(false, Ordering::SeqCst);
        let summary = monitor.run_health_check().await;

        assert_eq!(summary.unhealthy, 2);
        assert_eq!(summary.evicted, 2);
        // Replacement handles fail their initial probe as well.
        assert_eq!(summary.replenished, 0);
        assert_eq!(monitor.unresolved_alerts().await.len(), 2);

        probe.healthy.store(true, Ordering::SeqCst);
        let summary = monitor.run_health_check().await;
        assert_eq!(summary.replenished, 2);
        assert_eq!(pool.get_pool_status("p1").await.unwrap().healthy, 2);
    }

    #[tokio::test]
    async fn verdict_change_fires_callback() {
        let (_, pool, probe) = setup(2, 5).await;
        let changes = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = changes.clone();

        let monitor = HealthMonitor::new(pool, HealthConfig::default()).with_callback(Arc::new(
            move |from: HealthVerdict, to: HealthVerdict| -> BoxFuture {
                sink.lock().unwrap().push((from, to));
                Box::pin(async {})
            },
        ));

        monitor.run_health_check().await;
        probe.healthy.store(false, Ordering::SeqCst);
        monitor.run_health_check().await;

        let changes = changes.lock().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].0, HealthVerdict::Healthy);
        assert_eq!(changes[0].1, HealthVerdict::Unhealthy);
    }

    #[tokio::test]
    async fn interval_falls_back_to_pool_setting() {
        let (monitor, _pool, _probe) = setup(1, 5).await;
        assert_eq!(monitor.interval().await, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn start_runs_sweeps_until_stopped() {
        let (monitor, _pool, _probe) = setup(1, 5).await;

        let task = monitor.start().await;
        tokio::time::sleep(Duration::from_secs(25)).await;
        task.shutdown().await;

        assert_eq!(monitor.get_health_status().await.sweeps, 2);
    }

    #[tokio::test]
    async fn report_serializes_lowercase_verdict() {
        let (monitor, _pool, _probe) = setup(1, 5).await;
        let json = serde_json::to_value(monitor.get_health_status().await).unwrap();
        assert_eq!(json["verdict"], "healthy");
        assert_eq!(json["checks"][0]["status"], "pass");
    }
}
