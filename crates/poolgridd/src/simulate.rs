//! `poolgridd simulate`: every manager wired against the simulated backend.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};

use poolgrid_core::PoolgridConfig;
use poolgrid_core::clock::system_clock;
use poolgrid_core::rand::unit_f64;
use poolgrid_diagnostics::{DiagnosticsConfig, QueryDiagnostics};
use poolgrid_health::{HealthCallback, HealthConfig, HealthMonitor, HealthVerdict};
use poolgrid_leak::{LeakConfig, LeakDetector};
use poolgrid_pool::{ConnectionPoolManager, ExecuteOptions};

use crate::backend::{SimBackend, SimConnection};

/// Query mix replayed by the workers.
const QUERIES: &[&str] = &[
    "SELECT id, email FROM users WHERE id = $1 LIMIT 1",
    "SELECT * FROM orders WHERE customer_id = $1",
    "UPDATE sessions SET last_seen = now() WHERE id = $1",
    "SELECT o.id FROM orders o JOIN items i ON i.order_id = o.id WHERE i.sku LIKE '%-XL' LIMIT 50",
    "SELECT id FROM events WHERE kind = 'login' OR kind = 'logout' LIMIT 5000",
    "DELETE FROM audit_log",
];

const THINK_TIME: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct SimulateOptions {
    pub duration: Duration,
    pub failure_rate: f64,
    pub workers: usize,
}

#[derive(Clone)]
struct Workload {
    backend: Arc<SimBackend>,
    pool: Arc<ConnectionPoolManager<SimConnection>>,
    monitor: Arc<HealthMonitor<SimConnection>>,
    leaks: Arc<LeakDetector>,
    diagnostics: Arc<QueryDiagnostics>,
    pool_ids: Arc<Vec<String>>,
}

/// Run the workload until its deadline or Ctrl-C and return the final
/// reports.
pub async fn run(config: PoolgridConfig, options: SimulateOptions) -> anyhow::Result<Value> {
    run_until(config, options, ctrl_c()).await
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl-c, running to the deadline");
        std::future::pending::<()>().await;
    }
}

/// Run the workload until its deadline or until `interrupt` resolves.
///
/// An interrupt only raises the stop flag. Workers finish the query they
/// are in, so every handle is released before the reports are taken.
pub async fn run_until(
    config: PoolgridConfig,
    options: SimulateOptions,
    interrupt: impl Future<Output = ()>,
) -> anyhow::Result<Value> {
    anyhow::ensure!(!config.pools.is_empty(), "no pools configured");

    let clock = system_clock();
    let backend = Arc::new(SimBackend::new(options.failure_rate));
    let pool = Arc::new(ConnectionPoolManager::new(
        backend.clone(),
        backend.clone(),
        clock.clone(),
    ));
    for (id, section) in &config.pools {
        pool.initialize_pool(id, section)
            .await
            .with_context(|| format!("initializing pool {id}"))?;
    }
    info!(pools = config.pools.len(), "pools initialized");

    let health = HealthConfig::from_section(&config.health.clone().unwrap_or_default())?;
    let on_change: HealthCallback = Arc::new(log_verdict_change);
    let monitor = Arc::new(HealthMonitor::new(pool.clone(), health).with_callback(on_change));

    let leak_config = LeakConfig::from_section(&config.leak.clone().unwrap_or_default())?;
    let leaks = Arc::new(LeakDetector::new(leak_config, clock.clone()));

    let diag_config =
        DiagnosticsConfig::from_section(&config.diagnostics.clone().unwrap_or_default())?;
    let diagnostics = Arc::new(QueryDiagnostics::new(diag_config, clock.clone()));

    // ── Background tasks ───────────────────────────────────────

    let tasks = vec![
        pool.start_maintenance(),
        monitor.start().await,
        leaks.start(),
        diagnostics.start(),
    ];

    // ── Workload ───────────────────────────────────────────────

    let workload = Workload {
        backend: backend.clone(),
        pool: pool.clone(),
        monitor: monitor.clone(),
        leaks: leaks.clone(),
        diagnostics: diagnostics.clone(),
        pool_ids: Arc::new(pool.pool_ids().await),
    };
    let deadline = Instant::now() + options.duration;
    info!(
        workers = options.workers,
        duration = ?options.duration,
        failure_rate = options.failure_rate,
        "workload starting"
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut workers = JoinSet::new();
    for n in 0..options.workers.max(1) {
        workers.spawn(worker(workload.clone(), n, deadline, stop_rx.clone()));
    }

    tokio::pin!(interrupt);
    let mut interrupted = false;
    let mut total = 0u64;
    loop {
        tokio::select! {
            joined = workers.join_next() => match joined {
                Some(Ok(count)) => total += count,
                Some(Err(e)) => warn!(error = %e, "worker task failed"),
                None => break,
            },
            () = &mut interrupt, if !interrupted => {
                interrupted = true;
                info!("interrupted, letting in-flight queries finish");
                stop_tx.send_replace(true);
            }
        }
    }
    info!(queries = total, interrupted, "workload finished");

    // ── Reports ────────────────────────────────────────────────

    pool.log_stats().await;
    let report = json!({
        "pools": pool.get_metrics().await,
        "health": monitor.get_health_status().await,
        "leaks": {
            "health": leaks.get_pool_health().await,
            "stats": leaks.stats().await,
            "suspected": leaks.detect_leaks().await,
        },
        "diagnostics": diagnostics.get_report().await,
    });

    // ── Shutdown ───────────────────────────────────────────────

    for task in tasks {
        task.shutdown().await;
    }
    let forced = pool.shutdown().await;
    info!(
        forced,
        open = backend.open_connections(),
        "simulation stopped"
    );

    Ok(report)
}

fn log_verdict_change(
    from: HealthVerdict,
    to: HealthVerdict,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        info!(%from, %to, "pool health changed");
    })
}

async fn worker(
    w: Workload,
    n: usize,
    deadline: Instant,
    mut stop: watch::Receiver<bool>,
) -> u64 {
    let mut count = 0;
    while Instant::now() < deadline && !*stop.borrow() {
        let pool_id = &w.pool_ids[(count as usize + n) % w.pool_ids.len()];
        let sql = QUERIES[(unit_f64() * QUERIES.len() as f64) as usize % QUERIES.len()];
        run_query(&w, pool_id, sql).await;
        count += 1;
        tokio::select! {
            _ = tokio::time::sleep(THINK_TIME) => {}
            _ = stop.changed() => {}
        }
    }
    count
}

/// One query through `execute`, leak-tracked and traced per attempt.
async fn run_query(w: &Workload, pool_id: &str, sql: &str) {
    let started = Instant::now();
    let result = w
        .pool
        .execute(pool_id, ExecuteOptions::default(), |conn: Arc<SimConnection>| async move {
            let lease = format!("{pool_id}/{}", conn.id);
            w.leaks.track_acquisition(&lease, pool_id, None).await;
            let trace = w.diagnostics.start_query(sql, None, None).await;

            let result = w.backend.query(&conn, sql).await;
            match &result {
                Ok(rows) => {
                    w.diagnostics.end_query(&trace, Some(*rows), None).await;
                    w.leaks.track_activity(&lease, true).await;
                }
                Err(e) => {
                    w.diagnostics.end_query(&trace, None, Some(e.clone())).await;
                    w.leaks.track_error(&lease, e).await;
                }
            }
            w.leaks.track_release(&lease).await;
            result
        })
        .await;

    match result {
        Ok(_) => {
            w.monitor
                .record_latency(started.elapsed().as_millis() as u64)
                .await;
        }
        Err(e) => w.monitor.record_error(&e.to_string()).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[health]
interval = "1s"

[leak]
threshold = "30s"
sweep_interval = "1s"

[diagnostics]
purge_interval = "1s"

[pools.primary]
min = 2
max = 4
endpoint = "sim://primary"
api_key = "anon"

[pools.replica]
min = 1
max = 2
endpoint = "sim://replica"
api_key = "anon"
"#;

    #[tokio::test(start_paused = true)]
    async fn reliable_run_reports_every_manager() {
        let config = PoolgridConfig::parse(CONFIG).unwrap();
        let report = run(
            config,
            SimulateOptions {
                duration: Duration::from_secs(3),
                failure_rate: 0.0,
                workers: 3,
            },
        )
        .await
        .unwrap();

        assert_eq!(report["pools"]["pools"], 2);
        assert!(report["pools"]["acquired"].as_u64().unwrap() > 0);
        assert_eq!(report["leaks"]["stats"]["currently_tracked"], 0);
        assert_eq!(report["leaks"]["suspected"].as_array().unwrap().len(), 0);

        let traces = &report["diagnostics"]["traces"];
        assert!(traces["completed"].as_u64().unwrap() > 0);
        assert_eq!(traces["failed"], 0);
        assert_eq!(report["health"]["verdict"], "healthy");
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_lets_workers_finish_in_flight_queries() {
        let config = PoolgridConfig::parse(CONFIG).unwrap();
        let started = Instant::now();
        let report = run_until(
            config,
            SimulateOptions {
                duration: Duration::from_secs(600),
                failure_rate: 0.0,
                workers: 4,
            },
            tokio::time::sleep(Duration::from_millis(500)),
        )
        .await
        .unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(report["pools"]["acquired"].as_u64().unwrap() > 0);
        assert_eq!(report["pools"]["in_use"], 0);
        assert_eq!(report["pools"]["acquired"], report["pools"]["released"]);
        assert_eq!(report["leaks"]["stats"]["currently_tracked"], 0);
        assert_eq!(report["diagnostics"]["traces"]["running"], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_config_is_rejected() {
        let options = SimulateOptions {
            duration: Duration::from_secs(1),
            failure_rate: 0.0,
            workers: 1,
        };
        let err = run(PoolgridConfig::default(), options).await.unwrap_err();
        assert!(err.to_string().contains("no pools"));
    }
}
