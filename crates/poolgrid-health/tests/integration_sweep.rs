//! Pool manager and health monitor working together: warm-up, probe
//! failure, eviction, and replenishment across sweeps.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use poolgrid_core::ManualClock;
use poolgrid_core::config::PoolgridConfig;
use poolgrid_health::{HealthConfig, HealthMonitor, HealthVerdict};
use poolgrid_pool::{BoxFuture, ConnectionParams, ConnectionPoolManager, HandleFactory, Probe};

#[derive(Debug)]
struct Client {
    serial: u32,
}

#[derive(Default)]
struct ClientFactory {
    serial: AtomicU32,
    closed: AtomicU32,
}

impl HandleFactory<Client> for ClientFactory {
    fn create<'a>(&'a self, params: &'a ConnectionParams) -> BoxFuture<'a, Result<Client, String>> {
        Box::pin(async move {
            if params.api_key.is_empty() {
                return Err("missing key".to_string());
            }
            Ok(Client {
                serial: self.serial.fetch_add(1, Ordering::SeqCst),
            })
        })
    }

    fn close(&self, _handle: &Client) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Reports every handle with a serial below `broken_below` as dead.
struct SerialProbe {
    broken_below: AtomicU32,
    stalled: AtomicBool,
}

impl Probe<Client> for SerialProbe {
    fn probe<'a>(&'a self, handle: &'a Client) -> BoxFuture<'a, Result<bool, String>> {
        Box::pin(async move {
            if self.stalled.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(handle.serial >= self.broken_below.load(Ordering::SeqCst))
        })
    }
}

const CONFIG: &str = r#"
[health]
latency_warning_ms = 500

[pools.primary]
min = 2
max = 5
acquire_timeout = "500ms"
probe_timeout = "1s"
health_check_interval = "5s"
endpoint = "https://db.example.test"
api_key = "anon"

[pools.replica]
min = 1
max = 2
endpoint = "https://replica.example.test"
api_key = "anon"
"#;

struct World {
    pool: Arc<ConnectionPoolManager<Client>>,
    monitor: Arc<HealthMonitor<Client>>,
    factory: Arc<ClientFactory>,
    probe: Arc<SerialProbe>,
}

async fn world() -> World {
    let config = PoolgridConfig::parse(CONFIG).unwrap();
    let factory = Arc::new(ClientFactory::default());
    let probe = Arc::new(SerialProbe {
        broken_below: AtomicU32::new(0),
        stalled: AtomicBool::new(false),
    });
    let pool = Arc::new(ConnectionPoolManager::new(
        factory.clone(),
        probe.clone(),
        Arc::new(ManualClock::new(0)),
    ));
    for (id, section) in &config.pools {
        pool.initialize_pool(id, section).await.unwrap();
    }
    let health = HealthConfig::from_section(&config.health.unwrap_or_default()).unwrap();
    let monitor = Arc::new(HealthMonitor::new(pool.clone(), health));

    World {
        pool,
        monitor,
        factory,
        probe,
    }
}

#[tokio::test(start_paused = true)]
async fn warm_up_follows_config() {
    let w = world().await;

    assert_eq!(w.pool.pool_ids().await, vec!["primary", "replica"]);
    assert_eq!(w.pool.get_pool_status("primary").await.unwrap().total, 2);
    assert_eq!(w.pool.get_pool_status("replica").await.unwrap().total, 1);
    assert_eq!(w.monitor.get_health_status().await.verdict, HealthVerdict::Healthy);
}

#[tokio::test(start_paused = true)]
async fn dead_handles_are_replaced_by_the_sweep() {
    let w = world().await;

    // Every handle created so far stops answering.
    w.probe.broken_below.store(3, Ordering::SeqCst);
    let summary = w.monitor.run_health_check().await;

    assert_eq!(summary.unhealthy, 3);
    assert_eq!(summary.evicted, 3);
    assert_eq!(summary.replenished, 3);
    assert_eq!(w.factory.closed.load(Ordering::SeqCst), 3);

    let primary = w.pool.get_pool_status("primary").await.unwrap();
    assert_eq!(primary.total, 2);
    assert!(primary.entries.iter().all(|e| e.healthy));

    // 3 failures in 3 observations: the error-rate check fails.
    assert_eq!(w.monitor.get_health_status().await.verdict, HealthVerdict::Unhealthy);
    assert_eq!(w.monitor.unresolved_alerts().await.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn stalled_probe_times_out_as_unhealthy() {
    let w = world().await;
    let held = w.pool.acquire("primary", None).await.unwrap();

    w.probe.stalled.store(true, Ordering::SeqCst);
    let summary = w.monitor.run_health_check().await;
    w.probe.stalled.store(false, Ordering::SeqCst);

    // One idle primary entry and the replica entry; the held one is skipped.
    assert_eq!(summary.probed, 2);
    assert_eq!(summary.unhealthy, 2);

    let alerts = w.monitor.alerts().await;
    assert!(alerts.iter().all(|a| a.message.contains("timed out")));

    let primary = w.pool.get_pool_status("primary").await.unwrap();
    let in_use = primary.entries.iter().find(|e| e.in_use).unwrap();
    assert!(in_use.healthy);

    w.pool.release("primary", &held).await;
}

#[tokio::test(start_paused = true)]
async fn periodic_sweep_and_shutdown() {
    let w = world().await;
    assert_eq!(w.monitor.interval().await, Duration::from_secs(5));

    let sweeps = w.monitor.start().await;
    let maintenance = w.pool.start_maintenance();

    tokio::time::sleep(Duration::from_secs(16)).await;
    sweeps.shutdown().await;
    maintenance.shutdown().await;

    let report = w.monitor.get_health_status().await;
    assert_eq!(report.sweeps, 3);
    assert!(report.last_check_at.is_some());

    assert_eq!(w.pool.shutdown().await, 0);
    assert_eq!(w.factory.closed.load(Ordering::SeqCst), 3);
}
