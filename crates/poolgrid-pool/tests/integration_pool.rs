//! Pool manager under concurrent load and a flaky backend.
//!
//! The backend is a counter-based mock; what matters here is the interplay
//! of reservations, retries and releases across many callers.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use poolgrid_core::ManualClock;
use poolgrid_core::config::PoolSection;
use poolgrid_pool::{
    BoxFuture, ConnectionParams, ConnectionPoolManager, ExecuteOptions, HandleFactory, PoolError,
    Probe,
};

// ── Tracing setup ────────────────────────────────────────────────

static TRACING_INIT: Once = Once::new();

/// Controlled by `RUST_LOG` (e.g. `RUST_LOG=poolgrid_pool=debug`).
fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

// ── Mock backend ─────────────────────────────────────────────────

#[derive(Debug)]
struct Session(u32);

/// Fails the first `fail_first` connects, then succeeds.
#[derive(Default)]
struct FlakyBackend {
    fail_first: u32,
    attempts: AtomicU32,
    closed: AtomicU32,
}

impl HandleFactory<Session> for FlakyBackend {
    fn create<'a>(&'a self, _params: &'a ConnectionParams) -> BoxFuture<'a, Result<Session, String>> {
        Box::pin(async move {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(format!("connect attempt {n} refused"));
            }
            Ok(Session(n))
        })
    }

    fn close(&self, _handle: &Session) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct AlwaysUp;

impl Probe<Session> for AlwaysUp {
    fn probe<'a>(&'a self, _handle: &'a Session) -> BoxFuture<'a, Result<bool, String>> {
        Box::pin(async { Ok(true) })
    }
}

fn section(min: usize, max: usize) -> PoolSection {
    PoolSection {
        min: Some(min),
        max: Some(max),
        acquire_timeout: Some("5s".to_string()),
        retry_attempts: Some(3),
        retry_delay: Some("10ms".to_string()),
        endpoint: Some("https://db.example.test".to_string()),
        api_key: Some("anon".to_string()),
        ..PoolSection::default()
    }
}

fn manager(backend: Arc<FlakyBackend>) -> Arc<ConnectionPoolManager<Session>> {
    Arc::new(ConnectionPoolManager::new(
        backend,
        Arc::new(AlwaysUp),
        Arc::new(ManualClock::new(0)),
    ))
}

// ── Scenarios ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn execute_rides_out_connect_failures() {
    init_tracing();
    let backend = Arc::new(FlakyBackend {
        fail_first: 2,
        ..FlakyBackend::default()
    });
    let pool = manager(backend.clone());
    pool.initialize_pool("primary", &section(0, 2)).await.unwrap();

    let serial = pool
        .execute("primary", ExecuteOptions::default(), |s: Arc<Session>| async move {
            Ok::<_, String>(s.0)
        })
        .await
        .unwrap();

    assert_eq!(serial, 2);
    let metrics = pool.get_metrics().await;
    assert_eq!(metrics.creation_failures, 2);
    assert_eq!(metrics.created, 1);
    assert_eq!(metrics.in_use, 0);
}

#[tokio::test(start_paused = true)]
async fn persistent_connect_failure_surfaces_last_error() {
    init_tracing();
    let backend = Arc::new(FlakyBackend {
        fail_first: u32::MAX,
        ..FlakyBackend::default()
    });
    let pool = manager(backend.clone());
    pool.initialize_pool("primary", &section(0, 2)).await.unwrap();

    let err = pool
        .execute("primary", ExecuteOptions::default(), |_s: Arc<Session>| async move {
            Ok::<_, String>(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err.as_pool(), Some(PoolError::Creation { .. })));
    assert_eq!(backend.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(pool.get_pool_status("primary").await.unwrap().total, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_a_bounded_pool() {
    init_tracing();
    let backend = Arc::new(FlakyBackend::default());
    let pool = manager(backend.clone());
    pool.initialize_pool("primary", &section(1, 3)).await.unwrap();

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..12 {
        let pool = pool.clone();
        let active = active.clone();
        let peak = peak.clone();
        tasks.spawn(async move {
            pool.execute("primary", ExecuteOptions::default(), |_s: Arc<Session>| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(())
                }
            })
            .await
        });
    }

    while let Some(result) = tasks.join_next().await {
        assert!(result.unwrap().is_ok());
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    let status = pool.get_pool_status("primary").await.unwrap();
    assert!(status.total <= 3);
    assert_eq!(status.in_use, 0);
    assert_eq!(pool.get_metrics().await.released, 12);
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_every_handle_and_rejects_new_callers() {
    init_tracing();
    let backend = Arc::new(FlakyBackend::default());
    let pool = manager(backend.clone());
    pool.initialize_pool("primary", &section(2, 4)).await.unwrap();
    pool.initialize_pool("replica", &section(1, 2)).await.unwrap();

    assert_eq!(pool.shutdown().await, 0);
    assert_eq!(backend.closed.load(Ordering::SeqCst), 3);
    assert!(matches!(
        pool.acquire("primary", None).await,
        Err(PoolError::Draining)
    ));
}
