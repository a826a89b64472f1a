//! In-process simulated backend.
//!
//! Stands in for a real database client: connects, answers probes and
//! runs queries with random latency, failing at a configurable rate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use poolgrid_core::rand::unit_f64;
use poolgrid_pool::{BoxFuture, ConnectionParams, HandleFactory, Probe};

/// Share of queries that take far longer than the rest.
const SLOW_QUERY_RATE: f64 = 0.02;

#[derive(Debug)]
pub struct SimConnection {
    pub id: u64,
    pub endpoint: String,
    pub region: Option<String>,
}

#[derive(Debug)]
pub struct SimBackend {
    failure_rate: f64,
    next_id: AtomicU64,
    open: AtomicU64,
}

impl SimBackend {
    pub fn new(failure_rate: f64) -> Self {
        Self {
            failure_rate: failure_rate.clamp(0.0, 1.0),
            next_id: AtomicU64::new(1),
            open: AtomicU64::new(0),
        }
    }

    /// Connections created and not yet closed.
    pub fn open_connections(&self) -> u64 {
        self.open.load(Ordering::SeqCst)
    }

    fn fails(&self) -> bool {
        self.failure_rate > 0.0 && unit_f64() < self.failure_rate
    }

    /// Run `sql` and return the number of rows it "produced".
    pub async fn query(&self, conn: &SimConnection, sql: &str) -> Result<u64, String> {
        let latency = if unit_f64() < SLOW_QUERY_RATE {
            jitter(1_000, 2_000)
        } else {
            jitter(2, 40)
        };
        tokio::time::sleep(latency).await;

        if self.fails() {
            return Err(format!(
                "connection {} to {} reset while running {} bytes of sql",
                conn.id,
                conn.endpoint,
                sql.len()
            ));
        }
        Ok((unit_f64() * 100.0) as u64)
    }
}

fn jitter(min_ms: u64, max_ms: u64) -> Duration {
    let span = max_ms.saturating_sub(min_ms) as f64;
    Duration::from_millis(min_ms + (unit_f64() * span) as u64)
}

impl HandleFactory<SimConnection> for SimBackend {
    fn create<'a>(
        &'a self,
        params: &'a ConnectionParams,
    ) -> BoxFuture<'a, Result<SimConnection, String>> {
        Box::pin(async move {
            tokio::time::sleep(jitter(5, 25)).await;
            if self.fails() {
                return Err(format!("connect to {} refused", params.endpoint));
            }
            self.open.fetch_add(1, Ordering::SeqCst);
            Ok(SimConnection {
                id: self.next_id.fetch_add(1, Ordering::SeqCst),
                endpoint: params.endpoint.clone(),
                region: params.region.clone(),
            })
        })
    }

    fn region_of(&self, handle: &SimConnection) -> Option<String> {
        handle.region.clone()
    }

    fn close(&self, _handle: &SimConnection) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Probe<SimConnection> for SimBackend {
    fn probe<'a>(&'a self, _handle: &'a SimConnection) -> BoxFuture<'a, Result<bool, String>> {
        Box::pin(async move {
            tokio::time::sleep(jitter(1, 5)).await;
            Ok(!self.fails())
        })
    }
}
