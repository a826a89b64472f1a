//! poolgrid-health — health checking for poolgrid connection pools.
//!
//! Probes idle pool entries on a fixed interval, keeps a bounded window of
//! probe latencies and an error count, and grades the pool manager as
//! healthy, degraded, or unhealthy.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor
//!   ├── Periodic sweep (spawn_periodic)
//!   │   ├── ConnectionPoolManager::probe_idle() → ProbeReport per idle entry
//!   │   ├── record_latency() / record_error() → two-tier alerts
//!   │   └── cleanup_pool() + ensure_minimum_connections()
//!   ├── get_health_status() → connection / latency / error_rate / capacity
//!   └── Optional HealthCallback on verdict change
//! ```
//!
//! In-use entries are never probed. A probe that times out, errors, or
//! answers `false` marks its entry unhealthy, and the cleanup pass in the
//! same sweep evicts it.

pub mod checker;
pub mod monitor;

pub use checker::{CheckStatus, HealthConfig, HealthVerdict, LatencyWindow, SubCheck};
pub use monitor::{HealthCallback, HealthMonitor, HealthReport, SweepSummary};
