//! poolgrid-pool — named pools of opaque backend handles.
//!
//! A "connection" here is a remote-client handle, not a socket. Liveness
//! is established with synthetic probes, and the pool never inspects the
//! handle itself.
//!
//! ```text
//! ConnectionPoolManager<H>
//!   ├── HandleFactory<H>   create / close
//!   ├── Probe<H>           minimal read, bounded by probe_timeout
//!   ├── Clock              entry ages and idle times
//!   └── pools: pool_id → (PoolConfig, [PoolEntry])
//! ```

pub mod config;
pub mod error;
pub mod factory;
pub mod manager;

pub use config::{ConnectionParams, PoolConfig};
pub use error::{ExecuteError, PoolError, PoolResult};
pub use factory::{BoxFuture, HandleFactory, Probe, run_probe};
pub use manager::{
    ConnectionPoolManager, EntryInfo, ExecuteOptions, ManagerOptions, PoolMetrics, PoolStatus,
    ProbeReport,
};
