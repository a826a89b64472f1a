//! poolgrid-core — shared primitives for the poolgrid crates.
//!
//! Every manager in the workspace is built from the same small set of
//! building blocks:
//! - **clock**: injectable millisecond clock (`SystemClock`, `ManualClock`)
//! - **signal**: watch-channel based abort signal for long waits
//! - **task**: stoppable periodic task with per-tick error isolation
//! - **retry**: bounded exponential-backoff retry executor
//! - **alert**: capped alert log shared by health and diagnostics
//! - **metadata**: open JSON metadata bags, sanitized at the boundary
//! - **config**: `poolgrid.toml` parsing

pub mod alert;
pub mod clock;
pub mod config;
pub mod metadata;
pub mod rand;
pub mod retry;
pub mod signal;
pub mod task;

pub use alert::{Alert, AlertLog, Severity};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{ConfigError, PoolgridConfig};
pub use metadata::Metadata;
pub use retry::{RetryExecutor, RetryPolicy};
pub use signal::{AbortController, AbortSignal, Aborted};
pub use task::{TaskHandle, spawn_periodic};
