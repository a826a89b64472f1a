//! Pluggable collaborators: the handle factory and the probe.
//!
//! The pool never looks inside a handle. It asks the factory for new ones,
//! asks the probe whether an existing one still answers, and tells the
//! factory when a handle is thrown away.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::config::ConnectionParams;
use crate::error::PoolError;

/// Boxed, sendable future returned by factory and probe implementations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Creates opaque backend handles. Must tolerate repeated invocation.
pub trait HandleFactory<H>: Send + Sync {
    /// Create a new handle for the given connection parameters.
    fn create<'a>(&'a self, params: &'a ConnectionParams) -> BoxFuture<'a, Result<H, String>>;

    /// Region the handle was placed in, if the backend reports one.
    fn region_of(&self, _handle: &H) -> Option<String> {
        None
    }

    /// Release backend resources held by a discarded handle.
    fn close(&self, _handle: &H) {}
}

/// Performs a minimal read against a handle to establish liveness.
pub trait Probe<H>: Send + Sync {
    /// `Ok(true)` when the handle is usable.
    fn probe<'a>(&'a self, handle: &'a H) -> BoxFuture<'a, Result<bool, String>>;
}

/// Run `probe` against `handle`, bounded by `timeout`.
///
/// Returns the probe latency on success. A timeout, an error, or a
/// `false` answer are all reported as errors; callers turn them into an
/// unhealthy verdict.
pub async fn run_probe<H>(
    probe: &dyn Probe<H>,
    handle: &H,
    timeout: Duration,
) -> Result<Duration, PoolError> {
    let started = tokio::time::Instant::now();
    match tokio::time::timeout(timeout, probe.probe(handle)).await {
        Ok(Ok(true)) => Ok(started.elapsed()),
        Ok(Ok(false)) => Err(PoolError::ProbeFailed("probe reported unhealthy".to_string())),
        Ok(Err(e)) => Err(PoolError::ProbeFailed(e)),
        Err(_) => Err(PoolError::ProbeTimeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe(Result<bool, String>);

    impl Probe<u32> for FixedProbe {
        fn probe<'a>(&'a self, _handle: &'a u32) -> BoxFuture<'a, Result<bool, String>> {
            let answer = self.0.clone();
            Box::pin(async move { answer })
        }
    }

    struct StuckProbe;

    impl Probe<u32> for StuckProbe {
        fn probe<'a>(&'a self, _handle: &'a u32) -> BoxFuture<'a, Result<bool, String>> {
            Box::pin(std::future::pending())
        }
    }

    #[tokio::test]
    async fn healthy_probe_reports_latency() {
        let result = run_probe(&FixedProbe(Ok(true)), &1, Duration::from_secs(1)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn false_answer_is_failure() {
        let result = run_probe(&FixedProbe(Ok(false)), &1, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(PoolError::ProbeFailed(_))));
    }

    #[tokio::test]
    async fn probe_error_is_failure() {
        let result = run_probe(
            &FixedProbe(Err("connection reset".to_string())),
            &1,
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(
            result,
            Err(PoolError::ProbeFailed("connection reset".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_probe_times_out() {
        let result = run_probe(&StuckProbe, &1, Duration::from_millis(500)).await;
        assert_eq!(
            result,
            Err(PoolError::ProbeTimeout(Duration::from_millis(500)))
        );
    }
}
