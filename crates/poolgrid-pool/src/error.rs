//! Pool error types.

use std::time::Duration;

use poolgrid_core::{Aborted, ConfigError};
use thiserror::Error;

/// Errors surfaced by the pool manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("failed to create handle for pool {pool_id}: {message}")]
    Creation { pool_id: String, message: String },

    #[error("pool {pool_id} exhausted (timeout: {timeout:?})")]
    Exhausted { pool_id: String, timeout: Duration },

    /// Internal: a probe did not answer in time. Converted into an
    /// unhealthy entry, never returned from `acquire`/`execute`.
    #[error("probe timed out after {0:?}")]
    ProbeTimeout(Duration),

    /// Internal: a probe answered unhealthy or failed.
    #[error("probe failed: {0}")]
    ProbeFailed(String),

    #[error("unknown pool: {0}")]
    UnknownPool(String),

    #[error("connection pool is draining, no new handles are issued")]
    Draining,

    #[error("operation aborted")]
    Aborted,
}

impl From<Aborted> for PoolError {
    fn from(_: Aborted) -> Self {
        PoolError::Aborted
    }
}

impl PoolError {
    /// Whether `execute()` should retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::Creation { .. } | PoolError::Exhausted { .. }
        )
    }
}

pub type PoolResult<T> = Result<T, PoolError>;

/// Error returned by `execute()`.
///
/// `Operation` carries the caller's own error untouched.
#[derive(Debug, Error)]
pub enum ExecuteError<E> {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("{0}")]
    Operation(E),
}

impl<E> From<Aborted> for ExecuteError<E> {
    fn from(_: Aborted) -> Self {
        ExecuteError::Pool(PoolError::Aborted)
    }
}

impl<E> ExecuteError<E> {
    /// The caller's own error, if that is what failed.
    pub fn into_operation(self) -> Option<E> {
        match self {
            ExecuteError::Operation(e) => Some(e),
            ExecuteError::Pool(_) => None,
        }
    }

    pub fn as_pool(&self) -> Option<&PoolError> {
        match self {
            ExecuteError::Pool(e) => Some(e),
            ExecuteError::Operation(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_message_names_pool() {
        let err = PoolError::Exhausted {
            pool_id: "p1".to_string(),
            timeout: Duration::from_millis(300),
        };
        assert_eq!(err.to_string(), "pool p1 exhausted (timeout: 300ms)");
    }

    #[test]
    fn configuration_wraps_config_error() {
        let err: PoolError = ConfigError::Missing("endpoint".to_string()).into();
        assert!(err.to_string().contains("endpoint"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn retryable_classification() {
        assert!(PoolError::Creation {
            pool_id: "p".into(),
            message: "refused".into()
        }
        .is_retryable());
        assert!(!PoolError::Draining.is_retryable());
        assert!(!PoolError::Aborted.is_retryable());
        assert!(!PoolError::UnknownPool("x".into()).is_retryable());
    }

    #[test]
    fn execute_error_preserves_operation_error() {
        let err: ExecuteError<String> = ExecuteError::Operation("row not found".to_string());
        assert_eq!(err.to_string(), "row not found");
        assert_eq!(err.into_operation().as_deref(), Some("row not found"));
    }

    #[test]
    fn aborted_converts_to_pool_error() {
        let err: ExecuteError<String> = Aborted.into();
        assert_eq!(err.as_pool(), Some(&PoolError::Aborted));
    }
}
