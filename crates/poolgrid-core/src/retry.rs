//! Bounded exponential-backoff retry.
//!
//! The delay before retry `n` (zero-based) is
//! `min(base * multiplier^n, max_delay)` plus up to `jitter * delay` of
//! random extra wait.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::rand::unit_f64;
use crate::signal::{AbortSignal, Aborted, sleep};

/// Retry policy shared by `execute` and warm-up.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one (minimum 1).
    pub attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Fraction of the computed delay added as random jitter (0.0 - 1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn with_attempts(self, attempts: u32) -> Self {
        Self { attempts, ..self }
    }

    pub fn with_base_delay(self, base_delay: Duration) -> Self {
        Self { base_delay, ..self }
    }

    /// Backoff before retry `attempt` without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let millis = self.base_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Backoff before retry `attempt` including jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let extra = base.as_millis() as f64 * jitter * unit_f64();
        base + Duration::from_millis(extra as u64)
    }
}

/// Runs an async operation under a `RetryPolicy`.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Retry every failure.
    pub async fn run<T, E, F, Fut>(&self, signal: Option<&AbortSignal>, op: F) -> Result<T, E>
    where
        E: From<Aborted>,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_if(signal, op, |_| true).await
    }

    /// Retry failures accepted by `retryable`; other failures return at once.
    ///
    /// `op` receives the zero-based attempt number. The error of the final
    /// attempt is returned untouched. An abort during a backoff delay ends
    /// the loop with `E::from(Aborted)`.
    pub async fn run_if<T, E, F, Fut, R>(
        &self,
        signal: Option<&AbortSignal>,
        mut op: F,
        retryable: R,
    ) -> Result<T, E>
    where
        E: From<Aborted>,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
    {
        let attempts = self.policy.attempts.max(1);
        let mut attempt = 0;

        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if attempt >= attempts || !retryable(&err) {
                        return Err(err);
                    }
                    let delay = self.policy.delay_for(attempt - 1);
                    debug!(attempt, max_attempts = attempts, ?delay, "retrying after failure");
                    sleep(delay, signal).await?;
                }
            }
        }
    }
}
