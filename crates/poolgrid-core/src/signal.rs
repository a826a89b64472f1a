//! Abort signal for long waits (acquire polling, retry backoff).
//!
//! Built on a `tokio::sync::watch` channel the same way the background
//! loops receive their shutdown flag: the controller flips the value to
//! `true` once and every clone of the signal observes it.

use std::time::Duration;

use tokio::sync::watch;

/// Distinguished error returned when a wait is cut short by an abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation aborted")]
pub struct Aborted;

/// Owner side of an abort signal.
#[derive(Debug)]
pub struct AbortController {
    tx: watch::Sender<bool>,
}

impl AbortController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Hand out a signal observing this controller.
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Abort every wait observing this controller. Idempotent.
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of an abort signal.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the signal is aborted. Pends forever if the controller
    /// is dropped without aborting.
    pub async fn aborted(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Sleep for `duration`, failing early with `Aborted` if the signal fires.
pub async fn sleep(duration: Duration, signal: Option<&AbortSignal>) -> Result<(), Aborted> {
    let Some(signal) = signal else {
        tokio::time::sleep(duration).await;
        return Ok(());
    };

    if signal.is_aborted() {
        return Err(Aborted);
    }

    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = signal.aborted() => Err(Aborted),
    }
}
