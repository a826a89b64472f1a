//! Periodic background tasks.
//!
//! Each sweep (health probes, leak detection, idle cleanup, trace purging)
//! runs on its own fixed interval. A tick runs in its own spawned task so a
//! returned error or a panic is logged and the schedule keeps going.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Handle to a running periodic task.
///
/// Dropping the handle also stops the task.
#[derive(Debug)]
pub struct TaskHandle {
    name: String,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal the task to stop after its current tick. Idempotent.
    pub fn stop(&self) {
        if !self.shutdown_tx.send_replace(true) {
            debug!(task = %self.name, "periodic task stop requested");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the task and wait for its loop to exit.
    pub async fn shutdown(self) {
        self.stop();
        let _ = self.handle.await;
    }
}

/// Spawn `tick` every `interval` until the returned handle is stopped.
///
/// The first tick fires one full interval after spawning.
pub fn spawn_periodic<F, Fut>(name: impl Into<String>, interval: Duration, tick: F) -> TaskHandle
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let name = name.into();
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let task_name = name.clone();

    let handle = tokio::spawn(async move {
        debug!(task = %task_name, ?interval, "periodic task started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match tokio::spawn(tick()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            warn!(task = %task_name, error = %e, "periodic tick failed");
                        }
                        Err(e) => {
                            error!(task = %task_name, error = %e, "periodic tick panicked");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    debug!(task = %task_name, "periodic task shutting down");
                    break;
                }
            }
        }
    });

    TaskHandle {
        name,
        shutdown_tx,
        handle,
    }
}
