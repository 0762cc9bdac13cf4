//! Graceful shutdown coordination via `CancellationToken`.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default time each shutdown stage may take before its tasks are aborted.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Coordinates shutdown across the ingest sources, the broadcast
/// coordinator, viewer connections and the HTTP listener.
///
/// Sessions, the coordinator and the listener watch [`ShutdownCoordinator::token`].
/// [`ShutdownCoordinator::drain`] waits for one group of tasks at a time so
/// the caller controls the order in which stages wind down.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            timeout,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        if !self.token.is_cancelled() {
            info!("shutdown requested");
        }
        self.token.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for `handles`. Tasks still running after the timeout are
    /// aborted and `None` is returned; otherwise the outputs of the tasks
    /// that completed without panicking.
    pub async fn drain<T: Send + 'static>(
        &self,
        stage: &str,
        handles: Vec<JoinHandle<T>>,
    ) -> Option<Vec<T>> {
        info!(stage, task_count = handles.len(), "waiting for tasks to complete");

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let drain = futures::future::join_all(handles);

        match tokio::time::timeout(self.timeout, drain).await {
            Ok(results) => Some(
                results
                    .into_iter()
                    .filter_map(|r| match r {
                        Ok(v) => Some(v),
                        Err(e) => {
                            warn!(stage, error = %e, "task failed during shutdown");
                            None
                        }
                    })
                    .collect(),
            ),
            Err(_) => {
                warn!(stage, timeout = ?self.timeout, "shutdown stage timed out, aborting tasks");
                for abort in aborts {
                    abort.abort();
                }
                None
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_SHUTDOWN_TIMEOUT)
    }
}
