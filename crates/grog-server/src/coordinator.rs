use std::sync::Arc;

use grog_ingest::WriteEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::engine::Engine;

/// Turns append completions into broadcast cycles.
///
/// Completions that pile up while a cycle runs are folded into the next
/// one: a single cycle reads every session's window at the then-current
/// head, so it covers all of them.
pub struct BroadcastCoordinator {
    engine: Arc<Engine>,
}

impl BroadcastCoordinator {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Spawn the coordinator loop. It ends when every producer has dropped
    /// its sender or `cancel` fires.
    pub fn start(
        &self,
        mut rx: mpsc::Receiver<WriteEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);

        tokio::spawn(async move {
            loop {
                let first = tokio::select! {
                    event = rx.recv() => event,
                    () = cancel.cancelled() => {
                        debug!("broadcast coordinator cancelled");
                        break;
                    }
                };
                let Some(first) = first else {
                    info!("completion channel closed");
                    break;
                };

                let mut appended = 0usize;
                let mut pending = Some(first);
                while let Some(event) = pending.take().or_else(|| rx.try_recv().ok()) {
                    match event.result {
                        Ok(_) => appended += 1,
                        Err(e) => error!(
                            source = %event.source,
                            error = %e,
                            kind = e.error_kind(),
                            "append failed"
                        ),
                    }
                }
                if appended == 0 {
                    continue;
                }

                let cycle_engine = Arc::clone(&engine);
                match tokio::task::spawn_blocking(move || cycle_engine.broadcast()).await {
                    Ok(report) => debug!(
                        appended,
                        sent = report.sent,
                        dropped = report.dropped,
                        failed = report.failed,
                        "broadcast cycle"
                    ),
                    Err(e) => error!(error = %e, "broadcast cycle panicked"),
                }
            }
        })
    }
}
