use std::sync::Arc;
use std::time::Instant;

use grog_store::LogStore;
use grog_telemetry::{names, MetricsRecorder};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::WindowConfig;
use crate::error::SessionError;
use crate::registry::SessionRegistry;
use crate::session::{Outbound, RefreshOutcome, Session};

/// Tally of one broadcast cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub sent: usize,
    pub dropped: usize,
    pub failed: usize,
}

/// Process-scoped broadcast state shared by the coordinator, the viewer
/// connections and the HTTP handlers.
pub struct Engine {
    store: LogStore,
    registry: SessionRegistry,
    window: WindowConfig,
    metrics: Arc<MetricsRecorder>,
}

impl Engine {
    pub fn new(
        store: LogStore,
        registry: SessionRegistry,
        window: WindowConfig,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            store,
            registry,
            window,
            metrics,
        }
    }

    pub fn store(&self) -> &LogStore {
        &self.store
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn window(&self) -> &WindowConfig {
        &self.window
    }

    pub fn metrics(&self) -> &MetricsRecorder {
        &self.metrics
    }

    /// Register a viewer with its cursor at the current head.
    pub fn open_session(&self) -> (Arc<Session>, mpsc::Receiver<Outbound>) {
        let (session, rx) = self.registry.register(self.store.head());
        self.metrics.counter_inc(names::SESSIONS_OPENED, &[], 1);
        self.metrics.gauge_inc(names::SESSIONS_ACTIVE, &[], 1);
        info!(session_id = %session.id(), cursor = %session.cursor(), "viewer connected");
        (session, rx)
    }

    /// Deregister a session whose transport has been released.
    pub fn release_session(&self, session: &Session) {
        if self.registry.deregister(session.id()).is_some() {
            self.metrics.counter_inc(names::SESSIONS_CLOSED, &[], 1);
            self.metrics.gauge_inc(names::SESSIONS_ACTIVE, &[], -1);
        }
        session.mark_closed();
        info!(
            session_id = %session.id(),
            reason = session.close_reason().map(|r| r.as_str()).unwrap_or("unknown"),
            age_ms = session.age().as_millis() as u64,
            sent = session.windows_sent(),
            dropped = session.windows_dropped(),
            "session closed"
        );
    }

    /// Refresh one session, recording the outcome.
    pub fn refresh_session(&self, session: &Session) -> Result<RefreshOutcome, SessionError> {
        let started = Instant::now();
        let result = session.refresh(&self.store, &self.window);
        match &result {
            Ok(RefreshOutcome::Sent { records }) => {
                self.metrics.counter_inc(names::REFRESHES_SENT, &[], 1);
                self.metrics.histogram_observe(
                    names::REFRESH_LATENCY_US,
                    &[],
                    started.elapsed().as_micros() as f64,
                );
                debug!(session_id = %session.id(), records, "window queued");
            }
            Ok(RefreshOutcome::Dropped) => {
                self.metrics.counter_inc(names::REFRESHES_DROPPED, &[], 1);
                debug!(session_id = %session.id(), "outbound queue full, window dropped");
            }
            Err(e) if e.is_corrupt_record() => {
                self.metrics.counter_inc(names::CORRUPT_REFRESHES, &[], 1);
                warn!(session_id = %session.id(), error = %e, "refresh aborted");
            }
            Err(SessionError::Closed(_)) => {}
            Err(e) => {
                debug!(session_id = %session.id(), error = %e, "refresh failed");
            }
        }
        result
    }

    /// [`Engine::refresh_session`] on the blocking pool. The store lock can
    /// be held by an append for the length of a commit.
    pub async fn refresh_session_async(
        self: &Arc<Self>,
        session: &Arc<Session>,
    ) -> Result<RefreshOutcome, SessionError> {
        let engine = Arc::clone(self);
        let session = Arc::clone(session);
        tokio::task::spawn_blocking(move || engine.refresh_session(&session))
            .await
            .unwrap_or_else(|e| Err(SessionError::Task(e.to_string())))
    }

    /// One broadcast cycle: refresh every registered session. Failures stay
    /// with the session that produced them.
    pub fn broadcast(&self) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for session in self.registry.snapshot() {
            match self.refresh_session(&session) {
                Ok(RefreshOutcome::Sent { .. }) => report.sent += 1,
                Ok(RefreshOutcome::Dropped) => report.dropped += 1,
                Err(_) => report.failed += 1,
            }
        }
        self.metrics.counter_inc(names::BROADCAST_CYCLES, &[], 1);
        report
    }
}
