//! Ping/pong liveness probing for viewer connections.

use std::sync::Arc;

use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, trace};

use crate::config::KeepaliveConfig;
use crate::session::{CloseReason, PingOutcome, Session};

/// Outcome of the keepalive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveResult {
    /// A ping went unanswered past the deadline.
    TimedOut,
    /// The ping could not be queued; the writer is gone.
    TransportClosed,
    /// The outbound queue was full, so no ping could be sent.
    Backlogged,
    /// The session closed for another reason.
    Cancelled,
}

/// Ping the viewer every `interval`; close the session if a ping is not
/// acknowledged within `timeout`, or if the outbound queue is too full to
/// take a ping at all.
pub async fn run_keepalive(session: Arc<Session>, config: KeepaliveConfig) -> KeepaliveResult {
    let mut ticker = time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // consume first immediate tick

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = session.closed() => return KeepaliveResult::Cancelled,
        }

        let pong = session.pong_received();
        match session.send_ping() {
            PingOutcome::Queued => {}
            PingOutcome::Backlogged => {
                debug!(
                    session_id = %session.id(),
                    "outbound queue full at ping time, evicting slow viewer"
                );
                session.close(CloseReason::Backlogged);
                return KeepaliveResult::Backlogged;
            }
            PingOutcome::Closed => {
                session.close(CloseReason::TransportError);
                return KeepaliveResult::TransportClosed;
            }
        }
        trace!(session_id = %session.id(), "sent ping");

        tokio::select! {
            res = time::timeout(config.timeout, pong) => {
                if res.is_err() {
                    debug!(
                        session_id = %session.id(),
                        timeout_ms = config.timeout.as_millis() as u64,
                        "ping not acknowledged"
                    );
                    session.close(CloseReason::KeepaliveTimeout);
                    return KeepaliveResult::TimedOut;
                }
            }
            () = session.closed() => return KeepaliveResult::Cancelled,
        }
    }
}
