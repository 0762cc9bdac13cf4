//! Server-side state for one connected viewer.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use grog_core::{encode_window, Sequence, SessionId};
use grog_store::LogStore;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::WindowConfig;
use crate::error::SessionError;

/// Lifecycle of a session. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Active = 0,
    Closing = 1,
    Closed = 2,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Active,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Why a session left the `Active` state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    ProtocolViolation,
    TransportError,
    KeepaliveTimeout,
    PeerClosed,
    Shutdown,
    /// The outbound queue stayed full: the viewer is not draining frames.
    Backlogged,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProtocolViolation => "protocol_violation",
            Self::TransportError => "transport_error",
            Self::KeepaliveTimeout => "keepalive_timeout",
            Self::PeerClosed => "peer_closed",
            Self::Shutdown => "shutdown",
            Self::Backlogged => "backlogged",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frames queued for the connection's writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// A serialized window: JSON array of `"<sequence>:<payload>"`.
    Window(String),
    /// Control-frame liveness check.
    Ping,
}

/// Result of queueing a keepalive ping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PingOutcome {
    Queued,
    /// Queue full; no ping was sent.
    Backlogged,
    /// The writer is gone.
    Closed,
}

/// Result of a refresh that did not fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Window queued for delivery.
    Sent { records: usize },
    /// Outbound queue was full; the next cycle supersedes this one.
    Dropped,
}

/// One connected viewer.
///
/// The cursor is written by the viewer's inbound handler and read by
/// refreshes running on the coordinator, so it lives in an atomic.
pub struct Session {
    id: SessionId,
    cursor: AtomicU64,
    state: AtomicU8,
    close_reason: Mutex<Option<CloseReason>>,
    tx: mpsc::Sender<Outbound>,
    pong: Notify,
    cancel: CancellationToken,
    connected_at: Instant,
    windows_sent: AtomicU64,
    windows_dropped: AtomicU64,
    /// Held from reading the cursor until the window is queued, so windows
    /// enter the queue in cursor order.
    delivery: Mutex<()>,
}

impl Session {
    pub fn new(id: SessionId, cursor: Sequence, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            cursor: AtomicU64::new(cursor.get()),
            state: AtomicU8::new(SessionState::Active as u8),
            close_reason: Mutex::new(None),
            tx,
            pong: Notify::new(),
            cancel: CancellationToken::new(),
            connected_at: Instant::now(),
            windows_sent: AtomicU64::new(0),
            windows_dropped: AtomicU64::new(0),
            delivery: Mutex::new(()),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn cursor(&self) -> Sequence {
        Sequence::new(self.cursor.load(Ordering::Acquire))
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn windows_sent(&self) -> u64 {
        self.windows_sent.load(Ordering::Relaxed)
    }

    pub fn windows_dropped(&self) -> u64 {
        self.windows_dropped.load(Ordering::Relaxed)
    }

    /// Apply a repositioning request from the viewer.
    ///
    /// Anything but a non-negative base-10 integer is a protocol violation
    /// and closes the session.
    pub fn set_cursor(&self, raw: &str) -> Result<Sequence, SessionError> {
        if !self.is_active() {
            return Err(SessionError::Closed(self.id));
        }
        match raw.parse::<Sequence>() {
            Ok(cursor) => {
                self.cursor.store(cursor.get(), Ordering::Release);
                debug!(session_id = %self.id, cursor = %cursor, "cursor moved");
                Ok(cursor)
            }
            Err(e) => {
                self.close(CloseReason::ProtocolViolation);
                Err(SessionError::ProtocolViolation(e.to_string()))
            }
        }
    }

    /// Serialize the window around the current cursor:
    /// `[max(1, cursor - lookback), ...]`, at most `batch_size` records.
    pub fn render_window(
        &self,
        store: &LogStore,
        window: &WindowConfig,
    ) -> Result<(String, usize), SessionError> {
        let start = self.cursor().back_clamped(window.lookback);
        let records = store.read_range(start, window.batch_size)?;
        Ok((encode_window(&records)?, records.len()))
    }

    /// Push the current window to the viewer without waiting on the
    /// transport. A store failure aborts only this refresh.
    pub fn refresh(
        &self,
        store: &LogStore,
        window: &WindowConfig,
    ) -> Result<RefreshOutcome, SessionError> {
        if !self.is_active() {
            return Err(SessionError::Closed(self.id));
        }
        let _delivery = self.delivery.lock();
        let (payload, records) = self.render_window(store, window)?;

        match self.tx.try_send(Outbound::Window(payload)) {
            Ok(()) => {
                self.windows_sent.fetch_add(1, Ordering::Relaxed);
                Ok(RefreshOutcome::Sent { records })
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.windows_dropped.fetch_add(1, Ordering::Relaxed);
                Ok(RefreshOutcome::Dropped)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.close(CloseReason::TransportError);
                Err(SessionError::Transport("outbound queue closed".into()))
            }
        }
    }

    /// Queue a liveness ping without waiting on the writer.
    pub fn send_ping(&self) -> PingOutcome {
        match self.tx.try_send(Outbound::Ping) {
            Ok(()) => PingOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => PingOutcome::Backlogged,
            Err(mpsc::error::TrySendError::Closed(_)) => PingOutcome::Closed,
        }
    }

    /// Future resolved by the next [`Session::record_pong`]. Create it
    /// before sending the ping it answers.
    pub fn pong_received(&self) -> tokio::sync::futures::Notified<'_> {
        self.pong.notified()
    }

    pub fn record_pong(&self) {
        self.pong.notify_waiters();
    }

    /// Leave `Active`. Only the first call has an effect; returns whether
    /// this call started the close.
    pub fn close(&self, reason: CloseReason) -> bool {
        let started = self
            .state
            .compare_exchange(
                SessionState::Active as u8,
                SessionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if started {
            *self.close_reason.lock() = Some(reason);
            info!(session_id = %self.id, reason = %reason, "session closing");
            self.cancel.cancel();
        }
        started
    }

    /// Final transition once the session is deregistered and its transport
    /// released.
    pub fn mark_closed(&self) {
        self.close(CloseReason::TransportError);
        self.state
            .store(SessionState::Closed as u8, Ordering::Release);
    }

    /// Resolves once the session has left `Active`.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("cursor", &self.cursor())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grog_core::RecordKind;
    use grog_store::{Database, StoreError};

    fn store_with(lines: &[&str]) -> LogStore {
        let store = LogStore::open(Database::in_memory().unwrap()).unwrap();
        for line in lines {
            store
                .append(line.as_bytes(), RecordKind::classify(line.as_bytes()))
                .unwrap();
        }
        store
    }

    fn session(cursor: u64, queue: usize) -> (Session, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(queue);
        (Session::new(SessionId::from_raw(1), Sequence::new(cursor), tx), rx)
    }

    fn window_entries(frame: Outbound) -> Vec<String> {
        match frame {
            Outbound::Window(json) => serde_json::from_str(&json).unwrap(),
            other => panic!("expected window, got {other:?}"),
        }
    }

    fn first_seq(entry: &str) -> u64 {
        entry.split(':').next().unwrap().parse().unwrap()
    }

    #[test]
    fn refresh_delivers_records_up_to_head() {
        let store = store_with(&["a", "b", "c", "d", "e"]);
        let (s, mut rx) = session(5, 8);

        let outcome = s.refresh(&store, &WindowConfig::default()).unwrap();
        assert_eq!(outcome, RefreshOutcome::Sent { records: 5 });
        assert_eq!(
            window_entries(rx.try_recv().unwrap()),
            vec!["1:a", "2:b", "3:c", "4:d", "5:e"]
        );
        assert_eq!(s.windows_sent(), 1);
    }

    #[test]
    fn refresh_is_idempotent_without_changes() {
        let store = store_with(&["x", r#"{"k":1}"#, "z"]);
        let (s, mut rx) = session(3, 8);
        let window = WindowConfig::default();

        s.refresh(&store, &window).unwrap();
        s.refresh(&store, &window).unwrap();
        assert_eq!(rx.try_recv().unwrap(), rx.try_recv().unwrap());
    }

    #[test]
    fn window_start_clamps_to_first_record() {
        let lines: Vec<String> = (1..=10).map(|i| format!("l{i}")).collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let store = store_with(&refs);
        let window = WindowConfig {
            lookback: 4,
            batch_size: 6,
        };

        for cursor in [0u64, 1, 3, 4, 5] {
            let (s, _rx) = session(cursor, 1);
            let (json, _) = s.render_window(&store, &window).unwrap();
            let entries: Vec<String> = serde_json::from_str(&json).unwrap();
            let expected_start = cursor.saturating_sub(4).max(1);
            assert_eq!(first_seq(&entries[0]), expected_start, "cursor {cursor}");
        }
    }

    #[test]
    fn set_cursor_moves_window() {
        let lines: Vec<String> = (1..=200).map(|i| format!("line {i}")).collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let store = store_with(&refs);
        let window = WindowConfig::default();
        let (s, mut rx) = session(200, 8);

        assert_eq!(s.set_cursor("100").unwrap(), Sequence::new(100));
        s.refresh(&store, &window).unwrap();
        let entries = window_entries(rx.try_recv().unwrap());
        assert_eq!(first_seq(&entries[0]), 60);
        assert_eq!(entries.len(), 80);
        assert_eq!(first_seq(entries.last().unwrap()), 139);
    }

    #[test]
    fn cursor_two_includes_two_from_first() {
        let store = store_with(&["p1", "p2", "p3", "p4", "p5"]);
        let (s, mut rx) = session(5, 8);
        s.set_cursor("2").unwrap();
        s.refresh(&store, &WindowConfig::default()).unwrap();
        let entries = window_entries(rx.try_recv().unwrap());
        assert_eq!(entries[0], "1:p1");
        assert!(entries.contains(&"2:p2".to_string()));
    }

    #[test]
    fn invalid_cursor_closes_session() {
        let (s, _rx) = session(0, 1);
        let err = s.set_cursor("not-a-number").unwrap_err();
        assert!(matches!(err, SessionError::ProtocolViolation(_)));
        assert_eq!(s.state(), SessionState::Closing);
        assert_eq!(s.close_reason(), Some(CloseReason::ProtocolViolation));

        assert!(matches!(s.set_cursor("3"), Err(SessionError::Closed(_))));
    }

    #[test]
    fn negative_cursor_is_a_violation() {
        let (s, _rx) = session(0, 1);
        assert!(s.set_cursor("-5").is_err());
        assert!(!s.is_active());
    }

    #[test]
    fn full_queue_drops_refresh() {
        let store = store_with(&["a"]);
        let (s, _rx) = session(1, 1);
        let window = WindowConfig::default();

        assert!(matches!(
            s.refresh(&store, &window).unwrap(),
            RefreshOutcome::Sent { .. }
        ));
        assert_eq!(s.refresh(&store, &window).unwrap(), RefreshOutcome::Dropped);
        assert_eq!(s.windows_dropped(), 1);
        assert!(s.is_active());
    }

    #[test]
    fn closed_queue_closes_session() {
        let store = store_with(&["a"]);
        let (s, rx) = session(1, 1);
        drop(rx);
        let err = s.refresh(&store, &WindowConfig::default()).unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));
        assert_eq!(s.close_reason(), Some(CloseReason::TransportError));
    }

    #[test]
    fn corrupt_record_aborts_refresh_only() {
        let store = store_with(&["a"]);
        store
            .database()
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO records (key, kind, payload) VALUES ('0000000000000000000x', 'plain', x'00')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();
        let (s, mut rx) = session(1, 4);

        let err = s.refresh(&store, &WindowConfig::default()).unwrap_err();
        assert!(err.is_corrupt_record());
        assert!(matches!(
            err,
            SessionError::Store(StoreError::CorruptRecord { .. })
        ));
        assert!(s.is_active());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn close_is_first_wins() {
        let (s, _rx) = session(0, 1);
        assert!(s.close(CloseReason::KeepaliveTimeout));
        assert!(!s.close(CloseReason::Shutdown));
        assert_eq!(s.close_reason(), Some(CloseReason::KeepaliveTimeout));

        s.mark_closed();
        assert_eq!(s.state(), SessionState::Closed);
        assert_eq!(s.close_reason(), Some(CloseReason::KeepaliveTimeout));
    }

    #[test]
    fn refresh_after_close_is_rejected() {
        let store = store_with(&["a"]);
        let (s, mut rx) = session(1, 4);
        s.close(CloseReason::Shutdown);
        assert!(matches!(
            s.refresh(&store, &WindowConfig::default()),
            Err(SessionError::Closed(_))
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_resolves_after_close() {
        let (s, _rx) = session(0, 1);
        s.close(CloseReason::PeerClosed);
        tokio::time::timeout(Duration::from_millis(100), s.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn pong_wakes_pending_waiter() {
        let (s, _rx) = session(0, 1);
        let waiter = s.pong_received();
        s.record_pong();
        tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .unwrap();
    }

    #[test]
    fn ping_outcome_tracks_queue() {
        let (s, rx) = session(0, 1);
        assert_eq!(s.send_ping(), PingOutcome::Queued);
        assert_eq!(s.send_ping(), PingOutcome::Backlogged);
        drop(rx);
        assert_eq!(s.send_ping(), PingOutcome::Closed);
    }

    #[test]
    fn last_queued_window_follows_latest_cursor() {
        let lines: Vec<String> = (1..=300).map(|i| format!("r{i}")).collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let store = store_with(&refs);
        let window = WindowConfig::default();
        let (s, mut rx) = session(300, 8);

        for i in 0..300u64 {
            let target = 41 + (i * 7) % 200;
            std::thread::scope(|scope| {
                // Broadcast cycle racing the viewer's own repositioning.
                scope.spawn(|| s.refresh(&store, &window).unwrap());
                scope.spawn(|| {
                    s.set_cursor(&target.to_string()).unwrap();
                    s.refresh(&store, &window).unwrap();
                });
            });

            let mut last = None;
            while let Ok(frame) = rx.try_recv() {
                last = Some(frame);
            }
            let entries = window_entries(last.unwrap());
            assert_eq!(first_seq(&entries[0]), target - 40, "iteration {i}");
        }
    }
}
