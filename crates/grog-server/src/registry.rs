use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use grog_core::{Sequence, SessionId};
use tokio::sync::mpsc;

use crate::session::{CloseReason, Outbound, Session};

/// Registry of all active viewer sessions.
///
/// Backed by a sharded map: registration and removal lock a single shard,
/// and [`SessionRegistry::snapshot`] clones handles out so iteration never
/// holds a lock while delivering.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    next_id: AtomicU64,
    max_send_queue: usize,
}

impl SessionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(0),
            max_send_queue: max_send_queue.max(1),
        }
    }

    /// Register a new session positioned at `cursor`. Returns the session
    /// and the receiving end of its outbound queue.
    pub fn register(&self, cursor: Sequence) -> (Arc<Session>, mpsc::Receiver<Outbound>) {
        let id = SessionId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let session = Arc::new(Session::new(id, cursor, tx));
        self.sessions.insert(id, Arc::clone(&session));
        (session, rx)
    }

    /// Remove a session by ID.
    pub fn deregister(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.remove(&id).map(|(_, session)| session)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Handles to every registered session, ordered by id.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        sessions.sort_by_key(|s| s.id());
        sessions
    }

    /// Number of registered sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Ask every session to close. Sessions deregister themselves once
    /// their transport is released.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        self.snapshot()
            .iter()
            .filter(|session| session.close(reason))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;

    #[test]
    fn register_assigns_increasing_ids() {
        let registry = SessionRegistry::new(8);
        let (a, _ra) = registry.register(Sequence::ZERO);
        let (b, _rb) = registry.register(Sequence::new(4));
        assert_eq!(a.id().get(), 1);
        assert_eq!(b.id().get(), 2);
        assert_eq!(b.cursor(), Sequence::new(4));
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn ids_not_reused_after_deregister() {
        let registry = SessionRegistry::new(8);
        let (a, _ra) = registry.register(Sequence::ZERO);
        registry.deregister(a.id());
        let (b, _rb) = registry.register(Sequence::ZERO);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn register_and_deregister() {
        let registry = SessionRegistry::new(8);
        assert_eq!(registry.count(), 0);

        let (a, _ra) = registry.register(Sequence::ZERO);
        let (b, _rb) = registry.register(Sequence::ZERO);
        assert_eq!(registry.count(), 2);

        assert!(registry.deregister(a.id()).is_some());
        assert!(registry.deregister(a.id()).is_none());
        assert_eq!(registry.count(), 1);
        assert!(registry.get(b.id()).is_some());
        assert!(registry.get(a.id()).is_none());
    }

    #[test]
    fn snapshot_survives_concurrent_deregistration() {
        let registry = SessionRegistry::new(8);
        let handles: Vec<_> = (0..5).map(|_| registry.register(Sequence::ZERO)).collect();

        let snapshot = registry.snapshot();
        for (session, _) in &handles {
            registry.deregister(session.id());
        }
        assert_eq!(snapshot.len(), 5);
        assert_eq!(registry.count(), 0);
        let ids: Vec<u64> = snapshot.iter().map(|s| s.id().get()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn close_all_moves_sessions_to_closing() {
        let registry = SessionRegistry::new(8);
        let (a, _ra) = registry.register(Sequence::ZERO);
        let (b, _rb) = registry.register(Sequence::ZERO);
        b.close(CloseReason::PeerClosed);

        assert_eq!(registry.close_all(CloseReason::Shutdown), 1);
        assert_eq!(a.state(), SessionState::Closing);
        assert_eq!(a.close_reason(), Some(CloseReason::Shutdown));
        assert_eq!(b.close_reason(), Some(CloseReason::PeerClosed));
    }

    #[test]
    fn concurrent_registration() {
        let registry = Arc::new(SessionRegistry::new(4));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    (0..50)
                        .map(|_| registry.register(Sequence::ZERO).0.id())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids: Vec<SessionId> = threads
            .into_iter()
            .flat_map(|t| t.join().unwrap())
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 200);
        assert_eq!(registry.count(), 200);
    }
}
