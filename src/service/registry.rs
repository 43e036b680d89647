//! Online session registry.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::server::ServerResponse;

static CONNECTION_ID: AtomicU32 = AtomicU32::new(1);

pub fn next_connection_id() -> u32 {
    CONNECTION_ID.fetch_add(1, Ordering::SeqCst)
}

/// Outbound side of an authenticated session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub connection_id: u32,
    pub tx: mpsc::Sender<ServerResponse>,
}

impl SessionHandle {
    /// Queue a response without waiting. Returns false if the outbox is full or closed.
    pub fn try_send(&self, response: ServerResponse) -> bool {
        self.tx.try_send(response).is_ok()
    }
}

/// Username to session map. A username is bound to at most one connection.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `username` to a session. Returns false if it is already bound.
    pub fn register(&self, username: &str, handle: SessionHandle) -> bool {
        match self.sessions.entry(username.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(handle);
                true
            }
        }
    }

    /// Remove the binding if it still belongs to `connection_id`.
    pub fn unregister(&self, username: &str, connection_id: u32) -> bool {
        self.sessions
            .remove_if(username, |_, handle| handle.connection_id == connection_id)
            .is_some()
    }

    pub fn lookup(&self, username: &str) -> Option<SessionHandle> {
        self.sessions.get(username).map(|h| h.clone())
    }

    pub fn is_online(&self, username: &str) -> bool {
        self.sessions.contains_key(username)
    }

    pub fn list_online(&self) -> BTreeSet<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn online_count(&self) -> usize {
        self.sessions.len()
    }

    /// Best-effort delivery to one user. Returns false if offline or the outbox refused it.
    pub fn send_to(&self, username: &str, response: ServerResponse) -> bool {
        let Some(handle) = self.lookup(username) else {
            debug!(%username, "delivery skipped, user offline");
            return false;
        };
        if handle.try_send(response) {
            true
        } else {
            warn!(%username, "delivery dropped, outbox full or closed");
            false
        }
    }

    /// Deliver to every online user except `except`. Returns the number reached.
    pub fn broadcast(&self, response: &ServerResponse, except: Option<&str>) -> usize {
        // Snapshot first so no shard lock is held while sending.
        let targets: Vec<(String, SessionHandle)> = self
            .sessions
            .iter()
            .filter(|e| Some(e.key().as_str()) != except)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut delivered = 0;
        for (username, handle) in targets {
            if handle.try_send(response.clone()) {
                delivered += 1;
            } else {
                warn!(%username, "broadcast dropped, outbox full or closed");
            }
        }
        delivered
    }

    /// Deliver to each listed user that is online, skipping `except`.
    pub fn multicast<'a, I>(&self, users: I, response: &ServerResponse, except: Option<&str>) -> usize
    where
        I: IntoIterator<Item = &'a String>,
    {
        users
            .into_iter()
            .filter(|u| Some(u.as_str()) != except)
            .filter(|u| self.is_online(u))
            .filter(|u| self.send_to(u, response.clone()))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn handle(capacity: usize) -> (SessionHandle, mpsc::Receiver<ServerResponse>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            SessionHandle {
                connection_id: next_connection_id(),
                tx,
            },
            rx,
        )
    }

    #[test]
    fn test_register_is_exclusive() {
        let registry = SessionRegistry::new();
        let (first, _rx1) = handle(4);
        let (second, _rx2) = handle(4);
        assert!(registry.register("alice", first.clone()));
        assert!(!registry.register("alice", second));
        assert_eq!(registry.lookup("alice").unwrap().connection_id, first.connection_id);
    }

    #[test]
    fn test_unregister_ignores_foreign_connection() {
        let registry = SessionRegistry::new();
        let (h, _rx) = handle(4);
        registry.register("alice", h.clone());
        assert!(!registry.unregister("alice", h.connection_id + 1000));
        assert!(registry.is_online("alice"));
        assert!(registry.unregister("alice", h.connection_id));
        assert!(!registry.is_online("alice"));
    }

    #[test]
    fn test_list_online_is_sorted_and_stable() {
        let registry = SessionRegistry::new();
        for name in ["carol", "alice", "bob"] {
            let (h, _rx) = handle(1);
            registry.register(name, h);
        }
        let first = registry.list_online();
        let second = registry.list_online();
        assert_eq!(first, second);
        assert_eq!(
            first.into_iter().collect::<Vec<_>>(),
            vec!["alice", "bob", "carol"]
        );
    }

    #[test]
    fn test_broadcast_skips_sender_and_full_outboxes() {
        let registry = SessionRegistry::new();
        let (a, mut rx_a) = handle(4);
        let (b, mut rx_b) = handle(1);
        registry.register("alice", a);
        registry.register("bob", b);

        let msg = ServerResponse::UserJoined {
            username: "carol".into(),
        };
        assert!(registry.send_to("bob", msg.clone()));
        // bob's outbox is now full
        assert_eq!(registry.broadcast(&msg, Some("carol")), 1);
        assert_eq!(rx_a.try_recv().unwrap(), msg);
        assert_eq!(rx_b.try_recv().unwrap(), msg);
        assert!(rx_b.try_recv().is_err());

        assert_eq!(registry.broadcast(&msg, Some("alice")), 1);
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_concurrent_register_has_one_winner() {
        let registry = Arc::new(SessionRegistry::new());
        let mut threads = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            threads.push(std::thread::spawn(move || {
                let (h, _rx) = handle(1);
                registry.register("carol", h)
            }));
        }
        let winners = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
