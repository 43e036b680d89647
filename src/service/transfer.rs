//! Pending file transfer bookkeeping.
//!
//! A transfer is announced on the control channel, accepted or rejected there,
//! and then carried out on the transfer port. Entries leave the map once they
//! reach a terminal state; the removed request is handed back to the caller.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferTarget {
    User(String),
    Group(String),
}

impl TransferTarget {
    pub fn name(&self) -> &str {
        match self {
            TransferTarget::User(name) | TransferTarget::Group(name) => name,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, TransferTarget::Group(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Waiting for the receiver to accept or reject.
    Requested,
    /// The sender may open its SEND leg.
    Accepted,
    /// A SEND leg is streaming the file in.
    Transferring,
    Completed,
    Rejected,
    Abandoned,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Rejected | TransferState::Abandoned
        )
    }
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub id: String,
    pub sender: String,
    pub target: TransferTarget,
    pub file_name: String,
    pub file_size: u64,
    pub state: TransferState,
    pub updated_at: Instant,
    /// Group members who asked for the file before it was stored.
    pub interested: Vec<String>,
}

impl TransferRequest {
    pub fn new(
        id: impl Into<String>,
        sender: impl Into<String>,
        target: TransferTarget,
        file_name: impl Into<String>,
        file_size: u64,
    ) -> Self {
        Self {
            id: id.into(),
            sender: sender.into(),
            target,
            file_name: file_name.into(),
            file_size,
            state: TransferState::Requested,
            updated_at: Instant::now(),
            interested: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct TransferCoordinator {
    transfers: DashMap<String, TransferRequest>,
}

impl TransferCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new transfer. With `auto_accept` it starts out Accepted.
    pub fn announce(&self, mut request: TransferRequest, auto_accept: bool) -> Result<TransferRequest> {
        match self.transfers.entry(request.id.clone()) {
            Entry::Occupied(_) => Err(Error::Duplicate(format!("transfer {}", request.id))),
            Entry::Vacant(slot) => {
                if auto_accept {
                    request.state = TransferState::Accepted;
                }
                request.updated_at = Instant::now();
                debug!(id = %request.id, sender = %request.sender, state = ?request.state, "transfer announced");
                slot.insert(request.clone());
                Ok(request)
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<TransferRequest> {
        self.transfers.get(id).map(|t| t.clone())
    }

    /// Receiver accepts a private transfer.
    pub fn accept(&self, id: &str, by: &str) -> Result<TransferRequest> {
        let mut entry = self
            .transfers
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("transfer {}", id)))?;
        if entry.target != TransferTarget::User(by.to_string()) {
            return Err(Error::PermissionDenied(format!("transfer {} is not addressed to you", id)));
        }
        if entry.state != TransferState::Requested {
            return Err(Error::Duplicate(format!("transfer {} already answered", id)));
        }
        entry.state = TransferState::Accepted;
        entry.updated_at = Instant::now();
        Ok(entry.clone())
    }

    /// Receiver declines a private transfer; the entry is dropped.
    pub fn reject(&self, id: &str, by: &str) -> Result<TransferRequest> {
        {
            let entry = self
                .transfers
                .get(id)
                .ok_or_else(|| Error::NotFound(format!("transfer {}", id)))?;
            if entry.target != TransferTarget::User(by.to_string()) {
                return Err(Error::PermissionDenied(format!(
                    "transfer {} is not addressed to you",
                    id
                )));
            }
            if entry.state != TransferState::Requested {
                return Err(Error::Duplicate(format!("transfer {} already answered", id)));
            }
        }
        self.finish(id, TransferState::Rejected)
            .ok_or_else(|| Error::NotFound(format!("transfer {}", id)))
    }

    /// A group member asks to be told once the file is stored.
    pub fn register_interest(&self, id: &str, member: &str) -> Result<TransferRequest> {
        let mut entry = self
            .transfers
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("transfer {}", id)))?;
        if !entry.target.is_group() {
            return Err(Error::PermissionDenied(format!("transfer {} is not a group transfer", id)));
        }
        if !entry.interested.iter().any(|m| m == member) {
            entry.interested.push(member.to_string());
        }
        Ok(entry.clone())
    }

    /// Claim an accepted transfer for a SEND leg.
    pub fn begin_upload(&self, id: &str) -> Result<TransferRequest> {
        let mut entry = self
            .transfers
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("transfer {}", id)))?;
        match entry.state {
            TransferState::Accepted => {
                entry.state = TransferState::Transferring;
                entry.updated_at = Instant::now();
                Ok(entry.clone())
            }
            TransferState::Requested => Err(Error::Unavailable(format!(
                "transfer {} has not been accepted",
                id
            ))),
            _ => Err(Error::Duplicate(format!("transfer {} already in progress", id))),
        }
    }

    pub fn complete(&self, id: &str) -> Option<TransferRequest> {
        self.finish(id, TransferState::Completed)
    }

    pub fn fail(&self, id: &str) -> Option<TransferRequest> {
        self.finish(id, TransferState::Abandoned)
    }

    fn finish(&self, id: &str, state: TransferState) -> Option<TransferRequest> {
        self.finish_if(id, state, |_| true)
    }

    /// Remove `id` only if `pred` still holds under the entry's lock.
    fn finish_if(
        &self,
        id: &str,
        state: TransferState,
        pred: impl FnOnce(&TransferRequest) -> bool,
    ) -> Option<TransferRequest> {
        let (_, mut request) = self.transfers.remove_if(id, |_, t| pred(t))?;
        request.state = state;
        request.updated_at = Instant::now();
        debug_assert!(state.is_terminal());
        debug!(%id, ?state, "transfer finished");
        Some(request)
    }

    /// Abandon what a departing user leaves behind: its own transfers that have not
    /// started streaming, and private transfers still waiting for its answer.
    pub fn release_for(&self, username: &str) -> Vec<TransferRequest> {
        let left_behind = |t: &TransferRequest| {
            let own = t.sender == username
                && matches!(t.state, TransferState::Requested | TransferState::Accepted);
            let addressed = t.target == TransferTarget::User(username.to_string())
                && t.state == TransferState::Requested;
            own || addressed
        };
        self.fail_matching(left_behind)
    }

    /// Drop transfers that sat in Requested or Accepted longer than `ttl`.
    pub fn evict_stale(&self, ttl: Duration) -> Vec<TransferRequest> {
        let now = Instant::now();
        self.fail_matching(|t| {
            matches!(t.state, TransferState::Requested | TransferState::Accepted)
                && now.duration_since(t.updated_at) >= ttl
        })
    }

    /// Abandon every entry matching `pred`. The predicate is checked again at removal,
    /// so an entry that moved on since the scan is left alone.
    fn fail_matching(&self, pred: impl Fn(&TransferRequest) -> bool) -> Vec<TransferRequest> {
        let ids: Vec<String> = self
            .transfers
            .iter()
            .filter(|t| pred(t))
            .map(|t| t.id.clone())
            .collect();
        ids.iter()
            .filter_map(|id| self.finish_if(id, TransferState::Abandoned, &pred))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn private(id: &str) -> TransferRequest {
        TransferRequest::new(id, "alice", TransferTarget::User("bob".into()), "report.pdf", 10_000)
    }

    #[test]
    fn test_accept_then_upload() {
        let transfers = TransferCoordinator::new();
        transfers.announce(private("t1"), false).unwrap();
        assert!(matches!(
            transfers.begin_upload("t1"),
            Err(Error::Unavailable(_))
        ));
        assert!(matches!(
            transfers.accept("t1", "carol"),
            Err(Error::PermissionDenied(_))
        ));
        assert_eq!(transfers.accept("t1", "bob").unwrap().state, TransferState::Accepted);
        assert!(matches!(transfers.accept("t1", "bob"), Err(Error::Duplicate(_))));
        assert_eq!(
            transfers.begin_upload("t1").unwrap().state,
            TransferState::Transferring
        );
        assert!(matches!(transfers.begin_upload("t1"), Err(Error::Duplicate(_))));

        let done = transfers.complete("t1").unwrap();
        assert_eq!(done.state, TransferState::Completed);
        assert!(done.state.is_terminal());
        assert!(transfers.is_empty());
    }

    #[test]
    fn test_duplicate_announce() {
        let transfers = TransferCoordinator::new();
        transfers.announce(private("t1"), false).unwrap();
        assert!(matches!(
            transfers.announce(private("t1"), true),
            Err(Error::Duplicate(_))
        ));
    }

    #[test]
    fn test_reject_removes_entry() {
        let transfers = TransferCoordinator::new();
        transfers.announce(private("t1"), false).unwrap();
        assert_eq!(transfers.reject("t1", "bob").unwrap().state, TransferState::Rejected);
        assert!(transfers.get("t1").is_none());
        assert!(matches!(transfers.reject("t1", "bob"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_release_for_departing_user() {
        let transfers = TransferCoordinator::new();
        transfers.announce(private("mine"), false).unwrap();
        transfers
            .announce(
                TransferRequest::new("to-alice", "bob", TransferTarget::User("alice".into()), "a", 1),
                false,
            )
            .unwrap();
        transfers
            .announce(
                TransferRequest::new("streaming", "alice", TransferTarget::User("bob".into()), "b", 1),
                true,
            )
            .unwrap();
        transfers.begin_upload("streaming").unwrap();

        let mut released: Vec<String> =
            transfers.release_for("alice").into_iter().map(|t| t.id).collect();
        released.sort();
        assert_eq!(released, vec!["mine", "to-alice"]);
        assert!(transfers.get("streaming").is_some());
    }

    #[test]
    fn test_group_interest_is_deduplicated() {
        let transfers = TransferCoordinator::new();
        transfers
            .announce(
                TransferRequest::new("g1", "alice", TransferTarget::Group("team".into()), "a", 1),
                true,
            )
            .unwrap();
        transfers.register_interest("g1", "bob").unwrap();
        let request = transfers.register_interest("g1", "bob").unwrap();
        assert_eq!(request.interested, vec!["bob"]);
        assert!(transfers.register_interest("missing", "bob").is_err());
    }

    #[test]
    fn test_evict_stale() {
        let transfers = TransferCoordinator::new();
        transfers.announce(private("old"), false).unwrap();
        assert!(transfers.evict_stale(Duration::from_secs(3600)).is_empty());
        let evicted = transfers.evict_stale(Duration::ZERO);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].state, TransferState::Abandoned);
    }

    #[test]
    fn test_removal_rechecks_state() {
        let transfers = TransferCoordinator::new();
        transfers.announce(private("t1"), true).unwrap();
        transfers.begin_upload("t1").unwrap();

        // Scanned while Accepted, streaming by the time it is removed.
        let accepted = |t: &TransferRequest| t.state == TransferState::Accepted;
        assert!(
            transfers
                .finish_if("t1", TransferState::Abandoned, accepted)
                .is_none()
        );

        assert!(transfers.evict_stale(Duration::ZERO).is_empty());
        assert!(transfers.release_for("alice").is_empty());
        assert_eq!(
            transfers.complete("t1").unwrap().state,
            TransferState::Completed
        );
    }
}
