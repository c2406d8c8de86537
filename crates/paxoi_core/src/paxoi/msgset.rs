//! Quorum-ack aggregator.
//!
//! A `MsgSet` collects per-replica acknowledgements until a quorum of them
//! passes the accept predicate against the leader's message. Completion is
//! reported exactly once, as the return value of `add`; the caller runs
//! whatever the completion implies (phase transition, delivery, sync).

use std::collections::HashMap;

use super::quorum::Quorum;
use super::types::ReplicaId;

/// Accept predicate: does `msg` support the leader's message?
pub type AcceptFn<M> = Box<dyn Fn(&M, &M) -> bool + Send>;

/// Outcome of recording one message.
#[derive(Debug)]
pub enum Added<M> {
    /// Not complete (or already fired earlier).
    Pending,
    /// Quorum reached just now. Holds the leader message and the accepted
    /// non-leader messages; the set is drained and will not fire again.
    Completed { leader: M, msgs: Vec<M> },
}

impl<M> Added<M> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Added::Completed { .. })
    }
}

/// Aggregates acknowledgements toward one quorum predicate.
///
/// Deduplicates by replica id (last write wins). Messages failing the accept
/// predicate are retained but uncounted; they are re-tested once the leader
/// message arrives, since acceptance is defined relative to it.
pub struct MsgSet<M> {
    quorum: Quorum,
    accept: AcceptFn<M>,
    leader_msg: Option<M>,
    msgs: HashMap<ReplicaId, M>,
    fired: bool,
}

impl<M: Clone> MsgSet<M> {
    pub fn new(quorum: Quorum, accept: AcceptFn<M>) -> Self {
        Self {
            quorum,
            accept,
            leader_msg: None,
            msgs: HashMap::new(),
            fired: false,
        }
    }

    /// Record `msg` from `replica`. Returns `Completed` exactly once, when a
    /// leader message has been recorded and the accepted non-leader messages
    /// reach quorum size minus one (the leader counts).
    pub fn add(&mut self, replica: ReplicaId, is_leader: bool, msg: M) -> Added<M> {
        if self.fired {
            return Added::Pending;
        }

        if is_leader {
            self.leader_msg = Some(msg);
        } else {
            self.msgs.insert(replica, msg);
        }

        let Some(leader) = &self.leader_msg else {
            return Added::Pending;
        };

        let accepted = self
            .msgs
            .values()
            .filter(|m| (self.accept)(m, leader))
            .count();
        if accepted + 1 < self.quorum.size() {
            return Added::Pending;
        }

        self.fired = true;
        let leader = self.leader_msg.take().expect("leader message present");
        let msgs = self
            .msgs
            .drain()
            .map(|(_, m)| m)
            .filter(|m| (self.accept)(m, &leader))
            .collect();
        Added::Completed { leader, msgs }
    }

    /// Drop held messages and reset the fired latch.
    pub fn free(&mut self) {
        self.leader_msg = None;
        self.msgs.clear();
        self.fired = false;
    }

    /// Rebind the quorum and accept predicate, dropping held state.
    pub fn reinit(&mut self, quorum: Quorum, accept: AcceptFn<M>) {
        self.quorum = quorum;
        self.accept = accept;
        self.free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(size: usize) -> MsgSet<(u32, bool)> {
        // Message payload: (replica, acceptable).
        MsgSet::new(Quorum::Size(size), Box::new(|m: &(u32, bool), _| m.1))
    }

    #[test]
    fn fires_once_at_quorum_with_leader() {
        let mut s = set(3);
        assert!(!s.add(1, false, (1, true)).is_completed());
        assert!(!s.add(2, false, (2, true)).is_completed());
        // Quorum-many acceptable messages, but no leader message yet.
        assert!(!s.add(3, false, (3, true)).is_completed());
        match s.add(0, true, (0, true)) {
            Added::Completed { leader, msgs } => {
                assert_eq!(leader.0, 0);
                assert_eq!(msgs.len(), 3);
            }
            Added::Pending => panic!("expected completion"),
        }
        // Further messages never re-fire.
        assert!(!s.add(4, false, (4, true)).is_completed());
    }

    #[test]
    fn non_accepting_messages_are_not_counted() {
        let mut s = set(3);
        assert!(!s.add(0, true, (0, true)).is_completed());
        assert!(!s.add(1, false, (1, false)).is_completed());
        assert!(!s.add(2, false, (2, false)).is_completed());
        assert!(!s.add(3, false, (3, true)).is_completed());
        match s.add(4, false, (4, true)) {
            Added::Completed { msgs, .. } => {
                assert_eq!(msgs.len(), 2);
                assert!(msgs.iter().all(|m| m.1));
            }
            Added::Pending => panic!("expected completion"),
        }
    }

    #[test]
    fn duplicate_replica_is_idempotent() {
        let mut s = set(3);
        assert!(!s.add(0, true, (0, true)).is_completed());
        assert!(!s.add(1, false, (1, true)).is_completed());
        // Replaying the same replica's ack does not advance the count.
        assert!(!s.add(1, false, (1, true)).is_completed());
        assert!(!s.add(1, false, (1, true)).is_completed());
        assert!(s.add(2, false, (2, true)).is_completed());
    }

    #[test]
    fn leader_alone_satisfies_quorum_of_one() {
        let mut s = set(1);
        assert!(s.add(0, true, (0, true)).is_completed());
    }

    #[test]
    fn free_resets_and_allows_reuse() {
        let mut s = set(2);
        assert!(!s.add(0, true, (0, true)).is_completed());
        assert!(s.add(1, false, (1, true)).is_completed());
        s.free();
        assert!(!s.add(0, true, (0, true)).is_completed());
        assert!(s.add(2, false, (2, true)).is_completed());
    }
}
