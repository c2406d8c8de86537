//! Quorum predicates and the ballot-to-acceptor-quorum mapping.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::types::{Ballot, ReplicaId};

/// Strict majority size.
pub fn majority_of(n: usize) -> usize {
    n / 2 + 1
}

/// Fast-quorum size: three quarters, rounded up.
pub fn three_quarters_of(n: usize) -> usize {
    n - n / 4
}

/// A quorum predicate: either anonymous (any `size` replicas) or a fixed
/// acceptor set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quorum {
    Size(usize),
    Fixed(BTreeSet<ReplicaId>),
}

impl Quorum {
    pub fn majority(n: usize) -> Self {
        Quorum::Size(majority_of(n))
    }

    pub fn three_quarters(n: usize) -> Self {
        Quorum::Size(three_quarters_of(n))
    }

    pub fn fixed(members: impl IntoIterator<Item = ReplicaId>) -> Self {
        Quorum::Fixed(members.into_iter().collect())
    }

    pub fn size(&self) -> usize {
        match self {
            Quorum::Size(size) => *size,
            Quorum::Fixed(set) => set.len(),
        }
    }

    /// Membership test. Anonymous quorums are canonically the first `size`
    /// replicas, so membership stays deterministic across the cluster.
    pub fn contains(&self, replica: ReplicaId) -> bool {
        match self {
            Quorum::Size(size) => (replica as usize) < *size,
            Quorum::Fixed(set) => set.contains(&replica),
        }
    }
}

/// One pre-declared ballot and its acceptor set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumEntry {
    pub ballot: Ballot,
    pub acceptors: BTreeSet<ReplicaId>,
}

/// Maps ballots to acceptor quorums.
///
/// With no declared entries every ballot uses an anonymous three-quarters
/// quorum. Declared entries pin specific ballots to fixed acceptor sets of
/// exactly the majority size; any two quorums at the same ballot then
/// intersect by construction.
#[derive(Clone, Debug)]
pub struct QuorumSystem {
    n: usize,
    entries: Vec<QuorumEntry>,
}

impl QuorumSystem {
    pub fn new(n: usize, entries: Vec<QuorumEntry>) -> anyhow::Result<Self> {
        let majority = majority_of(n);
        for entry in &entries {
            anyhow::ensure!(
                entry.acceptors.len() == majority,
                "quorum at ballot {} has {} acceptors, expected {}",
                entry.ballot,
                entry.acceptors.len(),
                majority
            );
            if let Some(max) = entry.acceptors.iter().max() {
                anyhow::ensure!(
                    (*max as usize) < n,
                    "quorum at ballot {} names replica {} outside 0..{}",
                    entry.ballot,
                    max,
                    n
                );
            }
        }
        Ok(Self { n, entries })
    }

    /// True when ballots carry pre-assigned (fixed) acceptor quorums.
    pub fn is_fixed(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Acceptor quorum at this ballot.
    pub fn aq(&self, ballot: Ballot) -> Quorum {
        self.entries
            .iter()
            .find(|e| e.ballot == ballot)
            .map(|e| Quorum::Fixed(e.acceptors.clone()))
            .unwrap_or_else(|| Quorum::three_quarters(self.n))
    }

    /// The i-th declared ballot, if any.
    pub fn ballot_at(&self, index: usize) -> Option<Ballot> {
        self.entries.get(index).map(|e| e.ballot)
    }

    /// Least ballot >= max(a, b) whose acceptor quorum equals `aq(a)`.
    pub fn same_higher(&self, a: Ballot, b: Ballot) -> Ballot {
        let floor = a.max(b);
        let target = self.aq(a);
        if matches!(target, Quorum::Size(_)) {
            return floor;
        }
        self.entries
            .iter()
            .filter(|e| e.ballot >= floor)
            .filter(|e| Quorum::Fixed(e.acceptors.clone()) == target)
            .map(|e| e.ballot)
            .min()
            .unwrap_or(floor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ballot: Ballot, acceptors: &[ReplicaId]) -> QuorumEntry {
        QuorumEntry {
            ballot,
            acceptors: acceptors.iter().copied().collect(),
        }
    }

    #[test]
    fn quorum_sizes() {
        assert_eq!(majority_of(3), 2);
        assert_eq!(majority_of(4), 3);
        assert_eq!(majority_of(5), 3);
        assert_eq!(three_quarters_of(3), 3);
        assert_eq!(three_quarters_of(4), 3);
        assert_eq!(three_quarters_of(5), 4);
        assert_eq!(three_quarters_of(7), 6);
    }

    #[test]
    fn anonymous_quorum_membership_is_a_prefix() {
        let q = Quorum::three_quarters(4);
        assert_eq!(q.size(), 3);
        assert!(q.contains(0));
        assert!(q.contains(2));
        assert!(!q.contains(3));
        let f = Quorum::fixed([0, 1]);
        assert!(f.contains(1));
        assert!(!f.contains(2));
    }

    #[test]
    fn declared_ballots_map_to_fixed_sets() {
        let qs = QuorumSystem::new(
            3,
            vec![entry(0, &[0, 1]), entry(1, &[1, 2]), entry(4, &[0, 1])],
        )
        .unwrap();
        assert!(qs.is_fixed());
        assert_eq!(qs.aq(0), Quorum::fixed([0, 1]));
        assert_eq!(qs.aq(1), Quorum::fixed([1, 2]));
        // Undeclared ballots fall back to the anonymous fast quorum.
        assert_eq!(qs.aq(7), Quorum::three_quarters(3));
        assert_eq!(qs.ballot_at(1), Some(1));
        assert_eq!(qs.ballot_at(5), None);
    }

    #[test]
    fn same_higher_finds_matching_quorum() {
        let qs = QuorumSystem::new(
            3,
            vec![entry(0, &[0, 1]), entry(1, &[1, 2]), entry(4, &[0, 1])],
        )
        .unwrap();
        assert_eq!(qs.same_higher(0, 0), 0);
        // aq(0) = {0,1}; the least ballot >= 1 with that set is 4.
        assert_eq!(qs.same_higher(0, 1), 4);
        // Anonymous systems return max(a, b) directly.
        let anon = QuorumSystem::new(3, Vec::new()).unwrap();
        assert_eq!(anon.same_higher(2, 5), 5);
    }

    #[test]
    fn rejects_malformed_entries() {
        assert!(QuorumSystem::new(3, vec![entry(0, &[0])]).is_err());
        assert!(QuorumSystem::new(3, vec![entry(0, &[0, 7])]).is_err());
    }

    #[test]
    fn same_ballot_quorums_are_majority_sized() {
        // Majority-sized quorums at a ballot pairwise intersect; the
        // constructor enforces the size, so every aq() result is one.
        let qs = QuorumSystem::new(5, vec![entry(0, &[0, 1, 2]), entry(1, &[2, 3, 4])]).unwrap();
        for b in [0, 1] {
            assert!(qs.aq(b).size() * 2 > 5);
        }
        // Undeclared ballots use the three-quarters quorum, which is at
        // least a majority for every n.
        assert!(qs.aq(9).size() * 2 > 5);
    }
}
