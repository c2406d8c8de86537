//! Shared types for the Paxoi replica core.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by both the replica engine and the client/network layers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::conflicts::SHash;
use super::quorum::QuorumEntry;

/// Logical replica identifier within a cluster.
pub type ReplicaId = u32;
/// Logical client identifier; unique per client process or clone.
pub type ClientId = u32;
/// Per-client monotone request counter.
pub type SeqNum = u32;
/// Key addressed by a command.
pub type Key = u64;
/// Opaque command payload / execution result.
pub type Value = Vec<u8>;
/// Protocol epoch counter, partitioned across replicas by `leader_of`.
pub type Ballot = i64;

/// Replica that owns a ballot.
pub fn leader_of(ballot: Ballot, n: usize) -> ReplicaId {
    (ballot.rem_euclid(n as i64)) as ReplicaId
}

/// Smallest ballot strictly greater than `after` owned by `replica`.
pub fn next_ballot_of(replica: ReplicaId, after: Ballot, n: usize) -> Ballot {
    let n = n as i64;
    let base = (after / n) * n + i64::from(replica);
    if base > after {
        base
    } else {
        base + n
    }
}

/// Unique request identifier scoped by client and a monotone counter.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct CommandId {
    pub client_id: ClientId,
    pub seq_num: SeqNum,
}

/// Command operation kind.
///
/// `Noop` carries no keys and is used during recovery to seal holes left by
/// proposes that never reached a quorum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Get,
    Put,
    Noop,
}

/// Opaque state-machine command. Two commands conflict iff they share a key
/// and at least one of them is a write.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub op: Op,
    pub key: Key,
    pub value: Value,
}

impl Command {
    pub fn get(key: Key) -> Self {
        Self {
            op: Op::Get,
            key,
            value: Vec::new(),
        }
    }

    pub fn put(key: Key, value: Value) -> Self {
        Self {
            op: Op::Put,
            key,
            value,
        }
    }

    pub fn noop() -> Self {
        Self {
            op: Op::Noop,
            key: 0,
            value: Vec::new(),
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(self.op, Op::Get)
    }

    /// Keys touched by this command. A noop touches none.
    pub fn keys(&self) -> impl Iterator<Item = Key> {
        match self.op {
            Op::Noop => None,
            _ => Some(self.key),
        }
        .into_iter()
    }

    pub fn conflicts_with(&self, other: &Command) -> bool {
        if matches!(self.op, Op::Noop) || matches!(other.op, Op::Noop) {
            return false;
        }
        self.key == other.key && !(self.is_read() && other.is_read())
    }
}

/// Dependency set: command ids this command must be delivered after.
///
/// Stored in arrival order; equality is order-insensitive. The nil-dep of a
/// command `c` is `[c]` and stands for "dep unknown" in compacted acks.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Dep(pub Vec<CommandId>);

impl Dep {
    pub fn nil_of(cmd_id: CommandId) -> Self {
        Self(vec![cmd_id])
    }

    pub fn is_nil_of(&self, cmd_id: CommandId) -> bool {
        self.0.len() == 1 && self.0[0] == cmd_id
    }

    pub fn contains(&self, cmd_id: CommandId) -> bool {
        self.0.contains(&cmd_id)
    }

    /// Order-insensitive equality.
    pub fn equals(&self, other: &Dep) -> bool {
        if self.0.len() != other.0.len() {
            return false;
        }
        self.0.iter().all(|id| other.0.contains(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = CommandId> + '_ {
        self.0.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Per-command protocol phase. Monotone within a ballot; only recovery may
/// install a phase across ballots.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub enum Phase {
    #[default]
    Start,
    PayloadOnly,
    PreAccept,
    Accept,
    Commit,
}

/// Replica-wide status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Normal,
    Recovering,
}

/// Client-visible acknowledgement classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckOk {
    /// Fast-path vote: this replica's dep matches the leader's.
    True,
    /// Slow-path signal: dep disagreement or checksum correction.
    False,
    /// Post-delivery record on the ordered path.
    Ordered,
}

/// Client proposal as seen by the replica ingress.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Propose {
    pub cmd_id: CommandId,
    pub command: Command,
    /// True when the issuing client is collocated with the receiving replica.
    pub collocated: bool,
}

/// Pre-accept vote carrying the sender's dependency view.
///
/// `dep == None` encodes a compacted light-slow-ack reshaped as a fast-ack.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FastAck {
    pub replica: ReplicaId,
    pub ballot: Ballot,
    pub cmd_id: CommandId,
    pub dep: Option<Dep>,
    pub checksum: Vec<SHash>,
}

/// Dep-agnostic acknowledgement: SQ membership contribution or corrective
/// signal.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct LightSlowAck {
    pub replica: ReplicaId,
    pub ballot: Ballot,
    pub cmd_id: CommandId,
}

/// Mixed batch of replica-to-replica acknowledgements.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Acks {
    pub fast_acks: Vec<FastAck>,
    pub light_slow_acks: Vec<LightSlowAck>,
}

/// One compacted acknowledgement inside an `OptAcks` batch. A nil-dep
/// (`dep == [cmd_id]`) stands for a light-slow-ack.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OptAck {
    pub cmd_id: CommandId,
    pub dep: Dep,
    pub checksum: Vec<SHash>,
}

/// Batched compacted acknowledgements from one replica at one ballot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OptAcks {
    pub replica: ReplicaId,
    pub ballot: Ballot,
    pub acks: Vec<OptAck>,
}

/// Leader's reply to the waiting client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Reply {
    pub replica: ReplicaId,
    pub ballot: Ballot,
    pub cmd_id: CommandId,
    pub rep: Value,
    pub ok: AckOk,
}

/// Follower's client-facing record of a proposal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordAck {
    pub replica: ReplicaId,
    pub ballot: Ballot,
    pub cmd_id: CommandId,
    pub ok: AckOk,
}

/// Client-issued sync request for an outstanding command.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ClientSync {
    pub client_id: ClientId,
    pub cmd_id: CommandId,
}

/// Leader's answer to a client sync once the command has executed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncReply {
    pub replica: ReplicaId,
    pub ballot: Ballot,
    pub cmd_id: CommandId,
    pub rep: Value,
}

/// Ballot-takeover announcement.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct NewLeader {
    pub replica: ReplicaId,
    pub ballot: Ballot,
}

/// A replica's command log snapshot sent to the would-be leader.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewLeaderAckN {
    pub replica: ReplicaId,
    pub ballot: Ballot,
    pub cballot: Ballot,
    pub cmd_ids: Vec<CommandId>,
    pub phases: Vec<Phase>,
    pub cmds: Vec<Command>,
    pub deps: Vec<Dep>,
}

/// Recovered command log installed on every replica at the new ballot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncMsg {
    pub replica: ReplicaId,
    pub ballot: Ballot,
    pub phases: HashMap<CommandId, Phase>,
    pub cmds: HashMap<CommandId, Command>,
    pub deps: HashMap<CommandId, Dep>,
}

/// Post-recovery notice to a client whose propose was lost.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Accept {
    pub replica: ReplicaId,
    pub ballot: Ballot,
    pub cmd_id: CommandId,
}

/// Messages delivered to a replica's ingress channels.
#[derive(Clone, Debug)]
pub enum PeerMsg {
    Propose(Propose),
    FastAck(FastAck),
    LightSlowAck(LightSlowAck),
    Acks(Acks),
    OptAcks(OptAcks),
    NewLeader(NewLeader),
    NewLeaderAckN(NewLeaderAckN),
    Sync(SyncMsg),
    ClientSync(ClientSync),
}

/// Messages delivered to a client's inbox.
#[derive(Clone, Debug)]
pub enum ClientMsg {
    Reply(Reply),
    RecordAck(RecordAck),
    SyncReply(SyncReply),
    Accept(Accept),
}

/// Transport seam consumed by the core.
///
/// Sends are non-blocking enqueues onto sender queues; the dispatch loop
/// never waits on the network. `send_to_all` targets every peer except the
/// sender itself.
pub trait Network: Send + Sync + 'static {
    fn send_to(&self, target: ReplicaId, msg: PeerMsg);
    fn send_to_all(&self, msg: PeerMsg);
    fn send_to_client(&self, client: ClientId, msg: ClientMsg);
}

/// Application state store driven by delivery.
///
/// `execute` must be deterministic; the core treats results as opaque.
pub trait StateMachine: Send + Sync + 'static {
    fn execute(&self, cmd: &Command) -> Value;
}

/// Replica configuration and operational toggles.
#[derive(Clone, Debug)]
pub struct Config {
    pub replica_id: ReplicaId,
    pub n: usize,

    /// Execute delivered commands against the state machine.
    pub exec: bool,
    /// Reply to clients after execution.
    pub dreply: bool,
    /// Leader-side speculative execution before quorum certification.
    pub opt_exec: bool,
    /// Serve collocated reads locally without broadcasting.
    pub fast_read: bool,

    /// Per-descriptor worker budget; descriptors beyond it serialize on the
    /// dispatcher.
    pub max_desc_routines: usize,
    /// Capacity of the post-delivery history ring.
    pub history_size: usize,

    /// Pre-declared ballot quorums. Empty means anonymous three-quarters
    /// fast quorums.
    pub quorums: Vec<QuorumEntry>,
}

impl Config {
    pub fn new(replica_id: ReplicaId, n: usize) -> Self {
        Self {
            replica_id,
            n,
            exec: true,
            dreply: true,
            opt_exec: true,
            fast_read: false,
            max_desc_routines: 100,
            history_size: 10_000,
            quorums: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ballot_leader_partition() {
        assert_eq!(leader_of(0, 3), 0);
        assert_eq!(leader_of(4, 3), 1);
        assert_eq!(next_ballot_of(1, 0, 3), 1);
        assert_eq!(next_ballot_of(1, 1, 3), 4);
        assert_eq!(next_ballot_of(0, 2, 3), 3);
        // The returned ballot is always owned by the requested replica.
        for r in 0..3u32 {
            for b in 0..10i64 {
                let next = next_ballot_of(r, b, 3);
                assert!(next > b);
                assert_eq!(leader_of(next, 3), r);
            }
        }
    }

    #[test]
    fn dep_equality_ignores_order() {
        let a = CommandId {
            client_id: 1,
            seq_num: 1,
        };
        let b = CommandId {
            client_id: 2,
            seq_num: 7,
        };
        assert!(Dep(vec![a, b]).equals(&Dep(vec![b, a])));
        assert!(!Dep(vec![a]).equals(&Dep(vec![b])));
        assert!(!Dep(vec![a]).equals(&Dep(vec![a, b])));
        assert!(Dep::nil_of(a).is_nil_of(a));
        assert!(!Dep(vec![a, b]).is_nil_of(a));
    }

    #[test]
    fn conflicts_require_shared_key_and_a_write() {
        let w = Command::put(9, b"v".to_vec());
        let r = Command::get(9);
        let other = Command::get(10);
        assert!(w.conflicts_with(&r));
        assert!(r.conflicts_with(&w));
        assert!(!r.conflicts_with(&r.clone()));
        assert!(!w.conflicts_with(&Command::put(10, Vec::new())));
        assert!(!other.conflicts_with(&w));
        assert!(!Command::noop().conflicts_with(&w));
        assert_eq!(Command::noop().keys().count(), 0);
    }
}
