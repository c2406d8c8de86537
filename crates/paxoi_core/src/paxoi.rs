//! Paxoi replica module wiring.
//!
//! `replica` contains the dispatch loop and delivery machinery, `recovery`
//! the ballot-takeover protocol, `descriptor` the per-command state and
//! workers, and `types` the shared message/trait contracts. `quorum`,
//! `msgset` and `conflicts` are the leaf building blocks.

mod conflicts;
mod descriptor;
mod msgset;
mod quorum;
mod recovery;
mod replica;
mod types;

pub mod testing;

pub use conflicts::{Checksum, KeyInfo, SHash};
pub use descriptor::{CommandStaticDesc, DescMsg, HistoryRing};
pub use msgset::{Added, MsgSet};
pub use quorum::{majority_of, three_quarters_of, Quorum, QuorumEntry, QuorumSystem};
pub use replica::{Replica, ReplicaInbox};
pub use types::{
    leader_of, next_ballot_of, Accept, AckOk, Acks, Ballot, ClientId, ClientMsg, ClientSync,
    Command, CommandId, Config, Dep, FastAck, Key, LightSlowAck, Network, NewLeader,
    NewLeaderAckN, Op, OptAck, OptAcks, PeerMsg, Phase, Propose, RecordAck, ReplicaId, Reply,
    SeqNum, StateMachine, Status, SyncMsg, SyncReply, Value,
};
