//! Per-command descriptor state and the post-delivery history ring.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use super::conflicts::SHash;
use super::msgset::MsgSet;
use super::quorum::Quorum;
use super::types::{
    Command, CommandId, Dep, FastAck, LightSlowAck, Phase, Propose,
};

/// Messages handled by a descriptor, in arrival order.
#[derive(Debug)]
pub enum DescMsg {
    /// Client proposal with the dispatcher-computed dep and key checksums.
    Propose(Propose, Dep, Vec<SHash>),
    FastAck(FastAck),
    LightSlowAck(LightSlowAck),
    /// Re-entry from the delivery channel (a dependency delivered).
    Deliver,
    /// History slot assigned by the reply channel; finalizes the descriptor.
    HistorySlot(u64),
    /// Recovery barrier: acknowledge and stop the worker.
    Stop(oneshot::Sender<()>),
}

/// Mutable per-command protocol state.
///
/// Owned behind a mutex; exactly one worker (or the dispatcher, for
/// sequential descriptors) processes its messages at a time.
pub struct CommandDesc {
    pub phase: Phase,
    pub cmd: Option<Command>,
    pub dep: Dep,
    pub hs: Vec<SHash>,
    pub propose: Option<Propose>,
    pub propose_dep: Option<Dep>,

    pub slow_path_h: MsgSet<FastAck>,
    pub fast_path_h: MsgSet<FastAck>,

    /// Leader fast-ack that arrived before the propose; replayed once the
    /// propose lands (the deferred-call slot).
    pub pending_leader_ack: Option<FastAck>,

    pub slow_path: bool,
    pub active: bool,
    /// Handled inline on the dispatcher instead of a dedicated worker.
    pub seq: bool,
}

/// Accept predicate shared by the fast and slow aggregators: a nil-dep ack
/// (compacted light-slow-ack) always counts; otherwise the dep must equal
/// the leader's.
fn accept_fast_and_slow(msg: &FastAck, leader: &FastAck) -> bool {
    match (&msg.dep, &leader.dep) {
        (None, _) => true,
        (Some(dep), Some(leader_dep)) => leader_dep.equals(dep),
        (Some(_), None) => false,
    }
}

impl CommandDesc {
    /// Fresh descriptor with all mutable fields initialised. `sq` accepts a
    /// strict majority, `fq` only leader-equal deps at fast-quorum size.
    pub fn new(sq: Quorum, fq: Quorum, seq: bool) -> Self {
        Self {
            phase: Phase::Start,
            cmd: None,
            dep: Dep::default(),
            hs: Vec::new(),
            propose: None,
            propose_dep: None,
            slow_path_h: MsgSet::new(sq, Box::new(accept_fast_and_slow)),
            fast_path_h: MsgSet::new(fq, Box::new(accept_fast_and_slow)),
            pending_leader_ack: None,
            slow_path: false,
            active: true,
            seq,
        }
    }
}

/// Dispatcher-side handle to a descriptor.
#[derive(Clone)]
pub struct DescHandle {
    pub desc: Arc<Mutex<CommandDesc>>,
    /// Commands to re-deliver once this one executes. Guarded separately so
    /// linking never nests descriptor locks.
    pub successors: Arc<Mutex<Vec<CommandId>>>,
    /// Message queue drained by the worker; `None` for sequential
    /// descriptors, which the dispatcher handles inline.
    pub tx: Option<mpsc::UnboundedSender<DescMsg>>,
}

/// Post-delivery summary retained in the history ring.
#[derive(Clone, Debug)]
pub struct CommandStaticDesc {
    pub cmd_id: CommandId,
    pub phase: Phase,
    pub cmd: Option<Command>,
    pub dep: Dep,
    pub slow_path: bool,
}

/// Fixed-capacity ring of committed command summaries. Slot numbers are
/// allocated by the reply channel in reply order; overflow wraps.
pub struct HistoryRing {
    slots: Vec<Option<CommandStaticDesc>>,
}

impl HistoryRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity.max(1)).map(|_| None).collect(),
        }
    }

    pub fn write(&mut self, slot: u64, entry: CommandStaticDesc) {
        let idx = (slot % self.slots.len() as u64) as usize;
        self.slots[idx] = Some(entry);
    }

    pub fn get(&self, slot: u64) -> Option<&CommandStaticDesc> {
        let idx = (slot % self.slots.len() as u64) as usize;
        self.slots[idx].as_ref()
    }

    /// (total retained, slow-path) counts over occupied slots.
    pub fn stats(&self) -> (usize, usize) {
        let total = self.slots.iter().filter(|s| s.is_some()).count();
        let slow = self
            .slots
            .iter()
            .filter(|s| s.as_ref().is_some_and(|e| e.slow_path))
            .count();
        (total, slow)
    }
}

/// Light wrapper pairing a light-slow-ack with its fast-ack reshaping, used
/// when recording a slow ack into the aggregators.
pub fn light_slow_as_fast(msg: LightSlowAck) -> FastAck {
    FastAck {
        replica: msg.replica,
        ballot: msg.ballot,
        cmd_id: msg.cmd_id,
        dep: None,
        checksum: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(seq: u32) -> CommandId {
        CommandId {
            client_id: 1,
            seq_num: seq,
        }
    }

    fn ack(replica: u32, dep: Option<Dep>) -> FastAck {
        FastAck {
            replica,
            ballot: 0,
            cmd_id: id(1),
            dep,
            checksum: Vec::new(),
        }
    }

    #[test]
    fn fast_aggregator_requires_leader_equal_deps() {
        let mut desc = CommandDesc::new(Quorum::Size(2), Quorum::Size(3), false);
        let leader_dep = Dep(vec![id(7)]);

        let leader = ack(0, Some(leader_dep.clone()));
        assert!(!desc.fast_path_h.add(0, true, leader).is_completed());
        // Disagreeing dep is retained but never counted.
        assert!(!desc
            .fast_path_h
            .add(1, false, ack(1, Some(Dep::default())))
            .is_completed());
        assert!(!desc
            .fast_path_h
            .add(2, false, ack(2, Some(leader_dep.clone())))
            .is_completed());
        assert!(desc
            .fast_path_h
            .add(3, false, ack(3, Some(leader_dep)))
            .is_completed());
    }

    #[test]
    fn slow_aggregator_counts_nil_dep_acks() {
        let mut desc = CommandDesc::new(Quorum::Size(2), Quorum::Size(3), false);
        let leader = ack(0, Some(Dep(vec![id(7)])));
        assert!(!desc.slow_path_h.add(0, true, leader).is_completed());
        let reshaped = light_slow_as_fast(LightSlowAck {
            replica: 2,
            ballot: 0,
            cmd_id: id(1),
        });
        assert!(desc.slow_path_h.add(2, false, reshaped).is_completed());
    }

    #[test]
    fn history_ring_wraps() {
        let mut ring = HistoryRing::new(2);
        let entry = |seq: u32| CommandStaticDesc {
            cmd_id: id(seq),
            phase: Phase::Commit,
            cmd: None,
            dep: Dep::default(),
            slow_path: seq % 2 == 1,
        };
        ring.write(0, entry(1));
        ring.write(1, entry(2));
        assert_eq!(ring.stats(), (2, 1));
        // Slot 2 wraps onto slot 0.
        ring.write(2, entry(3));
        assert_eq!(ring.get(2).unwrap().cmd_id, id(3));
        assert_eq!(ring.get(0).unwrap().cmd_id, id(3));
    }
}
