//! Replica dispatch loop, propose/ack handling, and delivery.
//!
//! One dispatch task consumes every protocol channel. Per-command work is
//! routed to descriptor workers (up to the configured budget); descriptors
//! beyond it serialize on the dispatcher. Delivery re-entry, checksum
//! corrections and history-slot assignment all flow back through channels,
//! so no handler ever blocks.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use super::conflicts::{shashes_eq, Checksum, KeyInfo, SHash};
use super::descriptor::{
    light_slow_as_fast, CommandDesc, CommandStaticDesc, DescHandle, DescMsg, HistoryRing,
};
use super::msgset::{Added, MsgSet};
use super::quorum::{majority_of, Quorum, QuorumSystem};
use super::types::{
    leader_of, AckOk, Acks, Ballot, ClientId, ClientMsg, ClientSync, Command, CommandId, Config,
    Dep, FastAck, Key, LightSlowAck, Network, NewLeader, NewLeaderAckN, OptAck, OptAcks, PeerMsg,
    Phase, Propose, RecordAck, Reply, StateMachine, Status, SyncMsg, SyncReply, Value,
};

/// Out-of-band checksum correction queued for the dispatcher.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ChecksumUpdate {
    pub key: Key,
    pub cmd_id: CommandId,
    pub new_hash: SHash,
}

/// Cloneable senders for a replica's ingress channels. The in-memory (or any
/// other) transport pushes received messages through this.
#[derive(Clone)]
pub struct ReplicaInbox {
    pub(crate) propose_tx: mpsc::UnboundedSender<Propose>,
    pub(crate) fast_ack_tx: mpsc::UnboundedSender<FastAck>,
    pub(crate) light_slow_ack_tx: mpsc::UnboundedSender<LightSlowAck>,
    pub(crate) acks_tx: mpsc::UnboundedSender<Acks>,
    pub(crate) opt_acks_tx: mpsc::UnboundedSender<OptAcks>,
    pub(crate) new_leader_tx: mpsc::UnboundedSender<NewLeader>,
    pub(crate) new_leader_ack_tx: mpsc::UnboundedSender<NewLeaderAckN>,
    pub(crate) sync_tx: mpsc::UnboundedSender<SyncMsg>,
    pub(crate) client_sync_tx: mpsc::UnboundedSender<ClientSync>,
    pub(crate) recover_tx: mpsc::UnboundedSender<Ballot>,
    pub(crate) deliver_tx: mpsc::UnboundedSender<CommandId>,
    pub(crate) checksum_tx: mpsc::UnboundedSender<ChecksumUpdate>,
    pub(crate) history_slot_tx: mpsc::UnboundedSender<(CommandId, u64)>,
}

impl ReplicaInbox {
    /// Route a received protocol message onto the right channel.
    pub fn deliver(&self, msg: PeerMsg) {
        let _ = match msg {
            PeerMsg::Propose(m) => self.propose_tx.send(m).map_err(drop),
            PeerMsg::FastAck(m) => self.fast_ack_tx.send(m).map_err(drop),
            PeerMsg::LightSlowAck(m) => self.light_slow_ack_tx.send(m).map_err(drop),
            PeerMsg::Acks(m) => self.acks_tx.send(m).map_err(drop),
            PeerMsg::OptAcks(m) => self.opt_acks_tx.send(m).map_err(drop),
            PeerMsg::NewLeader(m) => self.new_leader_tx.send(m).map_err(drop),
            PeerMsg::NewLeaderAckN(m) => self.new_leader_ack_tx.send(m).map_err(drop),
            PeerMsg::Sync(m) => self.sync_tx.send(m).map_err(drop),
            PeerMsg::ClientSync(m) => self.client_sync_tx.send(m).map_err(drop),
        };
    }

    /// Push a ballot-advancement target; negative means "next own ballot".
    pub fn trigger_recovery(&self, ballot: Ballot) {
        let _ = self.recover_tx.send(ballot);
    }
}

pub(crate) struct Receivers {
    pub propose: mpsc::UnboundedReceiver<Propose>,
    pub fast_ack: mpsc::UnboundedReceiver<FastAck>,
    pub light_slow_ack: mpsc::UnboundedReceiver<LightSlowAck>,
    pub acks: mpsc::UnboundedReceiver<Acks>,
    pub opt_acks: mpsc::UnboundedReceiver<OptAcks>,
    pub new_leader: mpsc::UnboundedReceiver<NewLeader>,
    pub new_leader_ack: mpsc::UnboundedReceiver<NewLeaderAckN>,
    pub sync: mpsc::UnboundedReceiver<SyncMsg>,
    pub client_sync: mpsc::UnboundedReceiver<ClientSync>,
    pub recover: mpsc::UnboundedReceiver<Ballot>,
    pub deliver: mpsc::UnboundedReceiver<CommandId>,
    pub checksum: mpsc::UnboundedReceiver<ChecksumUpdate>,
    pub history_slot: mpsc::UnboundedReceiver<(CommandId, u64)>,
}

/// Local read awaiting its dependencies; never broadcast.
pub(crate) struct ReadDesc {
    pub dep: Dep,
    pub propose: Propose,
}

/// State owned exclusively by the dispatch task. No synchronisation needed.
pub(crate) struct DispatchState {
    pub keys: HashMap<Key, KeyInfo>,
    pub sums: HashMap<Key, Checksum>,
    pub reads: HashMap<CommandId, ReadDesc>,
    pub proposes: HashMap<CommandId, Propose>,
    pub new_leader_acks: MsgSet<NewLeaderAckN>,
    pub rec_start: Option<Instant>,
}

impl DispatchState {
    fn new(n: usize) -> Self {
        Self {
            keys: HashMap::new(),
            sums: HashMap::new(),
            reads: HashMap::new(),
            proposes: HashMap::new(),
            new_leader_acks: MsgSet::new(Quorum::majority(n), Box::new(|_, _| true)),
            rec_start: None,
        }
    }
}

/// The Paxoi replica core.
pub struct Replica {
    pub(crate) config: Config,
    pub(crate) qs: QuorumSystem,
    pub(crate) sq: Quorum,
    pub(crate) fq: RwLock<Quorum>,
    pub(crate) fixed_majority: bool,

    pub(crate) network: Arc<dyn Network>,
    sm: Arc<dyn StateMachine>,

    ballot: AtomicI64,
    cballot: AtomicI64,
    recovering: AtomicBool,

    pub(crate) descs: Mutex<HashMap<CommandId, DescHandle>>,
    delivered: RwLock<HashSet<CommandId>>,
    history: Mutex<HistoryRing>,
    alive: RwLock<Vec<bool>>,
    pub(crate) routine_count: AtomicUsize,

    pub(crate) inbox: ReplicaInbox,
    pub(crate) repchan: ReplyChan,
    pub(crate) batcher: Batcher,
    receivers: Mutex<Option<Receivers>>,
}

impl Replica {
    pub fn new(
        config: Config,
        network: Arc<dyn Network>,
        sm: Arc<dyn StateMachine>,
    ) -> anyhow::Result<Arc<Self>> {
        let qs = QuorumSystem::new(config.n, config.quorums.clone())?;
        let fixed_majority = qs.is_fixed();
        let ballot = qs.ballot_at(0).unwrap_or(0);
        let sq = Quorum::majority(config.n);
        let fq = if fixed_majority {
            qs.aq(ballot)
        } else {
            Quorum::three_quarters(config.n)
        };

        let (propose_tx, propose_rx) = mpsc::unbounded_channel();
        let (fast_ack_tx, fast_ack_rx) = mpsc::unbounded_channel();
        let (light_slow_ack_tx, light_slow_ack_rx) = mpsc::unbounded_channel();
        let (acks_tx, acks_rx) = mpsc::unbounded_channel();
        let (opt_acks_tx, opt_acks_rx) = mpsc::unbounded_channel();
        let (new_leader_tx, new_leader_rx) = mpsc::unbounded_channel();
        let (new_leader_ack_tx, new_leader_ack_rx) = mpsc::unbounded_channel();
        let (sync_tx, sync_rx) = mpsc::unbounded_channel();
        let (client_sync_tx, client_sync_rx) = mpsc::unbounded_channel();
        let (recover_tx, recover_rx) = mpsc::unbounded_channel();
        let (deliver_tx, deliver_rx) = mpsc::unbounded_channel();
        let (checksum_tx, checksum_rx) = mpsc::unbounded_channel();
        let (history_slot_tx, history_slot_rx) = mpsc::unbounded_channel();

        let inbox = ReplicaInbox {
            propose_tx,
            fast_ack_tx,
            light_slow_ack_tx,
            acks_tx,
            opt_acks_tx,
            new_leader_tx,
            new_leader_ack_tx,
            sync_tx,
            client_sync_tx,
            recover_tx,
            deliver_tx,
            checksum_tx,
            history_slot_tx: history_slot_tx.clone(),
        };

        let receivers = Receivers {
            propose: propose_rx,
            fast_ack: fast_ack_rx,
            light_slow_ack: light_slow_ack_rx,
            acks: acks_rx,
            opt_acks: opt_acks_rx,
            new_leader: new_leader_rx,
            new_leader_ack: new_leader_ack_rx,
            sync: sync_rx,
            client_sync: client_sync_rx,
            recover: recover_rx,
            deliver: deliver_rx,
            checksum: checksum_rx,
            history_slot: history_slot_rx,
        };

        let repchan = ReplyChan::new(config.replica_id, network.clone(), history_slot_tx);
        let batcher = Batcher::new(config.replica_id, config.opt_exec, network.clone());
        let history = HistoryRing::new(config.history_size);

        tracing::info!(
            replica = config.replica_id,
            ballot,
            leader = leader_of(ballot, config.n),
            fixed_majority,
            "replica starting"
        );

        Ok(Arc::new(Self {
            alive: RwLock::new(vec![true; config.n]),
            config,
            qs,
            sq,
            fq: RwLock::new(fq),
            fixed_majority,
            network,
            sm,
            ballot: AtomicI64::new(ballot),
            cballot: AtomicI64::new(ballot),
            recovering: AtomicBool::new(false),
            descs: Mutex::new(HashMap::new()),
            delivered: RwLock::new(HashSet::new()),
            history: Mutex::new(history),
            routine_count: AtomicUsize::new(0),
            inbox,
            repchan,
            batcher,
            receivers: Mutex::new(Some(receivers)),
        }))
    }

    /// Spawn the dispatch loop and helper workers. Idempotent per replica.
    pub fn start(self: &Arc<Self>) {
        let Some(receivers) = self.receivers.lock().expect("receivers lock").take() else {
            return;
        };
        self.repchan.restart();
        self.batcher.start();
        let replica = self.clone();
        tokio::spawn(async move {
            replica.run(receivers).await;
        });
    }

    pub fn inbox(&self) -> ReplicaInbox {
        self.inbox.clone()
    }

    pub fn id(&self) -> super::types::ReplicaId {
        self.config.replica_id
    }

    pub fn current_ballot(&self) -> Ballot {
        self.ballot.load(Ordering::SeqCst)
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::SeqCst)
    }

    /// i-th pre-declared ballot (recovery pre-planning).
    pub fn ballot_at(&self, index: usize) -> Option<Ballot> {
        self.qs.ballot_at(index)
    }

    /// Feed the liveness oracle consulted when advancing past dead quorums.
    pub fn set_alive(&self, replica: super::types::ReplicaId, alive: bool) {
        if let Ok(mut v) = self.alive.write() {
            if let Some(slot) = v.get_mut(replica as usize) {
                *slot = alive;
            }
        }
    }

    pub(crate) fn replica_alive(&self, replica: super::types::ReplicaId) -> bool {
        self.alive
            .read()
            .map(|v| v.get(replica as usize).copied().unwrap_or(false))
            .unwrap_or(false)
    }

    /// (total, slow-path) counts over the retained history.
    pub fn history_stats(&self) -> (usize, usize) {
        self.history.lock().expect("history lock").stats()
    }

    pub fn is_delivered(&self, cmd_id: CommandId) -> bool {
        self.delivered
            .read()
            .expect("delivered lock")
            .contains(&cmd_id)
    }

    pub(crate) fn status(&self) -> Status {
        if self.recovering.load(Ordering::SeqCst) {
            Status::Recovering
        } else {
            Status::Normal
        }
    }

    pub(crate) fn set_status(&self, status: Status) {
        self.recovering
            .store(matches!(status, Status::Recovering), Ordering::SeqCst);
    }

    pub(crate) fn set_ballot(&self, ballot: Ballot) {
        self.ballot.store(ballot, Ordering::SeqCst);
    }

    pub(crate) fn cballot(&self) -> Ballot {
        self.cballot.load(Ordering::SeqCst)
    }

    pub(crate) fn set_cballot(&self, ballot: Ballot) {
        self.cballot.store(ballot, Ordering::SeqCst);
    }

    pub(crate) fn leader(&self) -> super::types::ReplicaId {
        leader_of(self.current_ballot(), self.config.n)
    }

    pub(crate) fn is_leader(&self) -> bool {
        self.leader() == self.config.replica_id
    }

    pub(crate) fn fq(&self) -> Quorum {
        self.fq.read().expect("fq lock").clone()
    }

    async fn run(self: Arc<Self>, mut rx: Receivers) {
        let mut st = DispatchState::new(self.config.n);
        loop {
            if self.status() == Status::Recovering {
                // Normal channels stay untouched until a sync lands.
                tokio::select! {
                    Some(m) = rx.new_leader.recv() => self.adopt_new_leader(m, &mut st).await,
                    Some(m) = rx.new_leader_ack.recv() => self.on_new_leader_ack_n(m, &mut st).await,
                    Some(m) = rx.sync.recv() => self.on_sync(m, &mut st).await,
                }
                continue;
            }

            tokio::select! {
                Some(ballot) = rx.recover.recv() => self.start_recovery(ballot, &mut st).await,
                Some(cmd_id) = rx.deliver.recv() => {
                    if st.reads.contains_key(&cmd_id) {
                        self.deliver_read(cmd_id, &mut st);
                    } else {
                        self.route(cmd_id, DescMsg::Deliver);
                    }
                }
                Some(upd) = rx.checksum.recv() => {
                    if let Some(sum) = st.sums.get_mut(&upd.key) {
                        sum.correct(upd.cmd_id, upd.new_hash);
                    }
                }
                Some(propose) = rx.propose.recv() => self.on_propose(propose, &mut st),
                Some(m) = rx.fast_ack.recv() => self.route(m.cmd_id, DescMsg::FastAck(m)),
                Some(m) = rx.light_slow_ack.recv() => self.route(m.cmd_id, DescMsg::LightSlowAck(m)),
                Some(m) = rx.acks.recv() => {
                    for f in m.fast_acks {
                        self.route(f.cmd_id, DescMsg::FastAck(f));
                    }
                    for s in m.light_slow_acks {
                        self.route(s.cmd_id, DescMsg::LightSlowAck(s));
                    }
                }
                Some(m) = rx.opt_acks.recv() => {
                    for ack in m.acks {
                        let dep = if ack.dep.is_nil_of(ack.cmd_id) {
                            None
                        } else {
                            Some(ack.dep)
                        };
                        let fast_ack = FastAck {
                            replica: m.replica,
                            ballot: m.ballot,
                            cmd_id: ack.cmd_id,
                            dep,
                            checksum: ack.checksum,
                        };
                        self.route(fast_ack.cmd_id, DescMsg::FastAck(fast_ack));
                    }
                }
                Some(m) = rx.new_leader.recv() => self.adopt_new_leader(m, &mut st).await,
                Some(m) = rx.new_leader_ack.recv() => self.on_new_leader_ack_n(m, &mut st).await,
                Some(m) = rx.sync.recv() => self.on_sync(m, &mut st).await,
                Some(m) = rx.client_sync.recv() => {
                    self.repchan.send(RepReq::Sync {
                        client: m.client_id,
                        cmd_id: m.cmd_id,
                        ballot: self.current_ballot(),
                    });
                }
                Some((cmd_id, slot)) = rx.history_slot.recv() => {
                    self.route_slot(cmd_id, slot);
                }
            }
        }
    }

    fn on_propose(self: &Arc<Self>, propose: Propose, st: &mut DispatchState) {
        let cmd_id = propose.cmd_id;
        st.proposes.insert(cmd_id, propose.clone());

        if self.config.fast_read && propose.command.is_read() {
            self.handle_read(propose, st);
            return;
        }

        let (dep, hs) = dep_and_hashes(st, &propose.command, cmd_id);
        if self.is_delivered(cmd_id) {
            // Fatal: a panic here would only take down this dispatch task,
            // leaving the rest of the process running without the replica.
            tracing::error!(?cmd_id, "propose for a delivered command");
            std::process::exit(1);
        }
        let seq_hint = self.is_leader();
        self.route_with(cmd_id, DescMsg::Propose(propose, dep, hs), seq_hint);
    }

    fn handle_read(self: &Arc<Self>, propose: Propose, st: &mut DispatchState) {
        let cmd_id = propose.cmd_id;
        if !propose.collocated {
            let record = RecordAck {
                replica: self.config.replica_id,
                ballot: self.current_ballot(),
                cmd_id,
                ok: AckOk::False,
            };
            self.network
                .send_to_client(cmd_id.client_id, ClientMsg::RecordAck(record));
            return;
        }

        let dep = dep_of(st, &propose.command);
        for dep_id in dep.iter() {
            if let Some(handle) = self.upsert_live(dep_id, false) {
                handle
                    .successors
                    .lock()
                    .expect("successors lock")
                    .push(cmd_id);
            }
        }
        st.reads.insert(cmd_id, ReadDesc { dep, propose });
        self.deliver_read(cmd_id, st);
    }

    fn deliver_read(&self, cmd_id: CommandId, st: &mut DispatchState) {
        let Some(read) = st.reads.get(&cmd_id) else {
            return;
        };
        if self.is_delivered(cmd_id) || !self.config.exec {
            st.reads.remove(&cmd_id);
            return;
        }
        if read.dep.iter().any(|d| !self.is_delivered(d)) {
            return;
        }

        self.delivered
            .write()
            .expect("delivered lock")
            .insert(cmd_id);
        let value = self.sm.execute(&read.propose.command);
        if self.config.dreply {
            self.repchan.send(RepReq::ReadReply {
                cmd_id,
                rep: value,
                ballot: self.current_ballot(),
            });
        }
        st.reads.remove(&cmd_id);
    }

    /// Locate or allocate the descriptor and hand it the message, inline for
    /// sequential descriptors, through the worker queue otherwise.
    pub(crate) fn route(self: &Arc<Self>, cmd_id: CommandId, msg: DescMsg) {
        self.route_with(cmd_id, msg, false);
    }

    fn route_slot(self: &Arc<Self>, cmd_id: CommandId, slot: u64) {
        // History slots target already-delivered commands; skip the
        // delivered drop but never allocate for them.
        let handle = {
            let descs = self.descs.lock().expect("descs lock");
            descs.get(&cmd_id).cloned()
        };
        let Some(handle) = handle else {
            return;
        };
        match &handle.tx {
            Some(tx) => {
                let _ = tx.send(DescMsg::HistorySlot(slot));
            }
            None => {
                self.handle_desc_msg(DescMsg::HistorySlot(slot), &handle, cmd_id);
            }
        }
    }

    pub(crate) fn route_with(self: &Arc<Self>, cmd_id: CommandId, msg: DescMsg, seq_hint: bool) {
        let Some(handle) = self.upsert_live(cmd_id, seq_hint) else {
            tracing::debug!(?cmd_id, "dropping message for delivered command");
            return;
        };

        match &handle.tx {
            Some(tx) => {
                let _ = tx.send(msg);
            }
            None => {
                self.handle_desc_msg(msg, &handle, cmd_id);
            }
        }
    }

    /// Atomic create-or-get; `None` once the command has been delivered.
    pub(crate) fn upsert_live(
        self: &Arc<Self>,
        cmd_id: CommandId,
        seq_hint: bool,
    ) -> Option<DescHandle> {
        if self.is_delivered(cmd_id) {
            return None;
        }
        let mut spawn: Option<(DescHandle, mpsc::UnboundedReceiver<DescMsg>)> = None;
        let handle = {
            let mut descs = self.descs.lock().expect("descs lock");
            if let Some(handle) = descs.get(&cmd_id) {
                handle.clone()
            } else {
                let seq = seq_hint
                    || self.routine_count.load(Ordering::SeqCst) >= self.config.max_desc_routines;
                let desc = CommandDesc::new(self.sq.clone(), self.fq(), seq);
                let (tx, rx) = if seq {
                    (None, None)
                } else {
                    let (tx, rx) = mpsc::unbounded_channel();
                    (Some(tx), Some(rx))
                };
                let handle = DescHandle {
                    desc: Arc::new(Mutex::new(desc)),
                    successors: Arc::new(Mutex::new(Vec::new())),
                    tx,
                };
                descs.insert(cmd_id, handle.clone());
                if let Some(rx) = rx {
                    self.routine_count.fetch_add(1, Ordering::SeqCst);
                    spawn = Some((handle.clone(), rx));
                }
                handle
            }
        };
        if let Some((handle, rx)) = spawn {
            let replica = self.clone();
            tokio::spawn(async move {
                replica.desc_worker(cmd_id, handle, rx).await;
            });
        }
        Some(handle)
    }

    async fn desc_worker(
        self: Arc<Self>,
        cmd_id: CommandId,
        handle: DescHandle,
        mut rx: mpsc::UnboundedReceiver<DescMsg>,
    ) {
        while let Some(msg) = rx.recv().await {
            match msg {
                DescMsg::Stop(ack) => {
                    handle.desc.lock().expect("desc lock").active = false;
                    let _ = ack.send(());
                    return;
                }
                msg => {
                    if self.handle_desc_msg(msg, &handle, cmd_id) {
                        break;
                    }
                }
            }
        }
        // Acknowledge any stop raced with finalization.
        while let Ok(msg) = rx.try_recv() {
            if let DescMsg::Stop(ack) = msg {
                let _ = ack.send(());
            }
        }
    }

    /// Handle one descriptor message. Returns true when the descriptor has
    /// been finalized and its worker should exit.
    pub(crate) fn handle_desc_msg(
        self: &Arc<Self>,
        msg: DescMsg,
        handle: &DescHandle,
        cmd_id: CommandId,
    ) -> bool {
        let mut desc = handle.desc.lock().expect("desc lock");
        match msg {
            DescMsg::Propose(propose, dep, hs) => {
                self.handle_propose_locked(propose, dep, hs, &mut desc, handle, cmd_id);
                false
            }
            DescMsg::FastAck(m) => {
                if m.cmd_id == cmd_id {
                    self.handle_fast_ack_locked(m, &mut desc, handle, cmd_id);
                }
                false
            }
            DescMsg::LightSlowAck(m) => {
                if m.cmd_id == cmd_id {
                    self.handle_light_slow_ack_locked(m, &mut desc, handle, cmd_id);
                }
                false
            }
            DescMsg::Deliver => {
                self.deliver_locked(&mut desc, handle, cmd_id);
                false
            }
            DescMsg::HistorySlot(slot) => {
                self.finalize_locked(slot, &mut desc, cmd_id);
                true
            }
            DescMsg::Stop(ack) => {
                desc.active = false;
                let _ = ack.send(());
                true
            }
        }
    }

    fn handle_propose_locked(
        self: &Arc<Self>,
        propose: Propose,
        dep: Dep,
        hs: Vec<SHash>,
        desc: &mut CommandDesc,
        handle: &DescHandle,
        cmd_id: CommandId,
    ) {
        if desc.propose_dep.is_none() {
            desc.propose_dep = Some(dep);
            desc.hs = hs;
        }
        if self.status() != Status::Normal || desc.propose.is_some() {
            return;
        }

        desc.cmd = Some(propose.command.clone());
        desc.propose = Some(propose);

        if !self.fq().contains(self.config.replica_id) {
            desc.phase = Phase::PayloadOnly;
            self.recall_locked(desc, handle, cmd_id);
            return;
        }

        desc.dep = desc.propose_dep.clone().unwrap_or_default();
        desc.phase = Phase::PreAccept;

        let had_pending = desc.pending_leader_ack.is_some();
        self.recall_locked(desc, handle, cmd_id);
        if (had_pending && desc.slow_path) || self.is_delivered(cmd_id) {
            // A slow-ack already went out for this command; no fast-ack.
            return;
        }

        let fast_ack = FastAck {
            replica: self.config.replica_id,
            ballot: self.current_ballot(),
            cmd_id,
            dep: Some(desc.dep.clone()),
            checksum: desc.hs.clone(),
        };
        self.batcher.fast_ack(fast_ack.clone());
        if self.config.opt_exec && self.is_leader() {
            self.deliver_locked(desc, handle, cmd_id);
        }
        self.handle_fast_ack_locked(fast_ack, desc, handle, cmd_id);
    }

    /// Replay a leader fast-ack that arrived before the propose.
    fn recall_locked(
        self: &Arc<Self>,
        desc: &mut CommandDesc,
        handle: &DescHandle,
        cmd_id: CommandId,
    ) {
        if let Some(pending) = desc.pending_leader_ack.take() {
            self.fast_ack_from_leader_locked(pending, desc, handle, cmd_id);
        }
    }

    pub(crate) fn handle_fast_ack_locked(
        self: &Arc<Self>,
        msg: FastAck,
        desc: &mut CommandDesc,
        handle: &DescHandle,
        cmd_id: CommandId,
    ) {
        if msg.replica == self.leader() {
            self.fast_ack_from_leader_locked(msg, desc, handle, cmd_id);
        } else {
            self.common_case_fast_ack_locked(msg, desc, handle, cmd_id);
        }
    }

    pub(crate) fn handle_light_slow_ack_locked(
        self: &Arc<Self>,
        msg: LightSlowAck,
        desc: &mut CommandDesc,
        handle: &DescHandle,
        cmd_id: CommandId,
    ) {
        self.common_case_fast_ack_locked(light_slow_as_fast(msg), desc, handle, cmd_id);
    }

    fn fast_ack_from_leader_locked(
        self: &Arc<Self>,
        msg: FastAck,
        desc: &mut CommandDesc,
        handle: &DescHandle,
        cmd_id: CommandId,
    ) {
        if desc.propose.is_none() {
            // Deferred until the propose propagates.
            desc.pending_leader_ack = Some(msg);
            return;
        }
        if self.status() != Status::Normal || self.current_ballot() != msg.ballot {
            return;
        }

        desc.phase = Phase::Accept;
        let dep = msg.dep.clone().unwrap_or_default();
        let neq = !desc.dep.equals(&dep);
        let id = self.config.replica_id;
        let i_leader = self.is_leader();
        let fq = self.fq();
        let send_slow_ack = !i_leader && (self.sq.contains(id) || (neq && fq.contains(id)));
        let my_hs = desc.hs.clone();
        let msg_checksum = msg.checksum.clone();
        let ballot = self.current_ballot();

        if let Added::Completed { .. } = desc.slow_path_h.add(msg.replica, true, msg.clone()) {
            self.on_commit_locked(desc, handle, cmd_id);
        }
        let mut delivered = self.is_delivered(cmd_id);
        if !delivered {
            if let Added::Completed { .. } = desc.fast_path_h.add(msg.replica, true, msg) {
                self.on_commit_locked(desc, handle, cmd_id);
            }
            delivered = self.is_delivered(cmd_id);
        }

        if send_slow_ack {
            if neq && !delivered {
                desc.dep = dep;
                desc.slow_path = true;
            }
            let light_slow_ack = LightSlowAck {
                replica: id,
                ballot,
                cmd_id,
            };
            self.batcher.light_slow_ack(light_slow_ack);
            if self.config.opt_exec {
                let ok = if neq || !shashes_eq(&my_hs, &msg_checksum) {
                    AckOk::False
                } else {
                    AckOk::True
                };
                let record = RecordAck {
                    replica: id,
                    ballot,
                    cmd_id,
                    ok,
                };
                if fq.size() == majority_of(self.config.n) && !fq.contains(id) {
                    // Outside the fixed fast quorum the ack short-circuits
                    // straight to the client.
                    self.network
                        .send_to_client(cmd_id.client_id, ClientMsg::RecordAck(record));
                } else {
                    self.batcher.record_ack_client(record, cmd_id.client_id);
                }
            }
            if !delivered {
                self.handle_light_slow_ack_locked(light_slow_ack, desc, handle, cmd_id);
            }
        } else if !i_leader && !delivered && self.config.opt_exec {
            if !shashes_eq(&my_hs, &msg_checksum) {
                // No slow-ack was needed for the dep, but the speculative
                // view diverged: signal the client and resynchronize the
                // checksums.
                let record = RecordAck {
                    replica: id,
                    ballot,
                    cmd_id,
                    ok: AckOk::False,
                };
                self.network
                    .send_to_client(cmd_id.client_id, ClientMsg::RecordAck(record));
                if let Some(cmd) = desc.cmd.clone() {
                    for key in cmd.keys() {
                        for hash in &msg_checksum {
                            let _ = self.inbox.checksum_tx.send(ChecksumUpdate {
                                key,
                                cmd_id,
                                new_hash: *hash,
                            });
                        }
                    }
                }
            } else if fq.contains(id) {
                // Fast-quorum member outside the slow quorum: its vote for
                // the leader's dep reaches the client directly.
                self.batcher.record_ack_client(
                    RecordAck {
                        replica: id,
                        ballot,
                        cmd_id,
                        ok: AckOk::True,
                    },
                    cmd_id.client_id,
                );
            }
        }
    }

    fn common_case_fast_ack_locked(
        self: &Arc<Self>,
        msg: FastAck,
        desc: &mut CommandDesc,
        handle: &DescHandle,
        cmd_id: CommandId,
    ) {
        if self.status() != Status::Normal || self.current_ballot() != msg.ballot {
            return;
        }

        let is_leader_msg = msg.replica == self.leader();
        if msg.dep.is_none() {
            if let Added::Completed { .. } =
                desc.slow_path_h.add(msg.replica, is_leader_msg, msg.clone())
            {
                self.on_commit_locked(desc, handle, cmd_id);
            }
            if self.is_delivered(cmd_id) {
                return;
            }
        }
        if let Added::Completed { .. } = desc.fast_path_h.add(msg.replica, is_leader_msg, msg) {
            self.on_commit_locked(desc, handle, cmd_id);
        }
    }

    /// Shared fast/slow quorum completion: commit, link successors, deliver.
    fn on_commit_locked(
        self: &Arc<Self>,
        desc: &mut CommandDesc,
        handle: &DescHandle,
        cmd_id: CommandId,
    ) {
        desc.phase = Phase::Commit;

        for dep_id in desc.dep.iter() {
            if let Some(dep_handle) = self.upsert_live(dep_id, false) {
                dep_handle
                    .successors
                    .lock()
                    .expect("successors lock")
                    .push(cmd_id);
            }
        }

        self.deliver_locked(desc, handle, cmd_id);
    }

    pub(crate) fn deliver_locked(
        self: &Arc<Self>,
        desc: &mut CommandDesc,
        handle: &DescHandle,
        cmd_id: CommandId,
    ) {
        if desc.propose.is_none() || self.is_delivered(cmd_id) || !self.config.exec {
            return;
        }
        let speculative =
            self.config.opt_exec && self.is_leader() && desc.phase >= Phase::PreAccept;
        if desc.phase != Phase::Commit && !speculative {
            return;
        }
        if desc.dep.iter().any(|d| !self.is_delivered(d)) {
            // Retried when a dependency delivers and pushes its successors.
            return;
        }

        self.delivered
            .write()
            .expect("delivered lock")
            .insert(cmd_id);
        let cmd = desc.cmd.clone().unwrap_or_else(Command::noop);
        let value = self.sm.execute(&cmd);

        let successors = handle
            .successors
            .lock()
            .expect("successors lock")
            .clone();
        for successor in successors {
            let _ = self.inbox.deliver_tx.send(successor);
        }

        if !self.config.dreply {
            return;
        }
        let (from_leader, ok) = if self.is_leader() {
            let ok = if desc.phase != Phase::Commit {
                AckOk::True
            } else {
                AckOk::Ordered
            };
            (true, ok)
        } else {
            (false, AckOk::Ordered)
        };
        self.repchan.send(RepReq::Reply {
            cmd_id,
            rep: value,
            ballot: self.current_ballot(),
            from_leader,
            ok,
        });
    }

    fn finalize_locked(&self, slot: u64, desc: &mut CommandDesc, cmd_id: CommandId) {
        self.history.lock().expect("history lock").write(
            slot,
            CommandStaticDesc {
                cmd_id,
                phase: desc.phase,
                cmd: desc.cmd.clone(),
                dep: desc.dep.clone(),
                slow_path: desc.slow_path,
            },
        );
        desc.active = false;
        desc.slow_path_h.free();
        desc.fast_path_h.free();
        self.descs.lock().expect("descs lock").remove(&cmd_id);
        if !desc.seq {
            self.routine_count.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Ask all descriptor workers to stop and wait for their acks.
    pub(crate) async fn stop_descs(&self) {
        let targets: Vec<_> = {
            let descs = self.descs.lock().expect("descs lock");
            descs.values().filter_map(|h| h.tx.clone()).collect()
        };
        let mut acks = Vec::with_capacity(targets.len());
        for tx in targets {
            let (ack_tx, ack_rx) = oneshot::channel();
            if tx.send(DescMsg::Stop(ack_tx)).is_ok() {
                acks.push(ack_rx);
            }
        }
        for ack in acks {
            // A worker that finalized concurrently drops the sender; both
            // outcomes mean it is no longer running.
            let _ = ack.await;
        }
    }
}

/// Conflict-derived dependencies for `cmd`, without registering it.
pub(crate) fn dep_of(st: &DispatchState, cmd: &Command) -> Dep {
    let mut dep = Vec::new();
    for key in cmd.keys() {
        if let Some(info) = st.keys.get(&key) {
            dep.extend(info.conflict_cmds(cmd));
        }
    }
    Dep(dep)
}

/// Dependencies plus per-key checksums, registering `cmd` into both indexes.
pub(crate) fn dep_and_hashes(
    st: &mut DispatchState,
    cmd: &Command,
    cmd_id: CommandId,
) -> (Dep, Vec<SHash>) {
    let mut dep = Vec::new();
    let mut hashes = Vec::new();
    for key in cmd.keys() {
        let info = st.keys.entry(key).or_default();
        dep.extend(info.conflict_cmds(cmd));
        info.add(cmd, cmd_id);

        let sum = st.sums.entry(key).or_default();
        hashes.push(sum.update(cmd, cmd_id));
    }
    (Dep(dep), hashes)
}

/// Reply-channel request.
pub(crate) enum RepReq {
    /// Post-delivery client acknowledgement; allocates a history slot.
    Reply {
        cmd_id: CommandId,
        rep: Value,
        ballot: Ballot,
        from_leader: bool,
        ok: AckOk,
    },
    /// Local-read result; bypasses ordering and history.
    ReadReply {
        cmd_id: CommandId,
        rep: Value,
        ballot: Ballot,
    },
    /// Client-issued sync; answered immediately if the value is known.
    Sync {
        client: ClientId,
        cmd_id: CommandId,
        ballot: Ballot,
    },
}

/// Serialises client-bound replies and assigns history slots in reply order.
/// `stop` drops the queue so no post-recovery duplicate replies are emitted;
/// `restart` begins a fresh epoch with the slot counter back at zero.
pub(crate) struct ReplyChan {
    replica_id: super::types::ReplicaId,
    network: Arc<dyn Network>,
    history_slot_tx: mpsc::UnboundedSender<(CommandId, u64)>,
    tx: Mutex<Option<mpsc::UnboundedSender<RepReq>>>,
}

impl ReplyChan {
    fn new(
        replica_id: super::types::ReplicaId,
        network: Arc<dyn Network>,
        history_slot_tx: mpsc::UnboundedSender<(CommandId, u64)>,
    ) -> Self {
        Self {
            replica_id,
            network,
            history_slot_tx,
            tx: Mutex::new(None),
        }
    }

    pub(crate) fn send(&self, req: RepReq) {
        if let Some(tx) = self.tx.lock().expect("repchan lock").as_ref() {
            let _ = tx.send(req);
        }
    }

    pub(crate) fn stop(&self) {
        self.tx.lock().expect("repchan lock").take();
    }

    pub(crate) fn restart(&self) {
        let (tx, mut rx) = mpsc::unbounded_channel::<RepReq>();
        *self.tx.lock().expect("repchan lock") = Some(tx);

        let replica_id = self.replica_id;
        let network = self.network.clone();
        let history_slot_tx = self.history_slot_tx.clone();
        tokio::spawn(async move {
            let mut next_slot: u64 = 0;
            let mut values: HashMap<CommandId, Value> = HashMap::new();
            let mut pending_syncs: HashMap<CommandId, ClientId> = HashMap::new();
            while let Some(req) = rx.recv().await {
                match req {
                    RepReq::Reply {
                        cmd_id,
                        rep,
                        ballot,
                        from_leader,
                        ok,
                    } => {
                        let msg = if from_leader {
                            ClientMsg::Reply(Reply {
                                replica: replica_id,
                                ballot,
                                cmd_id,
                                rep: rep.clone(),
                                ok,
                            })
                        } else {
                            ClientMsg::RecordAck(RecordAck {
                                replica: replica_id,
                                ballot,
                                cmd_id,
                                ok,
                            })
                        };
                        network.send_to_client(cmd_id.client_id, msg);
                        if let Some(waiter) = pending_syncs.remove(&cmd_id) {
                            network.send_to_client(
                                waiter,
                                ClientMsg::SyncReply(SyncReply {
                                    replica: replica_id,
                                    ballot,
                                    cmd_id,
                                    rep: rep.clone(),
                                }),
                            );
                        }
                        values.insert(cmd_id, rep);
                        let _ = history_slot_tx.send((cmd_id, next_slot));
                        next_slot += 1;
                    }
                    RepReq::ReadReply {
                        cmd_id,
                        rep,
                        ballot,
                    } => {
                        network.send_to_client(
                            cmd_id.client_id,
                            ClientMsg::SyncReply(SyncReply {
                                replica: replica_id,
                                ballot,
                                cmd_id,
                                rep,
                            }),
                        );
                    }
                    RepReq::Sync {
                        client,
                        cmd_id,
                        ballot,
                    } => {
                        if let Some(rep) = values.get(&cmd_id) {
                            network.send_to_client(
                                client,
                                ClientMsg::SyncReply(SyncReply {
                                    replica: replica_id,
                                    ballot,
                                    cmd_id,
                                    rep: rep.clone(),
                                }),
                            );
                        } else {
                            pending_syncs.insert(cmd_id, client);
                        }
                    }
                }
            }
        });
    }
}

enum BatchReq {
    FastAck(FastAck),
    LightSlowAck(LightSlowAck),
    RecordAckClient(RecordAck, ClientId),
}

/// Coalesces outgoing replica-bound acknowledgements into `Acks` batches, or
/// `OptAcks` with nil-dep compaction in optimistic-execution mode. Client
/// records queued here are flushed individually alongside the batch.
pub(crate) struct Batcher {
    tx: mpsc::UnboundedSender<BatchReq>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<BatchReq>>>,
    replica_id: super::types::ReplicaId,
    opt_exec: bool,
    network: Arc<dyn Network>,
}

const BATCH_MAX: usize = 16;

impl Batcher {
    fn new(
        replica_id: super::types::ReplicaId,
        opt_exec: bool,
        network: Arc<dyn Network>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            replica_id,
            opt_exec,
            network,
        }
    }

    fn start(&self) {
        let Some(mut rx) = self.rx.lock().expect("batcher lock").take() else {
            return;
        };
        let replica_id = self.replica_id;
        let opt_exec = self.opt_exec;
        let network = self.network.clone();
        tokio::spawn(async move {
            while let Some(first) = rx.recv().await {
                let mut batch = vec![first];
                while batch.len() < BATCH_MAX {
                    match rx.try_recv() {
                        Ok(req) => batch.push(req),
                        Err(_) => break,
                    }
                }
                flush(replica_id, opt_exec, network.as_ref(), batch);
            }
        });
    }

    pub(crate) fn fast_ack(&self, msg: FastAck) {
        let _ = self.tx.send(BatchReq::FastAck(msg));
    }

    pub(crate) fn light_slow_ack(&self, msg: LightSlowAck) {
        let _ = self.tx.send(BatchReq::LightSlowAck(msg));
    }

    pub(crate) fn record_ack_client(&self, msg: RecordAck, client: ClientId) {
        let _ = self.tx.send(BatchReq::RecordAckClient(msg, client));
    }
}

fn flush(
    replica_id: super::types::ReplicaId,
    opt_exec: bool,
    network: &dyn Network,
    batch: Vec<BatchReq>,
) {
    let mut fast_acks = Vec::new();
    let mut light_slow_acks = Vec::new();
    for req in batch {
        match req {
            BatchReq::FastAck(m) => fast_acks.push(m),
            BatchReq::LightSlowAck(m) => light_slow_acks.push(m),
            BatchReq::RecordAckClient(m, client) => {
                network.send_to_client(client, ClientMsg::RecordAck(m));
            }
        }
    }
    if fast_acks.is_empty() && light_slow_acks.is_empty() {
        return;
    }

    if opt_exec {
        // Group per ballot; batches span a ballot change only around
        // recovery, when traffic has already quiesced.
        let mut by_ballot: HashMap<Ballot, Vec<OptAck>> = HashMap::new();
        for m in fast_acks {
            by_ballot.entry(m.ballot).or_default().push(OptAck {
                cmd_id: m.cmd_id,
                dep: m.dep.unwrap_or_else(|| Dep::nil_of(m.cmd_id)),
                checksum: m.checksum,
            });
        }
        for m in light_slow_acks {
            by_ballot.entry(m.ballot).or_default().push(OptAck {
                cmd_id: m.cmd_id,
                dep: Dep::nil_of(m.cmd_id),
                checksum: Vec::new(),
            });
        }
        for (ballot, acks) in by_ballot {
            network.send_to_all(PeerMsg::OptAcks(OptAcks {
                replica: replica_id,
                ballot,
                acks,
            }));
        }
    } else {
        network.send_to_all(PeerMsg::Acks(Acks {
            fast_acks,
            light_slow_acks,
        }));
    }
}
