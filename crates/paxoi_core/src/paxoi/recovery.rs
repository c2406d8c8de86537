//! Ballot takeover: new-leader announcement, log collection, and sync.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use super::descriptor::DescMsg;
use super::msgset::Added;
use super::quorum::Quorum;
use super::replica::{DispatchState, Replica};
use super::types::{
    next_ballot_of, Accept, AckOk, Ballot, ClientMsg, Command, CommandId, Dep, FastAck,
    LightSlowAck, NewLeader, NewLeaderAckN, PeerMsg, Phase, RecordAck, Reply, Status, SyncMsg,
};

impl Replica {
    /// Entry point for the recovery trigger channel: choose a ballot this
    /// replica owns, announce it, and adopt it locally.
    pub(crate) async fn start_recovery(
        self: &Arc<Self>,
        new_ballot: Ballot,
        st: &mut DispatchState,
    ) {
        let id = self.config.replica_id;
        let mut new_leader = NewLeader {
            replica: id,
            ballot: self.current_ballot(),
        };
        if new_ballot >= 0 {
            if new_ballot > new_leader.ballot {
                new_leader.ballot = new_ballot;
            } else {
                new_leader.ballot = self.qs.same_higher(new_ballot, new_leader.ballot);
            }
        } else {
            new_leader.ballot = next_ballot_of(id, new_leader.ballot, self.config.n);
        }

        // With fixed quorums, skip ballots whose acceptor set contains a
        // dead replica.
        while self.fixed_majority {
            let aq = self.qs.aq(new_leader.ballot);
            let dead = match &aq {
                Quorum::Fixed(set) => set
                    .iter()
                    .any(|r| *r != id && !self.replica_alive(*r)),
                Quorum::Size(_) => false,
            };
            if !dead {
                break;
            }
            new_leader.ballot = next_ballot_of(id, new_leader.ballot, self.config.n);
        }

        self.network.send_to_all(PeerMsg::NewLeader(new_leader));
        st.new_leader_acks
            .reinit(Quorum::majority(self.config.n), Box::new(|_, _| true));
        self.adopt_new_leader(new_leader, st).await;
    }

    /// Move to RECOVERING at the announced ballot, stop client replies and
    /// descriptor workers, and ship our command log to the would-be leader.
    pub(crate) async fn adopt_new_leader(
        self: &Arc<Self>,
        msg: NewLeader,
        st: &mut DispatchState,
    ) {
        if self.current_ballot() >= msg.ballot {
            return;
        }
        tracing::info!(
            replica = self.config.replica_id,
            ballot = msg.ballot,
            "recovering"
        );

        self.set_status(Status::Recovering);
        self.set_ballot(msg.ballot);
        st.rec_start = Some(Instant::now());

        self.repchan.stop();
        self.stop_descs().await;

        let ack = self.fill_new_leader_ack_n(st);
        if msg.replica != self.config.replica_id {
            self.network
                .send_to(msg.replica, PeerMsg::NewLeaderAckN(ack));
        } else {
            self.on_new_leader_ack_n(ack, st).await;
        }
    }

    /// Snapshot every propose-bearing descriptor, sealing outstanding
    /// proposes without a descriptor as NOOPs with an empty dep.
    fn fill_new_leader_ack_n(&self, st: &DispatchState) -> NewLeaderAckN {
        let mut ack = NewLeaderAckN {
            replica: self.config.replica_id,
            ballot: self.current_ballot(),
            cballot: self.cballot(),
            cmd_ids: Vec::new(),
            phases: Vec::new(),
            cmds: Vec::new(),
            deps: Vec::new(),
        };
        let mut seen = HashSet::new();

        let handles: Vec<_> = {
            let descs = self.descs.lock().expect("descs lock");
            descs.iter().map(|(id, h)| (*id, h.clone())).collect()
        };
        for (cmd_id, handle) in handles {
            let desc = handle.desc.lock().expect("desc lock");
            if desc.propose.is_none() || !seen.insert(cmd_id) {
                continue;
            }
            ack.cmd_ids.push(cmd_id);
            ack.phases.push(desc.phase);
            ack.cmds
                .push(desc.cmd.clone().unwrap_or_else(Command::noop));
            ack.deps.push(desc.dep.clone());
        }

        for cmd_id in st.proposes.keys() {
            if seen.contains(cmd_id) || self.is_delivered(*cmd_id) {
                continue;
            }
            ack.cmd_ids.push(*cmd_id);
            ack.phases.push(Phase::Accept);
            ack.cmds.push(Command::noop());
            ack.deps.push(Dep::default());
        }

        ack
    }

    pub(crate) async fn on_new_leader_ack_n(
        self: &Arc<Self>,
        msg: NewLeaderAckN,
        st: &mut DispatchState,
    ) {
        if self.status() != Status::Recovering || self.current_ballot() != msg.ballot {
            return;
        }

        let is_own = msg.replica == self.config.replica_id;
        if let Added::Completed { leader, mut msgs } =
            st.new_leader_acks.add(msg.replica, is_own, msg)
        {
            msgs.push(leader);
            self.on_new_leader_acks_complete(msgs, st).await;
        }
    }

    /// Majority of command logs collected: take the subset at the maximal
    /// cballot, keep its ACCEPT/COMMIT entries, and broadcast the sync.
    async fn on_new_leader_acks_complete(
        self: &Arc<Self>,
        acks: Vec<NewLeaderAckN>,
        st: &mut DispatchState,
    ) {
        let max_cballot = acks.iter().map(|a| a.cballot).max().unwrap_or(-1);

        let mut phases = HashMap::new();
        let mut cmds = HashMap::new();
        let mut deps = HashMap::new();
        for ack in acks.iter().filter(|a| a.cballot == max_cballot) {
            for i in 0..ack.cmd_ids.len() {
                if matches!(ack.phases[i], Phase::Accept | Phase::Commit) {
                    let cmd_id = ack.cmd_ids[i];
                    phases.insert(cmd_id, ack.phases[i]);
                    cmds.insert(cmd_id, ack.cmds[i].clone());
                    deps.insert(cmd_id, ack.deps[i].clone());
                }
            }
        }

        let sync = SyncMsg {
            replica: self.config.replica_id,
            ballot: self.current_ballot(),
            phases,
            cmds,
            deps,
        };
        self.network.send_to_all(PeerMsg::Sync(sync.clone()));
        self.on_sync(sync, st).await;
    }

    /// Install the recovered command log and return to NORMAL.
    pub(crate) async fn on_sync(self: &Arc<Self>, msg: SyncMsg, st: &mut DispatchState) {
        if self.current_ballot() > msg.ballot
            || (self.current_ballot() == msg.ballot && self.status() == Status::Normal)
        {
            return;
        }

        if self.status() == Status::Normal {
            // Sync at a higher ballot without a prior new-leader round.
            st.rec_start = Some(Instant::now());
            self.repchan.stop();
            self.stop_descs().await;
        }

        // Re-queue previously-proposed commands the sync does not mention,
        // then drop every descriptor.
        let handles: Vec<_> = {
            let mut descs = self.descs.lock().expect("descs lock");
            descs.drain().collect()
        };
        for (cmd_id, handle) in handles {
            let desc = handle.desc.lock().expect("desc lock");
            if let Some(propose) = desc.propose.clone() {
                if !msg.phases.contains_key(&cmd_id) {
                    let _ = self.inbox.propose_tx.send(propose);
                }
            }
        }
        self.routine_count
            .store(0, std::sync::atomic::Ordering::SeqCst);
        st.keys.clear();

        self.set_status(Status::Normal);
        self.set_ballot(msg.ballot);
        self.set_cballot(msg.ballot);
        if self.fixed_majority {
            *self.fq.write().expect("fq lock") = self.qs.aq(msg.ballot);
        }
        self.repchan.restart();

        let id = self.config.replica_id;
        let ballot = msg.ballot;
        let in_sq = self.sq.contains(id);
        let i_leader = self.is_leader();

        for cmd_id in topo_order(&msg.phases, &msg.deps) {
            let dep = msg.deps.get(&cmd_id).cloned().unwrap_or_default();
            if let Some(handle) = self.upsert_live(cmd_id, false) {
                {
                    let mut desc = handle.desc.lock().expect("desc lock");
                    desc.phase = if msg.phases[&cmd_id] == Phase::Commit {
                        Phase::Commit
                    } else {
                        Phase::Accept
                    };
                    desc.cmd = msg.cmds.get(&cmd_id).cloned();
                    desc.dep = dep.clone();
                    desc.propose_dep = Some(dep.clone());
                    if let Some(propose) = st.proposes.get(&cmd_id) {
                        desc.propose = Some(propose.clone());
                    }
                }
                for dep_id in dep.iter() {
                    if let Some(dep_handle) = self.upsert_live(dep_id, false) {
                        dep_handle
                            .successors
                            .lock()
                            .expect("successors lock")
                            .push(cmd_id);
                    }
                    let _ = self.inbox.deliver_tx.send(dep_id);
                }
                let _ = self.inbox.deliver_tx.send(cmd_id);
            }

            if st.proposes.contains_key(&cmd_id) {
                if !in_sq {
                    continue;
                }
                if i_leader {
                    let fast_ack = FastAck {
                        replica: id,
                        ballot,
                        cmd_id,
                        dep: Some(dep.clone()),
                        checksum: Vec::new(),
                    };
                    self.batcher.fast_ack(fast_ack.clone());
                    self.route(cmd_id, DescMsg::FastAck(fast_ack));
                    self.network.send_to_client(
                        cmd_id.client_id,
                        ClientMsg::Reply(Reply {
                            replica: id,
                            ballot,
                            cmd_id,
                            rep: Vec::new(),
                            ok: AckOk::True,
                        }),
                    );
                } else {
                    let light_slow_ack = LightSlowAck {
                        replica: id,
                        ballot,
                        cmd_id,
                    };
                    self.batcher.light_slow_ack(light_slow_ack);
                    self.batcher.record_ack_client(
                        RecordAck {
                            replica: id,
                            ballot,
                            cmd_id,
                            ok: AckOk::False,
                        },
                        cmd_id.client_id,
                    );
                    self.route(cmd_id, DescMsg::LightSlowAck(light_slow_ack));
                }
            }
        }

        // Clients whose proposes were lost get an accept notice and re-drive
        // on the new ballot.
        for cmd_id in st.proposes.keys() {
            if msg.phases.contains_key(cmd_id) {
                continue;
            }
            self.network.send_to_client(
                cmd_id.client_id,
                ClientMsg::Accept(Accept {
                    replica: id,
                    ballot,
                    cmd_id: *cmd_id,
                }),
            );
        }

        let elapsed = st.rec_start.take().map(|t| t.elapsed());
        tracing::info!(replica = id, ballot, ?elapsed, "recovered");
    }
}

/// Dependency-topological order over the sync set: a command follows every
/// dependency the set also contains. Edges leaving the set are ignored;
/// cycles (possible only across ballots) fall back to insertion order.
fn topo_order(
    phases: &HashMap<CommandId, Phase>,
    deps: &HashMap<CommandId, Dep>,
) -> Vec<CommandId> {
    let mut in_degree: HashMap<CommandId, usize> = HashMap::new();
    let mut dependents: HashMap<CommandId, Vec<CommandId>> = HashMap::new();
    for cmd_id in phases.keys() {
        let mut degree = 0;
        if let Some(dep) = deps.get(cmd_id) {
            for dep_id in dep.iter() {
                if phases.contains_key(&dep_id) && dep_id != *cmd_id {
                    degree += 1;
                    dependents.entry(dep_id).or_default().push(*cmd_id);
                }
            }
        }
        in_degree.insert(*cmd_id, degree);
    }

    let mut queue: VecDeque<CommandId> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(phases.len());
    while let Some(cmd_id) = queue.pop_front() {
        order.push(cmd_id);
        if let Some(next) = dependents.get(&cmd_id) {
            for dependent in next {
                let degree = in_degree.get_mut(dependent).expect("degree tracked");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(*dependent);
                }
            }
        }
    }

    if order.len() < phases.len() {
        for cmd_id in phases.keys() {
            if !order.contains(cmd_id) {
                order.push(*cmd_id);
            }
        }
    }
    order
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

    #[test]
    fn topo_order_respects_deps() {
        let mut phases = HashMap::new();
        let mut deps = HashMap::new();
        for seq in 1..=3 {
            phases.insert(id(seq), Phase::Commit);
        }
        // 3 depends on 2 depends on 1.
        deps.insert(id(1), Dep::default());
        deps.insert(id(2), Dep(vec![id(1)]));
        deps.insert(id(3), Dep(vec![id(2)]));

        let order = topo_order(&phases, &deps);
        let pos = |c: CommandId| order.iter().position(|x| *x == c).unwrap();
        assert_eq!(order.len(), 3);
        assert!(pos(id(1)) < pos(id(2)));
        assert!(pos(id(2)) < pos(id(3)));
    }

    #[test]
    fn topo_order_ignores_edges_outside_the_set() {
        let mut phases = HashMap::new();
        let mut deps = HashMap::new();
        phases.insert(id(2), Phase::Accept);
        deps.insert(id(2), Dep(vec![id(1)]));
        assert_eq!(topo_order(&phases, &deps), vec![id(2)]);
    }

    #[test]
    fn topo_order_survives_cycles() {
        let mut phases = HashMap::new();
        let mut deps = HashMap::new();
        phases.insert(id(1), Phase::Commit);
        phases.insert(id(2), Phase::Commit);
        deps.insert(id(1), Dep(vec![id(2)]));
        deps.insert(id(2), Dep(vec![id(1)]));
        let order = topo_order(&phases, &deps);
        assert_eq!(order.len(), 2);
    }
}
