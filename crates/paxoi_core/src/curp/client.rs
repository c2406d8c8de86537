//! Commutativity-exploiting client.
//!
//! Requests are certified on two overlapping paths: `acks` collects
//! fast-path votes (three quarters of the cluster agreeing with the
//! leader's dependency view) and `macks` collects the ordered path (a
//! majority of post-delivery records behind the leader). Whichever
//! completes first delivers; a timer falls back to an explicit sync with
//! the leader when neither converges in time.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use crate::paxoi::{
    leader_of, majority_of, AckOk, Ballot, ClientId, ClientMsg, ClientSync, Command, CommandId,
    MsgSet, Network, PeerMsg, Propose, Quorum, RecordAck, ReplicaId, SeqNum, SyncReply, Value,
};

/// Floor for the sync fallback timer.
const MIN_WAIT: Duration = Duration::from_millis(100);

pub struct Client {
    client_id: ClientId,
    n: usize,
    network: Arc<dyn Network>,
    inbox: mpsc::UnboundedReceiver<ClientMsg>,

    /// Replica this client is collocated with, for local reads.
    collocated: Option<ReplicaId>,
    /// Serve reads at the collocated replica without broadcasting.
    local_read: bool,

    acks: MsgSet<RecordAck>,
    macks: MsgSet<RecordAck>,

    ballot: Option<Ballot>,
    leader: Option<ReplicaId>,

    /// Measured per-replica round-trips (milliseconds) for calibration.
    pings: Vec<f64>,
    wait_time: Duration,
    calibrated: bool,

    delivered: HashSet<SeqNum>,
    last_cmd_id: CommandId,
    val: Value,

    slow_paths: usize,
    already_slow: HashSet<CommandId>,
}

fn fast_quorum(n: usize) -> MsgSet<RecordAck> {
    MsgSet::new(
        Quorum::three_quarters(n),
        Box::new(|m: &RecordAck, _| m.ok == AckOk::True),
    )
}

fn ordered_quorum(n: usize) -> MsgSet<RecordAck> {
    MsgSet::new(Quorum::majority(n), Box::new(|_, _| true))
}

impl Client {
    pub fn new(
        client_id: ClientId,
        n: usize,
        pings: Vec<f64>,
        collocated: Option<ReplicaId>,
        local_read: bool,
        network: Arc<dyn Network>,
        inbox: mpsc::UnboundedReceiver<ClientMsg>,
    ) -> Self {
        Self {
            client_id,
            n,
            network,
            inbox,
            collocated,
            local_read,
            acks: fast_quorum(n),
            macks: ordered_quorum(n),
            ballot: None,
            leader: None,
            pings,
            wait_time: MIN_WAIT,
            calibrated: false,
            delivered: HashSet::new(),
            last_cmd_id: CommandId {
                client_id,
                seq_num: 0,
            },
            val: Vec::new(),
            slow_paths: 0,
            already_slow: HashSet::new(),
        }
    }

    /// Commands reclassified from the fast to the slow path so far.
    pub fn slow_paths(&self) -> usize {
        self.slow_paths
    }

    /// Next sequence number to be issued; equals the delivered count.
    pub fn next_seq_num(&self) -> SeqNum {
        self.last_cmd_id.seq_num
    }

    /// Issue one command and wait for certification. Strictly sequential:
    /// the next call may only start once this one returned.
    pub async fn invoke(&mut self, command: Command) -> anyhow::Result<Value> {
        if !self.calibrated {
            self.calibrate();
        }

        let cmd_id = self.last_cmd_id;
        let propose = Propose {
            cmd_id,
            command: command.clone(),
            collocated: false,
        };

        let local_read = self.local_read && command.is_read() && self.collocated.is_some();
        if local_read {
            let target = self.collocated.expect("collocated replica");
            self.network.send_to(
                target,
                PeerMsg::Propose(Propose {
                    collocated: true,
                    ..propose.clone()
                }),
            );
        } else {
            self.network.send_to_all(PeerMsg::Propose(propose.clone()));
        }

        let mut deadline = Instant::now() + self.wait_time;
        loop {
            tokio::select! {
                msg = self.inbox.recv() => {
                    let Some(msg) = msg else {
                        anyhow::bail!("client {} inbox closed", self.client_id);
                    };
                    if self.handle_msg(msg, cmd_id, &propose) {
                        return Ok(self.val.clone());
                    }
                }
                _ = time::sleep_until(deadline) => {
                    if let Some(leader) = self.leader {
                        if !self.delivered.contains(&cmd_id.seq_num) {
                            self.network.send_to(
                                leader,
                                PeerMsg::ClientSync(ClientSync {
                                    client_id: self.client_id,
                                    cmd_id,
                                }),
                            );
                        }
                    }
                    deadline = Instant::now() + self.wait_time;
                }
            }
        }
    }

    /// First-request calibration: the SQ-sized ping percentile, padded.
    fn calibrate(&mut self) {
        let mut pings = self.pings.clone();
        pings.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = majority_of(self.n).saturating_sub(1);
        let base = pings.get(idx).copied().unwrap_or(0.0);
        let wait = Duration::from_micros(((base * 2.05 + 25.0) * 1000.0) as u64);
        self.wait_time = wait.max(MIN_WAIT);
        self.calibrated = true;
        tracing::debug!(client = self.client_id, wait = ?self.wait_time, "calibrated");
    }

    /// Returns true once the outstanding command is delivered.
    fn handle_msg(&mut self, msg: ClientMsg, cmd_id: CommandId, propose: &Propose) -> bool {
        match msg {
            ClientMsg::Reply(reply) => {
                if reply.cmd_id != cmd_id || self.delivered.contains(&reply.cmd_id.seq_num) {
                    return false;
                }
                let ack = RecordAck {
                    replica: reply.replica,
                    ballot: reply.ballot,
                    cmd_id: reply.cmd_id,
                    ok: reply.ok,
                };
                self.val = reply.rep;
                self.handle_record_ack(ack, true)
            }
            ClientMsg::RecordAck(ack) => {
                if ack.cmd_id != cmd_id {
                    return false;
                }
                self.handle_record_ack(ack, false)
            }
            ClientMsg::SyncReply(reply) => {
                if reply.cmd_id != cmd_id {
                    return false;
                }
                self.handle_sync_reply(reply)
            }
            ClientMsg::Accept(accept) => {
                if accept.cmd_id != cmd_id || self.delivered.contains(&accept.cmd_id.seq_num) {
                    return false;
                }
                // Our propose was lost to a recovery: re-drive it on the
                // new ballot.
                if !self.ballot.is_some_and(|b| b >= accept.ballot) {
                    self.ballot = Some(accept.ballot);
                    self.reinit_acks();
                }
                self.leader = Some(leader_of(accept.ballot, self.n));
                self.network.send_to_all(PeerMsg::Propose(propose.clone()));
                false
            }
        }
    }

    fn handle_record_ack(&mut self, ack: RecordAck, from_leader: bool) -> bool {
        if self.delivered.contains(&ack.cmd_id.seq_num) {
            return false;
        }

        match self.ballot {
            None => self.ballot = Some(ack.ballot),
            Some(ballot) if ballot < ack.ballot => {
                self.ballot = Some(ack.ballot);
                self.reinit_acks();
            }
            Some(ballot) if ballot > ack.ballot => return false,
            Some(_) => {}
        }

        if ack.ok == AckOk::False && self.already_slow.insert(ack.cmd_id) {
            self.slow_paths += 1;
        }

        let mut completed = false;
        if from_leader {
            self.leader = Some(ack.replica);
            completed |= self
                .macks
                .add(ack.replica, true, ack.clone())
                .is_completed();
        }
        if ack.ok == AckOk::Ordered {
            completed |= self
                .macks
                .add(ack.replica, false, ack.clone())
                .is_completed();
        } else {
            completed |= self.acks.add(ack.replica, from_leader, ack).is_completed();
        }

        if completed {
            self.deliver_current();
        }
        completed
    }

    fn handle_sync_reply(&mut self, reply: SyncReply) -> bool {
        if self.delivered.contains(&reply.cmd_id.seq_num) {
            return false;
        }
        match self.ballot {
            None => self.ballot = Some(reply.ballot),
            Some(ballot) if ballot < reply.ballot => {
                self.ballot = Some(reply.ballot);
                self.reinit_acks();
            }
            Some(ballot) if ballot > reply.ballot => return false,
            Some(_) => {}
        }
        // Only adopt the sender as leader when the ballot actually elects
        // it; collocated read replies reuse this path.
        if leader_of(reply.ballot, self.n) == reply.replica {
            self.leader = Some(reply.replica);
        }

        self.val = reply.rep;
        self.deliver_current();
        true
    }

    fn deliver_current(&mut self) {
        self.delivered.insert(self.last_cmd_id.seq_num);
        self.last_cmd_id.seq_num += 1;
        tracing::debug!(
            client = self.client_id,
            slow_paths = self.slow_paths,
            "delivered"
        );
        self.reinit_acks();
    }

    fn reinit_acks(&mut self) {
        self.acks.reinit(
            Quorum::three_quarters(self.n),
            Box::new(|m: &RecordAck, _| m.ok == AckOk::True),
        );
        self.macks
            .reinit(Quorum::majority(self.n), Box::new(|_, _| true));
    }
}
