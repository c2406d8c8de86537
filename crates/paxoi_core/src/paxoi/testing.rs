//! In-memory transport and state machine for tests and the workload harness.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::replica::ReplicaInbox;
use super::types::{
    ClientId, ClientMsg, Command, Key, Network, Op, PeerMsg, ReplicaId, StateMachine, Value,
};

/// Zero-latency in-process network. Messages cross as values; replicas can
/// be marked down to simulate crashes and partitions.
pub struct InMemoryNetwork {
    inner: Mutex<Inner>,
}

struct Inner {
    replicas: HashMap<ReplicaId, ReplicaInbox>,
    clients: HashMap<ClientId, mpsc::UnboundedSender<ClientMsg>>,
    down: HashSet<ReplicaId>,
    client_muted: HashSet<ReplicaId>,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                replicas: HashMap::new(),
                clients: HashMap::new(),
                down: HashSet::new(),
                client_muted: HashSet::new(),
            }),
        })
    }

    pub fn register_replica(&self, id: ReplicaId, inbox: ReplicaInbox) {
        self.inner
            .lock()
            .expect("network lock")
            .replicas
            .insert(id, inbox);
    }

    pub fn register_client(&self, id: ClientId) -> mpsc::UnboundedReceiver<ClientMsg> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .expect("network lock")
            .clients
            .insert(id, tx);
        rx
    }

    /// Drop all traffic to and from a replica.
    pub fn set_down(&self, id: ReplicaId, down: bool) {
        let mut inner = self.inner.lock().expect("network lock");
        if down {
            inner.down.insert(id);
        } else {
            inner.down.remove(&id);
        }
    }

    /// Drop a replica's client-bound acknowledgements (sync replies still
    /// pass), simulating a slow path toward the client only.
    pub fn set_client_mute(&self, id: ReplicaId, muted: bool) {
        let mut inner = self.inner.lock().expect("network lock");
        if muted {
            inner.client_muted.insert(id);
        } else {
            inner.client_muted.remove(&id);
        }
    }

    /// Endpoint bound to one replica; `send_to_all` excludes it.
    pub fn replica_endpoint(self: &Arc<Self>, id: ReplicaId) -> Arc<dyn Network> {
        Arc::new(ReplicaEndpoint {
            net: self.clone(),
            id,
        })
    }

    /// Endpoint bound to a client; `send_to_all` targets every replica.
    pub fn client_endpoint(self: &Arc<Self>) -> Arc<dyn Network> {
        Arc::new(ClientEndpoint { net: self.clone() })
    }

    fn deliver_peer(&self, from: Option<ReplicaId>, target: ReplicaId, msg: PeerMsg) {
        let inner = self.inner.lock().expect("network lock");
        if inner.down.contains(&target) {
            return;
        }
        if let Some(from) = from {
            if inner.down.contains(&from) {
                return;
            }
        }
        if let Some(inbox) = inner.replicas.get(&target) {
            inbox.deliver(msg);
        }
    }

    fn deliver_client(&self, from: ReplicaId, client: ClientId, msg: ClientMsg) {
        let inner = self.inner.lock().expect("network lock");
        if inner.down.contains(&from) {
            return;
        }
        if inner.client_muted.contains(&from) && !matches!(msg, ClientMsg::SyncReply(_)) {
            return;
        }
        if let Some(tx) = inner.clients.get(&client) {
            let _ = tx.send(msg);
        }
    }

    fn replica_ids(&self) -> Vec<ReplicaId> {
        let inner = self.inner.lock().expect("network lock");
        let mut ids: Vec<_> = inner.replicas.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

struct ReplicaEndpoint {
    net: Arc<InMemoryNetwork>,
    id: ReplicaId,
}

impl Network for ReplicaEndpoint {
    fn send_to(&self, target: ReplicaId, msg: PeerMsg) {
        self.net.deliver_peer(Some(self.id), target, msg);
    }

    fn send_to_all(&self, msg: PeerMsg) {
        for target in self.net.replica_ids() {
            if target != self.id {
                self.net.deliver_peer(Some(self.id), target, msg.clone());
            }
        }
    }

    fn send_to_client(&self, client: ClientId, msg: ClientMsg) {
        self.net.deliver_client(self.id, client, msg);
    }
}

struct ClientEndpoint {
    net: Arc<InMemoryNetwork>,
}

impl Network for ClientEndpoint {
    fn send_to(&self, target: ReplicaId, msg: PeerMsg) {
        self.net.deliver_peer(None, target, msg);
    }

    fn send_to_all(&self, msg: PeerMsg) {
        for target in self.net.replica_ids() {
            self.net.deliver_peer(None, target, msg.clone());
        }
    }

    fn send_to_client(&self, _client: ClientId, _msg: ClientMsg) {}
}

/// Key-value store recording the order commands were applied in.
pub struct KvStore {
    state: Mutex<HashMap<Key, Value>>,
    applied: Mutex<Vec<Command>>,
}

impl KvStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HashMap::new()),
            applied: Mutex::new(Vec::new()),
        })
    }

    /// Commands applied so far, in execution order.
    pub fn applied(&self) -> Vec<Command> {
        self.applied.lock().expect("applied lock").clone()
    }

    pub fn get(&self, key: Key) -> Option<Value> {
        self.state.lock().expect("state lock").get(&key).cloned()
    }
}

impl StateMachine for KvStore {
    fn execute(&self, cmd: &Command) -> Value {
        self.applied.lock().expect("applied lock").push(cmd.clone());
        match cmd.op {
            Op::Put => {
                self.state
                    .lock()
                    .expect("state lock")
                    .insert(cmd.key, cmd.value.clone());
                cmd.value.clone()
            }
            Op::Get => self
                .state
                .lock()
                .expect("state lock")
                .get(&cmd.key)
                .cloned()
                .unwrap_or_default(),
            Op::Noop => Vec::new(),
        }
    }
}
