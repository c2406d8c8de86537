//! Shared helpers for cluster integration tests.

use std::sync::Arc;
use std::time::Duration;

use paxoi_core::curp::Client;
use paxoi_core::paxoi::testing::{InMemoryNetwork, KvStore};
use paxoi_core::paxoi::{ClientId, Config, Replica, ReplicaId};

/// Upper bound for any single convergence wait.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestCluster {
    pub net: Arc<InMemoryNetwork>,
    pub replicas: Vec<Arc<Replica>>,
    pub stores: Vec<Arc<KvStore>>,
}

impl TestCluster {
    /// N replicas over an in-memory network, default config.
    pub fn new(n: usize) -> Self {
        Self::with_config(n, |_| {})
    }

    /// N replicas with a per-replica config tweak applied before start.
    pub fn with_config(n: usize, tweak: impl Fn(&mut Config)) -> Self {
        let net = InMemoryNetwork::new();
        let mut replicas = Vec::with_capacity(n);
        let mut stores = Vec::with_capacity(n);
        for id in 0..n as ReplicaId {
            let mut config = Config::new(id, n);
            tweak(&mut config);
            let store = KvStore::new();
            let replica = Replica::new(
                config,
                net.replica_endpoint(id),
                store.clone(),
            )
            .expect("replica config");
            net.register_replica(id, replica.inbox());
            replica.start();
            replicas.push(replica);
            stores.push(store);
        }
        Self {
            net,
            replicas,
            stores,
        }
    }

    /// A client with uniform 1ms synthetic pings.
    pub fn client(&self, id: ClientId) -> Client {
        self.client_at(id, None, false)
    }

    pub fn client_at(
        &self,
        id: ClientId,
        collocated: Option<ReplicaId>,
        local_read: bool,
    ) -> Client {
        let inbox = self.net.register_client(id);
        Client::new(
            id,
            self.replicas.len(),
            vec![1.0; self.replicas.len()],
            collocated,
            local_read,
            self.net.client_endpoint(),
            inbox,
        )
    }
}

/// Poll `cond` until it holds or the timeout elapses.
pub async fn wait_for(mut cond: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
