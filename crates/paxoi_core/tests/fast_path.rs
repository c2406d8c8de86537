//! Fast-path certification over a healthy cluster.
//!
//! Flow: a client writes through a 4-replica cluster (fast quorum {0,1,2});
//! every fast-quorum member reports the leader's dependency view, the client
//! certifies on the fast path, and all replicas deliver in dependency order.

mod common;

use common::{wait_for, TestCluster};
use paxoi_core::paxoi::Command;

#[tokio::test(flavor = "multi_thread")]
async fn fast_path_write_delivers_everywhere() {
    let cluster = TestCluster::new(4);
    let mut client = cluster.client(1);

    let value = client
        .invoke(Command::put(100, b"x".to_vec()))
        .await
        .expect("write");
    assert_eq!(value, b"x".to_vec());
    assert_eq!(client.slow_paths(), 0);

    // Every replica eventually executes the write.
    for (id, store) in cluster.stores.iter().enumerate() {
        let store = store.clone();
        wait_for(
            || store.get(100) == Some(b"x".to_vec()),
            &format!("replica {id} to apply the write"),
        )
        .await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn sequential_writes_apply_in_issue_order_on_all_replicas() {
    let cluster = TestCluster::new(4);
    let mut client = cluster.client(1);

    const WRITES: usize = 20;
    for i in 0..WRITES {
        let value = format!("v{i}").into_bytes();
        let got = client
            .invoke(Command::put(7, value.clone()))
            .await
            .expect("write");
        assert_eq!(got, value);
    }
    // The client's sequence number advances once per delivered command.
    assert_eq!(client.next_seq_num() as usize, WRITES);
    assert_eq!(client.slow_paths(), 0);

    for (id, store) in cluster.stores.iter().enumerate() {
        let store = store.clone();
        wait_for(
            || store.applied().len() == WRITES,
            &format!("replica {id} to apply all writes"),
        )
        .await;
        // Same-key writes conflict pairwise, so execution order must match
        // issue order everywhere.
        let applied: Vec<_> = store
            .applied()
            .iter()
            .map(|c| c.value.clone())
            .collect();
        let expected: Vec<_> = (0..WRITES).map(|i| format!("v{i}").into_bytes()).collect();
        assert_eq!(applied, expected, "replica {id} applied out of order");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn history_retains_delivered_summaries() {
    let cluster = TestCluster::new(4);
    let mut client = cluster.client(1);

    client
        .invoke(Command::put(3, b"a".to_vec()))
        .await
        .expect("write");

    let leader = cluster.replicas[0].clone();
    wait_for(
        || leader.history_stats().0 == 1,
        "leader history to record the command",
    )
    .await;
    let (total, slow) = leader.history_stats();
    assert_eq!((total, slow), (1, 0));
}

#[tokio::test(flavor = "multi_thread")]
async fn commands_without_conflicts_run_on_independent_keys() {
    let cluster = TestCluster::new(4);
    let mut client = cluster.client(1);

    // Distinct keys never appear in each other's dependency sets, so each
    // write is unblocked immediately on commit.
    for key in [10u64, 11, 12, 13] {
        let got = client
            .invoke(Command::put(key, key.to_le_bytes().to_vec()))
            .await
            .expect("write");
        assert_eq!(got, key.to_le_bytes().to_vec());
    }
    assert_eq!(client.slow_paths(), 0);
}
