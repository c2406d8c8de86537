//! Speculative reads served by the collocated replica.

mod common;

use common::{wait_for, TestCluster};
use paxoi_core::paxoi::{Command, Op};

#[tokio::test(flavor = "multi_thread")]
async fn collocated_read_executes_locally() {
    let cluster = TestCluster::with_config(3, |config| {
        config.fast_read = true;
    });

    // Seed the key through the normal write path.
    let mut writer = cluster.client(1);
    writer
        .invoke(Command::put(100, b"x".to_vec()))
        .await
        .expect("seed write");
    for (id, store) in cluster.stores.iter().enumerate() {
        let store = store.clone();
        wait_for(
            || store.get(100) == Some(b"x".to_vec()),
            &format!("replica {id} to apply the seed write"),
        )
        .await;
    }

    // The read goes to replica 2 only and is answered from its local state
    // once the conflicting write has been delivered there.
    let mut reader = cluster.client_at(2, Some(2), true);
    let value = reader
        .invoke(Command::get(100))
        .await
        .expect("local read");
    assert_eq!(value, b"x".to_vec());

    // No other replica executed the read.
    for id in [0usize, 1] {
        assert!(
            !cluster.stores[id]
                .applied()
                .iter()
                .any(|c| c.op == Op::Get),
            "replica {id} must not execute the read"
        );
    }
    assert!(cluster.stores[2]
        .applied()
        .iter()
        .any(|c| c.op == Op::Get));
}

#[tokio::test(flavor = "multi_thread")]
async fn read_waits_for_pending_conflicting_write() {
    let cluster = TestCluster::with_config(3, |config| {
        config.fast_read = true;
    });

    let mut writer = cluster.client(1);
    writer
        .invoke(Command::put(5, b"a".to_vec()))
        .await
        .expect("first write");

    // Issue a second write and immediately a collocated read; the read's
    // dependency set points at the write, so the returned value reflects it.
    writer
        .invoke(Command::put(5, b"b".to_vec()))
        .await
        .expect("second write");
    let store = cluster.stores[2].clone();
    wait_for(
        || store.get(5) == Some(b"b".to_vec()),
        "replica 2 to deliver the second write",
    )
    .await;

    let mut reader = cluster.client_at(2, Some(2), true);
    let value = reader.invoke(Command::get(5)).await.expect("read");
    assert_eq!(value, b"b".to_vec());
}
