//! Slow-path reclassification: dependency disagreement and checksum
//! divergence.
//!
//! Both tests seed one replica with a conflicting propose it alone has seen,
//! then issue a client write on the same key. The seeded replica's local
//! view disagrees with the leader's, so its client-facing ack flips to the
//! slow signal while the command still commits with the leader's dep.

mod common;

use common::{wait_for, TestCluster};
use paxoi_core::paxoi::{Command, CommandId, PeerMsg, Propose};

fn seed_propose(seq: u32) -> Propose {
    Propose {
        cmd_id: CommandId {
            client_id: 99,
            seq_num: seq,
        },
        command: Command::put(100, b"seed".to_vec()),
        collocated: false,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn dep_disagreement_takes_the_slow_path() {
    let cluster = TestCluster::new(4);

    // Replica 1 alone sees a pending conflicting propose on key 100, so its
    // dependency view for the next write differs from the leader's.
    cluster.replicas[1]
        .inbox()
        .deliver(PeerMsg::Propose(seed_propose(1)));
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let mut client = cluster.client(1);
    let value = client
        .invoke(Command::put(100, b"x".to_vec()))
        .await
        .expect("write");
    assert_eq!(value, b"x".to_vec());
    assert_eq!(client.slow_paths(), 1);

    // The command commits with the leader's dep and executes everywhere,
    // including on the disagreeing replica.
    let store = cluster.stores[1].clone();
    wait_for(
        || store.get(100) == Some(b"x".to_vec()),
        "disagreeing replica to deliver with the leader's dep",
    )
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn checksum_divergence_is_corrected_once() {
    let cluster = TestCluster::new(4);

    // Replica 3 is outside both quorums; a propose only it has seen leaves
    // its per-key checksum chain stale relative to the leader's.
    cluster.replicas[3]
        .inbox()
        .deliver(PeerMsg::Propose(seed_propose(1)));
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    // Mute the agreeing followers toward the client so certification has to
    // wait for the sync fallback; the corrective signal from replica 3 is
    // then guaranteed to arrive first.
    cluster.net.set_client_mute(1, true);
    cluster.net.set_client_mute(2, true);

    let mut client = cluster.client(1);
    client
        .invoke(Command::put(100, b"x".to_vec()))
        .await
        .expect("first write");
    // The stale replica detected the divergence against the leader's
    // checksum and flagged the command slow.
    assert_eq!(client.slow_paths(), 1);

    // The correction resynchronized the checksum chain, so the next write
    // on the same key produces no further corrective signal.
    cluster.net.set_client_mute(1, false);
    cluster.net.set_client_mute(2, false);
    client
        .invoke(Command::put(100, b"y".to_vec()))
        .await
        .expect("second write");
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(client.slow_paths(), 1);
}
