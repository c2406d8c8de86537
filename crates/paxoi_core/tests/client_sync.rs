//! Client timer fallback: when neither certification quorum converges in
//! the calibrated wait time, the client syncs with the leader directly.

mod common;

use common::TestCluster;
use paxoi_core::paxoi::Command;

#[tokio::test(flavor = "multi_thread")]
async fn timer_syncs_with_the_leader_when_acks_stall() {
    let cluster = TestCluster::new(5);

    // Followers 2..4 cannot reach the client; the two remaining acks are
    // short of both the fast (4) and ordered (3) quorums.
    for id in [2u32, 3, 4] {
        cluster.net.set_client_mute(id, true);
    }

    let mut client = cluster.client(1);
    let start = tokio::time::Instant::now();
    let value = client
        .invoke(Command::put(100, b"x".to_vec()))
        .await
        .expect("write via sync fallback");
    assert_eq!(value, b"x".to_vec());

    // Delivery had to wait for the timer to fire and the leader to answer
    // the sync.
    assert!(start.elapsed() >= std::time::Duration::from_millis(100));

    // Subsequent requests with full connectivity go back to the fast path.
    for id in [2u32, 3, 4] {
        cluster.net.set_client_mute(id, false);
    }
    let start = tokio::time::Instant::now();
    let value = client
        .invoke(Command::put(100, b"y".to_vec()))
        .await
        .expect("fast write");
    assert_eq!(value, b"y".to_vec());
    assert!(start.elapsed() < std::time::Duration::from_millis(100));
}
