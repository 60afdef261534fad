//! Multi-broker tests: gossip join, metadata replication, controller
//! fan-out and follower catch-up over real sockets.

mod common;

use std::time::Duration;

use brokkr::error::ErrorCode;
use brokkr::protocol::batch;
use common::TestBroker;

/// Wait for `condition` over an async state probe.
async fn wait_for<F, Fut>(timeout: Duration, mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if probe().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn two_broker_cluster() -> (TestBroker, TestBroker) {
    let a = TestBroker::spawn(1, true, false, vec![]).await;
    a.wait_until_controller().await;

    let b = TestBroker::spawn(2, false, false, vec![a.config.serf_addr.clone()]).await;

    // the controller registers the joiner and promotes it to a voter;
    // once the broker row shows up in b's store, log replication works
    wait_for(Duration::from_secs(15), || {
        let store = b.broker.store().clone();
        async move { store.get_node(2).await.is_some() }
    })
    .await;

    (a, b)
}

#[tokio::test]
async fn joiner_learns_cluster_metadata() {
    let (a, b) = two_broker_cluster().await;

    assert_eq!(a.broker.membership().num_members().await, 2);
    assert_eq!(b.broker.membership().num_members().await, 2);

    // both brokers know both broker rows through the replicated store
    for node in [&a, &b] {
        assert!(node.broker.store().get_node(1).await.is_some());
        assert!(node.broker.store().get_node(2).await.is_some());
    }
}

#[tokio::test]
async fn create_topics_on_non_controller_is_rejected() {
    let (a, b) = two_broker_cluster().await;
    assert!(!b.broker.is_controller());

    let mut client_b = b.client().await;
    let rejected = client_b.create_topic("t", 1, 1).await;
    assert_eq!(
        rejected.topic_errors[0].error_code,
        ErrorCode::NotController
    );

    let mut client_a = a.client().await;
    let accepted = client_a.create_topic("t", 1, 1).await;
    assert_eq!(accepted.topic_errors[0].error_code, ErrorCode::None);
}

#[tokio::test]
async fn follower_replicates_and_catches_up() {
    let (a, b) = two_broker_cluster().await;

    let mut client = a.client().await;
    let created = client.create_topic("t", 1, 2).await;
    assert_eq!(created.topic_errors[0].error_code, ErrorCode::None);

    // brokers sorted by id: partition 0 leads on broker 1
    let partition = a.broker.store().get_partition("t", 0).await.unwrap();
    assert_eq!(partition.leader, 1);
    assert_eq!(partition.replicas, vec![1, 2]);

    let mut produced = 0i64;
    for i in 0..100 {
        let set = batch::build_record_batch(&[format!("m{i}").as_bytes()]);
        let response = client.produce("t", 0, set).await;
        let p = &response.topics[0].partitions[0];
        assert_eq!(p.error_code, ErrorCode::None);
        assert_eq!(p.base_offset, produced);
        produced += 1;
    }

    // the follower pulls until its log end matches the leader's
    wait_for(Duration::from_secs(10), || {
        let replicas = b.broker.replicas();
        let handle = replicas.get("t", 0);
        async move {
            match handle {
                Some(handle) => {
                    let replica = handle.lock().await;
                    replica.log_end_offset() == 100
                }
                None => false,
            }
        }
    })
    .await;

    // and its high-water mark converges on the leader's
    wait_for(Duration::from_secs(5), || {
        let handle = b.broker.replicas().get("t", 0);
        async move {
            match handle {
                Some(handle) => handle.lock().await.high_watermark() == 100,
                None => false,
            }
        }
    })
    .await;

    // byte-for-byte identical logs
    let leader_log = {
        let handle = a.broker.replicas().get("t", 0).unwrap();
        let replica = handle.lock().await;
        replica.log.clone().unwrap()
    };
    let follower_log = {
        let handle = b.broker.replicas().get("t", 0).unwrap();
        let replica = handle.lock().await;
        replica.log.clone().unwrap()
    };
    let mut leader_bytes = Vec::new();
    let mut follower_bytes = Vec::new();
    std::io::Read::read_to_end(
        &mut leader_log.reader(0, i32::MAX).unwrap(),
        &mut leader_bytes,
    )
    .unwrap();
    std::io::Read::read_to_end(
        &mut follower_log.reader(0, i32::MAX).unwrap(),
        &mut follower_bytes,
    )
    .unwrap();
    assert_eq!(leader_bytes, follower_bytes);
}

#[tokio::test]
async fn fetch_from_follower_is_redirected() {
    let (a, b) = two_broker_cluster().await;

    let mut client_a = a.client().await;
    client_a.create_topic("t", 1, 2).await;
    let set = batch::build_record_batch(&[b"only"]);
    client_a.produce("t", 0, set).await;

    // wait for the follower replica to exist before poking it
    wait_for(Duration::from_secs(5), || {
        let exists = b.broker.replicas().get("t", 0).is_some();
        async move { exists }
    })
    .await;

    // the follower hosts the partition but refuses consumer fetches
    let mut client_b = b.client().await;
    let fetched = client_b.fetch("t", 0, 0, 1, 1 << 20, 100).await;
    assert_eq!(
        fetched.topics[0].partitions[0].error_code,
        ErrorCode::NotLeaderForPartition
    );
}
