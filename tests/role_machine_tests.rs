//! Partition role machine behavior, driven through the broker's handlers
//! in dev mode (replicators are constructed but never started).

mod common;

use std::time::Duration;

use brokkr::cluster::{BrokerStatus, Member};
use brokkr::error::ErrorCode;
use brokkr::protocol::batch;
use brokkr::protocol::{
    CreateTopicRequest, CreateTopicsRequest, DeleteTopicsRequest, LeaderAndIsrRequest,
    PartitionState, ProducePartitionData, ProduceRequest, ProduceTopicData,
};
use common::{wait_until, TestBroker};

fn fake_member(id: i32) -> Member {
    Member {
        id,
        addr: format!("127.0.0.1:{}", 40000 + id),
        raft_addr: format!("127.0.0.1:{}", 41000 + id),
        serf_addr: format!("127.0.0.1:{}", 42000 + id),
        status: BrokerStatus::Alive,
    }
}

fn partition_state(
    topic: &str,
    controller_epoch: i32,
    leader: i32,
    leader_epoch: i32,
    replicas: Vec<i32>,
) -> LeaderAndIsrRequest {
    LeaderAndIsrRequest {
        controller_id: leader,
        controller_epoch,
        partition_states: vec![PartitionState {
            topic: topic.to_string(),
            partition: 0,
            controller_epoch,
            leader,
            leader_epoch,
            isr: replicas.clone(),
            replicas,
        }],
    }
}

async fn produce_one(node: &TestBroker, topic: &str, value: &[u8]) -> i64 {
    let response = node
        .broker
        .handle_produce(ProduceRequest {
            acks: 1,
            timeout_ms: 1_000,
            topics: vec![ProduceTopicData {
                topic: topic.to_string(),
                partitions: vec![ProducePartitionData {
                    partition: 0,
                    record_set: batch::build_record_batch(&[value]).into(),
                }],
            }],
        })
        .await;
    let p = &response.topics[0].partitions[0];
    assert_eq!(p.error_code, ErrorCode::None);
    p.base_offset
}

#[tokio::test]
async fn non_controller_rejects_topic_management() {
    // never bootstrapped: this broker can never be the Raft leader
    let node = TestBroker::spawn(1, false, true, vec![]).await;
    assert!(!node.broker.is_controller());

    let created = node
        .broker
        .handle_create_topics(CreateTopicsRequest {
            requests: vec![
                CreateTopicRequest {
                    topic: "a".to_string(),
                    num_partitions: 1,
                    replication_factor: 1,
                },
                CreateTopicRequest {
                    topic: "b".to_string(),
                    num_partitions: 2,
                    replication_factor: 1,
                },
            ],
            timeout_ms: 1_000,
        })
        .await;
    for topic_error in &created.topic_errors {
        assert_eq!(topic_error.error_code, ErrorCode::NotController);
    }

    let deleted = node
        .broker
        .handle_delete_topics(DeleteTopicsRequest {
            topics: vec!["a".to_string()],
            timeout_ms: 1_000,
        })
        .await;
    assert_eq!(
        deleted.topic_errors[0].error_code,
        ErrorCode::NotController
    );
}

#[tokio::test]
async fn leader_and_isr_for_unknown_topic_fails() {
    let node = TestBroker::spawn(1, true, true, vec![]).await;
    node.wait_until_controller().await;

    let response = node
        .broker
        .handle_leader_and_isr(partition_state("ghost", 1, 1, 0, vec![1]))
        .await;
    assert_eq!(
        response.partitions[0].error_code,
        ErrorCode::UnknownTopicOrPartition
    );
}

#[tokio::test]
async fn stale_controller_epoch_is_rejected() {
    let node = TestBroker::spawn(1, true, true, vec![]).await;
    node.wait_until_controller().await;
    let mut client = node.client().await;
    assert_eq!(
        client.create_topic("t", 1, 1).await.topic_errors[0].error_code,
        ErrorCode::None
    );

    // a later controller epoch supersedes...
    let response = node
        .broker
        .handle_leader_and_isr(partition_state("t", 50, 1, 1, vec![1]))
        .await;
    assert_eq!(response.partitions[0].error_code, ErrorCode::None);

    // ...and an older one is refused
    let response = node
        .broker
        .handle_leader_and_isr(partition_state("t", 49, 1, 2, vec![1]))
        .await;
    assert_eq!(
        response.partitions[0].error_code,
        ErrorCode::StaleControllerEpoch
    );
}

#[tokio::test]
async fn follower_truncates_uncommitted_suffix_on_leader_change() {
    let node = TestBroker::spawn(1, true, true, vec![]).await;
    node.wait_until_controller().await;
    let mut client = node.client().await;
    client.create_topic("t", 1, 1).await;

    for i in 0..10 {
        assert_eq!(produce_one(&node, "t", format!("m{i}").as_bytes()).await, i);
    }

    // the controller hands leadership to broker 99; this broker follows
    node.broker.broker_lookup().add_broker(fake_member(99));
    let epoch = 100;
    let response = node
        .broker
        .handle_leader_and_isr(partition_state("t", epoch, 99, 1, vec![99, 1]))
        .await;
    assert_eq!(response.partitions[0].error_code, ErrorCode::None);

    let handle = node.broker.replicas().get("t", 0).unwrap();
    {
        let replica = handle.lock().await;
        assert_eq!(replica.partition.leader, 99);
        // leader transition kept the whole committed log: the old leader's
        // high-water mark equalled its log end
        assert_eq!(replica.log_end_offset(), 10);
        assert_eq!(replica.high_watermark(), 10);
        let replicator = replica.replicator.as_ref().unwrap();
        assert_eq!(replicator.leader_id(), 99);
        assert!(!replicator.is_running(), "dev mode must not start the loop");
    }

    // simulate replicated-but-uncommitted records from 99's term: the log
    // grows past the high-water mark
    {
        let replica = handle.lock().await;
        let log = replica.log.clone().unwrap();
        let mut set = batch::build_record_batch(&[b"u1", b"u2"]);
        log.append(&mut set).unwrap();
        assert_eq!(log.newest_offset(), 12);
    }

    // 99 dies; 100 takes over. Following the new leader discards the
    // suffix past the high-water mark before replication resumes.
    node.broker.broker_lookup().add_broker(fake_member(100));
    let response = node
        .broker
        .handle_leader_and_isr(partition_state("t", epoch + 1, 100, 2, vec![100, 1]))
        .await;
    assert_eq!(response.partitions[0].error_code, ErrorCode::None);

    let replica = handle.lock().await;
    assert_eq!(replica.partition.leader, 100);
    assert_eq!(replica.log_end_offset(), 10, "uncommitted suffix kept");
    assert_eq!(replica.high_watermark(), 10);
}

#[tokio::test]
async fn becoming_leader_again_drops_the_replicator() {
    let node = TestBroker::spawn(1, true, true, vec![]).await;
    node.wait_until_controller().await;
    let mut client = node.client().await;
    client.create_topic("t", 1, 1).await;

    node.broker.broker_lookup().add_broker(fake_member(99));
    node.broker
        .handle_leader_and_isr(partition_state("t", 10, 99, 1, vec![99, 1]))
        .await;
    {
        let handle = node.broker.replicas().get("t", 0).unwrap();
        assert!(handle.lock().await.replicator.is_some());
    }

    let response = node
        .broker
        .handle_leader_and_isr(partition_state("t", 11, 1, 2, vec![1, 99]))
        .await;
    assert_eq!(response.partitions[0].error_code, ErrorCode::None);

    let handle = node.broker.replicas().get("t", 0).unwrap();
    let replica = handle.lock().await;
    assert!(replica.is_leader());
    assert!(replica.replicator.is_none());
    assert_eq!(replica.partition.leader_epoch, 2);
}

#[tokio::test]
async fn repeated_partition_state_is_a_noop() {
    let node = TestBroker::spawn(1, true, true, vec![]).await;
    node.wait_until_controller().await;
    let mut client = node.client().await;
    client.create_topic("t", 1, 1).await;

    produce_one(&node, "t", b"x").await;

    // re-sending the current state must not disturb the replica
    let epoch = 75;
    let first = node
        .broker
        .handle_leader_and_isr(partition_state("t", epoch, 1, 1, vec![1]))
        .await;
    assert_eq!(first.partitions[0].error_code, ErrorCode::None);
    let again = node
        .broker
        .handle_leader_and_isr(partition_state("t", epoch, 1, 1, vec![1]))
        .await;
    assert_eq!(again.partitions[0].error_code, ErrorCode::None);

    let handle = node.broker.replicas().get("t", 0).unwrap();
    let replica = handle.lock().await;
    assert!(replica.is_leader());
    assert_eq!(replica.log_end_offset(), 1);
}

#[tokio::test]
async fn controller_readiness_follows_leadership() {
    let node = TestBroker::spawn(1, true, true, vec![]).await;
    node.wait_until_controller().await;

    // the barrier commits shortly after election
    let broker = node.broker.clone();
    wait_until(Duration::from_secs(5), move || {
        broker.is_ready_for_consistent_reads()
    })
    .await;
}
