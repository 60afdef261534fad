//! End-to-end tests against one bootstrapped broker over real TCP.

mod common;

use std::time::Duration;

use brokkr::error::ErrorCode;
use brokkr::protocol::batch;
use common::TestBroker;

#[tokio::test]
async fn api_versions_advertises_supported_apis() {
    let node = TestBroker::spawn(1, true, false, vec![]).await;
    let mut client = node.client().await;

    let response = client.api_versions().await;
    assert_eq!(response.error_code, ErrorCode::None);
    let keys: Vec<i16> = response.api_versions.iter().map(|v| v.api_key).collect();
    assert!(keys.contains(&0), "produce missing");
    assert!(keys.contains(&1), "fetch missing");
    assert!(keys.contains(&19), "create topics missing");
}

#[tokio::test]
async fn create_produce_fetch_round_trip() {
    let node = TestBroker::spawn(1, true, false, vec![]).await;
    node.wait_until_controller().await;
    let mut client = node.client().await;

    let created = client.create_topic("t", 1, 1).await;
    assert_eq!(created.topic_errors[0].error_code, ErrorCode::None);

    let record_set = batch::build_record_batch(&[b"a", b"b", b"c"]);
    let produced = client.produce("t", 0, record_set.clone()).await;
    let p = &produced.topics[0].partitions[0];
    assert_eq!(p.error_code, ErrorCode::None);
    assert_eq!(p.base_offset, 0);

    let fetched = client.fetch("t", 0, 0, 1, 1 << 20, 1_000).await;
    let p = &fetched.topics[0].partitions[0];
    assert_eq!(p.error_code, ErrorCode::None);
    assert_eq!(p.high_watermark, 3);

    // the returned bytes are exactly the produced batch with offsets
    // assigned from zero
    let mut expected = record_set;
    batch::assign_offsets(&mut expected, 0);
    assert_eq!(p.record_set.as_ref(), expected.as_slice());
    assert_eq!(batch::count_records(&p.record_set), 3);
    assert_eq!(batch::base_offset(&p.record_set), 0);
}

#[tokio::test]
async fn produce_appends_are_dense_and_ordered() {
    let node = TestBroker::spawn(1, true, false, vec![]).await;
    node.wait_until_controller().await;
    let mut client = node.client().await;
    client.create_topic("t", 1, 1).await;

    for expected_base in 0..10i64 {
        let set = batch::build_record_batch(&[format!("m{expected_base}").as_bytes()]);
        let produced = client.produce("t", 0, set).await;
        assert_eq!(
            produced.topics[0].partitions[0].base_offset,
            expected_base
        );
    }
}

#[tokio::test]
async fn offsets_sentinels() {
    let node = TestBroker::spawn(1, true, false, vec![]).await;
    node.wait_until_controller().await;
    let mut client = node.client().await;
    client.create_topic("t", 1, 1).await;

    for i in 0..5 {
        let set = batch::build_record_batch(&[format!("m{i}").as_bytes()]);
        client.produce("t", 0, set).await;
    }

    let earliest = client.offsets("t", 0, -2).await;
    assert_eq!(earliest.topics[0].partitions[0].offsets, vec![0]);

    let latest = client.offsets("t", 0, -1).await;
    assert_eq!(latest.topics[0].partitions[0].offsets, vec![5]);
}

#[tokio::test]
async fn duplicate_create_is_rejected() {
    let node = TestBroker::spawn(1, true, false, vec![]).await;
    node.wait_until_controller().await;
    let mut client = node.client().await;

    assert_eq!(
        client.create_topic("t", 1, 1).await.topic_errors[0].error_code,
        ErrorCode::None
    );
    assert_eq!(
        client.create_topic("t", 1, 1).await.topic_errors[0].error_code,
        ErrorCode::TopicAlreadyExists
    );
}

#[tokio::test]
async fn replication_factor_above_member_count_is_rejected() {
    let node = TestBroker::spawn(1, true, false, vec![]).await;
    node.wait_until_controller().await;
    let mut client = node.client().await;

    let response = client.create_topic("t", 1, 3).await;
    assert_eq!(
        response.topic_errors[0].error_code,
        ErrorCode::InvalidReplicationFactor
    );
}

#[tokio::test]
async fn produce_to_unknown_topic_is_rejected() {
    let node = TestBroker::spawn(1, true, false, vec![]).await;
    node.wait_until_controller().await;
    let mut client = node.client().await;

    let set = batch::build_record_batch(&[b"x"]);
    let produced = client.produce("missing", 0, set).await;
    assert_eq!(
        produced.topics[0].partitions[0].error_code,
        ErrorCode::UnknownTopicOrPartition
    );
}

#[tokio::test]
async fn fetch_from_unhosted_partition_is_rejected() {
    let node = TestBroker::spawn(1, true, false, vec![]).await;
    node.wait_until_controller().await;
    let mut client = node.client().await;

    let fetched = client.fetch("missing", 0, 0, 1, 1 << 20, 50).await;
    assert_eq!(
        fetched.topics[0].partitions[0].error_code,
        ErrorCode::ReplicaNotAvailable
    );
}

#[tokio::test]
async fn fetch_past_log_end_waits_then_returns_empty() {
    let node = TestBroker::spawn(1, true, false, vec![]).await;
    node.wait_until_controller().await;
    let mut client = node.client().await;
    client.create_topic("t", 1, 1).await;

    let start = std::time::Instant::now();
    let fetched = client.fetch("t", 0, 0, 1, 1 << 20, 200).await;
    let waited = start.elapsed();

    let p = &fetched.topics[0].partitions[0];
    assert_eq!(p.error_code, ErrorCode::None);
    assert!(p.record_set.is_empty());
    assert_eq!(p.high_watermark, 0);
    assert!(waited >= Duration::from_millis(150), "fetch returned early");
}

#[tokio::test]
async fn metadata_lists_brokers_and_partitions() {
    let node = TestBroker::spawn(1, true, false, vec![]).await;
    node.wait_until_controller().await;
    let mut client = node.client().await;
    client.create_topic("t", 2, 1).await;

    let metadata = client.metadata(vec![]).await;
    assert_eq!(metadata.brokers.len(), 1);
    assert_eq!(metadata.brokers[0].node_id, 1);

    let topic = metadata.topics.iter().find(|t| t.topic == "t").unwrap();
    assert_eq!(topic.error_code, ErrorCode::None);
    assert_eq!(topic.partitions.len(), 2);
    for partition in &topic.partitions {
        assert_eq!(partition.leader, 1);
        assert_eq!(partition.replicas, vec![1]);
        assert_eq!(partition.isr, vec![1]);
    }
}

#[tokio::test]
async fn metadata_for_missing_topic_carries_error_code() {
    let node = TestBroker::spawn(1, true, false, vec![]).await;
    node.wait_until_controller().await;
    let mut client = node.client().await;

    let metadata = client.metadata(vec!["nope".to_string()]).await;
    let topic = &metadata.topics[0];
    assert_eq!(topic.topic, "nope");
    assert_eq!(topic.error_code, ErrorCode::UnknownTopicOrPartition);
}

#[tokio::test]
async fn delete_topic_removes_metadata() {
    let node = TestBroker::spawn(1, true, false, vec![]).await;
    node.wait_until_controller().await;
    let mut client = node.client().await;
    client.create_topic("t", 1, 1).await;

    let deleted = client.delete_topics(vec!["t".to_string()]).await;
    assert_eq!(deleted.topic_errors[0].error_code, ErrorCode::None);

    // the controller's apply is synchronous with the proposal
    assert!(node.broker.store().get_topic("t").await.is_none());
    assert!(node.broker.store().get_partition("t", 0).await.is_none());

    let metadata = client.metadata(vec![]).await;
    assert!(metadata.topics.iter().all(|t| t.topic != "t"));
}
