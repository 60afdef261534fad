//! Shared harness for integration tests: broker spawning on ephemeral
//! ports and a minimal wire-protocol client.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nombytes::NomBytes;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use brokkr::broker::Broker;
use brokkr::config::BrokerConfig;
use brokkr::protocol::{self, ApiKey, RequestHeader};
use brokkr::server::Server;
use brokkr::wire::ToByte;

/// Reserve an ephemeral port by binding and immediately releasing it.
pub async fn reserve_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}

pub struct TestBroker {
    pub broker: Arc<Broker>,
    pub config: BrokerConfig,
    _data_dir: TempDir,
}

impl TestBroker {
    /// Start a full broker: raft, gossip, dispatcher and client listener.
    pub async fn spawn(id: i32, bootstrap: bool, dev_mode: bool, seeds: Vec<String>) -> Self {
        let data_dir = TempDir::new().unwrap();
        let config = BrokerConfig {
            id,
            data_dir: data_dir.path().to_path_buf(),
            addr: reserve_addr().await,
            raft_addr: reserve_addr().await,
            serf_addr: reserve_addr().await,
            start_join: seeds,
            max_segment_bytes: 1 << 20,
            max_log_bytes: -1,
            bootstrap,
            dev_mode,
        };

        let broker = Broker::new(config.clone()).await.unwrap();

        let (requests_tx, requests_rx) = mpsc::channel(256);
        let server = Server::bind(&config.addr, requests_tx).await.unwrap();
        let shutdown = broker.shutdown_signal();
        tokio::spawn(broker.clone().run(requests_rx));
        tokio::spawn(server.run(shutdown));

        Self {
            broker,
            config,
            _data_dir: data_dir,
        }
    }

    pub async fn wait_until_controller(&self) {
        wait_until(Duration::from_secs(10), || self.broker.is_controller()).await;
    }

    pub async fn client(&self) -> TestClient {
        TestClient::connect(&self.config.addr).await
    }
}

/// Poll a condition until it holds or the deadline passes.
pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// A bare-bones protocol client for driving a broker over TCP.
pub struct TestClient {
    stream: TcpStream,
    correlation: i32,
}

impl TestClient {
    pub async fn connect(addr: &str) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        stream.set_nodelay(true).unwrap();
        Self {
            stream,
            correlation: 0,
        }
    }

    async fn call<B: ToByte>(&mut self, api_key: ApiKey, body: &B) -> Bytes {
        self.correlation += 1;
        let header = RequestHeader::new(api_key, self.correlation, "test-client");
        let frame = protocol::encode_request_frame(&header, body).unwrap();
        self.stream.write_all(&frame).await.unwrap();

        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await.unwrap();
        let mut payload = vec![0u8; i32::from_be_bytes(len_buf) as usize];
        self.stream.read_exact(&mut payload).await.unwrap();

        let echoed = i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        assert_eq!(echoed, self.correlation, "correlation id mismatch");
        Bytes::from(payload).slice(4..)
    }

    pub async fn api_versions(&mut self) -> protocol::ApiVersionsResponse {
        let body = self
            .call(ApiKey::ApiVersions, &protocol::ApiVersionsRequest)
            .await;
        let (_, response) = protocol::parse_api_versions_response(NomBytes::new(body)).unwrap();
        response
    }

    pub async fn metadata(&mut self, topics: Vec<String>) -> protocol::MetadataResponse {
        let body = self
            .call(ApiKey::Metadata, &protocol::MetadataRequest { topics })
            .await;
        let (_, response) = protocol::parse_metadata_response(NomBytes::new(body)).unwrap();
        response
    }

    pub async fn create_topic(
        &mut self,
        topic: &str,
        num_partitions: i32,
        replication_factor: i16,
    ) -> protocol::CreateTopicsResponse {
        let request = protocol::CreateTopicsRequest {
            requests: vec![protocol::CreateTopicRequest {
                topic: topic.to_string(),
                num_partitions,
                replication_factor,
            }],
            timeout_ms: 10_000,
        };
        let body = self.call(ApiKey::CreateTopics, &request).await;
        let (_, response) = protocol::parse_create_topics_response(NomBytes::new(body)).unwrap();
        response
    }

    pub async fn delete_topics(&mut self, topics: Vec<String>) -> protocol::DeleteTopicsResponse {
        let request = protocol::DeleteTopicsRequest {
            topics,
            timeout_ms: 10_000,
        };
        let body = self.call(ApiKey::DeleteTopics, &request).await;
        let (_, response) = protocol::parse_delete_topics_response(NomBytes::new(body)).unwrap();
        response
    }

    pub async fn produce(
        &mut self,
        topic: &str,
        partition: i32,
        record_set: Vec<u8>,
    ) -> protocol::ProduceResponse {
        let request = protocol::ProduceRequest {
            acks: 1,
            timeout_ms: 10_000,
            topics: vec![protocol::ProduceTopicData {
                topic: topic.to_string(),
                partitions: vec![protocol::ProducePartitionData {
                    partition,
                    record_set: record_set.into(),
                }],
            }],
        };
        let body = self.call(ApiKey::Produce, &request).await;
        let (_, response) = protocol::parse_produce_response(NomBytes::new(body)).unwrap();
        response
    }

    pub async fn fetch(
        &mut self,
        topic: &str,
        partition: i32,
        fetch_offset: i64,
        min_bytes: i32,
        max_bytes: i32,
        max_wait_ms: i32,
    ) -> protocol::FetchResponse {
        let request = protocol::FetchRequest {
            replica_id: -1,
            max_wait_ms,
            min_bytes,
            topics: vec![protocol::FetchTopic {
                topic: topic.to_string(),
                partitions: vec![protocol::FetchPartition {
                    partition,
                    fetch_offset,
                    max_bytes,
                }],
            }],
        };
        let body = self.call(ApiKey::Fetch, &request).await;
        let (_, response) = protocol::parse_fetch_response(NomBytes::new(body)).unwrap();
        response
    }

    pub async fn offsets(
        &mut self,
        topic: &str,
        partition: i32,
        timestamp: i64,
    ) -> protocol::OffsetsResponse {
        let request = protocol::OffsetsRequest {
            replica_id: -1,
            topics: vec![protocol::OffsetsTopic {
                topic: topic.to_string(),
                partitions: vec![protocol::OffsetsPartition {
                    partition,
                    timestamp,
                    max_num_offsets: 1,
                }],
            }],
        };
        let body = self.call(ApiKey::Offsets, &request).await;
        let (_, response) = protocol::parse_offsets_response(NomBytes::new(body)).unwrap();
        response
    }
}
