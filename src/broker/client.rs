//! Wire-protocol client for broker-to-broker RPC.
//!
//! The controller uses it to push LeaderAndIsr to peers; follower
//! replicators use it to fetch from the partition leader. One cached
//! connection per client, re-established on failure. Every call carries a
//! deadline.

use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use nombytes::NomBytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::constants::{MAX_FRAME_SIZE, PEER_CONNECT_TIMEOUT_MS, PEER_RPC_TIMEOUT_MS};
use crate::error::{Error, Result};
use crate::protocol::{
    self, encode_request_frame, ApiKey, FetchRequest, FetchResponse, LeaderAndIsrRequest,
    LeaderAndIsrResponse, RequestHeader,
};
use crate::wire::ToByte;

pub struct PeerClient {
    addr: String,
    client_id: String,
    correlation: AtomicI32,
    conn: Mutex<Option<TcpStream>>,
}

impl PeerClient {
    pub fn new(addr: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            client_id: client_id.into(),
            correlation: AtomicI32::new(0),
            conn: Mutex::new(None),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Push partition state to a peer broker.
    pub async fn leader_and_isr(
        &self,
        request: &LeaderAndIsrRequest,
    ) -> Result<LeaderAndIsrResponse> {
        let body = self.call(ApiKey::LeaderAndIsr, request).await?;
        let (_, response) = protocol::parse_leader_and_isr_response(NomBytes::new(body.clone()))
            .map_err(|_| Error::Parsing(body))?;
        Ok(response)
    }

    /// Fetch records from the partition leader.
    pub async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
        let body = self.call(ApiKey::Fetch, request).await?;
        let (_, response) = protocol::parse_fetch_response(NomBytes::new(body.clone()))
            .map_err(|_| Error::Parsing(body))?;
        Ok(response)
    }

    async fn call<B: ToByte>(&self, api_key: ApiKey, body: &B) -> Result<Bytes> {
        let correlation_id = self.correlation.fetch_add(1, Ordering::Relaxed);
        let header = RequestHeader::new(api_key, correlation_id, self.client_id.clone());
        let frame = encode_request_frame(&header, body)?;

        let mut guard = self.conn.lock().await;
        if let Some(stream) = guard.as_mut() {
            if let Ok(response) = Self::exchange(stream, &frame, correlation_id).await {
                return Ok(response);
            }
            // stale connection; reconnect below
            *guard = None;
        }

        let mut stream = timeout(
            Duration::from_millis(PEER_CONNECT_TIMEOUT_MS),
            TcpStream::connect(&self.addr),
        )
        .await
        .map_err(|_| Error::Io(std::io::ErrorKind::TimedOut))?
        .map_err(Error::from)?;
        stream.set_nodelay(true)?;

        let response = Self::exchange(&mut stream, &frame, correlation_id).await?;
        *guard = Some(stream);
        Ok(response)
    }

    async fn exchange(
        stream: &mut TcpStream,
        frame: &[u8],
        correlation_id: i32,
    ) -> Result<Bytes> {
        timeout(Duration::from_millis(PEER_RPC_TIMEOUT_MS), async {
            stream.write_all(frame).await?;

            let mut len_buf = [0u8; 4];
            stream.read_exact(&mut len_buf).await?;
            let len = i32::from_be_bytes(len_buf);
            if len < 4 || len as usize > MAX_FRAME_SIZE {
                return Err(Error::MissingData(format!("bad response frame length {len}")));
            }

            let mut payload = vec![0u8; len as usize];
            stream.read_exact(&mut payload).await?;

            let echoed = i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
            if echoed != correlation_id {
                return Err(Error::MissingData(format!(
                    "correlation mismatch: sent {correlation_id}, got {echoed}"
                )));
            }
            Ok(Bytes::from(payload).slice(4..))
        })
        .await
        .map_err(|_| Error::Io(std::io::ErrorKind::TimedOut))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::protocol::{
        encode_response_frame, parse_request, FetchPartition, FetchTopic, RequestBody,
    };

    /// A scripted peer that answers one fetch with a canned response.
    async fn scripted_leader(response: crate::protocol::FetchResponse) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut len_buf = [0u8; 4];
            stream.read_exact(&mut len_buf).await.unwrap();
            let mut payload = vec![0u8; u32::from_be_bytes(len_buf) as usize];
            stream.read_exact(&mut payload).await.unwrap();

            let (header, body) = parse_request(Bytes::from(payload)).unwrap();
            assert!(matches!(body, RequestBody::Fetch(_)));

            let frame = encode_response_frame(header.correlation_id, &response).unwrap();
            stream.write_all(&frame).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn fetch_round_trip_against_scripted_leader() {
        let canned = crate::protocol::FetchResponse {
            throttle_time_ms: 0,
            topics: vec![crate::protocol::FetchTopicResponse {
                topic: "t".to_string(),
                partitions: vec![crate::protocol::FetchPartitionResponse {
                    partition: 0,
                    error_code: ErrorCode::None,
                    high_watermark: 7,
                    record_set: Bytes::from_static(&[1, 2, 3]),
                }],
            }],
        };
        let addr = scripted_leader(canned).await;

        let client = PeerClient::new(addr, "replicator-test");
        let response = client
            .fetch(&FetchRequest {
                replica_id: 2,
                max_wait_ms: 100,
                min_bytes: 1,
                topics: vec![FetchTopic {
                    topic: "t".to_string(),
                    partitions: vec![FetchPartition {
                        partition: 0,
                        fetch_offset: 0,
                        max_bytes: 1 << 20,
                    }],
                }],
            })
            .await
            .unwrap();

        assert_eq!(response.topics[0].partitions[0].high_watermark, 7);
        assert_eq!(
            response.topics[0].partitions[0].record_set.as_ref(),
            &[1, 2, 3]
        );
    }

    #[tokio::test]
    async fn connect_failure_surfaces_as_io_error() {
        // nothing listens on this port
        let client = PeerClient::new("127.0.0.1:1", "test");
        let result = client
            .fetch(&FetchRequest {
                replica_id: -1,
                max_wait_ms: 10,
                min_bytes: 1,
                topics: vec![],
            })
            .await;
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
