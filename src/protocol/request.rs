//! Typed request bodies: nom parsers for the server side, `ToByte`
//! encoders for the intra-cluster client and tests.

use bytes::Bytes;
use nom::number::complete::{be_i16, be_i32, be_i64};
use nom::IResult;
use nombytes::NomBytes;

use crate::error::Result;
use crate::wire::{
    bytes_to_string, encode_array, encode_i32_array, parse_array, parse_bytes, parse_i32_array,
    parse_string, ToByte,
};

// =============================================================================
// ApiVersions (v0)
// =============================================================================

/// ApiVersions carries no body in v0.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiVersionsRequest;

impl ToByte for ApiVersionsRequest {
    fn encode<W: bytes::BufMut>(&self, _buffer: &mut W) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Metadata (v0)
// =============================================================================

/// Metadata request: an empty topic list asks for every topic.
#[derive(Debug, Clone, Default)]
pub struct MetadataRequest {
    pub topics: Vec<String>,
}

pub fn parse_metadata_request(s: NomBytes) -> IResult<NomBytes, MetadataRequest> {
    let (s, topics) = parse_array(parse_string)(s)?;
    let topics = topics
        .iter()
        .map(bytes_to_string)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok((s, MetadataRequest { topics }))
}

impl ToByte for MetadataRequest {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        encode_array(buffer, &self.topics)
    }
}

// =============================================================================
// Produce (v2)
// =============================================================================

#[derive(Debug, Clone)]
pub struct ProduceRequest {
    pub acks: i16,
    pub timeout_ms: i32,
    pub topics: Vec<ProduceTopicData>,
}

#[derive(Debug, Clone)]
pub struct ProduceTopicData {
    pub topic: String,
    pub partitions: Vec<ProducePartitionData>,
}

#[derive(Debug, Clone)]
pub struct ProducePartitionData {
    pub partition: i32,
    pub record_set: Bytes,
}

pub fn parse_produce_request(s: NomBytes) -> IResult<NomBytes, ProduceRequest> {
    let (s, acks) = be_i16(s)?;
    let (s, timeout_ms) = be_i32(s)?;
    let (s, topics) = parse_array(parse_produce_topic)(s)?;
    Ok((
        s,
        ProduceRequest {
            acks,
            timeout_ms,
            topics,
        },
    ))
}

fn parse_produce_topic(s: NomBytes) -> IResult<NomBytes, ProduceTopicData> {
    let (s, topic) = parse_string(s)?;
    let (s, partitions) = parse_array(parse_produce_partition)(s)?;
    Ok((
        s,
        ProduceTopicData {
            topic: bytes_to_string(&topic)?,
            partitions,
        },
    ))
}

fn parse_produce_partition(s: NomBytes) -> IResult<NomBytes, ProducePartitionData> {
    let (s, partition) = be_i32(s)?;
    let (s, record_set) = parse_bytes(s)?;
    Ok((
        s,
        ProducePartitionData {
            partition,
            record_set,
        },
    ))
}

impl ToByte for ProduceRequest {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.acks.encode(buffer)?;
        self.timeout_ms.encode(buffer)?;
        encode_array(buffer, &self.topics)
    }
}

impl ToByte for ProduceTopicData {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.topic.encode(buffer)?;
        encode_array(buffer, &self.partitions)
    }
}

impl ToByte for ProducePartitionData {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.partition.encode(buffer)?;
        self.record_set.encode(buffer)
    }
}

// =============================================================================
// Fetch (v1)
// =============================================================================

#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// -1 for consumers; the follower's broker id for replica fetches.
    pub replica_id: i32,
    pub max_wait_ms: i32,
    pub min_bytes: i32,
    pub topics: Vec<FetchTopic>,
}

#[derive(Debug, Clone)]
pub struct FetchTopic {
    pub topic: String,
    pub partitions: Vec<FetchPartition>,
}

#[derive(Debug, Clone)]
pub struct FetchPartition {
    pub partition: i32,
    pub fetch_offset: i64,
    pub max_bytes: i32,
}

pub fn parse_fetch_request(s: NomBytes) -> IResult<NomBytes, FetchRequest> {
    let (s, replica_id) = be_i32(s)?;
    let (s, max_wait_ms) = be_i32(s)?;
    let (s, min_bytes) = be_i32(s)?;
    let (s, topics) = parse_array(parse_fetch_topic)(s)?;
    Ok((
        s,
        FetchRequest {
            replica_id,
            max_wait_ms,
            min_bytes,
            topics,
        },
    ))
}

fn parse_fetch_topic(s: NomBytes) -> IResult<NomBytes, FetchTopic> {
    let (s, topic) = parse_string(s)?;
    let (s, partitions) = parse_array(parse_fetch_partition)(s)?;
    Ok((
        s,
        FetchTopic {
            topic: bytes_to_string(&topic)?,
            partitions,
        },
    ))
}

fn parse_fetch_partition(s: NomBytes) -> IResult<NomBytes, FetchPartition> {
    let (s, partition) = be_i32(s)?;
    let (s, fetch_offset) = be_i64(s)?;
    let (s, max_bytes) = be_i32(s)?;
    Ok((
        s,
        FetchPartition {
            partition,
            fetch_offset,
            max_bytes,
        },
    ))
}

impl ToByte for FetchRequest {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.replica_id.encode(buffer)?;
        self.max_wait_ms.encode(buffer)?;
        self.min_bytes.encode(buffer)?;
        encode_array(buffer, &self.topics)
    }
}

impl ToByte for FetchTopic {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.topic.encode(buffer)?;
        encode_array(buffer, &self.partitions)
    }
}

impl ToByte for FetchPartition {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.partition.encode(buffer)?;
        self.fetch_offset.encode(buffer)?;
        self.max_bytes.encode(buffer)
    }
}

// =============================================================================
// Offsets (v0)
// =============================================================================

#[derive(Debug, Clone)]
pub struct OffsetsRequest {
    pub replica_id: i32,
    pub topics: Vec<OffsetsTopic>,
}

#[derive(Debug, Clone)]
pub struct OffsetsTopic {
    pub topic: String,
    pub partitions: Vec<OffsetsPartition>,
}

#[derive(Debug, Clone)]
pub struct OffsetsPartition {
    pub partition: i32,
    /// -2 asks for the oldest retained offset, anything else the newest.
    pub timestamp: i64,
    pub max_num_offsets: i32,
}

pub fn parse_offsets_request(s: NomBytes) -> IResult<NomBytes, OffsetsRequest> {
    let (s, replica_id) = be_i32(s)?;
    let (s, topics) = parse_array(parse_offsets_topic)(s)?;
    Ok((s, OffsetsRequest { replica_id, topics }))
}

fn parse_offsets_topic(s: NomBytes) -> IResult<NomBytes, OffsetsTopic> {
    let (s, topic) = parse_string(s)?;
    let (s, partitions) = parse_array(parse_offsets_partition)(s)?;
    Ok((
        s,
        OffsetsTopic {
            topic: bytes_to_string(&topic)?,
            partitions,
        },
    ))
}

fn parse_offsets_partition(s: NomBytes) -> IResult<NomBytes, OffsetsPartition> {
    let (s, partition) = be_i32(s)?;
    let (s, timestamp) = be_i64(s)?;
    let (s, max_num_offsets) = be_i32(s)?;
    Ok((
        s,
        OffsetsPartition {
            partition,
            timestamp,
            max_num_offsets,
        },
    ))
}

impl ToByte for OffsetsRequest {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.replica_id.encode(buffer)?;
        encode_array(buffer, &self.topics)
    }
}

impl ToByte for OffsetsTopic {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.topic.encode(buffer)?;
        encode_array(buffer, &self.partitions)
    }
}

impl ToByte for OffsetsPartition {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.partition.encode(buffer)?;
        self.timestamp.encode(buffer)?;
        self.max_num_offsets.encode(buffer)
    }
}

// =============================================================================
// CreateTopics (v0)
// =============================================================================

#[derive(Debug, Clone)]
pub struct CreateTopicsRequest {
    pub requests: Vec<CreateTopicRequest>,
    pub timeout_ms: i32,
}

#[derive(Debug, Clone)]
pub struct CreateTopicRequest {
    pub topic: String,
    pub num_partitions: i32,
    pub replication_factor: i16,
}

pub fn parse_create_topics_request(s: NomBytes) -> IResult<NomBytes, CreateTopicsRequest> {
    let (s, requests) = parse_array(parse_create_topic)(s)?;
    let (s, timeout_ms) = be_i32(s)?;
    Ok((
        s,
        CreateTopicsRequest {
            requests,
            timeout_ms,
        },
    ))
}

fn parse_create_topic(s: NomBytes) -> IResult<NomBytes, CreateTopicRequest> {
    let (s, topic) = parse_string(s)?;
    let (s, num_partitions) = be_i32(s)?;
    let (s, replication_factor) = be_i16(s)?;
    // v0 assignment and config arrays; accepted and ignored
    let (s, _assignments) = parse_array(parse_assignment)(s)?;
    let (s, _configs) = parse_array(parse_config_entry)(s)?;
    Ok((
        s,
        CreateTopicRequest {
            topic: bytes_to_string(&topic)?,
            num_partitions,
            replication_factor,
        },
    ))
}

fn parse_assignment(s: NomBytes) -> IResult<NomBytes, ()> {
    let (s, _partition) = be_i32(s)?;
    let (s, _replicas) = parse_i32_array(s)?;
    Ok((s, ()))
}

fn parse_config_entry(s: NomBytes) -> IResult<NomBytes, ()> {
    let (s, _key) = parse_string(s)?;
    let (s, _value) = parse_string(s)?;
    Ok((s, ()))
}

impl ToByte for CreateTopicsRequest {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        encode_array(buffer, &self.requests)?;
        self.timeout_ms.encode(buffer)
    }
}

impl ToByte for CreateTopicRequest {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.topic.encode(buffer)?;
        self.num_partitions.encode(buffer)?;
        self.replication_factor.encode(buffer)?;
        0i32.encode(buffer)?; // no explicit assignments
        0i32.encode(buffer) // no configs
    }
}

// =============================================================================
// DeleteTopics (v0)
// =============================================================================

#[derive(Debug, Clone)]
pub struct DeleteTopicsRequest {
    pub topics: Vec<String>,
    pub timeout_ms: i32,
}

pub fn parse_delete_topics_request(s: NomBytes) -> IResult<NomBytes, DeleteTopicsRequest> {
    let (s, topics) = parse_array(parse_string)(s)?;
    let (s, timeout_ms) = be_i32(s)?;
    let topics = topics
        .iter()
        .map(bytes_to_string)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok((s, DeleteTopicsRequest { topics, timeout_ms }))
}

impl ToByte for DeleteTopicsRequest {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        encode_array(buffer, &self.topics)?;
        self.timeout_ms.encode(buffer)
    }
}

// =============================================================================
// LeaderAndIsr (v0, intra-cluster)
// =============================================================================

#[derive(Debug, Clone)]
pub struct LeaderAndIsrRequest {
    pub controller_id: i32,
    pub controller_epoch: i32,
    pub partition_states: Vec<PartitionState>,
}

/// The desired state of one partition, as dictated by the controller.
#[derive(Debug, Clone)]
pub struct PartitionState {
    pub topic: String,
    pub partition: i32,
    pub controller_epoch: i32,
    pub leader: i32,
    pub leader_epoch: i32,
    pub isr: Vec<i32>,
    pub replicas: Vec<i32>,
}

pub fn parse_leader_and_isr_request(s: NomBytes) -> IResult<NomBytes, LeaderAndIsrRequest> {
    let (s, controller_id) = be_i32(s)?;
    let (s, controller_epoch) = be_i32(s)?;
    let (s, partition_states) = parse_array(parse_partition_state)(s)?;
    Ok((
        s,
        LeaderAndIsrRequest {
            controller_id,
            controller_epoch,
            partition_states,
        },
    ))
}

fn parse_partition_state(s: NomBytes) -> IResult<NomBytes, PartitionState> {
    let (s, topic) = parse_string(s)?;
    let (s, partition) = be_i32(s)?;
    let (s, controller_epoch) = be_i32(s)?;
    let (s, leader) = be_i32(s)?;
    let (s, leader_epoch) = be_i32(s)?;
    let (s, isr) = parse_i32_array(s)?;
    let (s, replicas) = parse_i32_array(s)?;
    Ok((
        s,
        PartitionState {
            topic: bytes_to_string(&topic)?,
            partition,
            controller_epoch,
            leader,
            leader_epoch,
            isr,
            replicas,
        },
    ))
}

impl ToByte for LeaderAndIsrRequest {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.controller_id.encode(buffer)?;
        self.controller_epoch.encode(buffer)?;
        encode_array(buffer, &self.partition_states)
    }
}

impl ToByte for PartitionState {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.topic.encode(buffer)?;
        self.partition.encode(buffer)?;
        self.controller_epoch.encode(buffer)?;
        self.leader.encode(buffer)?;
        self.leader_epoch.encode(buffer)?;
        encode_i32_array(buffer, &self.isr)?;
        encode_i32_array(buffer, &self.replicas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<B, P, O>(body: &B, parser: P) -> O
    where
        B: ToByte,
        P: Fn(NomBytes) -> IResult<NomBytes, O>,
    {
        let mut buf = Vec::new();
        body.encode(&mut buf).unwrap();
        let (rest, parsed) = parser(NomBytes::from(buf.as_slice())).unwrap();
        assert!(rest.into_bytes().is_empty(), "parser left bytes behind");
        parsed
    }

    #[test]
    fn metadata_round_trip() {
        let req = MetadataRequest {
            topics: vec!["a".to_string(), "b".to_string()],
        };
        let parsed = round_trip(&req, parse_metadata_request);
        assert_eq!(parsed.topics, vec!["a", "b"]);
    }

    #[test]
    fn produce_round_trip() {
        let req = ProduceRequest {
            acks: 1,
            timeout_ms: 5000,
            topics: vec![ProduceTopicData {
                topic: "t".to_string(),
                partitions: vec![ProducePartitionData {
                    partition: 0,
                    record_set: Bytes::from_static(&[9, 9, 9]),
                }],
            }],
        };
        let parsed = round_trip(&req, parse_produce_request);
        assert_eq!(parsed.acks, 1);
        assert_eq!(parsed.topics[0].topic, "t");
        assert_eq!(parsed.topics[0].partitions[0].record_set.as_ref(), &[9, 9, 9]);
    }

    #[test]
    fn fetch_round_trip() {
        let req = FetchRequest {
            replica_id: 2,
            max_wait_ms: 250,
            min_bytes: 1,
            topics: vec![FetchTopic {
                topic: "t".to_string(),
                partitions: vec![FetchPartition {
                    partition: 3,
                    fetch_offset: 77,
                    max_bytes: 1 << 20,
                }],
            }],
        };
        let parsed = round_trip(&req, parse_fetch_request);
        assert_eq!(parsed.replica_id, 2);
        assert_eq!(parsed.topics[0].partitions[0].fetch_offset, 77);
    }

    #[test]
    fn offsets_round_trip() {
        let req = OffsetsRequest {
            replica_id: -1,
            topics: vec![OffsetsTopic {
                topic: "t".to_string(),
                partitions: vec![OffsetsPartition {
                    partition: 0,
                    timestamp: -2,
                    max_num_offsets: 1,
                }],
            }],
        };
        let parsed = round_trip(&req, parse_offsets_request);
        assert_eq!(parsed.topics[0].partitions[0].timestamp, -2);
    }

    #[test]
    fn create_topics_round_trip() {
        let req = CreateTopicsRequest {
            requests: vec![CreateTopicRequest {
                topic: "new".to_string(),
                num_partitions: 4,
                replication_factor: 3,
            }],
            timeout_ms: 1000,
        };
        let parsed = round_trip(&req, parse_create_topics_request);
        assert_eq!(parsed.requests[0].num_partitions, 4);
        assert_eq!(parsed.requests[0].replication_factor, 3);
        assert_eq!(parsed.timeout_ms, 1000);
    }

    #[test]
    fn delete_topics_round_trip() {
        let req = DeleteTopicsRequest {
            topics: vec!["gone".to_string()],
            timeout_ms: 500,
        };
        let parsed = round_trip(&req, parse_delete_topics_request);
        assert_eq!(parsed.topics, vec!["gone"]);
    }

    #[test]
    fn leader_and_isr_round_trip() {
        let req = LeaderAndIsrRequest {
            controller_id: 1,
            controller_epoch: 2,
            partition_states: vec![PartitionState {
                topic: "t".to_string(),
                partition: 0,
                controller_epoch: 2,
                leader: 1,
                leader_epoch: 5,
                isr: vec![1, 2],
                replicas: vec![1, 2, 3],
            }],
        };
        let parsed = round_trip(&req, parse_leader_and_isr_request);
        let p = &parsed.partition_states[0];
        assert_eq!(p.leader, 1);
        assert_eq!(p.isr, vec![1, 2]);
        assert_eq!(p.replicas, vec![1, 2, 3]);
    }
}
