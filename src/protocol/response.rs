//! Typed response bodies: `ToByte` encoders for the server side, nom
//! parsers for the intra-cluster client and tests.

use bytes::Bytes;
use nom::number::complete::{be_i16, be_i32, be_i64};
use nom::IResult;
use nombytes::NomBytes;

use crate::error::{ErrorCode, Result};
use crate::wire::{
    bytes_to_string, encode_array, encode_i32_array, parse_array, parse_bytes, parse_i32_array,
    parse_string, ToByte,
};

fn parse_error_code(s: NomBytes) -> IResult<NomBytes, ErrorCode> {
    use num_traits::FromPrimitive;
    let (s, raw) = be_i16(s)?;
    Ok((s, ErrorCode::from_i16(raw).unwrap_or(ErrorCode::Unknown)))
}

impl ToByte for ErrorCode {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.code().encode(buffer)
    }
}

// =============================================================================
// ApiVersions (v0)
// =============================================================================

#[derive(Debug, Clone)]
pub struct ApiVersionsResponse {
    pub error_code: ErrorCode,
    pub api_versions: Vec<ApiVersion>,
}

/// One supported (key, min, max) triple.
#[derive(Debug, Clone, Copy)]
pub struct ApiVersion {
    pub api_key: i16,
    pub min_version: i16,
    pub max_version: i16,
}

impl ToByte for ApiVersionsResponse {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.error_code.encode(buffer)?;
        encode_array(buffer, &self.api_versions)
    }
}

impl ToByte for ApiVersion {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.api_key.encode(buffer)?;
        self.min_version.encode(buffer)?;
        self.max_version.encode(buffer)
    }
}

pub fn parse_api_versions_response(s: NomBytes) -> IResult<NomBytes, ApiVersionsResponse> {
    let (s, error_code) = parse_error_code(s)?;
    let (s, api_versions) = parse_array(parse_api_version)(s)?;
    Ok((
        s,
        ApiVersionsResponse {
            error_code,
            api_versions,
        },
    ))
}

fn parse_api_version(s: NomBytes) -> IResult<NomBytes, ApiVersion> {
    let (s, api_key) = be_i16(s)?;
    let (s, min_version) = be_i16(s)?;
    let (s, max_version) = be_i16(s)?;
    Ok((
        s,
        ApiVersion {
            api_key,
            min_version,
            max_version,
        },
    ))
}

// =============================================================================
// Metadata (v0)
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct MetadataResponse {
    pub brokers: Vec<MetadataBroker>,
    pub topics: Vec<TopicMetadata>,
}

#[derive(Debug, Clone)]
pub struct MetadataBroker {
    pub node_id: i32,
    pub host: String,
    pub port: i32,
}

#[derive(Debug, Clone)]
pub struct TopicMetadata {
    pub error_code: ErrorCode,
    pub topic: String,
    pub partitions: Vec<PartitionMetadata>,
}

#[derive(Debug, Clone)]
pub struct PartitionMetadata {
    pub error_code: ErrorCode,
    pub partition: i32,
    pub leader: i32,
    pub replicas: Vec<i32>,
    pub isr: Vec<i32>,
}

impl ToByte for MetadataResponse {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        encode_array(buffer, &self.brokers)?;
        encode_array(buffer, &self.topics)
    }
}

impl ToByte for MetadataBroker {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.node_id.encode(buffer)?;
        self.host.encode(buffer)?;
        self.port.encode(buffer)
    }
}

impl ToByte for TopicMetadata {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.error_code.encode(buffer)?;
        self.topic.encode(buffer)?;
        encode_array(buffer, &self.partitions)
    }
}

impl ToByte for PartitionMetadata {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.error_code.encode(buffer)?;
        self.partition.encode(buffer)?;
        self.leader.encode(buffer)?;
        encode_i32_array(buffer, &self.replicas)?;
        encode_i32_array(buffer, &self.isr)
    }
}

pub fn parse_metadata_response(s: NomBytes) -> IResult<NomBytes, MetadataResponse> {
    let (s, brokers) = parse_array(parse_metadata_broker)(s)?;
    let (s, topics) = parse_array(parse_topic_metadata)(s)?;
    Ok((s, MetadataResponse { brokers, topics }))
}

fn parse_metadata_broker(s: NomBytes) -> IResult<NomBytes, MetadataBroker> {
    let (s, node_id) = be_i32(s)?;
    let (s, host) = parse_string(s)?;
    let (s, port) = be_i32(s)?;
    Ok((
        s,
        MetadataBroker {
            node_id,
            host: bytes_to_string(&host)?,
            port,
        },
    ))
}

fn parse_topic_metadata(s: NomBytes) -> IResult<NomBytes, TopicMetadata> {
    let (s, error_code) = parse_error_code(s)?;
    let (s, topic) = parse_string(s)?;
    let (s, partitions) = parse_array(parse_partition_metadata)(s)?;
    Ok((
        s,
        TopicMetadata {
            error_code,
            topic: bytes_to_string(&topic)?,
            partitions,
        },
    ))
}

fn parse_partition_metadata(s: NomBytes) -> IResult<NomBytes, PartitionMetadata> {
    let (s, error_code) = parse_error_code(s)?;
    let (s, partition) = be_i32(s)?;
    let (s, leader) = be_i32(s)?;
    let (s, replicas) = parse_i32_array(s)?;
    let (s, isr) = parse_i32_array(s)?;
    Ok((
        s,
        PartitionMetadata {
            error_code,
            partition,
            leader,
            replicas,
            isr,
        },
    ))
}

// =============================================================================
// Produce (v2)
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct ProduceResponse {
    pub topics: Vec<ProduceTopicResponse>,
    pub throttle_time_ms: i32,
}

#[derive(Debug, Clone)]
pub struct ProduceTopicResponse {
    pub topic: String,
    pub partitions: Vec<ProducePartitionResponse>,
}

#[derive(Debug, Clone)]
pub struct ProducePartitionResponse {
    pub partition: i32,
    pub error_code: ErrorCode,
    pub base_offset: i64,
    pub log_append_time: i64,
}

impl ProducePartitionResponse {
    pub fn error(partition: i32, error_code: ErrorCode) -> Self {
        Self {
            partition,
            error_code,
            base_offset: -1,
            log_append_time: -1,
        }
    }
}

impl ToByte for ProduceResponse {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        encode_array(buffer, &self.topics)?;
        self.throttle_time_ms.encode(buffer)
    }
}

impl ToByte for ProduceTopicResponse {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.topic.encode(buffer)?;
        encode_array(buffer, &self.partitions)
    }
}

impl ToByte for ProducePartitionResponse {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.partition.encode(buffer)?;
        self.error_code.encode(buffer)?;
        self.base_offset.encode(buffer)?;
        self.log_append_time.encode(buffer)
    }
}

pub fn parse_produce_response(s: NomBytes) -> IResult<NomBytes, ProduceResponse> {
    let (s, topics) = parse_array(parse_produce_topic_response)(s)?;
    let (s, throttle_time_ms) = be_i32(s)?;
    Ok((
        s,
        ProduceResponse {
            topics,
            throttle_time_ms,
        },
    ))
}

fn parse_produce_topic_response(s: NomBytes) -> IResult<NomBytes, ProduceTopicResponse> {
    let (s, topic) = parse_string(s)?;
    let (s, partitions) = parse_array(parse_produce_partition_response)(s)?;
    Ok((
        s,
        ProduceTopicResponse {
            topic: bytes_to_string(&topic)?,
            partitions,
        },
    ))
}

fn parse_produce_partition_response(s: NomBytes) -> IResult<NomBytes, ProducePartitionResponse> {
    let (s, partition) = be_i32(s)?;
    let (s, error_code) = parse_error_code(s)?;
    let (s, base_offset) = be_i64(s)?;
    let (s, log_append_time) = be_i64(s)?;
    Ok((
        s,
        ProducePartitionResponse {
            partition,
            error_code,
            base_offset,
            log_append_time,
        },
    ))
}

// =============================================================================
// Fetch (v1)
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    pub throttle_time_ms: i32,
    pub topics: Vec<FetchTopicResponse>,
}

#[derive(Debug, Clone)]
pub struct FetchTopicResponse {
    pub topic: String,
    pub partitions: Vec<FetchPartitionResponse>,
}

#[derive(Debug, Clone)]
pub struct FetchPartitionResponse {
    pub partition: i32,
    pub error_code: ErrorCode,
    pub high_watermark: i64,
    pub record_set: Bytes,
}

impl FetchPartitionResponse {
    pub fn error(partition: i32, error_code: ErrorCode) -> Self {
        Self {
            partition,
            error_code,
            high_watermark: -1,
            record_set: Bytes::new(),
        }
    }
}

impl ToByte for FetchResponse {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.throttle_time_ms.encode(buffer)?;
        encode_array(buffer, &self.topics)
    }
}

impl ToByte for FetchTopicResponse {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.topic.encode(buffer)?;
        encode_array(buffer, &self.partitions)
    }
}

impl ToByte for FetchPartitionResponse {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.partition.encode(buffer)?;
        self.error_code.encode(buffer)?;
        self.high_watermark.encode(buffer)?;
        self.record_set.encode(buffer)
    }
}

pub fn parse_fetch_response(s: NomBytes) -> IResult<NomBytes, FetchResponse> {
    let (s, throttle_time_ms) = be_i32(s)?;
    let (s, topics) = parse_array(parse_fetch_topic_response)(s)?;
    Ok((
        s,
        FetchResponse {
            throttle_time_ms,
            topics,
        },
    ))
}

fn parse_fetch_topic_response(s: NomBytes) -> IResult<NomBytes, FetchTopicResponse> {
    let (s, topic) = parse_string(s)?;
    let (s, partitions) = parse_array(parse_fetch_partition_response)(s)?;
    Ok((
        s,
        FetchTopicResponse {
            topic: bytes_to_string(&topic)?,
            partitions,
        },
    ))
}

fn parse_fetch_partition_response(s: NomBytes) -> IResult<NomBytes, FetchPartitionResponse> {
    let (s, partition) = be_i32(s)?;
    let (s, error_code) = parse_error_code(s)?;
    let (s, high_watermark) = be_i64(s)?;
    let (s, record_set) = parse_bytes(s)?;
    Ok((
        s,
        FetchPartitionResponse {
            partition,
            error_code,
            high_watermark,
            record_set,
        },
    ))
}

// =============================================================================
// Offsets (v0)
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct OffsetsResponse {
    pub topics: Vec<OffsetsTopicResponse>,
}

#[derive(Debug, Clone)]
pub struct OffsetsTopicResponse {
    pub topic: String,
    pub partitions: Vec<OffsetsPartitionResponse>,
}

#[derive(Debug, Clone)]
pub struct OffsetsPartitionResponse {
    pub partition: i32,
    pub error_code: ErrorCode,
    pub offsets: Vec<i64>,
}

impl ToByte for OffsetsResponse {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        encode_array(buffer, &self.topics)
    }
}

impl ToByte for OffsetsTopicResponse {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.topic.encode(buffer)?;
        encode_array(buffer, &self.partitions)
    }
}

impl ToByte for OffsetsPartitionResponse {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.partition.encode(buffer)?;
        self.error_code.encode(buffer)?;
        encode_array(buffer, &self.offsets)
    }
}

pub fn parse_offsets_response(s: NomBytes) -> IResult<NomBytes, OffsetsResponse> {
    let (s, topics) = parse_array(parse_offsets_topic_response)(s)?;
    Ok((s, OffsetsResponse { topics }))
}

fn parse_offsets_topic_response(s: NomBytes) -> IResult<NomBytes, OffsetsTopicResponse> {
    let (s, topic) = parse_string(s)?;
    let (s, partitions) = parse_array(parse_offsets_partition_response)(s)?;
    Ok((
        s,
        OffsetsTopicResponse {
            topic: bytes_to_string(&topic)?,
            partitions,
        },
    ))
}

fn parse_offsets_partition_response(s: NomBytes) -> IResult<NomBytes, OffsetsPartitionResponse> {
    let (s, partition) = be_i32(s)?;
    let (s, error_code) = parse_error_code(s)?;
    let (s, offsets) = parse_array(be_i64)(s)?;
    Ok((
        s,
        OffsetsPartitionResponse {
            partition,
            error_code,
            offsets,
        },
    ))
}

// =============================================================================
// CreateTopics / DeleteTopics (v0)
// =============================================================================

/// Per-topic error code, shared by create and delete responses.
#[derive(Debug, Clone)]
pub struct TopicError {
    pub topic: String,
    pub error_code: ErrorCode,
}

#[derive(Debug, Clone, Default)]
pub struct CreateTopicsResponse {
    pub topic_errors: Vec<TopicError>,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteTopicsResponse {
    pub topic_errors: Vec<TopicError>,
}

impl ToByte for TopicError {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.topic.encode(buffer)?;
        self.error_code.encode(buffer)
    }
}

impl ToByte for CreateTopicsResponse {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        encode_array(buffer, &self.topic_errors)
    }
}

impl ToByte for DeleteTopicsResponse {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        encode_array(buffer, &self.topic_errors)
    }
}

fn parse_topic_error(s: NomBytes) -> IResult<NomBytes, TopicError> {
    let (s, topic) = parse_string(s)?;
    let (s, error_code) = parse_error_code(s)?;
    Ok((
        s,
        TopicError {
            topic: bytes_to_string(&topic)?,
            error_code,
        },
    ))
}

pub fn parse_create_topics_response(s: NomBytes) -> IResult<NomBytes, CreateTopicsResponse> {
    let (s, topic_errors) = parse_array(parse_topic_error)(s)?;
    Ok((s, CreateTopicsResponse { topic_errors }))
}

pub fn parse_delete_topics_response(s: NomBytes) -> IResult<NomBytes, DeleteTopicsResponse> {
    let (s, topic_errors) = parse_array(parse_topic_error)(s)?;
    Ok((s, DeleteTopicsResponse { topic_errors }))
}

// =============================================================================
// LeaderAndIsr (v0)
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct LeaderAndIsrResponse {
    pub error_code: ErrorCode,
    pub partitions: Vec<LeaderAndIsrPartitionResponse>,
}

#[derive(Debug, Clone)]
pub struct LeaderAndIsrPartitionResponse {
    pub topic: String,
    pub partition: i32,
    pub error_code: ErrorCode,
}

impl ToByte for LeaderAndIsrResponse {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.error_code.encode(buffer)?;
        encode_array(buffer, &self.partitions)
    }
}

impl ToByte for LeaderAndIsrPartitionResponse {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.topic.encode(buffer)?;
        self.partition.encode(buffer)?;
        self.error_code.encode(buffer)
    }
}

pub fn parse_leader_and_isr_response(s: NomBytes) -> IResult<NomBytes, LeaderAndIsrResponse> {
    let (s, error_code) = parse_error_code(s)?;
    let (s, partitions) = parse_array(parse_leader_and_isr_partition_response)(s)?;
    Ok((
        s,
        LeaderAndIsrResponse {
            error_code,
            partitions,
        },
    ))
}

fn parse_leader_and_isr_partition_response(
    s: NomBytes,
) -> IResult<NomBytes, LeaderAndIsrPartitionResponse> {
    let (s, topic) = parse_string(s)?;
    let (s, partition) = be_i32(s)?;
    let (s, error_code) = parse_error_code(s)?;
    Ok((
        s,
        LeaderAndIsrPartitionResponse {
            topic: bytes_to_string(&topic)?,
            partition,
            error_code,
        },
    ))
}
