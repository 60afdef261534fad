//! Typed wire protocol: request parsing, response encoding, and record
//! batch utilities.
//!
//! Frames are a 4-byte big-endian length prefix followed by a header
//! (api_key: i16, api_version: i16, correlation_id: i32, client_id:
//! nullable string) and the typed body. The same codec serves both
//! directions: the server parses requests and encodes responses, while the
//! intra-cluster client encodes requests and parses responses.

pub mod batch;
pub mod request;
pub mod response;

use bytes::Bytes;
use nom::number::complete::{be_i16, be_i32};
use nom::IResult;
use nombytes::NomBytes;

use crate::error::{Error, Result};
use crate::wire::{bytes_to_string_opt, parse_nullable_string, ToByte};

pub use request::*;
pub use response::*;

/// API keys understood by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiKey {
    Produce,
    Fetch,
    Offsets,
    Metadata,
    LeaderAndIsr,
    ApiVersions,
    CreateTopics,
    DeleteTopics,
    Unknown(i16),
}

impl From<i16> for ApiKey {
    fn from(value: i16) -> Self {
        match value {
            0 => ApiKey::Produce,
            1 => ApiKey::Fetch,
            2 => ApiKey::Offsets,
            3 => ApiKey::Metadata,
            4 => ApiKey::LeaderAndIsr,
            18 => ApiKey::ApiVersions,
            19 => ApiKey::CreateTopics,
            20 => ApiKey::DeleteTopics,
            n => ApiKey::Unknown(n),
        }
    }
}

impl From<ApiKey> for i16 {
    fn from(key: ApiKey) -> Self {
        match key {
            ApiKey::Produce => 0,
            ApiKey::Fetch => 1,
            ApiKey::Offsets => 2,
            ApiKey::Metadata => 3,
            ApiKey::LeaderAndIsr => 4,
            ApiKey::ApiVersions => 18,
            ApiKey::CreateTopics => 19,
            ApiKey::DeleteTopics => 20,
            ApiKey::Unknown(n) => n,
        }
    }
}

impl ApiKey {
    /// Static name for logging without allocation.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiKey::Produce => "Produce",
            ApiKey::Fetch => "Fetch",
            ApiKey::Offsets => "Offsets",
            ApiKey::Metadata => "Metadata",
            ApiKey::LeaderAndIsr => "LeaderAndIsr",
            ApiKey::ApiVersions => "ApiVersions",
            ApiKey::CreateTopics => "CreateTopics",
            ApiKey::DeleteTopics => "DeleteTopics",
            ApiKey::Unknown(_) => "Unknown",
        }
    }
}

/// Parsed request header.
#[derive(Debug, Clone)]
pub struct RequestHeader {
    pub api_key: ApiKey,
    pub api_version: i16,
    pub correlation_id: i32,
    pub client_id: Option<String>,
}

impl RequestHeader {
    /// Build a header for an outgoing request.
    pub fn new(api_key: ApiKey, correlation_id: i32, client_id: impl Into<String>) -> Self {
        Self {
            api_key,
            api_version: default_version(api_key),
            correlation_id,
            client_id: Some(client_id.into()),
        }
    }
}

/// The version this broker speaks for each API, advertised in ApiVersions
/// and used by the intra-cluster client.
fn default_version(key: ApiKey) -> i16 {
    match key {
        ApiKey::Produce => 2,
        ApiKey::Fetch => 1,
        _ => 0,
    }
}

impl ToByte for RequestHeader {
    fn encode<W: bytes::BufMut>(&self, buffer: &mut W) -> Result<()> {
        i16::from(self.api_key).encode(buffer)?;
        self.api_version.encode(buffer)?;
        self.correlation_id.encode(buffer)?;
        self.client_id.encode(buffer)
    }
}

pub fn parse_request_header(s: NomBytes) -> IResult<NomBytes, RequestHeader> {
    let (s, api_key) = be_i16(s)?;
    let (s, api_version) = be_i16(s)?;
    let (s, correlation_id) = be_i32(s)?;
    let (s, client_id) = parse_nullable_string(s)?;
    let client_id = bytes_to_string_opt(client_id)?;

    Ok((
        s,
        RequestHeader {
            api_key: ApiKey::from(api_key),
            api_version,
            correlation_id,
            client_id,
        },
    ))
}

/// A decoded request body. The dispatcher exhaustively matches on this.
#[derive(Debug, Clone)]
pub enum RequestBody {
    ApiVersions(ApiVersionsRequest),
    Metadata(MetadataRequest),
    Produce(ProduceRequest),
    Fetch(FetchRequest),
    Offsets(OffsetsRequest),
    CreateTopics(CreateTopicsRequest),
    DeleteTopics(DeleteTopicsRequest),
    LeaderAndIsr(LeaderAndIsrRequest),
    /// Carries the raw body of an unsupported api_key so the dispatcher can
    /// answer with an error rather than dropping the connection.
    Unknown(Bytes),
}

/// Parse one request frame (header + body, length prefix already stripped).
pub fn parse_request(data: Bytes) -> Result<(RequestHeader, RequestBody)> {
    let input = NomBytes::new(data.clone());
    let (remaining, header) =
        parse_request_header(input).map_err(|_| Error::Parsing(data.clone()))?;

    let body = match header.api_key {
        ApiKey::ApiVersions => RequestBody::ApiVersions(ApiVersionsRequest),
        ApiKey::Metadata => {
            let (_, body) =
                request::parse_metadata_request(remaining).map_err(|_| Error::Parsing(data))?;
            RequestBody::Metadata(body)
        }
        ApiKey::Produce => {
            let (_, body) =
                request::parse_produce_request(remaining).map_err(|_| Error::Parsing(data))?;
            RequestBody::Produce(body)
        }
        ApiKey::Fetch => {
            let (_, body) =
                request::parse_fetch_request(remaining).map_err(|_| Error::Parsing(data))?;
            RequestBody::Fetch(body)
        }
        ApiKey::Offsets => {
            let (_, body) =
                request::parse_offsets_request(remaining).map_err(|_| Error::Parsing(data))?;
            RequestBody::Offsets(body)
        }
        ApiKey::CreateTopics => {
            let (_, body) = request::parse_create_topics_request(remaining)
                .map_err(|_| Error::Parsing(data))?;
            RequestBody::CreateTopics(body)
        }
        ApiKey::DeleteTopics => {
            let (_, body) = request::parse_delete_topics_request(remaining)
                .map_err(|_| Error::Parsing(data))?;
            RequestBody::DeleteTopics(body)
        }
        ApiKey::LeaderAndIsr => {
            let (_, body) = request::parse_leader_and_isr_request(remaining)
                .map_err(|_| Error::Parsing(data))?;
            RequestBody::LeaderAndIsr(body)
        }
        ApiKey::Unknown(_) => RequestBody::Unknown(remaining.into_bytes()),
    };

    Ok((header, body))
}

/// Encode a response frame: length prefix, correlation id, body.
pub fn encode_response_frame<B: ToByte>(correlation_id: i32, body: &B) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    correlation_id.encode(&mut payload)?;
    body.encode(&mut payload)?;

    let mut frame = Vec::with_capacity(4 + payload.len());
    (payload.len() as i32).encode(&mut frame)?;
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Encode a request frame: length prefix, header, body.
pub fn encode_request_frame<B: ToByte>(header: &RequestHeader, body: &B) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    header.encode(&mut payload)?;
    body.encode(&mut payload)?;

    let mut frame = Vec::with_capacity(4 + payload.len());
    (payload.len() as i32).encode(&mut frame)?;
    frame.extend_from_slice(&payload);
    Ok(frame)
}
