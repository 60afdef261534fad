//! Crate & protocol level errors.
//!
//! Two layers, mirroring the wire protocol:
//!
//! - [`Error`]: connection, parsing and I/O failures inside the broker.
//! - [`ErrorCode`]: the 16-bit signed codes carried in responses. Handlers
//!   never fail a whole response; they attach a per-partition [`ErrorCode`].
//!
//! Storage and coordination failures live in [`crate::cluster::ClusterError`]
//! and map onto [`ErrorCode`] via `ClusterError::code()`.

use bytes::Bytes;
use num_derive::FromPrimitive;
use std::{io, result};
use thiserror::Error as ThisError;

pub type Result<T> = result::Result<T, Error>;

/// Protocol and connection level errors.
#[derive(Clone, Debug, ThisError)]
pub enum Error {
    /// An error in the network or on disk.
    #[error("IO error: {0:?}")]
    Io(io::ErrorKind),

    /// Could not parse the data.
    #[error("parsing error: invalid data ({} bytes)", .0.len())]
    Parsing(Bytes),

    /// Missing data or connection closed.
    #[error("missing data: {0}")]
    MissingData(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Error::Io(a), Error::Io(b)) => a == b,
            (Error::Parsing(a), Error::Parsing(b)) => a == b,
            (Error::MissingData(a), Error::MissingData(b)) => a == b,
            (Error::Config(a), Error::Config(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e.kind())
    }
}

impl From<crate::cluster::ClusterError> for Error {
    fn from(e: crate::cluster::ClusterError) -> Self {
        use crate::cluster::ClusterError;
        match e {
            ClusterError::Io(io_err) => Error::Io(io_err.kind()),
            ClusterError::Config(msg) => Error::Config(msg),
            other => Error::Config(other.to_string()),
        }
    }
}

/// Wire protocol error codes.
///
/// Values match the Kafka protocol so off-the-shelf clients interpret them
/// correctly. `None` is success.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, Default)]
#[repr(i16)]
pub enum ErrorCode {
    /// An unexpected server error; wraps a transport or I/O cause.
    Unknown = -1,
    #[default]
    None = 0,
    /// The requested offset is below the oldest retained offset for the
    /// partition.
    OffsetOutOfRange = 1,
    /// The topic or partition does not exist on this broker.
    UnknownTopicOrPartition = 3,
    /// The request targeted a replica that is not the partition leader.
    /// The client's metadata is out of date.
    NotLeaderForPartition = 6,
    /// A replica is expected on this broker but has not been started.
    ReplicaNotAvailable = 9,
    /// A LeaderAndIsr command carried a controller epoch older than the
    /// one already seen for the partition.
    StaleControllerEpoch = 11,
    /// Topic with this name already exists.
    TopicAlreadyExists = 36,
    /// Replication factor exceeds the live member count.
    InvalidReplicationFactor = 38,
    /// A controller-only request was sent to a broker that is not the
    /// cluster controller.
    NotController = 41,
}

impl ErrorCode {
    /// The raw i16 carried on the wire.
    #[inline]
    pub fn code(self) -> i16 {
        self as i16
    }

    /// True when this code is success.
    #[inline]
    pub fn is_none(self) -> bool {
        self == ErrorCode::None
    }
}
