//! Cluster coordination: the Raft-replicated metadata store and the gossip
//! membership layer.

pub mod commands;
pub mod membership;
pub mod raft;
pub mod store;

pub use commands::{Broker, BrokerStatus, MetadataCommand, MetadataResponse, Partition, Topic};
pub use membership::{Member, MemberEvent, Membership};
pub use store::MetadataStore;

use thiserror::Error;

use crate::error::ErrorCode;

pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// Coordination failures: Raft proposals, snapshots, membership I/O.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// This node is not the Raft leader; the caller should answer
    /// NotController or retarget.
    #[error("not the cluster leader")]
    NotLeader,

    /// A proposal did not commit within its deadline.
    #[error("raft proposal timed out")]
    Timeout,

    /// Any other consensus-layer failure.
    #[error("raft: {0}")]
    Raft(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec: {0}")]
    Codec(String),

    #[error("config: {0}")]
    Config(String),
}

impl ClusterError {
    /// The wire code a handler should attach for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            ClusterError::NotLeader => ErrorCode::NotController,
            _ => ErrorCode::Unknown,
        }
    }
}
