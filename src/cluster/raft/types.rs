//! Type plumbing for the consensus layer.

use std::io::Cursor;

use openraft::BasicNode;

use crate::cluster::commands::{MetadataCommand, MetadataResponse};

/// Raft node ids are widened broker ids.
pub type RaftNodeId = u64;

openraft::declare_raft_types!(
    pub TypeConfig:
        D = MetadataCommand,
        R = MetadataResponse,
        NodeId = RaftNodeId,
        Node = BasicNode,
        SnapshotData = Cursor<Vec<u8>>,
);
