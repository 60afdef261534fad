//! Replicated metadata records and the commands that mutate them.
//!
//! Commands are the inputs to the metadata state machine. They are carried
//! through the Raft log and applied deterministically on every broker, so
//! every field here must serialize stably.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Liveness of a broker as reported by gossip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BrokerStatus {
    #[default]
    Alive,
    Leaving,
    Left,
    Failed,
}

/// One broker's addresses and liveness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Broker {
    pub id: i32,
    /// Client-facing address.
    pub addr: String,
    pub raft_addr: String,
    pub serf_addr: String,
    pub status: BrokerStatus,
}

/// A topic: partition count is the map's length; each partition id maps to
/// its assigned replicas in placement order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub name: String,
    pub partitions: BTreeMap<i32, Vec<i32>>,
}

/// One partition's replication state.
///
/// Invariants maintained by the controller: leader is in the ISR, the ISR
/// is a subset of the assigned replicas, and the AR ordering is stable
/// across updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub topic: String,
    pub id: i32,
    pub leader: i32,
    /// Assigned replicas, in placement order.
    pub replicas: Vec<i32>,
    pub isr: Vec<i32>,
    pub controller_epoch: i32,
    pub leader_epoch: i32,
}

/// Commands applied to the metadata state machine, in Raft commit order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetadataCommand {
    /// Barrier written by a fresh leader before serving linearizable reads.
    Noop,
    /// Upsert a broker record; idempotent by id.
    RegisterBroker(Broker),
    /// Remove a broker record; idempotent.
    DeregisterBroker { id: i32 },
    /// Create a topic if absent; no-op otherwise.
    RegisterTopic(Topic),
    /// Remove a topic and every partition row under it.
    DeregisterTopic { name: String },
    /// Upsert a partition record.
    RegisterPartition(Partition),
}

/// Responses from applying commands. Metadata mutations carry no payload
/// back; the caller reads the store afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetadataResponse {
    Ok,
}
