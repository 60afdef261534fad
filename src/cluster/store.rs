//! The replicated metadata store.
//!
//! In-memory indexed tables (brokers, topics, partitions) whose only writer
//! is the Raft apply path. Readers take a read guard and treat it as a
//! point-in-time snapshot; they never mutate.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::debug;

use super::commands::{Broker, MetadataCommand, MetadataResponse, Partition, Topic};
use super::{ClusterError, ClusterResult};

/// All replicated tables. Serialized wholesale for snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetadataState {
    /// Bumped on every applied command, including Noop barriers.
    pub version: u64,
    pub brokers: BTreeMap<i32, Broker>,
    pub topics: BTreeMap<String, Topic>,
    pub partitions: BTreeMap<(String, i32), Partition>,
}

impl MetadataState {
    fn apply(&mut self, command: MetadataCommand) -> MetadataResponse {
        self.version += 1;
        match command {
            MetadataCommand::Noop => {}
            MetadataCommand::RegisterBroker(broker) => {
                self.brokers.insert(broker.id, broker);
            }
            MetadataCommand::DeregisterBroker { id } => {
                self.brokers.remove(&id);
            }
            MetadataCommand::RegisterTopic(topic) => {
                // create-if-absent keeps replays and duplicate proposals benign
                self.topics.entry(topic.name.clone()).or_insert(topic);
            }
            MetadataCommand::DeregisterTopic { name } => {
                self.topics.remove(&name);
                self.partitions.retain(|(topic, _), _| *topic != name);
            }
            MetadataCommand::RegisterPartition(partition) => {
                self.partitions
                    .insert((partition.topic.clone(), partition.id), partition);
            }
        }
        MetadataResponse::Ok
    }
}

/// Shared handle on the metadata state. Cheap to clone; all clones see the
/// same tables.
#[derive(Clone, Default)]
pub struct MetadataStore {
    state: Arc<RwLock<MetadataState>>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one command. Called only from the Raft apply path, in strict
    /// log order.
    pub async fn apply(&self, command: MetadataCommand) -> MetadataResponse {
        let mut state = self.state.write().await;
        debug!(version = state.version + 1, ?command, "applying metadata command");
        state.apply(command)
    }

    /// Point-in-time read access to every table.
    pub async fn state(&self) -> RwLockReadGuard<'_, MetadataState> {
        self.state.read().await
    }

    pub async fn get_topic(&self, name: &str) -> Option<Topic> {
        self.state.read().await.topics.get(name).cloned()
    }

    pub async fn get_topics(&self) -> Vec<Topic> {
        self.state.read().await.topics.values().cloned().collect()
    }

    pub async fn get_partition(&self, topic: &str, id: i32) -> Option<Partition> {
        self.state
            .read()
            .await
            .partitions
            .get(&(topic.to_string(), id))
            .cloned()
    }

    pub async fn get_node(&self, id: i32) -> Option<Broker> {
        self.state.read().await.brokers.get(&id).cloned()
    }

    /// Serialized dump of all tables.
    pub async fn snapshot(&self) -> ClusterResult<Vec<u8>> {
        let state = self.state.read().await;
        bincode::serialize(&*state).map_err(|e| ClusterError::Codec(e.to_string()))
    }

    /// Replace state in place from a snapshot.
    pub async fn restore(&self, snapshot: &[u8]) -> ClusterResult<()> {
        let restored: MetadataState =
            bincode::deserialize(snapshot).map_err(|e| ClusterError::Codec(e.to_string()))?;
        *self.state.write().await = restored;
        Ok(())
    }
}
