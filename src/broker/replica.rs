//! Local runtime state for one hosted partition, and the registry mapping
//! (topic, partition) to it.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use super::replicator::Replicator;
use crate::cluster::Partition;
use crate::commitlog::CommitLog;

/// One partition hosted on this broker. Exists only while this broker's id
/// is in the partition's assigned replicas. Role mutations happen under
/// the broker-wide lock; the replicator shares only the log handle and the
/// high-water mark cell, so closing it can never deadlock against a role
/// transition.
pub struct Replica {
    pub broker_id: i32,
    pub partition: Partition,
    pub log: Option<Arc<CommitLog>>,
    pub replicator: Option<Replicator>,
    hw: Arc<AtomicI64>,
}

impl Replica {
    pub fn new(broker_id: i32, partition: Partition) -> Self {
        Self {
            broker_id,
            partition,
            log: None,
            replicator: None,
            hw: Arc::new(AtomicI64::new(0)),
        }
    }

    /// True when this broker currently leads the partition.
    pub fn is_leader(&self) -> bool {
        self.partition.leader == self.broker_id
    }

    /// Log end offset, exclusive. Zero before the log is opened.
    pub fn log_end_offset(&self) -> i64 {
        self.log.as_ref().map(|log| log.newest_offset()).unwrap_or(0)
    }

    /// Largest offset visible to consumers. On the leader this is the log
    /// end; on a follower it trails the leader's high-water mark.
    pub fn high_watermark(&self) -> i64 {
        if self.is_leader() {
            self.log_end_offset()
        } else {
            self.hw.load(Ordering::Acquire)
        }
    }

    pub fn set_high_watermark(&self, hw: i64) {
        self.hw.store(hw, Ordering::Release);
    }

    /// The cell a replicator advances as leader high-water marks arrive.
    pub fn hw_cell(&self) -> Arc<AtomicI64> {
        self.hw.clone()
    }
}

/// Maps (topic, partition) to the local replica. Concurrent readers; the
/// per-replica mutex serializes role transitions against request handling.
#[derive(Default)]
pub struct ReplicaRegistry {
    replicas: DashMap<(String, i32), Arc<Mutex<Replica>>>,
}

impl ReplicaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, topic: &str, partition: i32) -> Option<Arc<Mutex<Replica>>> {
        self.replicas
            .get(&(topic.to_string(), partition))
            .map(|entry| entry.value().clone())
    }

    pub fn insert(&self, replica: Replica) -> Arc<Mutex<Replica>> {
        let key = (replica.partition.topic.clone(), replica.partition.id);
        let handle = Arc::new(Mutex::new(replica));
        self.replicas.insert(key, handle.clone());
        handle
    }

    pub fn remove(&self, topic: &str, partition: i32) -> Option<Arc<Mutex<Replica>>> {
        self.replicas
            .remove(&(topic.to_string(), partition))
            .map(|(_, v)| v)
    }

    /// Every hosted (topic, partition).
    pub fn partitions(&self) -> Vec<(String, i32)> {
        self.replicas.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }
}
