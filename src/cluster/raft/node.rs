//! The consensus wrapper the broker programs against.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use openraft::storage::Adaptor;
use openraft::{BasicNode, Raft};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::network::{RaftRpcServer, RaftTransport};
use super::storage::RaftStore;
use super::types::{RaftNodeId, TypeConfig};
use crate::cluster::commands::MetadataCommand;
use crate::cluster::store::MetadataStore;
use crate::cluster::{ClusterError, ClusterResult};

/// Consensus on metadata commands: proposal with commit-ack, leadership
/// notifications, and membership changes. One per broker.
pub struct RaftLayer {
    raft: Arc<Raft<TypeConfig>>,
    transport: RaftTransport,
    node_id: RaftNodeId,
    raft_addr: String,
}

impl RaftLayer {
    /// Start the Raft node: restore any snapshot under `raft_dir`, bind the
    /// transport at `raft_addr`, and hand applied commands to `store`.
    pub async fn new(
        node_id: RaftNodeId,
        raft_addr: String,
        raft_dir: PathBuf,
        store: MetadataStore,
    ) -> ClusterResult<Self> {
        let raft_store = RaftStore::new(store, raft_dir);
        raft_store
            .load_snapshot_from_disk()
            .await
            .map_err(|e| ClusterError::Raft(e.to_string()))?;

        let config = openraft::Config {
            heartbeat_interval: 250,
            election_timeout_min: 1_000,
            election_timeout_max: 2_000,
            ..Default::default()
        };
        let config = Arc::new(
            config
                .validate()
                .map_err(|e| ClusterError::Config(e.to_string()))?,
        );

        let transport = RaftTransport::new();
        let (log_store, sm_store) = Adaptor::new(raft_store);
        let raft = Raft::new(node_id, config, transport.clone(), log_store, sm_store)
            .await
            .map_err(|e| ClusterError::Raft(e.to_string()))?;
        let raft = Arc::new(raft);

        let rpc_server = RaftRpcServer::new(raft.clone(), raft_addr.clone());
        tokio::spawn(async move {
            if let Err(e) = rpc_server.run().await {
                warn!(error = %e, "raft transport exited");
            }
        });

        info!(node_id, raft_addr = %raft_addr, "raft layer started");
        Ok(Self {
            raft,
            transport,
            node_id,
            raft_addr,
        })
    }

    /// Bootstrap a fresh single-node cluster with this node as the only
    /// voter. Later nodes are added through [`RaftLayer::add_voter`].
    pub async fn initialize(&self) -> ClusterResult<()> {
        let mut members = BTreeMap::new();
        members.insert(
            self.node_id,
            BasicNode {
                addr: self.raft_addr.clone(),
            },
        );
        match self.raft.initialize(members).await {
            Ok(()) => {
                info!(node_id = self.node_id, "initialized single-node raft cluster");
                Ok(())
            }
            Err(e) => {
                let msg = e.to_string();
                // a restarted node is already initialized; that is fine
                if msg.contains("not allowed to initialize") || msg.contains("initialized") {
                    Ok(())
                } else {
                    Err(ClusterError::Raft(msg))
                }
            }
        }
    }

    /// True once this node has committed membership, from bootstrap or a
    /// restored snapshot.
    pub fn is_initialized(&self) -> bool {
        self.raft
            .metrics()
            .borrow()
            .membership_config
            .membership()
            .voter_ids()
            .next()
            .is_some()
    }

    /// Propose a command and wait for it to commit and apply. Returns the
    /// log index. `NotLeader` when this node cannot commit it.
    pub async fn apply(&self, command: MetadataCommand) -> ClusterResult<u64> {
        match self.raft.client_write(command).await {
            Ok(response) => Ok(response.log_id.index),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("forward request to") || msg.contains("ForwardToLeader") {
                    Err(ClusterError::NotLeader)
                } else if msg.contains("timeout") || msg.contains("Timeout") {
                    Err(ClusterError::Timeout)
                } else {
                    Err(ClusterError::Raft(msg))
                }
            }
        }
    }

    /// Commit a no-op barrier. A fresh leader runs this before serving
    /// reads that must be linearizable.
    pub async fn barrier(&self) -> ClusterResult<u64> {
        self.apply(MetadataCommand::Noop).await
    }

    pub fn is_leader(&self) -> bool {
        let metrics = self.raft.metrics().borrow().clone();
        metrics.current_leader == Some(self.node_id)
    }

    /// Current Raft term; doubles as the controller epoch stamped onto
    /// LeaderAndIsr commands.
    pub fn current_term(&self) -> u64 {
        self.raft.metrics().borrow().current_term
    }

    /// Whether the given node is currently a voter.
    pub fn contains_voter(&self, node_id: RaftNodeId) -> bool {
        self.raft
            .metrics()
            .borrow()
            .membership_config
            .membership()
            .voter_ids()
            .any(|id| id == node_id)
    }

    /// Count of voting members.
    pub fn num_peers(&self) -> usize {
        self.raft
            .metrics()
            .borrow()
            .membership_config
            .membership()
            .voter_ids()
            .count()
    }

    /// Ordered stream of leadership transitions: `true` when this node
    /// gains leadership, `false` when it loses it.
    pub fn leader_changes(&self) -> mpsc::Receiver<bool> {
        let (tx, rx) = mpsc::channel(8);
        let mut metrics = self.raft.metrics();
        let node_id = self.node_id;
        tokio::spawn(async move {
            let mut was_leader = false;
            loop {
                let is_leader = metrics.borrow().current_leader == Some(node_id);
                if is_leader != was_leader {
                    was_leader = is_leader;
                    if tx.send(is_leader).await.is_err() {
                        return;
                    }
                }
                if metrics.changed().await.is_err() {
                    return;
                }
            }
        });
        rx
    }

    /// Add a broker as a voter: first as a learner until caught up, then
    /// promoted through a membership change.
    pub async fn add_voter(&self, node_id: RaftNodeId, addr: String) -> ClusterResult<()> {
        self.transport.add_node(node_id, addr.clone()).await;

        match self.raft.add_learner(node_id, BasicNode { addr }, true).await {
            Ok(_) => {}
            Err(e) => {
                let msg = e.to_string();
                if !msg.contains("already") {
                    return Err(ClusterError::Raft(msg));
                }
            }
        }

        let mut voters: BTreeSet<RaftNodeId> = self
            .raft
            .metrics()
            .borrow()
            .membership_config
            .membership()
            .voter_ids()
            .collect();
        if !voters.insert(node_id) {
            return Ok(());
        }

        self.raft
            .change_membership(voters, false)
            .await
            .map(|_| ())
            .map_err(|e| ClusterError::Raft(e.to_string()))?;
        info!(node_id, "promoted raft voter");
        Ok(())
    }

    /// Remove a server from the voter set.
    pub async fn remove_server(&self, node_id: RaftNodeId) -> ClusterResult<()> {
        let mut voters: BTreeSet<RaftNodeId> = self
            .raft
            .metrics()
            .borrow()
            .membership_config
            .membership()
            .voter_ids()
            .collect();
        if !voters.remove(&node_id) {
            return Ok(());
        }

        self.raft
            .change_membership(voters, false)
            .await
            .map(|_| ())
            .map_err(|e| ClusterError::Raft(e.to_string()))?;
        info!(node_id, "removed raft voter");
        Ok(())
    }

    pub async fn shutdown(&self) {
        if let Err(e) = self.raft.shutdown().await {
            warn!(error = %e, "raft shutdown error");
        }
    }
}
