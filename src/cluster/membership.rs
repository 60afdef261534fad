//! Gossip-style membership.
//!
//! Supplies the two things the broker consumes: a stream of join, leave and
//! failure events, and a queryable member list. Each broker listens on its
//! gossip address; a joining broker announces itself to the seed addresses
//! and receives the full member list back, then announces itself to every
//! member it learned about. A probe task pings peers once a second and
//! declares a member failed after three straight misses.
//!
//! The known-peer list is persisted to `<data_dir>/serf/local.snapshot` so
//! a restarted broker can rejoin without seeds.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::commands::BrokerStatus;
use super::ClusterResult;
use crate::constants::{GOSSIP_PROBE_INTERVAL_MS, GOSSIP_SUSPECT_PROBES};

const HELLO_TIMEOUT: Duration = Duration::from_secs(2);

/// One member as seen by gossip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: i32,
    /// Client-facing address.
    pub addr: String,
    pub raft_addr: String,
    pub serf_addr: String,
    pub status: BrokerStatus,
}

/// Membership transitions delivered to the broker's event loop.
#[derive(Debug, Clone)]
pub enum MemberEvent {
    Join(Member),
    Leave(Member),
    Failed(Member),
}

#[derive(Debug, Serialize, Deserialize)]
enum GossipMessage {
    /// "I exist"; the receiver replies with Roster and records the sender.
    Hello(Member),
    /// Everything the receiver knows, including itself.
    Roster(Vec<Member>),
    Ping,
    Pong,
    /// Graceful goodbye.
    Leave(i32),
}

async fn write_message(stream: &mut TcpStream, message: &GossipMessage) -> std::io::Result<()> {
    let data = bincode::serialize(message)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    stream.write_all(&(data.len() as u32).to_be_bytes()).await?;
    stream.write_all(&data).await
}

async fn read_message(stream: &mut TcpStream) -> std::io::Result<GossipMessage> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let mut buf = vec![0u8; u32::from_be_bytes(len_buf) as usize];
    stream.read_exact(&mut buf).await?;
    bincode::deserialize(&buf).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

async fn exchange(addr: &str, message: &GossipMessage) -> std::io::Result<GossipMessage> {
    let mut stream = timeout(HELLO_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "gossip connect timeout"))??;
    timeout(HELLO_TIMEOUT, async {
        write_message(&mut stream, message).await?;
        read_message(&mut stream).await
    })
    .await
    .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "gossip exchange timeout"))?
}

/// The local gossip agent.
pub struct Membership {
    local: Member,
    members: Arc<RwLock<HashMap<i32, Member>>>,
    event_tx: mpsc::Sender<MemberEvent>,
    shutdown_tx: broadcast::Sender<()>,
    snapshot_path: PathBuf,
}

impl Membership {
    /// Bind the gossip listener and start the probe task. Events flow into
    /// the returned receiver until shutdown.
    pub async fn start(
        local: Member,
        snapshot_path: PathBuf,
    ) -> ClusterResult<(Arc<Self>, mpsc::Receiver<MemberEvent>)> {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (shutdown_tx, _) = broadcast::channel(1);

        let listener = TcpListener::bind(&local.serf_addr).await?;
        info!(addr = %local.serf_addr, id = local.id, "gossip listening");

        let membership = Arc::new(Self {
            local: local.clone(),
            members: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            shutdown_tx,
            snapshot_path,
        });

        // the local broker is always a member and always announced
        membership.insert_member(local).await;

        let listen = membership.clone();
        let mut shutdown_rx = listen.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => return,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { return };
                        let handler = listen.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handler.handle_connection(stream).await {
                                debug!(error = %e, "gossip connection error");
                            }
                        });
                    }
                }
            }
        });

        let prober = membership.clone();
        let mut shutdown_rx = prober.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut misses: HashMap<i32, u32> = HashMap::new();
            let mut tick =
                tokio::time::interval(Duration::from_millis(GOSSIP_PROBE_INTERVAL_MS));
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => return,
                    _ = tick.tick() => prober.probe_round(&mut misses).await,
                }
            }
        });

        Ok((membership, event_rx))
    }

    /// Join via the given seed addresses, then announce to every member
    /// learned from them. Previously snapshotted peers count as seeds.
    pub async fn join(&self, seeds: &[String]) -> ClusterResult<usize> {
        let mut targets: Vec<String> = seeds.to_vec();
        for peer in self.load_snapshot().await {
            if peer.id != self.local.id && !targets.contains(&peer.serf_addr) {
                targets.push(peer.serf_addr);
            }
        }

        let mut contacted = 0;
        let mut index = 0;
        while index < targets.len() {
            let target = targets[index].clone();
            index += 1;
            if target == self.local.serf_addr {
                continue;
            }
            match exchange(&target, &GossipMessage::Hello(self.local.clone())).await {
                Ok(GossipMessage::Roster(roster)) => {
                    contacted += 1;
                    for member in roster {
                        if member.id == self.local.id {
                            continue;
                        }
                        if !targets.contains(&member.serf_addr) {
                            targets.push(member.serf_addr.clone());
                        }
                        self.insert_member(member).await;
                    }
                }
                Ok(_) => warn!(target = %target, "unexpected gossip join reply"),
                Err(e) => debug!(target = %target, error = %e, "gossip seed unreachable"),
            }
        }

        self.persist_snapshot().await;
        Ok(contacted)
    }

    /// All known members, the local broker included.
    pub async fn members(&self) -> Vec<Member> {
        self.members.read().await.values().cloned().collect()
    }

    pub async fn num_members(&self) -> usize {
        self.members.read().await.len()
    }

    /// Gracefully leave: tell every peer, then stop the agent's tasks.
    pub async fn leave(&self) {
        let peers = self.members().await;
        for peer in peers {
            if peer.id == self.local.id {
                continue;
            }
            if let Err(e) = exchange(&peer.serf_addr, &GossipMessage::Leave(self.local.id)).await {
                debug!(peer = peer.id, error = %e, "leave notification failed");
            }
        }
        let _ = self.shutdown_tx.send(());
    }

    async fn handle_connection(
        &self,
        mut stream: TcpStream,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let message = read_message(&mut stream).await?;
        match message {
            GossipMessage::Hello(member) => {
                debug!(id = member.id, addr = %member.serf_addr, "gossip hello");
                self.insert_member(member).await;
                let roster = self.members().await;
                write_message(&mut stream, &GossipMessage::Roster(roster)).await?;
                self.persist_snapshot().await;
            }
            GossipMessage::Ping => {
                write_message(&mut stream, &GossipMessage::Pong).await?;
            }
            GossipMessage::Leave(id) => {
                let removed = self.members.write().await.remove(&id);
                if let Some(mut member) = removed {
                    info!(id, "member left");
                    member.status = BrokerStatus::Left;
                    let _ = self.event_tx.send(MemberEvent::Leave(member)).await;
                    self.persist_snapshot().await;
                }
                write_message(&mut stream, &GossipMessage::Pong).await?;
            }
            GossipMessage::Roster(_) | GossipMessage::Pong => {}
        }
        Ok(())
    }

    async fn insert_member(&self, member: Member) {
        let mut members = self.members.write().await;
        let is_new = members.insert(member.id, member.clone()).is_none();
        drop(members);
        if is_new {
            info!(id = member.id, addr = %member.addr, "member joined");
            let _ = self.event_tx.send(MemberEvent::Join(member)).await;
        }
    }

    async fn probe_round(&self, misses: &mut HashMap<i32, u32>) {
        let peers = self.members().await;
        for peer in peers {
            if peer.id == self.local.id {
                continue;
            }
            match exchange(&peer.serf_addr, &GossipMessage::Ping).await {
                Ok(GossipMessage::Pong) => {
                    misses.remove(&peer.id);
                }
                _ => {
                    let count = misses.entry(peer.id).or_insert(0);
                    *count += 1;
                    if *count >= GOSSIP_SUSPECT_PROBES {
                        misses.remove(&peer.id);
                        let removed = self.members.write().await.remove(&peer.id);
                        if let Some(mut member) = removed {
                            warn!(id = member.id, "member failed");
                            member.status = BrokerStatus::Failed;
                            let _ = self.event_tx.send(MemberEvent::Failed(member)).await;
                            self.persist_snapshot().await;
                        }
                    }
                }
            }
        }
    }

    async fn load_snapshot(&self) -> Vec<Member> {
        match tokio::fs::read(&self.snapshot_path).await {
            Ok(data) => serde_json::from_slice(&data).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    async fn persist_snapshot(&self) {
        let members = self.members().await;
        if let Some(parent) = self.snapshot_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(error = %e, "cannot create gossip snapshot dir");
                return;
            }
        }
        match serde_json::to_vec_pretty(&members) {
            Ok(data) => {
                if let Err(e) = tokio::fs::write(&self.snapshot_path, data).await {
                    warn!(error = %e, "cannot write gossip snapshot");
                }
            }
            Err(e) => warn!(error = %e, "cannot serialize gossip snapshot"),
        }
    }
}
