//! TCP transport between Raft peers: length-prefixed bincode frames.
//!
//! openraft drives its own retry and heartbeat cadence, so the connection
//! here makes a single attempt per RPC and reconnects lazily when the
//! cached stream breaks.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{InstallSnapshotError, RPCError, RaftError};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::BasicNode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::warn;

use super::types::{RaftNodeId, TypeConfig};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub enum RaftRpcMessage {
    AppendEntries(AppendEntriesRequest<TypeConfig>),
    Vote(VoteRequest<RaftNodeId>),
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub enum RaftRpcResponse {
    AppendEntries(AppendEntriesResponse<RaftNodeId>),
    Vote(VoteResponse<RaftNodeId>),
    InstallSnapshot(InstallSnapshotResponse<RaftNodeId>),
    Error(String),
}

async fn write_frame(stream: &mut TcpStream, data: &[u8]) -> std::io::Result<()> {
    stream.write_all(&(data.len() as u32).to_be_bytes()).await?;
    stream.write_all(data).await
}

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Creates connections to peers, remembering their addresses.
#[derive(Clone, Default)]
pub struct RaftTransport {
    nodes: Arc<RwLock<BTreeMap<RaftNodeId, String>>>,
}

impl RaftTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_node(&self, node_id: RaftNodeId, addr: String) {
        self.nodes.write().await.insert(node_id, addr);
    }
}

impl RaftNetworkFactory<TypeConfig> for RaftTransport {
    type Network = RaftPeerConnection;

    async fn new_client(&mut self, target: RaftNodeId, node: &BasicNode) -> Self::Network {
        self.nodes.write().await.insert(target, node.addr.clone());
        RaftPeerConnection {
            target_addr: node.addr.clone(),
            cached: Mutex::new(None),
        }
    }
}

/// A connection to one Raft peer.
pub struct RaftPeerConnection {
    target_addr: String,
    cached: Mutex<Option<TcpStream>>,
}

impl RaftPeerConnection {
    async fn send(&self, message: RaftRpcMessage) -> std::io::Result<RaftRpcResponse> {
        let data = bincode::serialize(&message)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut guard = self.cached.lock().await;
        if let Some(stream) = guard.as_mut() {
            match Self::exchange(stream, &data).await {
                Ok(response) => return Ok(response),
                Err(_) => *guard = None,
            }
        }

        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.target_addr))
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect timeout to {}", self.target_addr),
                )
            })??;
        stream.set_nodelay(true)?;
        let response = Self::exchange(&mut stream, &data).await?;
        *guard = Some(stream);
        Ok(response)
    }

    async fn exchange(stream: &mut TcpStream, data: &[u8]) -> std::io::Result<RaftRpcResponse> {
        timeout(RPC_TIMEOUT, async {
            write_frame(stream, data).await?;
            let response = read_frame(stream).await?;
            bincode::deserialize(&response)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "raft rpc timeout"))?
    }
}

fn network_err<E: std::error::Error + 'static>(
    e: &dyn std::error::Error,
) -> RPCError<RaftNodeId, BasicNode, E> {
    RPCError::Network(openraft::error::NetworkError::new(&std::io::Error::other(
        e.to_string(),
    )))
}

impl RaftNetwork<TypeConfig> for RaftPeerConnection {
    async fn append_entries(
        &mut self,
        req: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        AppendEntriesResponse<RaftNodeId>,
        RPCError<RaftNodeId, BasicNode, RaftError<RaftNodeId>>,
    > {
        match self
            .send(RaftRpcMessage::AppendEntries(req))
            .await
            .map_err(|e| network_err(&e))?
        {
            RaftRpcResponse::AppendEntries(resp) => Ok(resp),
            RaftRpcResponse::Error(e) => Err(network_err(&std::io::Error::other(e))),
            _ => Err(network_err(&std::io::Error::other("unexpected response"))),
        }
    }

    async fn vote(
        &mut self,
        req: VoteRequest<RaftNodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<RaftNodeId>, RPCError<RaftNodeId, BasicNode, RaftError<RaftNodeId>>>
    {
        match self
            .send(RaftRpcMessage::Vote(req))
            .await
            .map_err(|e| network_err(&e))?
        {
            RaftRpcResponse::Vote(resp) => Ok(resp),
            RaftRpcResponse::Error(e) => Err(network_err(&std::io::Error::other(e))),
            _ => Err(network_err(&std::io::Error::other("unexpected response"))),
        }
    }

    async fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<RaftNodeId>,
        RPCError<RaftNodeId, BasicNode, RaftError<RaftNodeId, InstallSnapshotError>>,
    > {
        match self
            .send(RaftRpcMessage::InstallSnapshot(req))
            .await
            .map_err(|e| network_err(&e))?
        {
            RaftRpcResponse::InstallSnapshot(resp) => Ok(resp),
            RaftRpcResponse::Error(e) => Err(network_err(&std::io::Error::other(e))),
            _ => Err(network_err(&std::io::Error::other("unexpected response"))),
        }
    }
}

/// Accepts RPCs from Raft peers and feeds them into the local node.
pub struct RaftRpcServer {
    raft: Arc<openraft::Raft<TypeConfig>>,
    listen_addr: String,
}

impl RaftRpcServer {
    pub fn new(raft: Arc<openraft::Raft<TypeConfig>>, listen_addr: String) -> Self {
        Self { raft, listen_addr }
    }

    pub async fn run(self) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.listen_addr).await?;
        tracing::info!(addr = %self.listen_addr, "raft transport listening");

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let raft = self.raft.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(raft, stream).await {
                    warn!(peer = %peer_addr, error = %e, "raft rpc connection error");
                }
            });
        }
    }

    async fn handle_connection(
        raft: Arc<openraft::Raft<TypeConfig>>,
        mut stream: TcpStream,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let frame = match read_frame(&mut stream).await {
                Ok(frame) => frame,
                // peer closed between requests
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            let message: RaftRpcMessage = bincode::deserialize(&frame)?;

            let response = match message {
                RaftRpcMessage::AppendEntries(req) => match raft.append_entries(req).await {
                    Ok(resp) => RaftRpcResponse::AppendEntries(resp),
                    Err(e) => RaftRpcResponse::Error(e.to_string()),
                },
                RaftRpcMessage::Vote(req) => match raft.vote(req).await {
                    Ok(resp) => RaftRpcResponse::Vote(resp),
                    Err(e) => RaftRpcResponse::Error(e.to_string()),
                },
                RaftRpcMessage::InstallSnapshot(req) => match raft.install_snapshot(req).await {
                    Ok(resp) => RaftRpcResponse::InstallSnapshot(resp),
                    Err(e) => RaftRpcResponse::Error(e.to_string()),
                },
            };

            let data = bincode::serialize(&response)?;
            write_frame(&mut stream, &data).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transport_remembers_node_addresses() {
        let transport = RaftTransport::new();
        transport.add_node(1, "127.0.0.1:7001".to_string()).await;
        transport.add_node(2, "127.0.0.1:7002".to_string()).await;

        let nodes = transport.nodes.read().await;
        assert_eq!(nodes.get(&1).map(String::as_str), Some("127.0.0.1:7001"));
        assert_eq!(nodes.len(), 2);
    }

    #[tokio::test]
    async fn frame_round_trip_over_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let frame = read_frame(&mut stream).await.unwrap();
            write_frame(&mut stream, &frame).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut client, b"ping").await.unwrap();
        let echoed = read_frame(&mut client).await.unwrap();
        assert_eq!(echoed, b"ping");
        server.await.unwrap();
    }
}
