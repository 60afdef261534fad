//! Client-facing TCP server.
//!
//! Accepts connections and gives each one a reader task and a writer task.
//! The reader decodes length-prefixed frames into typed requests and pumps
//! them onto the broker's request channel together with a per-connection
//! reply sender; the writer drains encoded response frames back onto the
//! socket. Responses to pipelined requests keep their order because the
//! dispatcher handles requests one at a time.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::broker::Inbound;
use crate::constants::MAX_FRAME_SIZE;
use crate::error::{Error, Result};
use crate::protocol::parse_request;

pub struct Server {
    listener: TcpListener,
    requests: mpsc::Sender<Inbound>,
}

impl Server {
    /// Bind the client listener. Requests flow into `requests`; the broker
    /// dispatcher consumes them.
    pub async fn bind(addr: &str, requests: mpsc::Sender<Inbound>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %addr, "client listener bound");
        Ok(Self { listener, requests })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Error::from)
    }

    /// Accept connections until the shutdown signal fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("server no longer accepting connections");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!(peer = %peer, "accepted connection");
                    let requests = self.requests.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, peer, requests).await;
                        debug!(peer = %peer, "connection closed");
                    });
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, requests: mpsc::Sender<Inbound>) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "set_nodelay failed");
    }
    let (mut read_half, mut write_half) = stream.into_split();

    let (reply_tx, mut reply_rx) = mpsc::channel::<Vec<u8>>(64);
    let writer = tokio::spawn(async move {
        while let Some(frame) = reply_rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                return;
            }
        }
    });

    loop {
        let payload = match read_frame(&mut read_half).await {
            Ok(Some(payload)) => payload,
            Ok(None) => break,
            Err(e) => {
                debug!(peer = %peer, error = %e, "read error");
                break;
            }
        };

        let (header, body) = match parse_request(payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(peer = %peer, error = %e, "unparseable request, dropping connection");
                break;
            }
        };

        let inbound = Inbound {
            header,
            body,
            respond_to: reply_tx.clone(),
        };
        if requests.send(inbound).await.is_err() {
            // broker is shutting down
            break;
        }
    }

    drop(reply_tx);
    let _ = writer.await;
}

/// Read one length-prefixed frame. `None` on clean EOF between frames.
async fn read_frame(read_half: &mut OwnedReadHalf) -> Result<Option<Bytes>> {
    let mut len_buf = [0u8; 4];
    match read_half.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = i32::from_be_bytes(len_buf);
    if len <= 0 || len as usize > MAX_FRAME_SIZE {
        return Err(Error::MissingData(format!("bad frame length {len}")));
    }

    let mut payload = vec![0u8; len as usize];
    read_half.read_exact(&mut payload).await?;
    Ok(Some(Bytes::from(payload)))
}
