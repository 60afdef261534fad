//! # Brokkr
//! A distributed append-only log broker speaking the Kafka wire protocol.
//!
//! Producers append record batches to topic partitions; consumers fetch
//! ranges of those batches by offset. A small set of peer brokers owns the
//! topic metadata through a Raft-replicated state machine, distributes
//! partition leadership among themselves, and replicates each partition's
//! log from its leader to its followers.
//!
//! # Architecture
//!
//! - [`commitlog`]: the per-partition segmented, index-backed byte log.
//! - [`cluster`]: the replicated metadata store, the consensus wrapper and
//!   the gossip membership layer.
//! - [`broker`]: request dispatch, controller logic, the partition role
//!   machine and the follower replicator.
//! - [`server`]: the client-facing TCP listener.
//! - [`protocol`]: the typed wire codec, shared by the server side and the
//!   intra-cluster client.
//!
//! # Starting a broker
//!
//! ```rust,no_run
//! use brokkr::broker::Broker;
//! use brokkr::config::BrokerConfig;
//! use brokkr::server::Server;
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     brokkr::telemetry::init_logging(brokkr::telemetry::LogFormat::from_env())?;
//!
//!     let mut config = BrokerConfig::new(1, "/var/lib/brokkr");
//!     config.bootstrap = true;
//!
//!     let broker = Broker::new(config.clone()).await?;
//!     let (requests_tx, requests_rx) = mpsc::channel(1024);
//!     let server = Server::bind(&config.addr, requests_tx).await?;
//!
//!     let shutdown = broker.shutdown_signal();
//!     tokio::spawn(broker.clone().run(requests_rx));
//!     server.run(shutdown).await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

pub mod broker;
pub mod cluster;
pub mod commitlog;
pub mod config;
pub mod constants;
pub mod error;
pub mod protocol;
pub mod server;
pub mod telemetry;
pub mod wire;

pub use error::{Error, ErrorCode, Result};
