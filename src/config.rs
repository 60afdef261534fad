//! Broker configuration.

use std::path::PathBuf;

use crate::constants::DEFAULT_MAX_SEGMENT_BYTES;
use crate::error::{Error, Result};

/// Configuration for a single broker.
///
/// Addresses are `host:port` strings. `addr` is the client-facing listener;
/// `raft_addr` the consensus transport; `serf_addr` the gossip listener.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Stable broker id, unique across the cluster.
    pub id: i32,
    /// Root directory for partition logs, Raft state and the gossip
    /// snapshot.
    pub data_dir: PathBuf,
    /// Client-facing bind address.
    pub addr: String,
    /// Raft transport bind address.
    pub raft_addr: String,
    /// Gossip bind address.
    pub serf_addr: String,
    /// Seed addresses for the initial gossip join.
    pub start_join: Vec<String>,
    /// Segment roll threshold in bytes.
    pub max_segment_bytes: u64,
    /// Per-partition retention cap in bytes; -1 = unbounded.
    pub max_log_bytes: i64,
    /// Initialize a fresh single-node Raft cluster on startup. Exactly one
    /// broker in a new cluster sets this; the rest join through gossip.
    pub bootstrap: bool,
    /// When true, replicators are created but not started. Test aid.
    pub dev_mode: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            id: 0,
            data_dir: PathBuf::from("/tmp/brokkr"),
            addr: "127.0.0.1:9092".to_string(),
            raft_addr: "127.0.0.1:9093".to_string(),
            serf_addr: "127.0.0.1:9094".to_string(),
            start_join: vec![],
            max_segment_bytes: DEFAULT_MAX_SEGMENT_BYTES,
            max_log_bytes: -1,
            bootstrap: false,
            dev_mode: false,
        }
    }
}

impl BrokerConfig {
    /// Build a config with the given id and data directory, everything
    /// else default.
    pub fn new(id: i32, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            id,
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Validate the configuration. Called by `Broker::new` before any state
    /// is touched.
    pub fn validate(&self) -> Result<()> {
        if self.id < 0 {
            return Err(Error::Config(format!("broker id must be >= 0, got {}", self.id)));
        }
        if self.max_segment_bytes == 0 {
            return Err(Error::Config("max_segment_bytes must be positive".to_string()));
        }
        if self.max_log_bytes < -1 {
            return Err(Error::Config(format!(
                "max_log_bytes must be -1 or >= 0, got {}",
                self.max_log_bytes
            )));
        }
        for (name, addr) in [
            ("addr", &self.addr),
            ("raft_addr", &self.raft_addr),
            ("serf_addr", &self.serf_addr),
        ] {
            if !addr.contains(':') {
                return Err(Error::Config(format!("{name} must be host:port, got {addr}")));
            }
        }
        Ok(())
    }

    /// Directory holding partition logs.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("data")
    }

    /// Directory holding Raft state.
    pub fn raft_dir(&self) -> PathBuf {
        self.data_dir.join("raft")
    }

    /// Path of the gossip peer snapshot.
    pub fn serf_snapshot_path(&self) -> PathBuf {
        self.data_dir.join("serf").join("local.snapshot")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(BrokerConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_negative_id() {
        let cfg = BrokerConfig {
            id: -1,
            ..BrokerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_segment_size() {
        let cfg = BrokerConfig {
            max_segment_bytes: 0,
            ..BrokerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_bad_retention() {
        let cfg = BrokerConfig {
            max_log_bytes: -2,
            ..BrokerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_portless_addr() {
        let cfg = BrokerConfig {
            addr: "localhost".to_string(),
            ..BrokerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn derived_paths() {
        let cfg = BrokerConfig::new(1, "/var/lib/brokkr");
        assert_eq!(cfg.log_dir(), PathBuf::from("/var/lib/brokkr/data"));
        assert_eq!(cfg.raft_dir(), PathBuf::from("/var/lib/brokkr/raft"));
        assert_eq!(
            cfg.serf_snapshot_path(),
            PathBuf::from("/var/lib/brokkr/serf/local.snapshot")
        );
    }
}
