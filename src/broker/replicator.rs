//! Follower-side pull loop.
//!
//! One replicator per follower replica. Each round fetches from the leader
//! at the local log end offset, appends whatever comes back, and advances
//! the high-water mark to the leader's (clamped to the local log end).
//! Transport errors back off exponentially with jitter and retry forever;
//! the loop only exits on close.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::client::PeerClient;
use crate::commitlog::CommitLog;
use crate::constants::{
    REPLICA_BACKOFF_BASE_MS, REPLICA_BACKOFF_MAX_MS, REPLICA_FETCH_MAX_BYTES,
    REPLICA_FETCH_MAX_WAIT_MS, REPLICA_FETCH_MIN_BYTES,
};
use crate::error::ErrorCode;
use crate::protocol::{FetchPartition, FetchRequest, FetchTopic};

#[derive(Debug, Clone, Copy)]
pub struct ReplicatorConfig {
    pub max_wait_ms: i32,
    pub min_bytes: i32,
    pub max_bytes: i32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            max_wait_ms: REPLICA_FETCH_MAX_WAIT_MS,
            min_bytes: REPLICA_FETCH_MIN_BYTES,
            max_bytes: REPLICA_FETCH_MAX_BYTES,
            backoff_base: Duration::from_millis(REPLICA_BACKOFF_BASE_MS),
            backoff_max: Duration::from_millis(REPLICA_BACKOFF_MAX_MS),
        }
    }
}

pub struct Replicator {
    config: ReplicatorConfig,
    topic: String,
    partition: i32,
    follower_id: i32,
    leader_id: i32,
    client: Option<Arc<PeerClient>>,
    log: Arc<CommitLog>,
    hw: Arc<AtomicI64>,
    shutdown_tx: broadcast::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Replicator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ReplicatorConfig,
        topic: String,
        partition: i32,
        follower_id: i32,
        leader_id: i32,
        client: PeerClient,
        log: Arc<CommitLog>,
        hw: Arc<AtomicI64>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            topic,
            partition,
            follower_id,
            leader_id,
            client: Some(Arc::new(client)),
            log,
            hw,
            shutdown_tx,
            handle: None,
        }
    }

    /// The broker id this replicator pulls from.
    pub fn leader_id(&self) -> i32 {
        self.leader_id
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Spawn the pull loop. In dev mode the broker constructs replicators
    /// without starting them.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        let Some(client) = self.client.clone() else {
            return;
        };

        let config = self.config;
        let topic = self.topic.clone();
        let partition = self.partition;
        let follower_id = self.follower_id;
        let log = self.log.clone();
        let hw = self.hw.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        self.handle = Some(tokio::spawn(async move {
            let mut failures: u32 = 0;
            loop {
                let round = fetch_round(
                    &config, &topic, partition, follower_id, &client, &log, &hw,
                );
                let outcome = tokio::select! {
                    _ = shutdown_rx.recv() => return,
                    outcome = round => outcome,
                };

                let delay = match outcome {
                    RoundOutcome::Progress => {
                        failures = 0;
                        continue;
                    }
                    RoundOutcome::CaughtUp => {
                        failures = 0;
                        // the leader parks empty fetches for max_wait_ms
                        continue;
                    }
                    RoundOutcome::LeaderMoved => {
                        // wait for a LeaderAndIsr to retarget or close us
                        Duration::from_millis(500)
                    }
                    RoundOutcome::Failed => {
                        failures = failures.saturating_add(1);
                        backoff(&config, failures)
                    }
                };

                tokio::select! {
                    _ = shutdown_rx.recv() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }));
    }

    /// Stop the loop, cancelling any in-flight fetch. Returns only after
    /// the loop task has exited; the leader connection drops with it.
    pub async fn close(&mut self) {
        let _ = self.shutdown_tx.send(());
        self.client = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        debug!(
            topic = %self.topic,
            partition = self.partition,
            leader = self.leader_id,
            "replicator closed"
        );
    }
}

enum RoundOutcome {
    /// Appended at least one byte.
    Progress,
    /// Leader had nothing new past our log end.
    CaughtUp,
    /// Leader answered NotLeaderForPartition.
    LeaderMoved,
    /// Transport or append failure.
    Failed,
}

fn backoff(config: &ReplicatorConfig, failures: u32) -> Duration {
    let exp = config
        .backoff_base
        .saturating_mul(1u32 << failures.min(16).saturating_sub(1))
        .min(config.backoff_max);
    // +/- 25% jitter
    let jitter = 0.75 + fastrand::f64() * 0.5;
    Duration::from_secs_f64(exp.as_secs_f64() * jitter)
}

#[allow(clippy::too_many_arguments)]
async fn fetch_round(
    config: &ReplicatorConfig,
    topic: &str,
    partition: i32,
    follower_id: i32,
    client: &PeerClient,
    log: &Arc<CommitLog>,
    hw: &Arc<AtomicI64>,
) -> RoundOutcome {
    let fetch_offset = log.newest_offset();
    let request = FetchRequest {
        replica_id: follower_id,
        max_wait_ms: config.max_wait_ms,
        min_bytes: config.min_bytes,
        topics: vec![FetchTopic {
            topic: topic.to_string(),
            partitions: vec![FetchPartition {
                partition,
                fetch_offset,
                max_bytes: config.max_bytes,
            }],
        }],
    };

    let response = match client.fetch(&request).await {
        Ok(response) => response,
        Err(e) => {
            warn!(topic, partition, leader = %client.addr(), error = %e, "replica fetch failed");
            return RoundOutcome::Failed;
        }
    };

    let Some(p) = response
        .topics
        .iter()
        .find(|t| t.topic == topic)
        .and_then(|t| t.partitions.iter().find(|p| p.partition == partition))
    else {
        warn!(topic, partition, "leader response missing our partition");
        return RoundOutcome::Failed;
    };

    match p.error_code {
        ErrorCode::None => {}
        ErrorCode::NotLeaderForPartition => {
            debug!(topic, partition, "fetch target is no longer the leader");
            return RoundOutcome::LeaderMoved;
        }
        code => {
            warn!(topic, partition, ?code, "leader rejected replica fetch");
            return RoundOutcome::Failed;
        }
    }

    let mut progressed = false;
    if !p.record_set.is_empty() {
        // append preserves response order; a failed append aborts the
        // round so the next fetch restarts cleanly at the new log end
        let mut record_set = p.record_set.to_vec();
        match log.append(&mut record_set) {
            Ok(_) => progressed = true,
            Err(e) => {
                warn!(topic, partition, error = %e, "replica append failed");
                return RoundOutcome::Failed;
            }
        }
    }

    let clamped = p.high_watermark.min(log.newest_offset());
    if clamped >= 0 {
        hw.store(clamped, Ordering::Release);
    }

    if progressed {
        RoundOutcome::Progress
    } else {
        RoundOutcome::CaughtUp
    }
}
