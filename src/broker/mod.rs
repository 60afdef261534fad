//! The broker: request dispatch, controller logic, and the partition role
//! machine.
//!
//! One dispatcher task consumes decoded requests and routes them by kind.
//! Metadata mutations go through the Raft layer; data paths read the
//! metadata store and the local commit logs. Controller responsibilities
//! (topic creation and deletion, LeaderAndIsr fan-out) activate only while
//! this broker's Raft instance is the cluster leader.

pub mod client;
pub mod lookup;
pub mod replica;
pub mod replicator;

pub use client::PeerClient;
pub use lookup::BrokerLookup;
pub use replica::{Replica, ReplicaRegistry};
pub use replicator::{Replicator, ReplicatorConfig};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::cluster::raft::RaftLayer;
use crate::cluster::{
    Broker as BrokerRecord, BrokerStatus, Member, MemberEvent, Membership, MetadataCommand,
    MetadataStore, Partition,
};
use crate::commitlog::{CommitLog, LogOptions};
use crate::config::BrokerConfig;
use crate::constants::{FETCH_POLL_INTERVAL_MS, LEAVE_DRAIN_TIMEOUT_MS};
use crate::error::{ErrorCode, Result};
use crate::protocol::{
    encode_response_frame, ApiVersion, ApiVersionsResponse, CreateTopicsRequest,
    CreateTopicsResponse, DeleteTopicsRequest, DeleteTopicsResponse, FetchRequest, FetchResponse,
    FetchTopicResponse, LeaderAndIsrRequest, LeaderAndIsrResponse, MetadataBroker,
    MetadataRequest, MetadataResponse, OffsetsRequest, OffsetsResponse, OffsetsTopicResponse,
    PartitionMetadata, PartitionState, ProduceRequest, ProduceResponse, RequestBody,
    RequestHeader, TopicError, TopicMetadata,
};

/// Supported APIs, advertised to every client.
static API_VERSIONS: Lazy<ApiVersionsResponse> = Lazy::new(|| ApiVersionsResponse {
    error_code: ErrorCode::None,
    api_versions: vec![
        ApiVersion { api_key: 0, min_version: 2, max_version: 2 }, // Produce
        ApiVersion { api_key: 1, min_version: 1, max_version: 1 }, // Fetch
        ApiVersion { api_key: 2, min_version: 0, max_version: 0 }, // Offsets
        ApiVersion { api_key: 3, min_version: 0, max_version: 0 }, // Metadata
        ApiVersion { api_key: 4, min_version: 0, max_version: 0 }, // LeaderAndIsr
        ApiVersion { api_key: 18, min_version: 0, max_version: 0 }, // ApiVersions
        ApiVersion { api_key: 19, min_version: 0, max_version: 0 }, // CreateTopics
        ApiVersion { api_key: 20, min_version: 0, max_version: 0 }, // DeleteTopics
    ],
});

/// One decoded request plus the way back to its connection's writer task.
pub struct Inbound {
    pub header: RequestHeader,
    pub body: RequestBody,
    pub respond_to: mpsc::Sender<Vec<u8>>,
}

pub struct Broker {
    config: BrokerConfig,
    store: MetadataStore,
    raft: Arc<RaftLayer>,
    membership: Arc<Membership>,
    replicas: ReplicaRegistry,
    brokers: BrokerLookup,
    /// Set after a fresh leader's barrier commits; reset on leadership loss.
    ready_for_consistent_reads: AtomicBool,
    /// Serializes replica role transitions. Never held across fetch waits
    /// or raft proposals.
    lock: Mutex<()>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Broker {
    /// Start the broker: raft, gossip, and the background monitor tasks.
    /// The caller wires it to a listener via [`Broker::run`].
    pub async fn new(config: BrokerConfig) -> Result<Arc<Self>> {
        config.validate()?;
        tokio::fs::create_dir_all(config.log_dir()).await?;

        let store = MetadataStore::new();
        let raft = Arc::new(
            RaftLayer::new(
                config.id as u64,
                config.raft_addr.clone(),
                config.raft_dir(),
                store.clone(),
            )
            .await?,
        );
        if config.bootstrap && !raft.is_initialized() {
            raft.initialize().await?;
        }

        let local = Member {
            id: config.id,
            addr: config.addr.clone(),
            raft_addr: config.raft_addr.clone(),
            serf_addr: config.serf_addr.clone(),
            status: BrokerStatus::Alive,
        };
        let (membership, member_events) =
            Membership::start(local, config.serf_snapshot_path()).await?;
        membership.join(&config.start_join).await?;

        let (shutdown_tx, _) = broadcast::channel(1);
        let broker = Arc::new(Self {
            config,
            store,
            raft,
            membership,
            replicas: ReplicaRegistry::new(),
            brokers: BrokerLookup::new(),
            ready_for_consistent_reads: AtomicBool::new(false),
            lock: Mutex::new(()),
            shutdown_tx,
        });

        tokio::spawn(Self::monitor_leadership(broker.clone()));
        tokio::spawn(Self::monitor_membership(broker.clone(), member_events));

        info!(id = broker.config.id, addr = %broker.config.addr, "broker started");
        Ok(broker)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn replicas(&self) -> &ReplicaRegistry {
        &self.replicas
    }

    pub fn broker_lookup(&self) -> &BrokerLookup {
        &self.brokers
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    /// The controller is whichever broker currently leads Raft.
    pub fn is_controller(&self) -> bool {
        self.raft.is_leader()
    }

    pub fn is_ready_for_consistent_reads(&self) -> bool {
        self.ready_for_consistent_reads.load(Ordering::Acquire)
    }

    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    // =========================================================================
    // Dispatcher
    // =========================================================================

    /// Consume requests until shutdown. One at a time: role transitions
    /// never race in-flight handling.
    pub async fn run(self: Arc<Self>, mut requests: mpsc::Receiver<Inbound>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(id = self.config.id, "dispatcher stopping");
                    return;
                }
                inbound = requests.recv() => {
                    let Some(inbound) = inbound else { return };
                    self.dispatch(inbound).await;
                }
            }
        }
    }

    async fn dispatch(&self, inbound: Inbound) {
        let correlation_id = inbound.header.correlation_id;
        debug!(
            api = inbound.header.api_key.as_str(),
            correlation_id,
            client_id = inbound.header.client_id.as_deref().unwrap_or(""),
            "handling request"
        );

        let frame = match inbound.body {
            RequestBody::ApiVersions(_) => {
                encode_response_frame(correlation_id, &self.handle_api_versions())
            }
            RequestBody::Metadata(req) => {
                encode_response_frame(correlation_id, &self.handle_metadata(req).await)
            }
            RequestBody::Produce(req) => {
                encode_response_frame(correlation_id, &self.handle_produce(req).await)
            }
            RequestBody::Fetch(req) => {
                encode_response_frame(correlation_id, &self.handle_fetch(req).await)
            }
            RequestBody::Offsets(req) => {
                encode_response_frame(correlation_id, &self.handle_offsets(req).await)
            }
            RequestBody::CreateTopics(req) => {
                encode_response_frame(correlation_id, &self.handle_create_topics(req).await)
            }
            RequestBody::DeleteTopics(req) => {
                encode_response_frame(correlation_id, &self.handle_delete_topics(req).await)
            }
            RequestBody::LeaderAndIsr(req) => {
                encode_response_frame(correlation_id, &self.handle_leader_and_isr(req).await)
            }
            RequestBody::Unknown(_) => {
                warn!(
                    api = ?inbound.header.api_key,
                    correlation_id,
                    "dropping request with unsupported api key"
                );
                return;
            }
        };

        match frame {
            Ok(frame) => {
                if inbound.respond_to.send(frame).await.is_err() {
                    debug!(correlation_id, "connection closed before response");
                }
            }
            Err(e) => error!(correlation_id, error = %e, "failed to encode response"),
        }
    }

    // =========================================================================
    // Handlers
    // =========================================================================

    pub fn handle_api_versions(&self) -> ApiVersionsResponse {
        API_VERSIONS.clone()
    }

    pub async fn handle_metadata(&self, request: MetadataRequest) -> MetadataResponse {
        let mut brokers = Vec::new();
        for member in self.membership.members().await {
            match split_host_port(&member.addr) {
                Some((host, port)) => brokers.push(MetadataBroker {
                    node_id: member.id,
                    host,
                    port,
                }),
                None => warn!(id = member.id, addr = %member.addr, "member has unparseable address"),
            }
        }
        brokers.sort_by_key(|b| b.node_id);

        let topics = if request.topics.is_empty() {
            self.store.get_topics().await
        } else {
            let mut found = Vec::new();
            let mut missing = Vec::new();
            for name in &request.topics {
                match self.store.get_topic(name).await {
                    Some(topic) => found.push(topic),
                    None => missing.push(name.clone()),
                }
            }
            let mut metadata: Vec<TopicMetadata> = Vec::with_capacity(found.len() + missing.len());
            for topic in found {
                metadata.push(self.topic_metadata(topic).await);
            }
            for name in missing {
                metadata.push(TopicMetadata {
                    error_code: ErrorCode::UnknownTopicOrPartition,
                    topic: name,
                    partitions: vec![],
                });
            }
            return MetadataResponse {
                brokers,
                topics: metadata,
            };
        };

        let mut metadata = Vec::with_capacity(topics.len());
        for topic in topics {
            metadata.push(self.topic_metadata(topic).await);
        }
        MetadataResponse {
            brokers,
            topics: metadata,
        }
    }

    async fn topic_metadata(&self, topic: crate::cluster::Topic) -> TopicMetadata {
        let mut partitions = Vec::with_capacity(topic.partitions.len());
        for id in topic.partitions.keys() {
            match self.store.get_partition(&topic.name, *id).await {
                Some(p) => partitions.push(PartitionMetadata {
                    error_code: ErrorCode::None,
                    partition: p.id,
                    leader: p.leader,
                    replicas: p.replicas,
                    isr: p.isr,
                }),
                None => partitions.push(PartitionMetadata {
                    error_code: ErrorCode::UnknownTopicOrPartition,
                    partition: *id,
                    leader: -1,
                    replicas: vec![],
                    isr: vec![],
                }),
            }
        }
        TopicMetadata {
            error_code: ErrorCode::None,
            topic: topic.name,
            partitions,
        }
    }

    pub async fn handle_create_topics(&self, request: CreateTopicsRequest) -> CreateTopicsResponse {
        let is_controller = self.is_controller();
        let member_count = self.membership.num_members().await;

        let mut topic_errors = Vec::with_capacity(request.requests.len());
        for req in request.requests {
            let error_code = if !is_controller {
                ErrorCode::NotController
            } else if req.replication_factor < 1
                || req.replication_factor as usize > member_count
            {
                ErrorCode::InvalidReplicationFactor
            } else {
                self.create_topic(&req.topic, req.num_partitions, req.replication_factor)
                    .await
            };
            topic_errors.push(TopicError {
                topic: req.topic,
                error_code,
            });
        }
        CreateTopicsResponse { topic_errors }
    }

    pub async fn handle_delete_topics(&self, request: DeleteTopicsRequest) -> DeleteTopicsResponse {
        let is_controller = self.is_controller();
        let mut topic_errors = Vec::with_capacity(request.topics.len());
        for topic in request.topics {
            let error_code = if !is_controller {
                ErrorCode::NotController
            } else {
                match self
                    .raft
                    .apply(MetadataCommand::DeregisterTopic {
                        name: topic.clone(),
                    })
                    .await
                {
                    Ok(_) => ErrorCode::None,
                    Err(e) => {
                        error!(topic = %topic, error = %e, "topic deregistration failed");
                        e.code()
                    }
                }
            };
            topic_errors.push(TopicError {
                topic,
                error_code,
            });
        }
        DeleteTopicsResponse { topic_errors }
    }

    pub async fn handle_produce(&self, request: ProduceRequest) -> ProduceResponse {
        let mut topics = Vec::with_capacity(request.topics.len());
        for topic_data in request.topics {
            let mut partitions = Vec::with_capacity(topic_data.partitions.len());
            let topic_exists = self.store.get_topic(&topic_data.topic).await.is_some();

            for p in topic_data.partitions {
                if !topic_exists {
                    partitions.push(crate::protocol::ProducePartitionResponse::error(
                        p.partition,
                        ErrorCode::UnknownTopicOrPartition,
                    ));
                    continue;
                }

                let Some(handle) = self.replicas.get(&topic_data.topic, p.partition) else {
                    partitions.push(crate::protocol::ProducePartitionResponse::error(
                        p.partition,
                        ErrorCode::ReplicaNotAvailable,
                    ));
                    continue;
                };

                let log = {
                    let replica = handle.lock().await;
                    if !replica.is_leader() {
                        partitions.push(crate::protocol::ProducePartitionResponse::error(
                            p.partition,
                            ErrorCode::NotLeaderForPartition,
                        ));
                        continue;
                    }
                    match replica.log.clone() {
                        Some(log) => log,
                        None => {
                            partitions.push(crate::protocol::ProducePartitionResponse::error(
                                p.partition,
                                ErrorCode::ReplicaNotAvailable,
                            ));
                            continue;
                        }
                    }
                };

                let mut record_set = p.record_set.to_vec();
                match log.append(&mut record_set) {
                    Ok(base_offset) => partitions.push(crate::protocol::ProducePartitionResponse {
                        partition: p.partition,
                        error_code: ErrorCode::None,
                        base_offset,
                        log_append_time: unix_millis(),
                    }),
                    Err(e) => {
                        error!(
                            topic = %topic_data.topic,
                            partition = p.partition,
                            error = %e,
                            "append failed"
                        );
                        partitions.push(crate::protocol::ProducePartitionResponse::error(
                            p.partition,
                            e.code(),
                        ));
                    }
                }
            }
            topics.push(crate::protocol::ProduceTopicResponse {
                topic: topic_data.topic,
                partitions,
            });
        }
        ProduceResponse {
            topics,
            throttle_time_ms: 0,
        }
    }

    pub async fn handle_fetch(&self, request: FetchRequest) -> FetchResponse {
        let deadline = Instant::now()
            + Duration::from_millis(request.max_wait_ms.max(0) as u64);
        let min_bytes = request.min_bytes.max(0) as usize;

        let mut topics = Vec::with_capacity(request.topics.len());
        for topic in request.topics {
            let mut partitions = Vec::with_capacity(topic.partitions.len());
            for p in topic.partitions {
                let Some(handle) = self.replicas.get(&topic.topic, p.partition) else {
                    partitions.push(crate::protocol::FetchPartitionResponse::error(
                        p.partition,
                        ErrorCode::ReplicaNotAvailable,
                    ));
                    continue;
                };
                let log = {
                    let replica = handle.lock().await;
                    if !replica.is_leader() {
                        partitions.push(crate::protocol::FetchPartitionResponse::error(
                            p.partition,
                            ErrorCode::NotLeaderForPartition,
                        ));
                        continue;
                    }
                    match replica.log.clone() {
                        Some(log) => log,
                        None => {
                            partitions.push(crate::protocol::FetchPartitionResponse::error(
                                p.partition,
                                ErrorCode::ReplicaNotAvailable,
                            ));
                            continue;
                        }
                    }
                };

                match self
                    .collect_fetch(&log, p.fetch_offset, p.max_bytes, min_bytes, deadline)
                    .await
                {
                    Ok(record_set) => {
                        partitions.push(crate::protocol::FetchPartitionResponse {
                            partition: p.partition,
                            error_code: ErrorCode::None,
                            high_watermark: log.newest_offset(),
                            record_set: record_set.into(),
                        });
                    }
                    Err(code) => {
                        partitions.push(crate::protocol::FetchPartitionResponse::error(
                            p.partition,
                            code,
                        ));
                    }
                }
            }
            topics.push(FetchTopicResponse {
                topic: topic.topic,
                partitions,
            });
        }
        FetchResponse {
            throttle_time_ms: 0,
            topics,
        }
    }

    /// Accumulate bytes from the log until `min_bytes` arrive or the
    /// deadline passes.
    async fn collect_fetch(
        &self,
        log: &Arc<CommitLog>,
        fetch_offset: i64,
        max_bytes: i32,
        min_bytes: usize,
        deadline: Instant,
    ) -> std::result::Result<Vec<u8>, ErrorCode> {
        let mut reader = log.reader(fetch_offset, max_bytes).map_err(|e| e.code())?;
        let mut collected = Vec::new();
        let mut chunk = [0u8; 16 * 1024];

        loop {
            match std::io::Read::read(&mut reader, &mut chunk) {
                Ok(0) => {
                    if collected.len() >= min_bytes || Instant::now() >= deadline {
                        return Ok(collected);
                    }
                    tokio::time::sleep(Duration::from_millis(FETCH_POLL_INTERVAL_MS)).await;
                }
                Ok(n) => collected.extend_from_slice(&chunk[..n]),
                Err(e) => {
                    warn!(error = %e, "fetch read failed");
                    return Err(ErrorCode::Unknown);
                }
            }
        }
    }

    pub async fn handle_offsets(&self, request: OffsetsRequest) -> OffsetsResponse {
        let mut topics = Vec::with_capacity(request.topics.len());
        for topic in request.topics {
            let mut partitions = Vec::with_capacity(topic.partitions.len());
            for p in topic.partitions {
                let Some(handle) = self.replicas.get(&topic.topic, p.partition) else {
                    partitions.push(crate::protocol::OffsetsPartitionResponse {
                        partition: p.partition,
                        error_code: ErrorCode::Unknown,
                        offsets: vec![],
                    });
                    continue;
                };
                let replica = handle.lock().await;
                let Some(log) = replica.log.as_ref() else {
                    partitions.push(crate::protocol::OffsetsPartitionResponse {
                        partition: p.partition,
                        error_code: ErrorCode::Unknown,
                        offsets: vec![],
                    });
                    continue;
                };
                let offset = if p.timestamp == -2 {
                    log.oldest_offset()
                } else {
                    log.newest_offset()
                };
                partitions.push(crate::protocol::OffsetsPartitionResponse {
                    partition: p.partition,
                    error_code: ErrorCode::None,
                    offsets: vec![offset],
                });
            }
            topics.push(OffsetsTopicResponse {
                topic: topic.topic,
                partitions,
            });
        }
        OffsetsResponse { topics }
    }

    // =========================================================================
    // Controller
    // =========================================================================

    async fn create_topic(
        &self,
        name: &str,
        num_partitions: i32,
        replication_factor: i16,
    ) -> ErrorCode {
        if self.store.get_topic(name).await.is_some() {
            return ErrorCode::TopicAlreadyExists;
        }

        let members: Vec<i32> = self.brokers.brokers().iter().map(|m| m.id).collect();
        if members.is_empty() {
            return ErrorCode::Unknown;
        }
        let controller_epoch = self.raft.current_term() as i32;
        let assignments = build_partitions(
            name,
            num_partitions,
            replication_factor,
            &members,
            controller_epoch,
        );

        let mut topic = crate::cluster::Topic {
            name: name.to_string(),
            partitions: Default::default(),
        };
        for p in &assignments {
            topic.partitions.insert(p.id, p.replicas.clone());
        }

        if let Err(e) = self.raft.apply(MetadataCommand::RegisterTopic(topic)).await {
            error!(topic = name, error = %e, "topic registration failed");
            return e.code();
        }
        for p in &assignments {
            if let Err(e) = self
                .raft
                .apply(MetadataCommand::RegisterPartition(p.clone()))
                .await
            {
                error!(topic = name, partition = p.id, error = %e, "partition registration failed");
                return e.code();
            }
        }

        let request = LeaderAndIsrRequest {
            controller_id: self.config.id,
            controller_epoch,
            partition_states: assignments
                .iter()
                .map(|p| PartitionState {
                    topic: p.topic.clone(),
                    partition: p.id,
                    controller_epoch: p.controller_epoch,
                    leader: p.leader,
                    leader_epoch: p.leader_epoch,
                    isr: p.isr.clone(),
                    replicas: p.replicas.clone(),
                })
                .collect(),
        };

        for member in self.brokers.brokers() {
            if member.id == self.config.id {
                let response = self.handle_leader_and_isr(request.clone()).await;
                if let Some(p) = response
                    .partitions
                    .iter()
                    .find(|p| !p.error_code.is_none())
                {
                    error!(
                        topic = name,
                        partition = p.partition,
                        code = ?p.error_code,
                        "local leader-and-isr failed"
                    );
                    return ErrorCode::Unknown;
                }
            } else if let Err(code) = self.disseminate_to_peer(&member, name, &request).await {
                return code;
            }
        }

        info!(
            topic = name,
            partitions = num_partitions,
            replication_factor,
            "topic created"
        );
        ErrorCode::None
    }

    /// Push partition state to one peer. A freshly committed topic may not
    /// have reached the peer's state machine yet, so a handful of attempts
    /// ride out apply lag before the creation is failed with Unknown.
    async fn disseminate_to_peer(
        &self,
        member: &Member,
        topic: &str,
        request: &LeaderAndIsrRequest,
    ) -> std::result::Result<(), ErrorCode> {
        let peer = PeerClient::new(
            member.addr.clone(),
            format!("controller-{}", self.config.id),
        );

        let mut last_failure = String::new();
        for attempt in 0..3 {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(100 << attempt)).await;
            }
            match peer.leader_and_isr(request).await {
                Ok(response) => {
                    match response
                        .partitions
                        .iter()
                        .find(|p| !p.error_code.is_none())
                    {
                        None => return Ok(()),
                        Some(p) => {
                            last_failure = format!("partition {} => {:?}", p.partition, p.error_code);
                        }
                    }
                }
                Err(e) => last_failure = e.to_string(),
            }
        }

        error!(
            peer = member.id,
            topic,
            failure = %last_failure,
            "leader-and-isr dissemination failed"
        );
        Err(ErrorCode::Unknown)
    }

    // =========================================================================
    // Partition role machine
    // =========================================================================

    pub async fn handle_leader_and_isr(&self, request: LeaderAndIsrRequest) -> LeaderAndIsrResponse {
        let mut partitions = Vec::with_capacity(request.partition_states.len());
        for p in &request.partition_states {
            let error_code = self.apply_partition_state(p).await;
            partitions.push(crate::protocol::LeaderAndIsrPartitionResponse {
                topic: p.topic.clone(),
                partition: p.partition,
                error_code,
            });
        }
        LeaderAndIsrResponse {
            error_code: ErrorCode::None,
            partitions,
        }
    }

    async fn apply_partition_state(&self, p: &PartitionState) -> ErrorCode {
        let _guard = self.lock.lock().await;

        let (handle, is_new) = match self.replicas.get(&p.topic, p.partition) {
            Some(handle) => (handle, false),
            None => {
                let partition = Partition {
                    topic: p.topic.clone(),
                    id: p.partition,
                    leader: p.leader,
                    replicas: p.replicas.clone(),
                    isr: p.isr.clone(),
                    controller_epoch: p.controller_epoch,
                    leader_epoch: p.leader_epoch,
                };
                let handle = self
                    .replicas
                    .insert(Replica::new(self.config.id, partition));
                (handle, true)
            }
        };
        let mut replica = handle.lock().await;

        if !is_new && p.controller_epoch < replica.partition.controller_epoch {
            warn!(
                topic = %p.topic,
                partition = p.partition,
                stale = p.controller_epoch,
                current = replica.partition.controller_epoch,
                "rejecting stale partition state"
            );
            return ErrorCode::StaleControllerEpoch;
        }

        let code = self.start_replica(&mut replica).await;
        if !code.is_none() {
            return code;
        }

        // even a no-op command advances the epoch fence
        replica.partition.controller_epoch = p.controller_epoch;

        let self_id = self.config.id;
        if p.leader == self_id && (replica.partition.leader != self_id || is_new) {
            self.become_leader(&mut replica, p).await
        } else if p.replicas.contains(&self_id)
            && (!replica.partition.replicas.contains(&p.leader) || is_new)
        {
            self.become_follower(&mut replica, p).await
        } else {
            ErrorCode::None
        }
    }

    /// Verify this broker belongs to the partition's AR and open its log.
    async fn start_replica(&self, replica: &mut Replica) -> ErrorCode {
        let Some(topic) = self.store.get_topic(&replica.partition.topic).await else {
            return ErrorCode::UnknownTopicOrPartition;
        };
        let assigned = topic
            .partitions
            .get(&replica.partition.id)
            .map(|ar| ar.contains(&self.config.id))
            .unwrap_or(false);
        if !assigned {
            return ErrorCode::ReplicaNotAvailable;
        }

        if replica.log.is_none() {
            let dir = self
                .config
                .log_dir()
                .join(format!("{}-{}", replica.partition.topic, replica.partition.id));
            let options = LogOptions {
                max_segment_bytes: self.config.max_segment_bytes,
                max_log_bytes: self.config.max_log_bytes,
            };
            match CommitLog::open(&dir, options) {
                Ok(log) => {
                    let log = Arc::new(log);
                    replica.set_high_watermark(log.newest_offset());
                    replica.log = Some(log);
                }
                Err(e) => {
                    error!(
                        topic = %replica.partition.topic,
                        partition = replica.partition.id,
                        error = %e,
                        "cannot open commit log"
                    );
                    return ErrorCode::Unknown;
                }
            }
        }
        ErrorCode::None
    }

    async fn become_leader(&self, replica: &mut Replica, p: &PartitionState) -> ErrorCode {
        if let Some(mut replicator) = replica.replicator.take() {
            replicator.close().await;
        }
        replica.partition.leader = p.leader;
        replica.partition.replicas = p.replicas.clone();
        replica.partition.isr = p.isr.clone();
        replica.partition.leader_epoch = p.leader_epoch;
        replica.partition.controller_epoch = p.controller_epoch;
        info!(
            topic = %p.topic,
            partition = p.partition,
            leader_epoch = p.leader_epoch,
            "became leader"
        );
        ErrorCode::None
    }

    async fn become_follower(&self, replica: &mut Replica, p: &PartitionState) -> ErrorCode {
        if let Some(mut replicator) = replica.replicator.take() {
            replicator.close().await;
        }

        let Some(log) = replica.log.clone() else {
            return ErrorCode::ReplicaNotAvailable;
        };

        // Discard any suffix not covered by the high-water mark; a prior
        // leader term may have appended records that never committed. A
        // replica that was itself the leader has hw == log end.
        let hw = replica.high_watermark().min(log.newest_offset());
        if let Err(e) = log.truncate(hw) {
            error!(
                topic = %p.topic,
                partition = p.partition,
                hw,
                error = %e,
                "truncation failed"
            );
            return ErrorCode::Unknown;
        }
        replica.set_high_watermark(hw);

        replica.partition.leader = p.leader;
        replica.partition.replicas = p.replicas.clone();
        replica.partition.isr = p.isr.clone();
        replica.partition.leader_epoch = p.leader_epoch;
        replica.partition.controller_epoch = p.controller_epoch;

        let Some(leader) = self.brokers.broker_by_id(p.leader) else {
            warn!(
                topic = %p.topic,
                partition = p.partition,
                leader = p.leader,
                "leader unknown to broker lookup"
            );
            return ErrorCode::Unknown;
        };

        let client = PeerClient::new(leader.addr, format!("replica-{}", self.config.id));
        let mut replicator = Replicator::new(
            ReplicatorConfig::default(),
            p.topic.clone(),
            p.partition,
            self.config.id,
            p.leader,
            client,
            log,
            replica.hw_cell(),
        );
        if !self.config.dev_mode {
            replicator.start();
        }
        replica.replicator = Some(replicator);

        info!(
            topic = %p.topic,
            partition = p.partition,
            leader = p.leader,
            hw,
            "became follower"
        );
        ErrorCode::None
    }

    // =========================================================================
    // Background monitors
    // =========================================================================

    async fn monitor_leadership(self: Arc<Self>) {
        let mut changes = self.raft.leader_changes();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            let change = tokio::select! {
                _ = shutdown_rx.recv() => return,
                change = changes.recv() => change,
            };
            let Some(is_leader) = change else { return };

            if is_leader {
                info!(id = self.config.id, "gained cluster leadership");
                match self.raft.barrier().await {
                    Ok(_) => {
                        self.ready_for_consistent_reads.store(true, Ordering::Release);
                        // reconcile: every live member must have a broker row
                        for member in self.membership.members().await {
                            if let Err(e) = self
                                .raft
                                .apply(MetadataCommand::RegisterBroker(record_from(&member)))
                                .await
                            {
                                warn!(member = member.id, error = %e, "broker reconcile failed");
                            }
                        }
                    }
                    Err(e) => error!(error = %e, "leadership barrier failed"),
                }
            } else {
                info!(id = self.config.id, "lost cluster leadership");
                self.ready_for_consistent_reads.store(false, Ordering::Release);
            }
        }
    }

    async fn monitor_membership(self: Arc<Self>, mut events: mpsc::Receiver<MemberEvent>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            let event = tokio::select! {
                _ = shutdown_rx.recv() => return,
                event = events.recv() => event,
            };
            let Some(event) = event else { return };

            match event {
                MemberEvent::Join(member) => {
                    self.brokers.add_broker(member.clone());
                    if self.raft.is_leader() {
                        if let Err(e) = self
                            .raft
                            .apply(MetadataCommand::RegisterBroker(record_from(&member)))
                            .await
                        {
                            warn!(member = member.id, error = %e, "broker registration failed");
                        }
                        if member.id != self.config.id {
                            if let Err(e) = self
                                .raft
                                .add_voter(member.id as u64, member.raft_addr.clone())
                                .await
                            {
                                warn!(member = member.id, error = %e, "voter promotion failed");
                            }
                        }
                    }
                }
                MemberEvent::Leave(member) | MemberEvent::Failed(member) => {
                    self.brokers.remove_broker(member.id);
                    if self.raft.is_leader() {
                        if let Err(e) = self
                            .raft
                            .apply(MetadataCommand::DeregisterBroker { id: member.id })
                            .await
                        {
                            warn!(member = member.id, error = %e, "broker deregistration failed");
                        }
                        if let Err(e) = self.raft.remove_server(member.id as u64).await {
                            warn!(member = member.id, error = %e, "voter removal failed");
                        }
                    }
                }
            }
        }
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Orderly shutdown: stop the dispatcher, close replicators, leave
    /// gossip, hand off or drain the Raft seat, stop Raft.
    pub async fn shutdown(&self) {
        info!(id = self.config.id, "broker shutting down");
        let _ = self.shutdown_tx.send(());

        for (topic, partition) in self.replicas.partitions() {
            if let Some(handle) = self.replicas.get(&topic, partition) {
                let mut replica = handle.lock().await;
                if let Some(mut replicator) = replica.replicator.take() {
                    replicator.close().await;
                }
            }
        }

        self.membership.leave().await;

        let self_node = self.config.id as u64;
        if self.raft.num_peers() > 1 {
            if self.raft.is_leader() {
                if let Err(e) = self.raft.remove_server(self_node).await {
                    error!(error = %e, "failed to remove self from raft voters");
                }
            } else {
                // wait for the controller to notice the gossip leave
                let deadline = Instant::now() + Duration::from_millis(LEAVE_DRAIN_TIMEOUT_MS);
                while self.raft.contains_voter(self_node) && Instant::now() < deadline {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                if self.raft.contains_voter(self_node) {
                    warn!("raft voter removal not confirmed before deadline");
                }
            }
        }

        self.raft.shutdown().await;
        info!(id = self.config.id, "broker shut down");
    }
}

fn record_from(member: &Member) -> BrokerRecord {
    BrokerRecord {
        id: member.id,
        addr: member.addr.clone(),
        raft_addr: member.raft_addr.clone(),
        serf_addr: member.serf_addr.clone(),
        status: member.status,
    }
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(-1)
}

fn split_host_port(addr: &str) -> Option<(String, i32)> {
    let (host, port) = addr.rsplit_once(':')?;
    let port: i32 = port.parse().ok()?;
    Some((host.to_string(), port))
}

/// Deterministic partition placement. The leader of partition i is
/// members[i mod n] in broker-id-sorted order; followers continue from the
/// slot after the leader, wrapping and skipping the leader, so the AR
/// never repeats a broker even when the member count equals the
/// replication factor. ISR starts equal to AR.
pub fn build_partitions(
    topic: &str,
    num_partitions: i32,
    replication_factor: i16,
    member_ids: &[i32],
    controller_epoch: i32,
) -> Vec<Partition> {
    let n = member_ids.len();
    let mut partitions = Vec::with_capacity(num_partitions.max(0) as usize);

    for i in 0..num_partitions.max(0) {
        let leader_idx = i as usize % n;
        let leader = member_ids[leader_idx];

        let mut replicas = vec![leader];
        let mut cursor = (leader_idx + 1) % n;
        while replicas.len() < replication_factor as usize && cursor != leader_idx {
            replicas.push(member_ids[cursor]);
            cursor = (cursor + 1) % n;
        }

        partitions.push(Partition {
            topic: topic.to_string(),
            id: i,
            leader,
            isr: replicas.clone(),
            replicas,
            controller_epoch,
            leader_epoch: 0,
        });
    }
    partitions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignment_spreads_leaders_round_robin() {
        let members = [1, 2, 3];
        let partitions = build_partitions("t", 6, 1, &members, 1);
        let leaders: Vec<i32> = partitions.iter().map(|p| p.leader).collect();
        assert_eq!(leaders, vec![1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn assignment_satisfies_invariants() {
        let members = [1, 2, 3, 4, 5];
        for rf in 1..=5i16 {
            for p in build_partitions("t", 8, rf, &members, 3) {
                assert_eq!(p.replicas.len(), rf as usize, "rf {rf}");
                assert!(p.replicas.contains(&p.leader));
                assert!(p.isr.iter().all(|r| p.replicas.contains(r)));
                assert_eq!(p.controller_epoch, 3);
                // no duplicate broker ids in the AR
                let mut sorted = p.replicas.clone();
                sorted.sort_unstable();
                sorted.dedup();
                assert_eq!(sorted.len(), p.replicas.len());
            }
        }
    }

    #[test]
    fn assignment_with_rf_equal_to_member_count() {
        let members = [1, 2, 3];
        for p in build_partitions("t", 3, 3, &members, 1) {
            let mut sorted = p.replicas.clone();
            sorted.sort_unstable();
            assert_eq!(sorted, vec![1, 2, 3]);
        }
    }

    #[test]
    fn assignment_followers_follow_leader_slot() {
        let members = [10, 20, 30, 40];
        let partitions = build_partitions("t", 4, 2, &members, 1);
        assert_eq!(partitions[0].replicas, vec![10, 20]);
        assert_eq!(partitions[1].replicas, vec![20, 30]);
        assert_eq!(partitions[2].replicas, vec![30, 40]);
        assert_eq!(partitions[3].replicas, vec![40, 10]);
    }

    #[test]
    fn split_host_port_parses() {
        assert_eq!(
            split_host_port("127.0.0.1:9092"),
            Some(("127.0.0.1".to_string(), 9092))
        );
        assert_eq!(split_host_port("nohost"), None);
        assert_eq!(split_host_port("host:notaport"), None);
    }

    #[test]
    fn api_versions_lists_all_supported_keys() {
        let response = &*API_VERSIONS;
        let keys: Vec<i16> = response.api_versions.iter().map(|v| v.api_key).collect();
        assert_eq!(keys, vec![0, 1, 2, 3, 4, 18, 19, 20]);
        let produce = &response.api_versions[0];
        assert_eq!((produce.min_version, produce.max_version), (2, 2));
    }
}
