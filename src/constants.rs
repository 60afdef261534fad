//! Centralized protocol and configuration constants.

// =============================================================================
// Wire protocol
// =============================================================================

/// Fixed overhead of a v2 record batch header:
/// base_offset(8) + batch_length(4) + partition_leader_epoch(4) + magic(1)
/// + crc(4) + attributes(2) + last_offset_delta(4) + first_timestamp(8)
/// + max_timestamp(8) + producer_id(8) + producer_epoch(2)
/// + first_sequence(4) + record_count(4).
pub const BATCH_HEADER_SIZE: usize = 61;

/// Offset of the base_offset field (8 bytes, i64 big-endian).
pub const BATCH_BASE_OFFSET: usize = 0;

/// Offset of the batch_length field (4 bytes, i32 big-endian). The batch
/// frame occupies `12 + batch_length` bytes in a record set.
pub const BATCH_LENGTH_OFFSET: usize = 8;

/// Offset of the CRC field (4 bytes, u32 big-endian).
pub const BATCH_CRC_OFFSET: usize = 17;

/// Start of the CRC-covered region (attributes through end of batch).
pub const BATCH_CRC_DATA_START: usize = 21;

/// Offset of the last_offset_delta field (4 bytes, i32 big-endian).
/// record_count = last_offset_delta + 1.
pub const BATCH_LAST_OFFSET_DELTA_OFFSET: usize = 23;

/// Minimum bytes needed to read last_offset_delta.
pub const BATCH_LAST_OFFSET_DELTA_END: usize = 27;

/// Upper bound on array lengths accepted while parsing requests. Prevents
/// memory exhaustion from frames that claim billions of elements.
pub const MAX_PROTOCOL_ARRAY_SIZE: i32 = 100_000;

/// Maximum accepted request frame size (100 MB).
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

// =============================================================================
// Storage
// =============================================================================

/// Default segment roll threshold.
pub const DEFAULT_MAX_SEGMENT_BYTES: u64 = 64 * 1024 * 1024;

/// A sparse index entry is written once this many bytes of batch data have
/// accumulated since the previous entry.
pub const INDEX_INTERVAL_BYTES: u64 = 4096;

/// On-disk size of one sparse index entry:
/// relative_offset (u32) + byte_position (u64).
pub const INDEX_ENTRY_SIZE: usize = 12;

// =============================================================================
// Replication
// =============================================================================

/// Replicator fetch: bytes the follower asks for per round.
pub const REPLICA_FETCH_MAX_BYTES: i32 = 1024 * 1024;

/// Replicator fetch: how long the leader may hold the fetch open.
pub const REPLICA_FETCH_MAX_WAIT_MS: i32 = 250;

/// Replicator fetch: minimum bytes before the leader responds early.
pub const REPLICA_FETCH_MIN_BYTES: i32 = 1;

/// First backoff delay after a replicator transport error.
pub const REPLICA_BACKOFF_BASE_MS: u64 = 50;

/// Backoff cap for replicator retries.
pub const REPLICA_BACKOFF_MAX_MS: u64 = 2_500;

// =============================================================================
// Cluster
// =============================================================================

/// Interval between gossip liveness probes.
pub const GOSSIP_PROBE_INTERVAL_MS: u64 = 1_000;

/// Consecutive failed probes before a member is declared failed.
pub const GOSSIP_SUSPECT_PROBES: u32 = 3;

/// How long a leaving broker waits for its Raft voter removal to commit.
pub const LEAVE_DRAIN_TIMEOUT_MS: u64 = 5_000;

/// Dispatcher poll interval while a Fetch waits for MinBytes.
pub const FETCH_POLL_INTERVAL_MS: u64 = 25;

/// Deadline for intra-cluster RPC connects.
pub const PEER_CONNECT_TIMEOUT_MS: u64 = 3_000;

/// Deadline for a single intra-cluster request/response exchange.
pub const PEER_RPC_TIMEOUT_MS: u64 = 10_000;
