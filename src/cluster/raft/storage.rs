//! Raft log and state machine storage.
//!
//! The log lives in memory; what must survive restarts is the metadata
//! state, persisted as snapshots under `<data_dir>/raft/`. Snapshot writes
//! use a temp-file + rename two-phase commit: the metadata file is the
//! commit marker, so a crash mid-write leaves the previous snapshot valid.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::path::PathBuf;
use std::sync::Arc;

use openraft::{
    BasicNode, Entry, EntryPayload, LogId, OptionalSend, RaftStorage, Snapshot, SnapshotMeta,
    StorageError, StoredMembership, Vote,
};
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::types::{RaftNodeId, TypeConfig};
use crate::cluster::commands::MetadataResponse;
use crate::cluster::store::MetadataStore;

const SNAPSHOT_FILE: &str = "current.snapshot";
const SNAPSHOT_META_FILE: &str = "current.meta";

/// Metadata persisted alongside the snapshot data.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
struct PersistedSnapshotMeta {
    last_log_id: Option<LogId<RaftNodeId>>,
    last_membership: StoredMembership<RaftNodeId, BasicNode>,
    snapshot_id: String,
}

#[derive(Clone)]
struct CachedSnapshot {
    meta: SnapshotMeta<RaftNodeId, BasicNode>,
    data: Vec<u8>,
}

fn storage_io_err(verb: openraft::ErrorVerb, e: impl std::fmt::Display) -> StorageError<RaftNodeId> {
    StorageError::from_io_error(
        openraft::ErrorSubject::Snapshot(None),
        verb,
        std::io::Error::other(e.to_string()),
    )
}

/// Combined log and state machine storage.
pub struct RaftStore {
    vote: Arc<RwLock<Option<Vote<RaftNodeId>>>>,
    log: Arc<RwLock<BTreeMap<u64, Entry<TypeConfig>>>>,
    last_purged_log_id: Arc<RwLock<Option<LogId<RaftNodeId>>>>,
    store: MetadataStore,
    last_applied_log: Arc<RwLock<Option<LogId<RaftNodeId>>>>,
    last_membership: Arc<RwLock<StoredMembership<RaftNodeId, BasicNode>>>,
    cached_snapshot: Arc<RwLock<Option<CachedSnapshot>>>,
    snapshot_dir: PathBuf,
}

impl Clone for RaftStore {
    fn clone(&self) -> Self {
        Self {
            vote: self.vote.clone(),
            log: self.log.clone(),
            last_purged_log_id: self.last_purged_log_id.clone(),
            store: self.store.clone(),
            last_applied_log: self.last_applied_log.clone(),
            last_membership: self.last_membership.clone(),
            cached_snapshot: self.cached_snapshot.clone(),
            snapshot_dir: self.snapshot_dir.clone(),
        }
    }
}

impl RaftStore {
    pub fn new(store: MetadataStore, snapshot_dir: PathBuf) -> Self {
        Self {
            vote: Arc::new(RwLock::new(None)),
            log: Arc::new(RwLock::new(BTreeMap::new())),
            last_purged_log_id: Arc::new(RwLock::new(None)),
            store,
            last_applied_log: Arc::new(RwLock::new(None)),
            last_membership: Arc::new(RwLock::new(StoredMembership::default())),
            cached_snapshot: Arc::new(RwLock::new(None)),
            snapshot_dir,
        }
    }

    /// Restore state from the latest on-disk snapshot, if one exists.
    /// Returns whether a snapshot was loaded. A present-but-corrupt
    /// snapshot fails startup rather than silently starting empty.
    pub async fn load_snapshot_from_disk(&self) -> Result<bool, StorageError<RaftNodeId>> {
        tokio::fs::create_dir_all(&self.snapshot_dir)
            .await
            .map_err(|e| storage_io_err(openraft::ErrorVerb::Read, e))?;
        self.cleanup_temp_files().await;

        let meta_path = self.snapshot_dir.join(SNAPSHOT_META_FILE);
        let data_path = self.snapshot_dir.join(SNAPSHOT_FILE);

        let meta_bytes = match tokio::fs::read(&meta_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(storage_io_err(openraft::ErrorVerb::Read, e)),
        };
        let meta: PersistedSnapshotMeta = bincode::deserialize(&meta_bytes)
            .map_err(|e| storage_io_err(openraft::ErrorVerb::Read, e))?;

        // meta is the commit marker; data must exist and deserialize
        let data = tokio::fs::read(&data_path)
            .await
            .map_err(|e| storage_io_err(openraft::ErrorVerb::Read, e))?;
        self.store
            .restore(&data)
            .await
            .map_err(|e| storage_io_err(openraft::ErrorVerb::Read, e))?;

        *self.last_applied_log.write().await = meta.last_log_id;
        *self.last_membership.write().await = meta.last_membership.clone();

        let meta = SnapshotMeta {
            last_log_id: meta.last_log_id,
            last_membership: meta.last_membership,
            snapshot_id: meta.snapshot_id,
        };
        info!(
            snapshot_id = %meta.snapshot_id,
            last_log_index = ?meta.last_log_id.map(|l| l.index),
            "restored metadata snapshot from disk"
        );
        *self.cached_snapshot.write().await = Some(CachedSnapshot { meta, data });
        Ok(true)
    }

    async fn cleanup_temp_files(&self) {
        let Ok(mut entries) = tokio::fs::read_dir(&self.snapshot_dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with("temp-") {
                if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                    warn!(path = ?entry.path(), error = %e, "failed to remove orphaned temp snapshot");
                }
            }
        }
    }

    async fn persist_snapshot(
        &self,
        meta: &SnapshotMeta<RaftNodeId, BasicNode>,
        data: &[u8],
    ) -> Result<(), StorageError<RaftNodeId>> {
        tokio::fs::create_dir_all(&self.snapshot_dir)
            .await
            .map_err(|e| storage_io_err(openraft::ErrorVerb::Write, e))?;

        let temp_data = self
            .snapshot_dir
            .join(format!("temp-{}.snapshot", meta.snapshot_id));
        let temp_meta = self
            .snapshot_dir
            .join(format!("temp-{}.meta", meta.snapshot_id));

        let persisted = PersistedSnapshotMeta {
            last_log_id: meta.last_log_id,
            last_membership: meta.last_membership.clone(),
            snapshot_id: meta.snapshot_id.clone(),
        };
        let meta_bytes = bincode::serialize(&persisted)
            .map_err(|e| storage_io_err(openraft::ErrorVerb::Write, e))?;

        tokio::fs::write(&temp_data, data)
            .await
            .map_err(|e| storage_io_err(openraft::ErrorVerb::Write, e))?;
        tokio::fs::write(&temp_meta, &meta_bytes)
            .await
            .map_err(|e| storage_io_err(openraft::ErrorVerb::Write, e))?;

        // data first, then meta: the meta rename is the commit point
        tokio::fs::rename(&temp_data, self.snapshot_dir.join(SNAPSHOT_FILE))
            .await
            .map_err(|e| storage_io_err(openraft::ErrorVerb::Write, e))?;
        tokio::fs::rename(&temp_meta, self.snapshot_dir.join(SNAPSHOT_META_FILE))
            .await
            .map_err(|e| storage_io_err(openraft::ErrorVerb::Write, e))?;

        info!(
            snapshot_id = %meta.snapshot_id,
            size_bytes = data.len(),
            "persisted metadata snapshot"
        );
        Ok(())
    }
}

impl RaftStorage<TypeConfig> for RaftStore {
    type LogReader = Self;
    type SnapshotBuilder = Self;

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote<RaftNodeId>) -> Result<(), StorageError<RaftNodeId>> {
        *self.vote.write().await = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<RaftNodeId>>, StorageError<RaftNodeId>> {
        Ok(*self.vote.read().await)
    }

    async fn get_log_state(
        &mut self,
    ) -> Result<openraft::storage::LogState<TypeConfig>, StorageError<RaftNodeId>> {
        let log = self.log.read().await;
        Ok(openraft::storage::LogState {
            last_purged_log_id: *self.last_purged_log_id.read().await,
            last_log_id: log.values().last().map(|e| e.log_id),
        })
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<RaftNodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
    {
        let mut log = self.log.write().await;
        for entry in entries {
            log.insert(entry.log_id.index, entry);
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<RaftNodeId>,
    ) -> Result<(), StorageError<RaftNodeId>> {
        let mut log = self.log.write().await;
        let keys: Vec<u64> = log.range(log_id.index..).map(|(k, _)| *k).collect();
        for key in keys {
            log.remove(&key);
        }
        Ok(())
    }

    async fn purge_logs_upto(
        &mut self,
        log_id: LogId<RaftNodeId>,
    ) -> Result<(), StorageError<RaftNodeId>> {
        *self.last_purged_log_id.write().await = Some(log_id);
        let mut log = self.log.write().await;
        let keys: Vec<u64> = log.range(..=log_id.index).map(|(k, _)| *k).collect();
        for key in keys {
            log.remove(&key);
        }
        Ok(())
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<
        (
            Option<LogId<RaftNodeId>>,
            StoredMembership<RaftNodeId, BasicNode>,
        ),
        StorageError<RaftNodeId>,
    > {
        Ok((
            *self.last_applied_log.read().await,
            self.last_membership.read().await.clone(),
        ))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<MetadataResponse>, StorageError<RaftNodeId>> {
        let mut responses = Vec::with_capacity(entries.len());
        for entry in entries {
            *self.last_applied_log.write().await = Some(entry.log_id);
            match &entry.payload {
                EntryPayload::Blank => responses.push(MetadataResponse::Ok),
                EntryPayload::Normal(command) => {
                    responses.push(self.store.apply(command.clone()).await);
                }
                EntryPayload::Membership(membership) => {
                    *self.last_membership.write().await =
                        StoredMembership::new(Some(entry.log_id), membership.clone());
                    responses.push(MetadataResponse::Ok);
                }
            }
        }
        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<RaftNodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<RaftNodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<RaftNodeId>> {
        let data = snapshot.into_inner();
        self.store
            .restore(&data)
            .await
            .map_err(|e| storage_io_err(openraft::ErrorVerb::Write, e))?;
        *self.last_applied_log.write().await = meta.last_log_id;
        *self.last_membership.write().await =
            StoredMembership::new(meta.last_log_id, meta.last_membership.membership().clone());

        self.persist_snapshot(meta, &data).await?;
        *self.cached_snapshot.write().await = Some(CachedSnapshot {
            meta: meta.clone(),
            data,
        });
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<RaftNodeId>> {
        Ok(self.cached_snapshot.read().await.as_ref().map(|cached| Snapshot {
            meta: cached.meta.clone(),
            snapshot: Box::new(Cursor::new(cached.data.clone())),
        }))
    }
}

impl openraft::RaftSnapshotBuilder<TypeConfig> for RaftStore {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<RaftNodeId>> {
        let data = self
            .store
            .snapshot()
            .await
            .map_err(|e| storage_io_err(openraft::ErrorVerb::Write, e))?;

        let last_applied = *self.last_applied_log.read().await;
        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership: self.last_membership.read().await.clone(),
            snapshot_id: format!(
                "snapshot-{}",
                last_applied.map(|l| l.index).unwrap_or(0)
            ),
        };

        self.persist_snapshot(&meta, &data).await?;
        *self.cached_snapshot.write().await = Some(CachedSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        });

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl openraft::RaftLogReader<TypeConfig> for RaftStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<RaftNodeId>> {
        let log = self.log.read().await;
        Ok(log.range(range).map(|(_, e)| e.clone()).collect())
    }
}
