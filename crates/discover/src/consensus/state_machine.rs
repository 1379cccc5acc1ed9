//! Raft state machine over the application [`StateMachine`]
//!
//! Only `Normal` entries reach the application; blank and membership entries
//! are tracked here. Snapshots are captured through the application when
//! openraft asks for a builder, then written to the snapshot store when the
//! build runs.

use std::sync::Arc;

use bytes::Bytes;
use openraft::storage::{RaftStateMachine, Snapshot};
use openraft::{
    Entry, EntryPayload, LogId, RaftSnapshotBuilder, SnapshotMeta, StorageError, StoredMembership,
};
use parking_lot::RwLock;
use tracing::{debug, info};

use super::log_store::StoreError;
use super::snapshot::{SnapshotBuffer, SnapshotStore};
use super::types::{Command, Response, TypeConfig};
use crate::fsm::{FsmError, FsmSnapshot, LogEntry, StateMachine};

/// Raft state machine - feeds committed entries to the application
pub struct FsmAdapter {
    fsm: Arc<dyn StateMachine>,
    snapshots: Arc<SnapshotStore>,
    applied: RwLock<Option<LogId<TypeConfig>>>,
    membership: RwLock<StoredMembership<TypeConfig>>,
}

impl FsmAdapter {
    /// Create the adapter, restoring the newest stored snapshot if any
    pub fn open(fsm: Arc<dyn StateMachine>, snapshots: Arc<SnapshotStore>) -> Result<Self, StoreError> {
        let adapter = Self {
            fsm,
            snapshots,
            applied: RwLock::new(None),
            membership: RwLock::new(StoredMembership::default()),
        };

        if let Some((meta, data)) = adapter.snapshots.latest()? {
            adapter.fsm.restore(&mut data.as_slice())?;
            info!(
                "Restored snapshot {} (last log {:?})",
                meta.snapshot_id, meta.last_log_id
            );
            *adapter.applied.write() = meta.last_log_id;
            *adapter.membership.write() = meta.last_membership;
        }

        Ok(adapter)
    }

    fn apply_entry(&self, entry: Entry<TypeConfig>) -> Response {
        let log_id = entry.log_id;

        let response = match entry.payload {
            EntryPayload::Normal(Command(data)) => {
                let output = self.fsm.apply(&LogEntry {
                    index: log_id.index,
                    data: Bytes::from(data),
                });
                Response(output.to_vec())
            }
            EntryPayload::Membership(membership) => {
                debug!("Applying membership change at index {}", log_id.index);
                *self.membership.write() = StoredMembership::new(Some(log_id.clone()), membership);
                Response::default()
            }
            EntryPayload::Blank => Response::default(),
        };

        *self.applied.write() = Some(log_id);
        response
    }
}

impl RaftStateMachine<TypeConfig> for Arc<FsmAdapter> {
    type SnapshotBuilder = FsmSnapshotBuilder;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<TypeConfig>>, StoredMembership<TypeConfig>), StorageError<TypeConfig>>
    {
        Ok((self.applied.read().clone(), self.membership.read().clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<Response>, StorageError<TypeConfig>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
        I::IntoIter: Send,
    {
        Ok(entries
            .into_iter()
            .map(|entry| self.apply_entry(entry))
            .collect())
    }

    async fn begin_receiving_snapshot(&mut self) -> Result<SnapshotBuffer, StorageError<TypeConfig>> {
        Ok(SnapshotBuffer::default())
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<TypeConfig>,
        snapshot: SnapshotBuffer,
    ) -> Result<(), StorageError<TypeConfig>> {
        self.fsm
            .restore(&mut snapshot.data.as_slice())
            .map_err(|e| StorageError::write(&e))?;

        self.snapshots
            .save(meta, &snapshot.data)
            .map_err(|e| StorageError::write(&e))?;

        *self.applied.write() = meta.last_log_id.clone();
        *self.membership.write() = meta.last_membership.clone();

        info!("Installed snapshot {}", meta.snapshot_id);
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<TypeConfig>> {
        let latest = self.snapshots.latest().map_err(|e| StorageError::read(&e))?;

        Ok(latest.map(|(meta, data)| Snapshot {
            meta,
            snapshot: SnapshotBuffer::new(data),
        }))
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        // Capture the application state together with the applied position
        let applied = self.applied.read().clone();
        let membership = self.membership.read().clone();

        FsmSnapshotBuilder {
            captured: Some(self.fsm.snapshot()),
            snapshots: self.snapshots.clone(),
            last_applied: applied,
            membership,
        }
    }
}

/// Writes a captured application snapshot to the snapshot store
pub struct FsmSnapshotBuilder {
    captured: Option<Result<Box<dyn FsmSnapshot>, FsmError>>,
    snapshots: Arc<SnapshotStore>,
    last_applied: Option<LogId<TypeConfig>>,
    membership: StoredMembership<TypeConfig>,
}

impl RaftSnapshotBuilder<TypeConfig> for FsmSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<TypeConfig>> {
        let captured = self.captured.take().ok_or_else(|| {
            StorageError::write(&FsmError::Other("snapshot already built".to_string()))
        })?;
        let mut fsm_snapshot = captured.map_err(|e| StorageError::write(&e))?;

        let mut data = Vec::new();
        let persisted = fsm_snapshot.persist(&mut data);
        fsm_snapshot.release();
        persisted.map_err(|e| StorageError::write(&e))?;

        let snapshot_id = format!(
            "{}-{}",
            self.last_applied.as_ref().map_or(0, |log_id| log_id.index),
            chrono::Utc::now().timestamp_millis()
        );

        let meta = SnapshotMeta {
            last_log_id: self.last_applied.clone(),
            last_membership: self.membership.clone(),
            snapshot_id,
        };

        self.snapshots
            .save(&meta, &data)
            .map_err(|e| StorageError::write(&e))?;

        info!("Built snapshot {} ({} bytes)", meta.snapshot_id, data.len());

        Ok(Snapshot {
            meta,
            snapshot: SnapshotBuffer::new(data),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    /// Sums little-endian u64 commands
    #[derive(Default)]
    struct Counter {
        total: AtomicU64,
    }

    struct CounterSnapshot(u64);

    impl FsmSnapshot for CounterSnapshot {
        fn persist(&self, writer: &mut dyn Write) -> Result<(), FsmError> {
            writer.write_all(&self.0.to_le_bytes())?;
            Ok(())
        }
    }

    impl StateMachine for Counter {
        fn apply(&self, entry: &LogEntry) -> Bytes {
            let mut value = [0u8; 8];
            value.copy_from_slice(&entry.data[..8]);
            let delta = u64::from_le_bytes(value);
            let total = self.total.fetch_add(delta, Ordering::SeqCst) + delta;
            Bytes::copy_from_slice(&total.to_le_bytes())
        }

        fn snapshot(&self) -> Result<Box<dyn FsmSnapshot>, FsmError> {
            Ok(Box::new(CounterSnapshot(self.total.load(Ordering::SeqCst))))
        }

        fn restore(&self, reader: &mut dyn Read) -> Result<(), FsmError> {
            let mut value = [0u8; 8];
            reader.read_exact(&mut value)?;
            self.total.store(u64::from_le_bytes(value), Ordering::SeqCst);
            Ok(())
        }
    }

    fn snapshot_meta(id: &str) -> SnapshotMeta<TypeConfig> {
        SnapshotMeta {
            last_log_id: None,
            last_membership: StoredMembership::default(),
            snapshot_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_snapshot_is_built_and_restored() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = Arc::new(SnapshotStore::open(dir.path(), 1).unwrap());

        let counter = Arc::new(Counter::default());
        counter.total.store(42, Ordering::SeqCst);

        let mut adapter = Arc::new(FsmAdapter::open(counter.clone(), snapshots.clone()).unwrap());
        let mut builder = adapter.get_snapshot_builder().await;

        // Later changes do not leak into the captured snapshot
        counter.total.store(100, Ordering::SeqCst);
        let snapshot = builder.build_snapshot().await.unwrap();
        assert_eq!(snapshot.snapshot.data, 42u64.to_le_bytes().to_vec());

        let restored = Arc::new(Counter::default());
        let _adapter = FsmAdapter::open(restored.clone(), snapshots).unwrap();
        assert_eq!(restored.total.load(Ordering::SeqCst), 42);
    }

    #[tokio::test]
    async fn test_install_snapshot_restores_application() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = Arc::new(SnapshotStore::open(dir.path(), 1).unwrap());
        let counter = Arc::new(Counter::default());
        let mut adapter = Arc::new(FsmAdapter::open(counter.clone(), snapshots.clone()).unwrap());

        let mut buffer = adapter.begin_receiving_snapshot().await.unwrap();
        buffer.data.extend_from_slice(&7u64.to_le_bytes());
        adapter
            .install_snapshot(&snapshot_meta("remote"), buffer)
            .await
            .unwrap();

        assert_eq!(counter.total.load(Ordering::SeqCst), 7);

        let current = adapter.get_current_snapshot().await.unwrap().unwrap();
        assert_eq!(current.meta.snapshot_id, "remote");
        assert_eq!(snapshots.list().unwrap().len(), 1);
    }
}
