//! Raft log storage over the rocksdb log and stable stores

use std::fmt::Debug;
use std::ops::{Bound, RangeBounds};
use std::path::Path;
use std::sync::Arc;

use openraft::storage::{IOFlushed, LogState, RaftLogReader, RaftLogStorage};
use openraft::{Entry, LogId, StorageError, Vote};

use super::log_store::{LogStore, StoreError, decode, encode};
use super::stable_store::{COMMITTED_KEY, LAST_PURGED_KEY, StableStore, VOTE_KEY};
use super::types::TypeConfig;

/// Directory of the log store, relative to the store path
pub const LOGS_DIR: &str = "logs";
/// Directory of the stable store, relative to the store path
pub const STABLE_DIR: &str = "raft.db";

/// Raft log storage - log entries plus vote and commit metadata
pub struct RaftLogStore {
    logs: LogStore,
    stable: StableStore,
}

impl RaftLogStore {
    /// Open both stores under `store_path`
    pub fn open(store_path: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            logs: LogStore::open(store_path.join(LOGS_DIR))?,
            stable: StableStore::open(store_path.join(STABLE_DIR))?,
        })
    }

    fn last_purged(&self) -> Result<Option<LogId<TypeConfig>>, StoreError> {
        self.stable.get(LAST_PURGED_KEY)
    }

    fn last_log_id(&self) -> Result<Option<LogId<TypeConfig>>, StoreError> {
        match self.logs.last()? {
            Some((_, data)) => {
                let entry: Entry<TypeConfig> = decode(&data)?;
                Ok(Some(entry.log_id))
            }
            None => Ok(None),
        }
    }
}

impl RaftLogReader<TypeConfig> for Arc<RaftLogStore> {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + Send>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<TypeConfig>> {
        let start = match range.start_bound() {
            Bound::Included(&n) => n,
            Bound::Excluded(&n) => n.saturating_add(1),
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(&n) => n.checked_add(1),
            Bound::Excluded(&n) => Some(n),
            Bound::Unbounded => None,
        };

        if end.is_some_and(|end| end <= start) {
            return Ok(Vec::new());
        }

        let raw = self
            .logs
            .range(start, end)
            .map_err(|e| StorageError::read(&e))?;

        raw.iter()
            .map(|(_, data)| decode(data).map_err(|e| StorageError::read(&e)))
            .collect()
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<TypeConfig>>, StorageError<TypeConfig>> {
        self.stable
            .get(VOTE_KEY)
            .map_err(|e| StorageError::read(&e))
    }
}

impl RaftLogStorage<TypeConfig> for Arc<RaftLogStore> {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<TypeConfig>> {
        let last_purged_log_id = self.last_purged().map_err(|e| StorageError::read(&e))?;
        let last_log_id = self
            .last_log_id()
            .map_err(|e| StorageError::read(&e))?
            .or_else(|| last_purged_log_id.clone());

        Ok(LogState {
            last_purged_log_id,
            last_log_id,
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote<TypeConfig>) -> Result<(), StorageError<TypeConfig>> {
        self.stable
            .set(VOTE_KEY, vote)
            .map_err(|e| StorageError::write(&e))
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<TypeConfig>>,
    ) -> Result<(), StorageError<TypeConfig>> {
        self.stable
            .set(COMMITTED_KEY, &committed)
            .map_err(|e| StorageError::write(&e))
    }

    async fn read_committed(
        &mut self,
    ) -> Result<Option<LogId<TypeConfig>>, StorageError<TypeConfig>> {
        let committed: Option<Option<LogId<TypeConfig>>> = self
            .stable
            .get(COMMITTED_KEY)
            .map_err(|e| StorageError::read(&e))?;
        Ok(committed.flatten())
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: IOFlushed<TypeConfig>,
    ) -> Result<(), StorageError<TypeConfig>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
        I::IntoIter: Send,
    {
        let encoded = entries
            .into_iter()
            .map(|entry| Ok((entry.log_id.index, encode(&entry)?)))
            .collect::<Result<Vec<_>, StoreError>>()
            .map_err(|e| StorageError::write(&e))?;

        if !encoded.is_empty() {
            self.logs
                .append(&encoded)
                .map_err(|e| StorageError::write(&e))?;
        }

        callback.io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<TypeConfig>) -> Result<(), StorageError<TypeConfig>> {
        self.logs
            .truncate_from(log_id.index)
            .map_err(|e| StorageError::write(&e))
    }

    async fn purge(&mut self, log_id: LogId<TypeConfig>) -> Result<(), StorageError<TypeConfig>> {
        // Record the purge point first so the log state never regresses
        self.stable
            .set(LAST_PURGED_KEY, &log_id)
            .map_err(|e| StorageError::write(&e))?;

        self.logs
            .purge_through(log_id.index)
            .map_err(|e| StorageError::write(&e))
    }
}
