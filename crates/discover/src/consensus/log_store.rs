//! RocksDB log store
//!
//! Entries are stored under their raft index encoded as a big-endian u64 so
//! that key order matches log order.

use std::path::Path;

use rocksdb::{DB, Direction, IteratorMode, Options, WriteBatch};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// RocksDB failure
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Value could not be encoded
    #[error("Encoding error: {0}")]
    Encode(String),

    /// Value could not be decoded
    #[error("Decoding error: {0}")]
    Decode(String),

    /// Application state machine failure
    #[error("State machine error: {0}")]
    StateMachine(#[from] crate::fsm::FsmError),

    /// Key was not a log index
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let mut buffer = Vec::new();
    ciborium::into_writer(value, &mut buffer).map_err(|e| StoreError::Encode(e.to_string()))?;
    Ok(buffer)
}

pub(crate) fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, StoreError> {
    ciborium::from_reader(data).map_err(|e| StoreError::Decode(e.to_string()))
}

/// Ordered log of raw entries
pub struct LogStore {
    db: DB,
}

impl LogStore {
    /// Open (or create) the log store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }

    fn encode_key(index: u64) -> [u8; 8] {
        index.to_be_bytes()
    }

    fn decode_key(key: &[u8]) -> Result<u64, StoreError> {
        let bytes: [u8; 8] = key
            .try_into()
            .map_err(|_| StoreError::InvalidKey(format!("expected 8 bytes, got {}", key.len())))?;
        Ok(u64::from_be_bytes(bytes))
    }

    /// Write entries atomically, overwriting any existing entry at the same index
    pub fn append(&self, entries: &[(u64, Vec<u8>)]) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        for (index, data) in entries {
            batch.put(Self::encode_key(*index), data);
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// Entries with `start <= index < end`; an absent `end` is unbounded
    pub fn range(&self, start: u64, end: Option<u64>) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let start_key = Self::encode_key(start);
        let mut entries = Vec::new();

        for item in self
            .db
            .iterator(IteratorMode::From(&start_key, Direction::Forward))
        {
            let (key, value) = item?;
            let index = Self::decode_key(&key)?;
            if end.is_some_and(|end| index >= end) {
                break;
            }
            entries.push((index, value.to_vec()));
        }

        Ok(entries)
    }

    /// First stored index
    pub fn first_index(&self) -> Result<Option<u64>, StoreError> {
        match self.db.iterator(IteratorMode::Start).next() {
            Some(item) => {
                let (key, _) = item?;
                Ok(Some(Self::decode_key(&key)?))
            }
            None => Ok(None),
        }
    }

    /// Last stored entry
    pub fn last(&self) -> Result<Option<(u64, Vec<u8>)>, StoreError> {
        match self.db.iterator(IteratorMode::End).next() {
            Some(item) => {
                let (key, value) = item?;
                Ok(Some((Self::decode_key(&key)?, value.to_vec())))
            }
            None => Ok(None),
        }
    }

    /// Delete every entry at or after `index`
    pub fn truncate_from(&self, index: u64) -> Result<(), StoreError> {
        let start_key = Self::encode_key(index);
        let mut batch = WriteBatch::default();

        for item in self
            .db
            .iterator(IteratorMode::From(&start_key, Direction::Forward))
        {
            let (key, _) = item?;
            batch.delete(key);
        }

        self.db.write(batch)?;
        Ok(())
    }

    /// Delete every entry at or before `index`
    pub fn purge_through(&self, index: u64) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();

        for item in self.db.iterator(IteratorMode::Start) {
            let (key, _) = item?;
            if Self::decode_key(&key)? > index {
                break;
            }
            batch.delete(key);
        }

        self.db.write(batch)?;
        Ok(())
    }

    /// Flush memtables to disk
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}
