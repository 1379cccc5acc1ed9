//! RocksDB stable store for raft metadata

use std::path::Path;

use rocksdb::{DB, Options};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::log_store::{StoreError, decode, encode};

/// Key holding the current vote
pub const VOTE_KEY: &str = "vote";
/// Key holding the last committed log id
pub const COMMITTED_KEY: &str = "committed";
/// Key holding the last purged log id
pub const LAST_PURGED_KEY: &str = "last_purged";

/// Small key-value store for values that must survive restarts
pub struct StableStore {
    db: DB,
}

impl StableStore {
    /// Open (or create) the stable store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        // Point lookups only
        opts.optimize_for_point_lookup(8);

        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }

    /// Read and decode a value
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.db.get(key.as_bytes())? {
            Some(data) => Ok(Some(decode(&data)?)),
            None => Ok(None),
        }
    }

    /// Encode and write a value
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        self.db.put(key.as_bytes(), encode(value)?)?;
        Ok(())
    }
}
