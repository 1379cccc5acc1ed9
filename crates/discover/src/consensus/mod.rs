//! Replicated log behind a narrow engine interface
//!
//! The bridge only ever talks to [`ConsensusEngine`]. The openraft-backed
//! implementation lives in [`raft`], with rocksdb log and stable stores, a
//! file snapshot store and a TCP transport.

pub mod log_store;
#[cfg(test)]
pub(crate) mod mock;
pub mod network;
pub mod raft;
pub mod snapshot;
pub mod stable_store;
pub mod state_machine;
pub mod storage;
pub mod types;

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub use raft::RaftEngine;
pub use types::{TypeConfig, voter_id};

/// Role of the local engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Accepting writes
    Leader,
    /// Replicating from a leader
    Follower,
    /// Campaigning for leadership
    Candidate,
    /// Receiving the log without a vote
    Learner,
    /// Stopped
    Shutdown,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leader => write!(f, "leader"),
            Self::Follower => write!(f, "follower"),
            Self::Candidate => write!(f, "candidate"),
            Self::Learner => write!(f, "learner"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Point-in-time view of engine metrics, for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSummary {
    /// Local voter id
    pub id: u64,
    /// Current role
    pub state: EngineState,
    /// Current term
    pub term: u64,
    /// Known leader
    pub leader: Option<u64>,
    /// Index of the last log entry
    pub last_log_index: Option<u64>,
    /// Index of the last applied entry
    pub last_applied: Option<u64>,
    /// Voter addresses
    pub voters: Vec<String>,
}

impl fmt::Display for EngineSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "id={} state={} term={} leader={:?} last_log={:?} applied={:?} voters={:?}",
            self.id,
            self.state,
            self.term,
            self.leader,
            self.last_log_index,
            self.last_applied,
            self.voters
        )
    }
}

/// Consensus errors
#[derive(Debug, Clone, Error)]
pub enum ConsensusError {
    /// The operation did not complete in time
    #[error("Consensus timeout after {0:?}")]
    Timeout(Duration),

    /// The operation requires leadership
    #[error("Not leader: current leader is {leader:?}")]
    NotLeader {
        /// Known leader address, if any
        leader: Option<String>,
    },

    /// The engine refused the entry
    #[error("Entry rejected: {0}")]
    Rejected(String),

    /// A voter-set change failed
    #[error("Membership change failed: {0}")]
    Membership(String),

    /// The engine is shut down
    #[error("Consensus engine is shut down")]
    Shutdown,

    /// Engine construction failed
    #[error("Initialization failed: {0}")]
    Init(String),

    /// The raft core stopped abnormally
    #[error("Raft core failed: {0}")]
    Fatal(String),
}

/// Result type for consensus operations
pub type ConsensusResult<T> = Result<T, ConsensusError>;

/// Replicated log engine as seen by the bridge
///
/// Voter identity is the consensus advertise address. Membership and
/// leadership are always read from the engine; implementations must not
/// serve them from a cache.
#[async_trait]
pub trait ConsensusEngine: Send + Sync + 'static {
    /// Current role
    fn state(&self) -> EngineState;

    /// Submit a command and wait for it to be applied
    async fn apply(&self, command: Bytes, timeout: Duration) -> ConsensusResult<Bytes>;

    /// Make `addr` a voter; succeeds without change if it already is one
    async fn add_voter(&self, addr: SocketAddr) -> ConsensusResult<()>;

    /// Remove `addr` from the voters; succeeds without change if absent
    async fn remove_voter(&self, addr: SocketAddr) -> ConsensusResult<()>;

    /// Current voter addresses
    fn voters(&self) -> Vec<String>;

    /// Whether every entry in the local log has been applied
    fn is_drained(&self) -> bool;

    /// Metrics for diagnostics
    fn metrics_summary(&self) -> EngineSummary;

    /// Stop the engine and its transport
    async fn shutdown(&self) -> ConsensusResult<()>;
}
