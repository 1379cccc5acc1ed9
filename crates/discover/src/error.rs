//! Error types for the discover node

use std::time::Duration;

use proven_gossip::GossipError;
use thiserror::Error;

use crate::consensus::ConsensusError;

/// Result type for node operations
pub type Result<T> = std::result::Result<T, Error>;

/// Node errors
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed address or missing required field
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The gossip listener could not bind
    #[error("Transport error: {0}")]
    Transport(String),

    /// A seed address was supplied but could not be reached
    #[error("Join error: {0}")]
    Join(String),

    /// Log, stable or snapshot store, raft transport or engine setup failed
    #[error("Consensus initialization error: {0}")]
    ConsensusInit(String),

    /// The entry was not committed within the timeout
    #[error("Apply timed out after {0:?}")]
    ApplyTimeout(Duration),

    /// The engine rejected the entry (e.g. leadership lost mid-flight)
    #[error("Apply rejected: {0}")]
    ApplyRejected(String),

    /// A voter-set mutation triggered by a membership event failed
    #[error("Peer mutation failed for {addr}: {reason}")]
    PeerMutation {
        /// Consensus address of the affected peer
        addr: String,
        /// Why the mutation failed
        reason: String,
    },

    /// The consensus bridge has been shut down
    #[error("Consensus bridge is closed")]
    Closed,

    /// The node is not running
    #[error("Node is not running")]
    NotRunning,

    /// The node has already been started
    #[error("Node has already been started")]
    AlreadyStarted,

    /// Gossip error
    #[error("Gossip error: {0}")]
    Gossip(#[from] GossipError),

    /// Consensus error
    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    /// A reserved event carried a payload that is not a consensus address
    #[error("Invalid payload for {event}: {reason}")]
    InvalidPayload {
        /// Event name
        event: String,
        /// Why the payload was rejected
        reason: String,
    },
}
