//! Gossip error types

use std::net::SocketAddr;

use thiserror::Error;

/// Result type for gossip operations
pub type GossipResult<T> = Result<T, GossipError>;

/// Gossip-related errors
#[derive(Clone, Debug, Error)]
pub enum GossipError {
    /// The listener could not bind its address
    #[error("Failed to bind {addr}: {reason}")]
    Bind {
        /// Address that was requested
        addr: SocketAddr,
        /// Why the bind failed
        reason: String,
    },

    /// None of the seeds could be reached
    #[error("Failed to join cluster: {0}")]
    Join(String),

    /// The handle has left the cluster or been shut down
    #[error("Gossip handle is closed")]
    Closed,

    /// Generic error
    #[error("{0}")]
    Other(String),
}
