//! Raft type configuration

use openraft::{BasicNode, Entry};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::snapshot::SnapshotBuffer;

openraft::declare_raft_types!(
    /// Type configuration for the discover raft group
    pub TypeConfig:
        D = Command,
        R = Response,
        NodeId = u64,
        Node = BasicNode,
        Entry = Entry<TypeConfig>,
        SnapshotData = SnapshotBuffer,
        AsyncRuntime = openraft::TokioRuntime,
);

/// Opaque application command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command(#[serde(with = "serde_bytes")] pub Vec<u8>);

/// Response returned by the application state machine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response(#[serde(with = "serde_bytes")] pub Vec<u8>);

/// Voter id derived from a consensus advertise address
///
/// First eight bytes of the SHA-256 digest, big endian.
pub fn voter_id(addr: &str) -> u64 {
    let digest = Sha256::digest(addr.as_bytes());
    let mut id = [0u8; 8];
    id.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(id)
}
