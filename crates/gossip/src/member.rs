//! Member types

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Liveness status of a member as seen by the local node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    /// Reachable and participating
    Alive,
    /// Announced its departure, not yet gone
    Leaving,
    /// Left gracefully
    Left,
    /// Stopped responding without leaving
    Failed,
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alive => write!(f, "alive"),
            Self::Leaving => write!(f, "leaving"),
            Self::Left => write!(f, "left"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A member of the gossip cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Unique member name
    pub name: String,
    /// Advertised gossip address
    pub addr: SocketAddr,
    /// Published metadata
    pub tags: BTreeMap<String, String>,
    /// Current status
    pub status: MemberStatus,
}

impl Member {
    /// Create an alive member without tags
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
            tags: BTreeMap::new(),
            status: MemberStatus::Alive,
        }
    }

    /// Look up a tag value
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Whether the member is currently alive
    pub fn is_alive(&self) -> bool {
        self.status == MemberStatus::Alive
    }
}
