//! Read-only view of gossip membership

use std::net::SocketAddr;
use std::sync::Arc;

use proven_gossip::{Gossip, Member};

/// Narrow accessor over a gossip handle's member list
#[derive(Clone)]
pub struct MembershipDirectory {
    gossip: Arc<dyn Gossip>,
}

impl MembershipDirectory {
    /// Wrap a gossip handle
    pub fn new(gossip: Arc<dyn Gossip>) -> Self {
        Self { gossip }
    }

    /// All known members, including the local one
    pub fn members(&self) -> Vec<Member> {
        self.gossip.members()
    }

    /// The local member
    pub fn local_member(&self) -> Member {
        self.gossip.local_member()
    }

    /// Gossip address of the local member
    pub fn local_address(&self) -> SocketAddr {
        self.gossip.local_member().addr
    }

    /// Number of members currently alive
    pub fn alive_count(&self) -> usize {
        self.gossip
            .members()
            .iter()
            .filter(|member| member.is_alive())
            .count()
    }
}
