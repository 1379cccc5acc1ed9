//! Events delivered by a gossip handle

use bytes::Bytes;

use crate::member::Member;

/// Application-defined event broadcast through the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserEvent {
    /// Lamport time at which the event was issued
    pub ltime: u64,
    /// Event name
    pub name: String,
    /// Opaque payload
    pub payload: Bytes,
    /// Whether the sender allowed repeats to be merged
    pub coalesce: bool,
}

/// Event emitted by a gossip handle
#[derive(Debug, Clone)]
pub enum GossipEvent {
    /// Members joined (or rejoined) the cluster
    MemberJoin(Vec<Member>),
    /// Members left gracefully
    MemberLeave(Vec<Member>),
    /// Members stopped responding
    MemberFailed(Vec<Member>),
    /// A user event was received
    User(UserEvent),
}

impl GossipEvent {
    /// Short name of the event type, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MemberJoin(_) => "member-join",
            Self::MemberLeave(_) => "member-leave",
            Self::MemberFailed(_) => "member-failed",
            Self::User(_) => "user",
        }
    }
}
