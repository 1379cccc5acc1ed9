//! Generic gossip membership abstraction
//!
//! This crate describes the narrow surface the cluster bridge needs from a
//! gossip membership layer. Failure detection, anti-entropy and message
//! dissemination live in the implementations (see `proven-gossip-memory`).
//!
//! Implementations provide:
//! - A member list with per-member status and tags
//! - Cluster-wide user events with optional coalescing
//! - An inbound channel of membership and user events
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod event;
pub mod member;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

pub use error::{GossipError, GossipResult};
pub use event::{GossipEvent, UserEvent};
pub use member::{Member, MemberStatus};

/// Receiving side of a gossip handle's event channel
pub type GossipEvents = flume::Receiver<GossipEvent>;

/// Configuration used to create a gossip handle
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Unique member name within the cluster
    pub name: String,
    /// Address the gossip listener binds to
    pub bind_addr: SocketAddr,
    /// Address other members use to reach this member
    pub advertise_addr: SocketAddr,
    /// Metadata published alongside the member
    pub tags: BTreeMap<String, String>,
    /// How long left or failed members are kept in the member list
    pub tombstone_timeout: Duration,
}

impl GossipConfig {
    /// Create a config advertising the bind address, with no tags
    pub fn new(name: impl Into<String>, bind_addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            bind_addr,
            advertise_addr: bind_addr,
            tags: BTreeMap::new(),
            tombstone_timeout: Duration::from_secs(60),
        }
    }
}

/// Gossip membership handle
///
/// A handle is created bound to an address and stays alive until
/// [`Gossip::shutdown`]. Events for the handle are delivered on the channel
/// returned by [`Gossip::create`]; the channel closes on shutdown.
#[async_trait]
pub trait Gossip: Send + Sync + 'static {
    /// Create a handle bound to the configured address
    async fn create(config: GossipConfig) -> GossipResult<(Self, GossipEvents)>
    where
        Self: Sized;

    /// Join an existing cluster through the given seed addresses
    ///
    /// Returns the number of seeds successfully contacted. Fails with
    /// [`GossipError::Join`] if none could be reached.
    async fn join(&self, seeds: &[SocketAddr]) -> GossipResult<usize>;

    /// Broadcast a user event to every live member, this one included
    async fn user_event(&self, name: &str, payload: Bytes, coalesce: bool) -> GossipResult<()>;

    /// Current member list, including recently departed members
    fn members(&self) -> Vec<Member>;

    /// This member
    fn local_member(&self) -> Member;

    /// Gracefully leave the cluster
    async fn leave(&self) -> GossipResult<()>;

    /// Stop all background activity and close the event channel
    async fn shutdown(&self) -> GossipResult<()>;
}
