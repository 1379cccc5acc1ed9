//! In-memory gossip implementation for testing
//!
//! Members created in the same process find each other through a global
//! registry keyed by advertised address. Membership changes and user events
//! are pushed straight into every affected member's event channel, so
//! delivery is immediate and ordered per sender. There is no failure
//! detector: a member is reported failed when it shuts down without leaving.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use proven_gossip::{
    Gossip, GossipConfig, GossipError, GossipEvent, GossipEvents, GossipResult, Member,
    MemberStatus, UserEvent,
};
use tracing::{debug, info};

/// Global registry of live gossip members, keyed by advertised address
static GLOBAL_REGISTRY: LazyLock<DashMap<SocketAddr, Arc<Shared>>> = LazyLock::new(DashMap::new);

/// A remote member as seen by the local member
struct Tracked {
    member: Member,
    since: Instant,
}

/// State shared between a handle and the registry
struct Shared {
    name: String,
    addr: SocketAddr,
    tags: BTreeMap<String, String>,
    tombstone_timeout: Duration,
    status: RwLock<MemberStatus>,
    closed: AtomicBool,
    clock: AtomicU64,
    view: RwLock<BTreeMap<String, Tracked>>,
    events: Mutex<Option<flume::Sender<GossipEvent>>>,
}

impl Shared {
    fn current_member(&self) -> Member {
        Member {
            name: self.name.clone(),
            addr: self.addr,
            tags: self.tags.clone(),
            status: *self.status.read(),
        }
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && *self.status.read() == MemberStatus::Alive
    }

    fn emit(&self, event: GossipEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            // Unbounded; only fails once the receiver is gone
            let _ = tx.send(event);
        }
    }

    /// Lamport clock witness
    fn witness(&self, ltime: u64) {
        self.clock.fetch_max(ltime + 1, Ordering::AcqRel);
    }

    /// Forget departed members whose tombstone has expired
    fn prune(&self, view: &mut BTreeMap<String, Tracked>) {
        view.retain(|_, tracked| {
            matches!(
                tracked.member.status,
                MemberStatus::Alive | MemberStatus::Leaving
            ) || tracked.since.elapsed() < self.tombstone_timeout
        });
    }

    /// Record members as alive, returning the ones that were not already
    fn observe_alive(&self, members: &[Member]) -> Vec<Member> {
        let mut view = self.view.write();
        self.prune(&mut view);
        let mut joined = Vec::new();

        for member in members {
            if member.name == self.name {
                continue;
            }

            let was_alive = view
                .get(&member.name)
                .is_some_and(|tracked| tracked.member.is_alive() && tracked.member.addr == member.addr);

            let mut member = member.clone();
            member.status = MemberStatus::Alive;
            view.insert(
                member.name.clone(),
                Tracked {
                    member: member.clone(),
                    since: Instant::now(),
                },
            );

            if !was_alive {
                joined.push(member);
            }
        }

        joined
    }

    /// Record a member departure, returning the updated member if it changed
    fn observe_departure(&self, name: &str, status: MemberStatus) -> Option<Member> {
        let mut view = self.view.write();
        self.prune(&mut view);
        let tracked = view.get_mut(name)?;

        if !matches!(tracked.member.status, MemberStatus::Alive | MemberStatus::Leaving) {
            return None;
        }

        tracked.member.status = status;
        tracked.since = Instant::now();
        Some(tracked.member.clone())
    }

    /// Live members known to this member, resolved through the registry
    fn alive_peers(&self) -> Vec<Arc<Shared>> {
        let addrs: Vec<SocketAddr> = self
            .view
            .read()
            .values()
            .filter(|tracked| tracked.member.is_alive())
            .map(|tracked| tracked.member.addr)
            .collect();

        addrs
            .into_iter()
            .filter_map(|addr| GLOBAL_REGISTRY.get(&addr).map(|entry| Arc::clone(entry.value())))
            .filter(|peer| peer.is_alive())
            .collect()
    }

    fn announce_departure(&self, status: MemberStatus) {
        for peer in self.alive_peers() {
            if let Some(member) = peer.observe_departure(&self.name, status) {
                let event = match status {
                    MemberStatus::Failed => GossipEvent::MemberFailed(vec![member]),
                    _ => GossipEvent::MemberLeave(vec![member]),
                };
                peer.emit(event);
            }
        }
    }
}

/// In-memory gossip handle
#[derive(Clone)]
pub struct MemoryGossip {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MemoryGossip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryGossip")
            .field("name", &self.shared.name)
            .field("addr", &self.shared.addr)
            .field("closed", &self.shared.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl MemoryGossip {
    fn ensure_alive(&self) -> GossipResult<()> {
        if self.shared.is_alive() {
            Ok(())
        } else {
            Err(GossipError::Closed)
        }
    }
}

#[async_trait]
impl Gossip for MemoryGossip {
    async fn create(config: GossipConfig) -> GossipResult<(Self, GossipEvents)> {
        let (tx, rx) = flume::unbounded();

        let shared = Arc::new(Shared {
            name: config.name,
            addr: config.advertise_addr,
            tags: config.tags,
            tombstone_timeout: config.tombstone_timeout,
            status: RwLock::new(MemberStatus::Alive),
            closed: AtomicBool::new(false),
            clock: AtomicU64::new(0),
            view: RwLock::new(BTreeMap::new()),
            events: Mutex::new(Some(tx)),
        });

        match GLOBAL_REGISTRY.entry(config.advertise_addr) {
            Entry::Occupied(_) => {
                return Err(GossipError::Bind {
                    addr: config.bind_addr,
                    reason: "address already in use".to_string(),
                });
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&shared));
            }
        }

        info!("Memory gossip member {} created at {}", shared.name, shared.addr);

        shared.emit(GossipEvent::MemberJoin(vec![shared.current_member()]));

        Ok((Self { shared }, rx))
    }

    async fn join(&self, seeds: &[SocketAddr]) -> GossipResult<usize> {
        self.ensure_alive()?;

        let mut contacted = 0;
        let mut cluster: BTreeMap<SocketAddr, Arc<Shared>> = BTreeMap::new();

        for seed in seeds {
            if *seed == self.shared.addr {
                continue;
            }

            let Some(peer) = GLOBAL_REGISTRY
                .get(seed)
                .map(|entry| Arc::clone(entry.value()))
            else {
                debug!("No memory gossip member at {}", seed);
                continue;
            };

            if !peer.is_alive() {
                debug!("Memory gossip member at {} is not alive", seed);
                continue;
            }

            contacted += 1;
            for member in peer.alive_peers() {
                cluster.insert(member.addr, member);
            }
            cluster.insert(peer.addr, peer);
        }

        if contacted == 0 {
            return Err(GossipError::Join(format!("no reachable seed among {seeds:?}")));
        }

        cluster.retain(|_, peer| peer.name != self.shared.name);

        let local = self.shared.current_member();
        for peer in cluster.values() {
            let joined = peer.observe_alive(std::slice::from_ref(&local));
            if !joined.is_empty() {
                peer.emit(GossipEvent::MemberJoin(joined));
            }
        }

        let members: Vec<Member> = cluster.values().map(|peer| peer.current_member()).collect();
        let joined = self.shared.observe_alive(&members);
        if !joined.is_empty() {
            self.shared.emit(GossipEvent::MemberJoin(joined));
        }

        info!(
            "Memory gossip member {} joined {} peers via {} seeds",
            self.shared.name,
            cluster.len(),
            contacted
        );

        Ok(contacted)
    }

    async fn user_event(&self, name: &str, payload: Bytes, coalesce: bool) -> GossipResult<()> {
        self.ensure_alive()?;

        let event = UserEvent {
            ltime: self.shared.clock.fetch_add(1, Ordering::AcqRel),
            name: name.to_string(),
            payload,
            coalesce,
        };

        debug!(
            "Memory gossip member {} broadcasting user event {} ({} bytes)",
            self.shared.name,
            event.name,
            event.payload.len()
        );

        self.shared.emit(GossipEvent::User(event.clone()));
        for peer in self.shared.alive_peers() {
            peer.witness(event.ltime);
            peer.emit(GossipEvent::User(event.clone()));
        }

        Ok(())
    }

    fn members(&self) -> Vec<Member> {
        let view = self.shared.view.read();
        let tombstone_timeout = self.shared.tombstone_timeout;

        std::iter::once(self.shared.current_member())
            .chain(
                view.values()
                    .filter(|tracked| {
                        tracked.member.is_alive() || tracked.since.elapsed() < tombstone_timeout
                    })
                    .map(|tracked| tracked.member.clone()),
            )
            .collect()
    }

    fn local_member(&self) -> Member {
        self.shared.current_member()
    }

    async fn leave(&self) -> GossipResult<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(GossipError::Closed);
        }

        {
            let mut status = self.shared.status.write();
            if *status != MemberStatus::Alive {
                return Ok(());
            }
            *status = MemberStatus::Leaving;
        }

        self.shared.announce_departure(MemberStatus::Left);
        *self.shared.status.write() = MemberStatus::Left;

        info!("Memory gossip member {} left the cluster", self.shared.name);

        Ok(())
    }

    async fn shutdown(&self) -> GossipResult<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let never_left = {
            let mut status = self.shared.status.write();
            let never_left = *status == MemberStatus::Alive;
            if never_left {
                *status = MemberStatus::Failed;
            }
            never_left
        };

        if never_left {
            self.shared.announce_departure(MemberStatus::Failed);
        }

        GLOBAL_REGISTRY.remove_if(&self.shared.addr, |_, entry| Arc::ptr_eq(entry, &self.shared));
        self.shared.events.lock().take();

        info!("Memory gossip member {} shut down", self.shared.name);

        Ok(())
    }
}
