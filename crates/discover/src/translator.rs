//! Membership events to voter-set changes
//!
//! Nodes announce themselves with a `node-join` user event whose payload is
//! their consensus advertise address, and say goodbye with `node-leave`. The
//! leader turns these into voter additions and removals. Followers ignore
//! them; the leader at the time will act.

use std::net::SocketAddr;
use std::sync::Arc;

use proven_gossip::{Member, UserEvent};
use tracing::{debug, info};

use crate::bridge::ConsensusBridge;
use crate::directory::MembershipDirectory;
use crate::error::{Error, Result};

/// Announces a node's consensus address
pub const NODE_JOIN: &str = "node-join";

/// Withdraws a node's consensus address
pub const NODE_LEAVE: &str = "node-leave";

/// Member tag carrying the consensus advertise address
pub const CONSENSUS_ADDR_TAG: &str = "consensus-addr";

/// Whether `name` is interpreted by the translator
pub fn is_reserved(name: &str) -> bool {
    name == NODE_JOIN || name == NODE_LEAVE
}

/// Parse a reserved event payload as a consensus address
pub fn parse_consensus_addr(event: &str, payload: &[u8]) -> Result<SocketAddr> {
    let text = std::str::from_utf8(payload).map_err(|e| Error::InvalidPayload {
        event: event.to_string(),
        reason: format!("not UTF-8: {e}"),
    })?;

    text.trim().parse().map_err(|e| Error::InvalidPayload {
        event: event.to_string(),
        reason: format!("{text:?} is not a socket address: {e}"),
    })
}

/// Turns reserved membership events into bridge calls
pub struct PeerTranslator {
    bridge: Option<Arc<ConsensusBridge>>,
    directory: MembershipDirectory,
}

impl PeerTranslator {
    /// Create a translator; without a bridge, reserved events are only logged
    pub fn new(bridge: Option<Arc<ConsensusBridge>>, directory: MembershipDirectory) -> Self {
        Self { bridge, directory }
    }

    /// Handle a `node-join` or `node-leave` event
    pub async fn handle(&self, event: &UserEvent) -> Result<()> {
        let addr = parse_consensus_addr(&event.name, &event.payload)?;

        let Some(bridge) = &self.bridge else {
            debug!("Consensus disabled, ignoring {} for {}", event.name, addr);
            return Ok(());
        };

        match event.name.as_str() {
            NODE_JOIN => self.on_join(bridge, addr).await,
            NODE_LEAVE => self.on_leave(bridge, addr).await,
            other => {
                debug!("Event {} is not a membership event", other);
                Ok(())
            }
        }
    }

    async fn on_join(&self, bridge: &ConsensusBridge, addr: SocketAddr) -> Result<()> {
        if !bridge.is_leader() {
            debug!("Not leader, ignoring join of {}", addr);
            return Ok(());
        }

        // A lone member is hearing its own announcement
        if self.directory.alive_count() <= 1 {
            debug!("Single member cluster, ignoring join of {}", addr);
            return Ok(());
        }

        info!("Adding {} as a voter", addr);
        bridge
            .add_voter(addr)
            .await
            .map_err(|e| peer_mutation(addr, e))
    }

    async fn on_leave(&self, bridge: &ConsensusBridge, addr: SocketAddr) -> Result<()> {
        if !bridge.is_leader() {
            debug!("Not leader, ignoring leave of {}", addr);
            return Ok(());
        }

        // A lone voter hearing its own departure keeps the cluster intact
        if bridge.voters()? == [addr.to_string()] {
            debug!("{} is the last voter, leaving the voter set unchanged", addr);
            return Ok(());
        }

        info!("Removing {} from the voters", addr);
        bridge
            .remove_voter(addr)
            .await
            .map_err(|e| peer_mutation(addr, e))
    }

    /// Remove a failed member's voter when configured to
    pub async fn on_member_failed(&self, member: &Member) -> Result<()> {
        let Some(bridge) = &self.bridge else {
            return Ok(());
        };
        if !bridge.remove_failed_voters() {
            return Ok(());
        }

        let Some(tag) = member.tag(CONSENSUS_ADDR_TAG) else {
            debug!("Failed member {} has no consensus address", member.name);
            return Ok(());
        };
        let addr = parse_consensus_addr(CONSENSUS_ADDR_TAG, tag.as_bytes())?;

        if !bridge.is_leader() {
            return Ok(());
        }

        info!("Removing failed member {} ({}) from the voters", member.name, addr);
        bridge
            .remove_voter(addr)
            .await
            .map_err(|e| peer_mutation(addr, e))
    }
}

fn peer_mutation(addr: SocketAddr, error: Error) -> Error {
    Error::PeerMutation {
        addr: addr.to_string(),
        reason: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use bytes::Bytes;
    use proven_gossip::{Gossip, GossipConfig, MemberStatus};
    use proven_gossip_memory::MemoryGossip;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::config::ConsensusConfig;
    use crate::consensus::mock::MockEngine;

    const LEADER_RAFT: &str = "127.0.0.1:42101";

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn user_event(name: &str, payload: &str) -> UserEvent {
        UserEvent {
            ltime: 0,
            name: name.to_string(),
            payload: Bytes::copy_from_slice(payload.as_bytes()),
            coalesce: false,
        }
    }

    async fn bridge_with(
        engine: Arc<MockEngine>,
        remove_failed_voters: bool,
    ) -> Arc<ConsensusBridge> {
        let mut config = ConsensusConfig::new(LEADER_RAFT, "/tmp/unused");
        config.remove_failed_voters = remove_failed_voters;
        let bridge = ConsensusBridge::new(
            config.validate().await.unwrap(),
            Duration::from_secs(1),
            false,
            None,
        );
        bridge.activate_with(engine);
        Arc::new(bridge)
    }

    async fn gossip(name: &str, port: u16) -> Arc<MemoryGossip> {
        let (gossip, _events) = MemoryGossip::create(GossipConfig::new(name, addr(port)))
            .await
            .unwrap();
        Arc::new(gossip)
    }

    #[test]
    fn test_parse_consensus_addr() {
        assert_eq!(
            parse_consensus_addr(NODE_JOIN, b"127.0.0.1:7000").unwrap(),
            addr(7000)
        );
        assert!(matches!(
            parse_consensus_addr(NODE_JOIN, &[0xff, 0xfe]),
            Err(Error::InvalidPayload { .. })
        ));
        assert!(matches!(
            parse_consensus_addr(NODE_LEAVE, b"somewhere"),
            Err(Error::InvalidPayload { .. })
        ));
        assert!(is_reserved(NODE_JOIN));
        assert!(!is_reserved("deploy"));
    }

    #[tokio::test]
    async fn test_join_ignored_by_lone_leader() {
        let local = gossip("lone", 42001).await;
        let engine = Arc::new(MockEngine::leader_with(&[LEADER_RAFT]));
        let translator = PeerTranslator::new(
            Some(bridge_with(engine.clone(), false).await),
            MembershipDirectory::new(local.clone()),
        );

        translator
            .handle(&user_event(NODE_JOIN, LEADER_RAFT))
            .await
            .unwrap();
        assert_eq!(engine.adds.load(Ordering::SeqCst), 0);

        local.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_join_and_leave_on_leader() {
        let leader = gossip("leader", 42011).await;
        let peer = gossip("peer", 42012).await;
        peer.join(&[addr(42011)]).await.unwrap();

        let engine = Arc::new(MockEngine::leader_with(&[LEADER_RAFT]));
        let translator = PeerTranslator::new(
            Some(bridge_with(engine.clone(), false).await),
            MembershipDirectory::new(leader.clone()),
        );

        translator
            .handle(&user_event(NODE_JOIN, "127.0.0.1:42102"))
            .await
            .unwrap();
        // Repeated announcements leave the voter set unchanged
        translator
            .handle(&user_event(NODE_JOIN, "127.0.0.1:42102"))
            .await
            .unwrap();
        assert_eq!(engine.voter_set().len(), 2);

        translator
            .handle(&user_event(NODE_LEAVE, "127.0.0.1:42102"))
            .await
            .unwrap();
        assert_eq!(
            engine.voter_set().into_iter().collect::<Vec<_>>(),
            vec![LEADER_RAFT.to_string()]
        );

        peer.shutdown().await.unwrap();
        leader.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_follower_ignores_membership_events() {
        let local = gossip("follower", 42021).await;
        let other = gossip("other", 42022).await;
        other.join(&[addr(42021)]).await.unwrap();

        let engine = Arc::new(MockEngine::leader_with(&[LEADER_RAFT]));
        engine.leader.store(false, Ordering::SeqCst);
        let translator = PeerTranslator::new(
            Some(bridge_with(engine.clone(), false).await),
            MembershipDirectory::new(local.clone()),
        );

        translator
            .handle(&user_event(NODE_JOIN, "127.0.0.1:42103"))
            .await
            .unwrap();
        translator
            .handle(&user_event(NODE_LEAVE, LEADER_RAFT))
            .await
            .unwrap();

        assert_eq!(engine.adds.load(Ordering::SeqCst), 0);
        assert_eq!(engine.removes.load(Ordering::SeqCst), 0);

        other.shutdown().await.unwrap();
        local.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejection_becomes_peer_mutation() {
        let leader = gossip("leader", 42031).await;
        let peer = gossip("peer", 42032).await;
        peer.join(&[addr(42031)]).await.unwrap();

        let engine = Arc::new(MockEngine::leader_with(&[LEADER_RAFT]));
        engine.reject_mutations.store(true, Ordering::SeqCst);
        let translator = PeerTranslator::new(
            Some(bridge_with(engine.clone(), false).await),
            MembershipDirectory::new(leader.clone()),
        );

        let result = translator
            .handle(&user_event(NODE_JOIN, "127.0.0.1:42104"))
            .await;
        match result {
            Err(Error::PeerMutation { addr, .. }) => assert_eq!(addr, "127.0.0.1:42104"),
            other => panic!("expected peer mutation error, got {other:?}"),
        }

        let result = translator.handle(&user_event(NODE_JOIN, "not an address")).await;
        assert!(matches!(result, Err(Error::InvalidPayload { .. })));

        peer.shutdown().await.unwrap();
        leader.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_member_removed_when_enabled() {
        let leader = gossip("leader", 42041).await;
        let engine = Arc::new(MockEngine::leader_with(&[LEADER_RAFT, "127.0.0.1:42105"]));

        let mut failed = Member::new("gone", addr(42042));
        failed.status = MemberStatus::Failed;
        failed
            .tags
            .insert(CONSENSUS_ADDR_TAG.to_string(), "127.0.0.1:42105".to_string());

        let disabled = PeerTranslator::new(
            Some(bridge_with(engine.clone(), false).await),
            MembershipDirectory::new(leader.clone()),
        );
        disabled.on_member_failed(&failed).await.unwrap();
        assert_eq!(engine.voter_set().len(), 2);

        let enabled = PeerTranslator::new(
            Some(bridge_with(engine.clone(), true).await),
            MembershipDirectory::new(leader.clone()),
        );
        enabled.on_member_failed(&failed).await.unwrap();
        assert_eq!(engine.voter_set().len(), 1);

        leader.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_membership_churn_converges() {
        const PEERS: u16 = 3;

        let leader = gossip("leader", 42050).await;
        let directory = MembershipDirectory::new(leader.clone());
        let engine = Arc::new(MockEngine::leader_with(&[LEADER_RAFT]));
        let translator = PeerTranslator::new(
            Some(bridge_with(engine.clone(), false).await),
            directory.clone(),
        );

        let raft_addr = |peer: u16| format!("127.0.0.1:{}", 42210 + peer);
        let mut up: BTreeMap<u16, Arc<MemoryGossip>> = BTreeMap::new();
        let mut expected = BTreeSet::from([LEADER_RAFT.to_string()]);
        let mut rng = StdRng::seed_from_u64(7);

        for step in 0..60 {
            let peer = rng.gen_range(0..PEERS);
            match up.remove(&peer) {
                None => {
                    let handle = gossip(&format!("peer-{peer}"), 42051 + peer).await;
                    handle.join(&[addr(42050)]).await.unwrap();
                    up.insert(peer, handle);
                    translator
                        .handle(&user_event(NODE_JOIN, &raft_addr(peer)))
                        .await
                        .unwrap();
                    expected.insert(raft_addr(peer));
                }
                Some(handle) if rng.gen_bool(0.3) => {
                    // Re-announcement of a live peer
                    up.insert(peer, handle);
                    translator
                        .handle(&user_event(NODE_JOIN, &raft_addr(peer)))
                        .await
                        .unwrap();
                }
                Some(handle) => {
                    handle.leave().await.unwrap();
                    handle.shutdown().await.unwrap();
                    translator
                        .handle(&user_event(NODE_LEAVE, &raft_addr(peer)))
                        .await
                        .unwrap();
                    expected.remove(&raft_addr(peer));
                }
            }

            assert_eq!(directory.alive_count(), 1 + up.len(), "step {step}");
            assert_eq!(engine.voter_set(), expected, "step {step}");
        }

        // Once every peer is gone a join is treated as the leader hearing itself
        for handle in std::mem::take(&mut up).into_values() {
            handle.leave().await.unwrap();
            handle.shutdown().await.unwrap();
        }
        for peer in 0..PEERS {
            translator
                .handle(&user_event(NODE_LEAVE, &raft_addr(peer)))
                .await
                .unwrap();
        }
        translator
            .handle(&user_event(NODE_JOIN, &raft_addr(0)))
            .await
            .unwrap();
        assert_eq!(engine.voter_set(), BTreeSet::from([LEADER_RAFT.to_string()]));

        leader.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_last_voter_ignores_own_leave() {
        let local = gossip("solo", 42065).await;
        let engine = Arc::new(MockEngine::leader_with(&[LEADER_RAFT]));
        let translator = PeerTranslator::new(
            Some(bridge_with(engine.clone(), false).await),
            MembershipDirectory::new(local.clone()),
        );

        translator
            .handle(&user_event(NODE_LEAVE, LEADER_RAFT))
            .await
            .unwrap();
        assert_eq!(engine.removes.load(Ordering::SeqCst), 0);
        assert_eq!(engine.voter_set().len(), 1);

        local.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_without_consensus_events_are_ignored() {
        let local = gossip("plain", 42061).await;
        let translator = PeerTranslator::new(None, MembershipDirectory::new(local.clone()));

        translator
            .handle(&user_event(NODE_JOIN, "127.0.0.1:42106"))
            .await
            .unwrap();

        local.shutdown().await.unwrap();
    }
}
