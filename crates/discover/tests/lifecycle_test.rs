//! Single-node lifecycle tests

mod common;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use proven_discover::{ConsensusConfig, Error, Node, NodeConfig, NodeState};
use proven_gossip::{Gossip, GossipConfig, GossipEvents, GossipResult, Member};
use proven_gossip_memory::MemoryGossip;

use common::{
    CountingMachine, allocate_addr, allocate_port, consensus_config, gossip_config,
    wait_for_leader,
};

/// Gossip calls made by each node, keyed by node name
static GOSSIP_CALLS: LazyLock<Mutex<HashMap<String, Arc<GossipCalls>>>> =
    LazyLock::new(Default::default);

#[derive(Default)]
struct GossipCalls {
    user_events: AtomicUsize,
    leaves: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl GossipCalls {
    fn of(name: &str) -> Arc<Self> {
        GOSSIP_CALLS
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// (user events, leaves, shutdowns)
    fn counts(&self) -> (usize, usize, usize) {
        (
            self.user_events.load(Ordering::SeqCst),
            self.leaves.load(Ordering::SeqCst),
            self.shutdowns.load(Ordering::SeqCst),
        )
    }
}

/// Memory gossip that records outbound calls
struct CountingGossip {
    inner: MemoryGossip,
    calls: Arc<GossipCalls>,
}

#[async_trait]
impl Gossip for CountingGossip {
    async fn create(config: GossipConfig) -> GossipResult<(Self, GossipEvents)> {
        let calls = GossipCalls::of(&config.name);
        let (inner, events) = MemoryGossip::create(config).await?;
        Ok((Self { inner, calls }, events))
    }

    async fn join(&self, seeds: &[SocketAddr]) -> GossipResult<usize> {
        self.inner.join(seeds).await
    }

    async fn user_event(&self, name: &str, payload: Bytes, coalesce: bool) -> GossipResult<()> {
        self.calls.user_events.fetch_add(1, Ordering::SeqCst);
        self.inner.user_event(name, payload, coalesce).await
    }

    fn members(&self) -> Vec<Member> {
        self.inner.members()
    }

    fn local_member(&self) -> Member {
        self.inner.local_member()
    }

    async fn leave(&self) -> GossipResult<()> {
        self.calls.leaves.fetch_add(1, Ordering::SeqCst);
        self.inner.leave().await
    }

    async fn shutdown(&self) -> GossipResult<()> {
        self.calls.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.inner.shutdown().await
    }
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_bootstrap_node_becomes_leader() {
    let store = tempfile::tempdir().unwrap();
    let fsm = CountingMachine::shared();

    let node: Node<MemoryGossip> = Node::builder(consensus_config("solo", store.path(), None))
        .with_state_machine(fsm.clone())
        .build();
    node.start().await.unwrap();
    assert_eq!(node.state().await, NodeState::Running);

    wait_for_leader(&node).await;
    assert_eq!(node.voters().unwrap().len(), 1);
    assert_eq!(node.members().unwrap().len(), 1);
    assert_eq!(node.local_member().unwrap().name, "solo");

    let response = node
        .apply(Bytes::from_static(b"set x"), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(response, Some(Bytes::from_static(b"set x")));
    assert_eq!(fsm.count(), 1);

    node.stop().await.unwrap();
    assert_eq!(node.state().await, NodeState::Stopped);
}

#[tokio::test]
async fn test_stop_twice_is_noop() {
    let store = tempfile::tempdir().unwrap();
    let node: Node<MemoryGossip> = Node::new(consensus_config("twice", store.path(), None));

    // Never started
    node.stop().await.unwrap();
    assert_eq!(node.state().await, NodeState::Unstarted);

    node.start().await.unwrap();
    node.stop().await.unwrap();
    node.stop().await.unwrap();
    assert_eq!(node.state().await, NodeState::Stopped);

    assert!(matches!(node.start().await, Err(Error::AlreadyStarted)));
    assert!(matches!(node.members(), Err(Error::NotRunning)));
}

#[tokio::test]
async fn test_second_stop_touches_nothing() {
    let store = tempfile::tempdir().unwrap();
    let node: Node<CountingGossip> = Node::new(consensus_config("quiet", store.path(), None));
    let calls = GossipCalls::of("quiet");

    node.start().await.unwrap();
    // The node-join announcement
    assert_eq!(calls.counts(), (1, 0, 0));

    node.stop().await.unwrap();
    assert_eq!(calls.counts(), (2, 1, 1));

    node.stop().await.unwrap();
    assert_eq!(calls.counts(), (2, 1, 1));
    assert_eq!(node.state().await, NodeState::Stopped);
}

#[tokio::test]
async fn test_start_twice_fails() {
    let node: Node<MemoryGossip> = Node::new(gossip_config("again"));

    node.start().await.unwrap();
    assert!(matches!(node.start().await, Err(Error::AlreadyStarted)));

    node.stop().await.unwrap();
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let node: Node<MemoryGossip> = Node::new(NodeConfig::new("", allocate_addr().to_string()));
    assert!(matches!(node.start().await, Err(Error::Configuration(_))));
    assert_eq!(node.state().await, NodeState::Unstarted);

    let node: Node<MemoryGossip> = Node::new(NodeConfig::new("bad", "localhost"));
    assert!(matches!(node.start().await, Err(Error::Configuration(_))));
}

#[tokio::test]
async fn test_accessors_need_running_node() {
    let node: Node<MemoryGossip> = Node::new(gossip_config("idle"));

    assert!(matches!(node.members(), Err(Error::NotRunning)));
    assert!(matches!(node.local_address(), Err(Error::NotRunning)));
    assert!(matches!(
        node.send_event("ping", Bytes::new(), false).await,
        Err(Error::NotRunning)
    ));
    assert!(!node.is_leader());
}

#[tokio::test]
async fn test_gossip_only_node() {
    let config = gossip_config("plain");
    let addr = config.bind_addr.clone();
    let node: Node<MemoryGossip> = Node::new(config);

    node.start().await.unwrap();
    assert_eq!(node.local_address().unwrap().to_string(), addr);
    assert!(!node.is_leader());
    assert!(matches!(
        node.apply(Bytes::from_static(b"x"), Duration::from_secs(1)).await,
        Err(Error::Configuration(_))
    ));

    node.stop().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_gossip_address_is_transport_error() {
    let config = gossip_config("first");
    let mut duplicate = config.clone();
    duplicate.name = "second".to_string();

    let first: Node<MemoryGossip> = Node::new(config);
    first.start().await.unwrap();

    let second: Node<MemoryGossip> = Node::new(duplicate);
    assert!(matches!(second.start().await, Err(Error::Transport(_))));

    first.stop().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_seed_is_join_error() {
    let mut config = gossip_config("lost");
    config.seed_addr = Some(allocate_addr().to_string());
    let gossip_addr = config.bind_addr.clone();

    let node: Node<MemoryGossip> = Node::new(config);
    assert!(matches!(node.start().await, Err(Error::Join(_))));
    assert_eq!(node.state().await, NodeState::Unstarted);

    // The failed start released the gossip address
    let retry: Node<MemoryGossip> = Node::new(NodeConfig::new("retry", gossip_addr));
    retry.start().await.unwrap();
    retry.stop().await.unwrap();
}

#[tokio::test]
async fn test_hostname_seed_is_resolved() {
    let seed: Node<MemoryGossip> = Node::new(gossip_config("named-seed"));
    seed.start().await.unwrap();
    let port = seed.local_address().unwrap().port();

    let mut config = gossip_config("named-joiner");
    config.seed_addr = Some(format!("localhost:{port}"));
    let joiner: Node<MemoryGossip> = Node::new(config);
    joiner.start().await.unwrap();

    assert_eq!(joiner.members().unwrap().len(), 2);
    assert_eq!(seed.members().unwrap().len(), 2);

    joiner.stop().await.unwrap();
    seed.stop().await.unwrap();
}

#[tokio::test]
async fn test_unresolvable_seed_is_join_error() {
    let mut config = gossip_config("nowhere");
    config.seed_addr = Some("seed.invalid:7946".to_string());

    let node: Node<MemoryGossip> = Node::new(config);
    assert!(matches!(node.start().await, Err(Error::Join(_))));
    assert_eq!(node.state().await, NodeState::Unstarted);
}

#[tokio::test]
async fn test_consensus_init_failure_tears_down_gossip() {
    let store = tempfile::tempdir().unwrap();
    let occupied = std::net::TcpListener::bind(("127.0.0.1", allocate_port())).unwrap();
    let raft_addr = occupied.local_addr().unwrap();

    let mut config = gossip_config("broken");
    config.consensus = Some(ConsensusConfig::new(
        raft_addr.to_string(),
        store.path().join("broken"),
    ));
    let gossip_addr = config.bind_addr.clone();

    let node: Node<MemoryGossip> = Node::builder(config)
        .with_state_machine(Arc::new(CountingMachine::default()))
        .build();
    assert!(matches!(node.start().await, Err(Error::ConsensusInit(_))));
    assert_eq!(node.state().await, NodeState::Unstarted);

    let retry: Node<MemoryGossip> = Node::new(NodeConfig::new("retry", gossip_addr));
    retry.start().await.unwrap();
    retry.stop().await.unwrap();
}
