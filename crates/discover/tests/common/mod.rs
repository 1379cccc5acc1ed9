//! Shared helpers for node integration tests

#![allow(dead_code)]

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use proven_discover::{
    ConsensusConfig, FsmError, FsmSnapshot, LeaveDrain, LogEntry, Node, NodeConfig, StateMachine,
};
use proven_gossip_memory::MemoryGossip;

/// Next port to try, starting from a random offset
static NEXT_PORT: LazyLock<Mutex<u16>> = LazyLock::new(|| {
    let mut hasher = DefaultHasher::new();
    SystemTime::now().hash(&mut hasher);
    std::process::id().hash(&mut hasher);
    Mutex::new(15000 + (hasher.finish() % 10000) as u16)
});

/// Allocate a port that is free right now
pub fn allocate_port() -> u16 {
    let mut next = NEXT_PORT.lock().unwrap();

    for _ in 0..10000 {
        let port = *next;
        *next += 1;

        if TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], port))).is_ok() {
            return port;
        }
    }

    panic!("No available ports found");
}

/// Allocate a loopback address with a free port
pub fn allocate_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], allocate_port()))
}

/// Gossip-only node config
pub fn gossip_config(name: &str) -> NodeConfig {
    NodeConfig::new(name, allocate_addr().to_string())
}

/// Node config with fast raft timings and a short leave drain
pub fn consensus_config(name: &str, store: &Path, seed: Option<SocketAddr>) -> NodeConfig {
    let mut consensus = ConsensusConfig::new(allocate_addr().to_string(), store.join(name));
    consensus.heartbeat_interval = Duration::from_millis(50);
    consensus.election_timeout_min = Duration::from_millis(200);
    consensus.election_timeout_max = Duration::from_millis(400);
    consensus.leave_drain = LeaveDrain::Fixed(Duration::from_millis(500));

    let mut config = gossip_config(name);
    config.seed_addr = seed.map(|addr| addr.to_string());
    config.event_timeout = Duration::from_secs(10);
    config.consensus = Some(consensus);
    config
}

/// Poll `condition` until it holds or `within` elapses
pub async fn eventually(within: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Wait for `node` to become leader
pub async fn wait_for_leader(node: &Node<MemoryGossip>) {
    assert!(
        eventually(Duration::from_secs(10), || node.is_leader()).await,
        "{} did not become leader",
        node.name()
    );
}

/// Counts applied commands and echoes them back
#[derive(Default)]
pub struct CountingMachine {
    pub applied: AtomicU64,
}

struct CountSnapshot(u64);

impl FsmSnapshot for CountSnapshot {
    fn persist(&self, writer: &mut dyn Write) -> Result<(), FsmError> {
        writer.write_all(&self.0.to_be_bytes())?;
        Ok(())
    }
}

impl StateMachine for CountingMachine {
    fn apply(&self, entry: &LogEntry) -> Bytes {
        self.applied.fetch_add(1, Ordering::SeqCst);
        entry.data.clone()
    }

    fn snapshot(&self) -> Result<Box<dyn FsmSnapshot>, FsmError> {
        Ok(Box::new(CountSnapshot(self.applied.load(Ordering::SeqCst))))
    }

    fn restore(&self, reader: &mut dyn Read) -> Result<(), FsmError> {
        let mut count = [0u8; 8];
        reader.read_exact(&mut count)?;
        self.applied.store(u64::from_be_bytes(count), Ordering::SeqCst);
        Ok(())
    }
}

impl CountingMachine {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }
}
