//! In-process engine for bridge and translator tests

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{ConsensusEngine, ConsensusError, ConsensusResult, EngineState, EngineSummary};

/// Records every call; leadership and failures are toggled by the test
#[derive(Default)]
pub(crate) struct MockEngine {
    pub leader: AtomicBool,
    pub reject_mutations: AtomicBool,
    pub voters: Mutex<BTreeSet<String>>,
    pub applied: Mutex<Vec<Bytes>>,
    pub adds: AtomicUsize,
    pub removes: AtomicUsize,
    pub shutdowns: AtomicUsize,
}

impl MockEngine {
    pub fn leader_with(voters: &[&str]) -> Self {
        let engine = Self::default();
        engine.leader.store(true, Ordering::SeqCst);
        engine
            .voters
            .lock()
            .extend(voters.iter().map(|voter| voter.to_string()));
        engine
    }

    pub fn voter_set(&self) -> BTreeSet<String> {
        self.voters.lock().clone()
    }

    fn check_mutation(&self) -> ConsensusResult<()> {
        if self.shutdowns.load(Ordering::SeqCst) > 0 {
            return Err(ConsensusError::Shutdown);
        }
        if !self.leader.load(Ordering::SeqCst) {
            return Err(ConsensusError::NotLeader { leader: None });
        }
        if self.reject_mutations.load(Ordering::SeqCst) {
            return Err(ConsensusError::Membership("rejected".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ConsensusEngine for MockEngine {
    fn state(&self) -> EngineState {
        if self.shutdowns.load(Ordering::SeqCst) > 0 {
            EngineState::Shutdown
        } else if self.leader.load(Ordering::SeqCst) {
            EngineState::Leader
        } else {
            EngineState::Follower
        }
    }

    async fn apply(&self, command: Bytes, timeout: Duration) -> ConsensusResult<Bytes> {
        if !self.leader.load(Ordering::SeqCst) {
            return Err(ConsensusError::NotLeader { leader: None });
        }
        if command.is_empty() {
            return Err(ConsensusError::Timeout(timeout));
        }
        self.applied.lock().push(command.clone());
        Ok(command)
    }

    async fn add_voter(&self, addr: SocketAddr) -> ConsensusResult<()> {
        self.check_mutation()?;
        self.adds.fetch_add(1, Ordering::SeqCst);
        self.voters.lock().insert(addr.to_string());
        Ok(())
    }

    async fn remove_voter(&self, addr: SocketAddr) -> ConsensusResult<()> {
        self.check_mutation()?;
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.voters.lock().remove(&addr.to_string());
        Ok(())
    }

    fn voters(&self) -> Vec<String> {
        self.voters.lock().iter().cloned().collect()
    }

    fn is_drained(&self) -> bool {
        true
    }

    fn metrics_summary(&self) -> EngineSummary {
        EngineSummary {
            id: 1,
            state: self.state(),
            term: 1,
            leader: self.leader.load(Ordering::SeqCst).then_some(1),
            last_log_index: Some(self.applied.lock().len() as u64),
            last_applied: Some(self.applied.lock().len() as u64),
            voters: self.voters(),
        }
    }

    async fn shutdown(&self) -> ConsensusResult<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
