//! openraft-backed consensus engine
//!
//! Owns the raft instance together with its stores and transport. Voter ids
//! are derived from the consensus advertise address, so every node computes
//! the same id for a peer from its `node-join` payload alone.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use openraft::{BasicNode, Config, Raft, ServerState, SnapshotPolicy};
use tracing::{debug, info, warn};

use super::network::RaftTransport;
use super::snapshot::SnapshotStore;
use super::state_machine::FsmAdapter;
use super::storage::RaftLogStore;
use super::types::{Command, TypeConfig, voter_id};
use super::{ConsensusEngine, ConsensusError, ConsensusResult, EngineState, EngineSummary};
use crate::config::ValidatedConsensus;
use crate::fsm::StateMachine;

/// Snapshot directory under the store path
pub const SNAPSHOTS_DIR: &str = "snaps";

const CLUSTER_NAME: &str = "proven-discover";

/// Consensus engine running an openraft instance
pub struct RaftEngine {
    id: u64,
    advertise_addr: SocketAddr,
    raft: Raft<TypeConfig>,
    transport: RaftTransport,
    membership_timeout: Duration,
    shut_down: AtomicBool,
}

impl RaftEngine {
    /// Open the stores, bind the transport and start raft
    ///
    /// With `bootstrap` set and no existing raft state, the engine forms a
    /// single-voter cluster containing only itself.
    pub async fn open(
        settings: &ValidatedConsensus,
        fsm: Arc<dyn StateMachine>,
        bootstrap: bool,
        membership_timeout: Duration,
    ) -> ConsensusResult<Self> {
        let config = &settings.settings;
        let store_path = config.store_path.as_path();

        create_store_dir(store_path).map_err(|e| {
            ConsensusError::Init(format!("store path {}: {e}", store_path.display()))
        })?;

        let log_store = Arc::new(
            RaftLogStore::open(store_path)
                .map_err(|e| ConsensusError::Init(format!("log store: {e}")))?,
        );
        let snapshots = Arc::new(
            SnapshotStore::open(store_path.join(SNAPSHOTS_DIR), config.snapshot_retain)
                .map_err(|e| ConsensusError::Init(format!("snapshot store: {e}")))?,
        );
        let state_machine = Arc::new(
            FsmAdapter::open(fsm, snapshots)
                .map_err(|e| ConsensusError::Init(format!("state machine: {e}")))?,
        );

        let raft_config = Config {
            cluster_name: CLUSTER_NAME.to_string(),
            heartbeat_interval: millis(config.heartbeat_interval),
            election_timeout_min: millis(config.election_timeout_min),
            election_timeout_max: millis(config.election_timeout_max),
            snapshot_policy: SnapshotPolicy::LogsSinceLast(config.snapshot_threshold),
            ..Default::default()
        }
        .validate()
        .map_err(|e| ConsensusError::Init(format!("raft config: {e}")))?;

        let transport = RaftTransport::bind(
            settings.bind_addr,
            settings.advertise_addr,
            config.max_pool,
            config.transport_timeout,
        )
        .await
        .map_err(|e| ConsensusError::Init(format!("raft transport on {}: {e}", settings.bind_addr)))?;

        let id = voter_id(&settings.advertise_addr.to_string());
        let raft = match Raft::new(
            id,
            Arc::new(raft_config),
            transport.network_factory(),
            log_store,
            state_machine,
        )
        .await
        {
            Ok(raft) => raft,
            Err(e) => {
                transport.shutdown().await;
                return Err(ConsensusError::Init(format!("raft: {e}")));
            }
        };

        let engine = Self {
            id,
            advertise_addr: settings.advertise_addr,
            raft,
            transport,
            membership_timeout,
            shut_down: AtomicBool::new(false),
        };

        if let Err(e) = engine.start(bootstrap).await {
            if let Err(shutdown_error) = engine.shutdown().await {
                warn!("Failed to stop raft after init error: {}", shutdown_error);
            }
            return Err(e);
        }

        Ok(engine)
    }

    async fn start(&self, bootstrap: bool) -> ConsensusResult<()> {
        self.transport
            .serve(self.raft.clone())
            .map_err(|e| ConsensusError::Init(format!("raft transport: {e}")))?;

        if !bootstrap {
            info!(
                "Raft node {} started on {}, waiting to be added by the leader",
                self.id, self.advertise_addr
            );
            return Ok(());
        }

        let initialized = self
            .raft
            .is_initialized()
            .await
            .map_err(|e| ConsensusError::Init(e.to_string()))?;

        if initialized {
            info!(
                "Raft node {} already has cluster state, skipping bootstrap",
                self.id
            );
            return Ok(());
        }

        let members = BTreeMap::from([(self.id, BasicNode::new(self.advertise_addr.to_string()))]);
        self.raft
            .initialize(members)
            .await
            .map_err(|e| ConsensusError::Init(format!("bootstrap: {e}")))?;

        info!(
            "Bootstrapped raft cluster with node {} at {}",
            self.id, self.advertise_addr
        );
        Ok(())
    }

    /// Local voter id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Address the raft transport is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    fn ensure_running(&self) -> ConsensusResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ConsensusError::Shutdown);
        }
        Ok(())
    }

    fn voter_ids(&self) -> BTreeSet<u64> {
        let metrics = self.raft.metrics();
        let metrics = metrics.borrow();
        metrics.membership_config.membership().voter_ids().collect()
    }

    async fn change_voters(&self, voters: BTreeSet<u64>) -> ConsensusResult<()> {
        self.raft
            .change_membership(voters, false)
            .await
            .map_err(|e| match e.forward_to_leader() {
                Some(forward) => ConsensusError::NotLeader {
                    leader: forward.leader_node.as_ref().map(|node| node.addr.clone()),
                },
                None => ConsensusError::Membership(e.to_string()),
            })?;
        Ok(())
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn create_store_dir(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    }

    Ok(())
}

#[async_trait]
impl ConsensusEngine for RaftEngine {
    fn state(&self) -> EngineState {
        if self.shut_down.load(Ordering::SeqCst) {
            return EngineState::Shutdown;
        }

        match self.raft.metrics().borrow().state {
            ServerState::Leader => EngineState::Leader,
            ServerState::Follower => EngineState::Follower,
            ServerState::Candidate => EngineState::Candidate,
            ServerState::Learner => EngineState::Learner,
            ServerState::Shutdown => EngineState::Shutdown,
        }
    }

    async fn apply(&self, command: Bytes, timeout: Duration) -> ConsensusResult<Bytes> {
        self.ensure_running()?;

        let write = self.raft.client_write(Command(command.to_vec()));
        match tokio::time::timeout(timeout, write).await {
            Err(_) => Err(ConsensusError::Timeout(timeout)),
            Ok(Ok(response)) => Ok(Bytes::from(response.data.0)),
            Ok(Err(e)) => match e.forward_to_leader() {
                Some(forward) => Err(ConsensusError::NotLeader {
                    leader: forward.leader_node.as_ref().map(|node| node.addr.clone()),
                }),
                None => Err(ConsensusError::Rejected(e.to_string())),
            },
        }
    }

    async fn add_voter(&self, addr: SocketAddr) -> ConsensusResult<()> {
        self.ensure_running()?;

        let node_addr = addr.to_string();
        let id = voter_id(&node_addr);
        let mut voters = self.voter_ids();
        if voters.contains(&id) {
            debug!("{} is already a voter", node_addr);
            return Ok(());
        }

        let change = async {
            // Catch the new node up as a learner before it counts towards quorum
            self.raft
                .add_learner(id, BasicNode::new(node_addr.clone()), true)
                .await
                .map_err(|e| match e.forward_to_leader() {
                    Some(forward) => ConsensusError::NotLeader {
                        leader: forward.leader_node.as_ref().map(|node| node.addr.clone()),
                    },
                    None => ConsensusError::Membership(e.to_string()),
                })?;

            voters.insert(id);
            self.change_voters(voters).await
        };

        tokio::time::timeout(self.membership_timeout, change)
            .await
            .map_err(|_| ConsensusError::Timeout(self.membership_timeout))??;

        info!("Added voter {} ({})", node_addr, id);
        Ok(())
    }

    async fn remove_voter(&self, addr: SocketAddr) -> ConsensusResult<()> {
        self.ensure_running()?;

        let node_addr = addr.to_string();
        let id = voter_id(&node_addr);
        let mut voters = self.voter_ids();
        if !voters.remove(&id) {
            debug!("{} is not a voter", node_addr);
            return Ok(());
        }
        if voters.is_empty() {
            return Err(ConsensusError::Membership(format!(
                "{node_addr} is the last voter"
            )));
        }

        tokio::time::timeout(self.membership_timeout, self.change_voters(voters))
            .await
            .map_err(|_| ConsensusError::Timeout(self.membership_timeout))??;

        info!("Removed voter {} ({})", node_addr, id);
        Ok(())
    }

    fn voters(&self) -> Vec<String> {
        let metrics = self.raft.metrics();
        let metrics = metrics.borrow();
        let membership = metrics.membership_config.membership();
        let voter_ids: BTreeSet<u64> = membership.voter_ids().collect();

        membership
            .nodes()
            .filter(|(id, _)| voter_ids.contains(id))
            .map(|(_, node)| node.addr.clone())
            .collect()
    }

    fn is_drained(&self) -> bool {
        let metrics = self.raft.metrics();
        let metrics = metrics.borrow();
        metrics.last_applied.as_ref().map(|log_id| log_id.index) >= metrics.last_log_index
    }

    fn metrics_summary(&self) -> EngineSummary {
        let (term, leader, last_log_index, last_applied) = {
            let metrics = self.raft.metrics();
            let metrics = metrics.borrow();
            (
                metrics.current_term,
                metrics.current_leader,
                metrics.last_log_index,
                metrics.last_applied.as_ref().map(|log_id| log_id.index),
            )
        };

        EngineSummary {
            id: self.id,
            state: self.state(),
            term,
            leader,
            last_log_index,
            last_applied,
            voters: self.voters(),
        }
    }

    async fn shutdown(&self) -> ConsensusResult<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let result = self
            .raft
            .shutdown()
            .await
            .map_err(|e| ConsensusError::Fatal(e.to_string()));

        self.transport.shutdown().await;
        info!("Raft node {} stopped", self.id);
        result
    }
}
