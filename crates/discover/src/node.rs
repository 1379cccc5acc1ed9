//! Node lifecycle controller
//!
//! Startup order: bind gossip, spawn the event pump, join the seed, announce
//! the consensus address, then open consensus. Shutdown runs in reverse:
//! announce departure, drain, stop consensus, leave gossip, shut gossip down
//! and finally stop the pump. Start and stop hold the lifecycle lock for
//! their whole duration, so they never interleave.

use std::fmt;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use proven_gossip::{Gossip, GossipConfig, GossipError, Member};
use tracing::{debug, info, warn};

use crate::bridge::ConsensusBridge;
use crate::config::{self, NodeConfig, ValidatedConfig};
use crate::directory::MembershipDirectory;
use crate::dispatch::{Dispatcher, HandlerErrorSink, HandlerMap};
use crate::error::{Error, Result};
use crate::fsm::StateMachine;
use crate::pump::EventPump;
use crate::translator::{CONSENSUS_ADDR_TAG, NODE_JOIN, NODE_LEAVE, PeerTranslator};

/// Node lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Never started
    Unstarted,
    /// Gossip and consensus are up
    Running,
    /// Shutdown in progress
    Stopping,
    /// Shut down; the node cannot be restarted
    Stopped,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unstarted => write!(f, "unstarted"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Handles that exist only while the node is running
struct Handles<G: Gossip> {
    config: ValidatedConfig,
    gossip: Arc<G>,
    directory: MembershipDirectory,
    bridge: Option<Arc<ConsensusBridge>>,
    pump: Mutex<Option<EventPump>>,
}

impl<G: Gossip> Handles<G> {
    /// Address announced in `node-join` / `node-leave`
    fn announce_addr(&self) -> SocketAddr {
        self.bridge
            .as_ref()
            .map_or(self.config.advertise_addr, |bridge| bridge.advertise_addr())
    }

    async fn stop_pump(&self) {
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            pump.stop().await;
        }
    }

    /// Release everything after a failed start
    async fn abandon(&self) {
        if let Some(bridge) = &self.bridge
            && let Err(e) = bridge.shutdown().await
        {
            warn!("Failed to close consensus after failed start: {}", e);
        }
        if let Err(e) = self.gossip.shutdown().await {
            warn!("Failed to shut down gossip after failed start: {}", e);
        }
        self.stop_pump().await;
    }
}

/// Builder for [`Node`]
pub struct NodeBuilder<G: Gossip> {
    config: NodeConfig,
    state_machine: Option<Arc<dyn StateMachine>>,
    handlers: HandlerMap,
    handler_errors: Option<HandlerErrorSink>,
    _gossip: PhantomData<fn() -> G>,
}

impl<G: Gossip> NodeBuilder<G> {
    /// Start building a node from `config`
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            state_machine: None,
            handlers: HandlerMap::new(),
            handler_errors: None,
            _gossip: PhantomData,
        }
    }

    /// Application state machine for the replicated log
    pub fn with_state_machine(mut self, state_machine: Arc<dyn StateMachine>) -> Self {
        self.state_machine = Some(state_machine);
        self
    }

    /// Handlers for application events
    pub fn with_handlers(mut self, handlers: HandlerMap) -> Self {
        self.handlers = handlers;
        self
    }

    /// Where handler failures are sent
    pub fn with_handler_errors(mut self, sink: HandlerErrorSink) -> Self {
        self.handler_errors = Some(sink);
        self
    }

    /// Build the node
    pub fn build(self) -> Node<G> {
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.register(self.handlers, self.handler_errors);

        Node {
            config: self.config,
            state_machine: self.state_machine,
            dispatcher,
            lifecycle: tokio::sync::Mutex::new(NodeState::Unstarted),
            handles: RwLock::new(None),
        }
    }
}

/// A cluster node: gossip membership plus an optional replicated log
pub struct Node<G: Gossip> {
    config: NodeConfig,
    state_machine: Option<Arc<dyn StateMachine>>,
    dispatcher: Arc<Dispatcher>,
    lifecycle: tokio::sync::Mutex<NodeState>,
    handles: RwLock<Option<Arc<Handles<G>>>>,
}

impl<G: Gossip> Node<G> {
    /// Create a node with no state machine or handlers
    pub fn new(config: NodeConfig) -> Self {
        NodeBuilder::new(config).build()
    }

    /// Start building a node
    pub fn builder(config: NodeConfig) -> NodeBuilder<G> {
        NodeBuilder::new(config)
    }

    /// Configured node name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Current lifecycle state; waits for an in-flight start or stop
    pub async fn state(&self) -> NodeState {
        *self.lifecycle.lock().await
    }

    /// Bring the node up
    ///
    /// On failure everything created so far is released and the node stays
    /// unstarted.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.lifecycle.lock().await;
        if *state != NodeState::Unstarted {
            return Err(Error::AlreadyStarted);
        }

        let config = self.config.validate().await?;

        let mut gossip_config = GossipConfig::new(config.name.clone(), config.bind_addr);
        gossip_config.advertise_addr = config.advertise_addr;
        gossip_config.tombstone_timeout = config.node_timeout;
        if let Some(consensus) = &config.consensus {
            gossip_config.tags.insert(
                CONSENSUS_ADDR_TAG.to_string(),
                consensus.advertise_addr.to_string(),
            );
        }

        let (gossip, events) = G::create(gossip_config).await.map_err(|e| match e {
            GossipError::Bind { .. } => Error::Transport(e.to_string()),
            other => Error::Gossip(other),
        })?;
        let gossip = Arc::new(gossip);
        let directory = MembershipDirectory::new(gossip.clone());

        let bridge = config.consensus.clone().map(|consensus| {
            Arc::new(ConsensusBridge::new(
                consensus,
                config.event_timeout,
                config.verbose_diagnostics,
                self.state_machine.clone(),
            ))
        });

        let translator = Arc::new(PeerTranslator::new(bridge.clone(), directory.clone()));
        let pump = EventPump::spawn(events, translator, self.dispatcher.clone());

        let handles = Handles {
            config,
            gossip,
            directory,
            bridge,
            pump: Mutex::new(Some(pump)),
        };

        if let Err(e) = Self::bring_up(&handles).await {
            warn!("Node {} failed to start: {}", handles.config.name, e);
            handles.abandon().await;
            return Err(e);
        }

        info!(
            "Node {} running at {}",
            handles.config.name, handles.config.advertise_addr
        );
        *self.handles.write() = Some(Arc::new(handles));
        *state = NodeState::Running;
        Ok(())
    }

    async fn bring_up(handles: &Handles<G>) -> Result<()> {
        if let Some(seed) = &handles.config.seed_addr {
            let seeds = config::lookup(seed)
                .await
                .map_err(|e| Error::Join(format!("seed {seed} does not resolve: {e}")))?;
            let contacted = handles
                .gossip
                .join(&seeds)
                .await
                .map_err(|e| Error::Join(format!("seed {seed}: {e}")))?;
            info!("Joined cluster through {} ({} members contacted)", seed, contacted);
        }

        let announce = handles.announce_addr().to_string();
        handles
            .gossip
            .user_event(NODE_JOIN, Bytes::from(announce), false)
            .await?;

        if let Some(bridge) = &handles.bridge {
            bridge.initialize(handles.config.seed_addr.is_none()).await?;
        }

        Ok(())
    }

    /// Take the node down
    ///
    /// Every phase runs even when an earlier one fails; the first error is
    /// returned and later ones are logged. Stopping an unstarted or stopped
    /// node does nothing.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.lifecycle.lock().await;
        if *state != NodeState::Running {
            debug!("Node {} is {}, nothing to stop", self.config.name, *state);
            return Ok(());
        }
        *state = NodeState::Stopping;

        let handles = self.handles.write().take();
        let mut first_error = None;

        if let Some(handles) = handles {
            let mut record = |phase: &str, result: Result<()>| {
                if let Err(e) = result {
                    if first_error.is_none() {
                        first_error = Some(e);
                    } else {
                        warn!("Stop phase {} failed: {}", phase, e);
                    }
                }
            };

            let announce = handles.announce_addr().to_string();
            record(
                "leave broadcast",
                handles
                    .gossip
                    .user_event(NODE_LEAVE, Bytes::from(announce), false)
                    .await
                    .map_err(Error::from),
            );

            if let Some(bridge) = &handles.bridge {
                bridge.drain().await;
                record("consensus shutdown", bridge.shutdown().await);
            }

            record(
                "gossip leave",
                handles.gossip.leave().await.map_err(Error::from),
            );
            record(
                "gossip shutdown",
                handles.gossip.shutdown().await.map_err(Error::from),
            );

            handles.stop_pump().await;
        }

        *state = NodeState::Stopped;
        info!("Node {} stopped", self.config.name);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn handles(&self) -> Result<Arc<Handles<G>>> {
        self.handles.read().clone().ok_or(Error::NotRunning)
    }

    fn bridge(&self) -> Result<Arc<ConsensusBridge>> {
        self.handles()?
            .bridge
            .clone()
            .ok_or_else(|| Error::Configuration("consensus is not enabled".to_string()))
    }

    /// All known members
    pub fn members(&self) -> Result<Vec<Member>> {
        Ok(self.handles()?.directory.members())
    }

    /// The local member
    pub fn local_member(&self) -> Result<Member> {
        Ok(self.handles()?.directory.local_member())
    }

    /// Local gossip address
    pub fn local_address(&self) -> Result<SocketAddr> {
        Ok(self.handles()?.directory.local_address())
    }

    /// Whether the local consensus engine is leader
    pub fn is_leader(&self) -> bool {
        self.bridge().is_ok_and(|bridge| bridge.is_leader())
    }

    /// Current voter addresses
    pub fn voters(&self) -> Result<Vec<String>> {
        self.bridge()?.voters()
    }

    /// Broadcast an application event to every member
    pub async fn send_event(&self, name: &str, payload: Bytes, coalesce: bool) -> Result<()> {
        let handles = self.handles()?;
        handles.gossip.user_event(name, payload, coalesce).await?;
        Ok(())
    }

    /// Submit a command to the replicated log
    ///
    /// Returns `Ok(None)` on a non-leader, which leaves the log untouched.
    pub async fn apply(&self, command: Bytes, timeout: Duration) -> Result<Option<Bytes>> {
        self.bridge()?.apply(command, timeout).await
    }

    /// Replace the application event handlers and error sink
    pub fn register_handlers(&self, handlers: HandlerMap, sink: Option<HandlerErrorSink>) {
        self.dispatcher.register(handlers, sink);
    }
}
