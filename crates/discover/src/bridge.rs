//! Consensus bridge
//!
//! Owns the replicated-log lifecycle for a node: decides between bootstrap
//! and join, opens the engine, gates voter mutations on leadership and
//! sequences shutdown. Membership and leadership are always read from the
//! engine at the point of use.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{LeaveDrain, ValidatedConsensus};
use crate::consensus::{ConsensusEngine, ConsensusError, EngineState, RaftEngine};
use crate::error::{Error, Result};
use crate::fsm::{NoopStateMachine, StateMachine};

/// Bridge lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgePhase {
    /// Engine not yet opened
    Uninitialized,
    /// Engine being opened
    Bootstrapping,
    /// Serving requests
    Active,
    /// Shutdown in progress
    ShuttingDown,
    /// Shut down
    Closed,
}

impl fmt::Display for BridgePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Bootstrapping => write!(f, "bootstrapping"),
            Self::Active => write!(f, "active"),
            Self::ShuttingDown => write!(f, "shutting down"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

struct Diagnostics {
    stop: Arc<Notify>,
    handle: JoinHandle<()>,
}

/// Connects node lifecycle and membership events to the consensus engine
pub struct ConsensusBridge {
    settings: ValidatedConsensus,
    event_timeout: Duration,
    verbose_diagnostics: bool,
    fsm: Option<Arc<dyn StateMachine>>,
    phase: RwLock<BridgePhase>,
    engine: RwLock<Option<Arc<dyn ConsensusEngine>>>,
    diagnostics: Mutex<Option<Diagnostics>>,
}

impl ConsensusBridge {
    /// Create an uninitialized bridge
    ///
    /// `event_timeout` bounds each voter mutation. Without `fsm`, committed
    /// entries are applied to a [`NoopStateMachine`].
    pub fn new(
        settings: ValidatedConsensus,
        event_timeout: Duration,
        verbose_diagnostics: bool,
        fsm: Option<Arc<dyn StateMachine>>,
    ) -> Self {
        Self {
            settings,
            event_timeout,
            verbose_diagnostics,
            fsm,
            phase: RwLock::new(BridgePhase::Uninitialized),
            engine: RwLock::new(None),
            diagnostics: Mutex::new(None),
        }
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> BridgePhase {
        *self.phase.read()
    }

    /// Consensus advertise address
    pub fn advertise_addr(&self) -> SocketAddr {
        self.settings.advertise_addr
    }

    /// Whether failed members are removed from the voters
    pub fn remove_failed_voters(&self) -> bool {
        self.settings.settings.remove_failed_voters
    }

    /// Open stores, transport and engine
    ///
    /// With `bootstrap` set the engine forms a single-voter cluster unless
    /// the store already holds cluster state.
    pub async fn initialize(&self, bootstrap: bool) -> Result<()> {
        {
            let mut phase = self.phase.write();
            if *phase != BridgePhase::Uninitialized {
                return Err(Error::ConsensusInit(format!(
                    "bridge cannot initialize while {}",
                    *phase
                )));
            }
            *phase = BridgePhase::Bootstrapping;
        }

        let fsm = self
            .fsm
            .clone()
            .unwrap_or_else(|| Arc::new(NoopStateMachine) as Arc<dyn StateMachine>);

        info!(
            "Initializing consensus at {} (bootstrap: {})",
            self.settings.advertise_addr, bootstrap
        );

        match RaftEngine::open(&self.settings, fsm, bootstrap, self.event_timeout).await {
            Ok(engine) => {
                self.activate_with(Arc::new(engine));
                Ok(())
            }
            Err(e) => {
                *self.phase.write() = BridgePhase::Closed;
                Err(Error::ConsensusInit(e.to_string()))
            }
        }
    }

    /// Install an opened engine and start serving
    pub(crate) fn activate_with(&self, engine: Arc<dyn ConsensusEngine>) {
        if self.verbose_diagnostics {
            *self.diagnostics.lock() = Some(spawn_diagnostics(
                engine.clone(),
                self.settings.settings.diagnostics_interval,
            ));
        }

        *self.engine.write() = Some(engine);
        *self.phase.write() = BridgePhase::Active;
    }

    fn engine(&self) -> Result<Arc<dyn ConsensusEngine>> {
        match self.phase() {
            BridgePhase::Active => self.engine.read().clone().ok_or(Error::Closed),
            BridgePhase::Uninitialized | BridgePhase::Bootstrapping => Err(Error::NotRunning),
            BridgePhase::ShuttingDown | BridgePhase::Closed => Err(Error::Closed),
        }
    }

    /// Whether the local engine is currently leader
    pub fn is_leader(&self) -> bool {
        self.engine()
            .map(|engine| engine.state() == EngineState::Leader)
            .unwrap_or(false)
    }

    /// Current voter addresses
    pub fn voters(&self) -> Result<Vec<String>> {
        Ok(self.engine()?.voters())
    }

    /// Submit a command to the replicated log
    ///
    /// Returns `Ok(None)` without touching the log when the local engine is
    /// not leader. Otherwise returns the state machine's response.
    pub async fn apply(&self, command: Bytes, timeout: Duration) -> Result<Option<Bytes>> {
        let engine = self.engine()?;
        if engine.state() != EngineState::Leader {
            debug!("Ignoring apply on a non-leader");
            return Ok(None);
        }

        match engine.apply(command, timeout).await {
            Ok(response) => Ok(Some(response)),
            Err(ConsensusError::Timeout(elapsed)) => Err(Error::ApplyTimeout(elapsed)),
            Err(e @ (ConsensusError::NotLeader { .. } | ConsensusError::Rejected(_))) => {
                Err(Error::ApplyRejected(e.to_string()))
            }
            Err(ConsensusError::Shutdown) => Err(Error::Closed),
            Err(e) => Err(Error::Consensus(e)),
        }
    }

    /// Add `addr` as a voter; a no-op unless the local engine is leader
    pub async fn add_voter(&self, addr: SocketAddr) -> Result<()> {
        let engine = self.engine()?;
        if engine.state() != EngineState::Leader {
            debug!("Not leader, leaving voter {} to the leader", addr);
            return Ok(());
        }

        engine.add_voter(addr).await.map_err(|e| match e {
            ConsensusError::Shutdown => Error::Closed,
            other => Error::Consensus(other),
        })
    }

    /// Remove `addr` from the voters; a no-op unless the local engine is leader
    pub async fn remove_voter(&self, addr: SocketAddr) -> Result<()> {
        let engine = self.engine()?;
        if engine.state() != EngineState::Leader {
            debug!("Not leader, leaving voter {} to the leader", addr);
            return Ok(());
        }

        engine.remove_voter(addr).await.map_err(|e| match e {
            ConsensusError::Shutdown => Error::Closed,
            other => Error::Consensus(other),
        })
    }

    /// Wait according to the configured leave drain
    pub async fn drain(&self) {
        match self.settings.settings.leave_drain {
            LeaveDrain::Fixed(grace) => tokio::time::sleep(grace).await,
            LeaveDrain::UntilApplied { poll, max } => {
                let Ok(engine) = self.engine() else {
                    return;
                };

                let deadline = tokio::time::Instant::now() + max;
                while !engine.is_drained() {
                    if tokio::time::Instant::now() >= deadline {
                        warn!("Leave drain gave up after {:?} with entries unapplied", max);
                        return;
                    }
                    tokio::time::sleep(poll).await;
                }
                debug!("Local log drained");
            }
        }
    }

    /// Stop the engine and its transport
    ///
    /// Later calls return `Ok(())`.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut phase = self.phase.write();
            match *phase {
                BridgePhase::ShuttingDown | BridgePhase::Closed => return Ok(()),
                BridgePhase::Uninitialized | BridgePhase::Bootstrapping => {
                    *phase = BridgePhase::Closed;
                    return Ok(());
                }
                BridgePhase::Active => *phase = BridgePhase::ShuttingDown,
            }
        }

        let diagnostics = self.diagnostics.lock().take();
        if let Some(diagnostics) = diagnostics {
            diagnostics.stop.notify_one();
            if let Err(e) = diagnostics.handle.await {
                warn!("Diagnostics task ended abnormally: {}", e);
            }
        }

        let engine = self.engine.write().take();
        let result = match engine {
            Some(engine) => engine.shutdown().await.map_err(Error::Consensus),
            None => Ok(()),
        };

        *self.phase.write() = BridgePhase::Closed;
        info!("Consensus bridge closed");
        result
    }
}

fn spawn_diagnostics(engine: Arc<dyn ConsensusEngine>, interval: Duration) -> Diagnostics {
    let stop = Arc::new(Notify::new());
    let stopped = stop.clone();

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => info!("Consensus: {}", engine.metrics_summary()),
                _ = stopped.notified() => break,
            }
        }
    });

    Diagnostics { stop, handle }
}
