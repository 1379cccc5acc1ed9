//! Node configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for a discover node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name, unique within the cluster
    pub name: String,
    /// Gossip bind address
    pub bind_addr: String,
    /// Gossip advertise address (defaults to the bind address)
    pub advertise_addr: Option<String>,
    /// Gossip address of an existing member; none bootstraps a new cluster
    pub seed_addr: Option<String>,
    /// How long departed members remain visible
    pub node_timeout: Duration,
    /// Bound on voter mutations triggered by membership events
    pub event_timeout: Duration,
    /// Periodically log consensus state
    pub verbose_diagnostics: bool,
    /// Consensus settings; none runs gossip only
    pub consensus: Option<ConsensusConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            bind_addr: "127.0.0.1:7946".to_string(),
            advertise_addr: None,
            seed_addr: None,
            node_timeout: Duration::from_secs(60),
            event_timeout: Duration::from_secs(10),
            verbose_diagnostics: false,
            consensus: None,
        }
    }
}

/// How `stop` waits between broadcasting `node-leave` and stopping consensus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveDrain {
    /// Sleep for a fixed grace interval
    Fixed(Duration),
    /// Poll until everything in the local log has been applied
    UntilApplied {
        /// Poll interval
        poll: Duration,
        /// Upper bound on the wait
        max: Duration,
    },
}

impl Default for LeaveDrain {
    fn default() -> Self {
        Self::Fixed(Duration::from_secs(2))
    }
}

/// Consensus (raft) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Raft transport bind address
    pub bind_addr: String,
    /// Raft transport advertise address (defaults to the bind address)
    pub advertise_addr: Option<String>,
    /// Directory holding the log, stable and snapshot stores
    pub store_path: PathBuf,
    /// Idle connections kept per peer
    pub max_pool: usize,
    /// Connect and RPC timeout of the raft transport
    pub transport_timeout: Duration,
    /// Leader heartbeat interval
    pub heartbeat_interval: Duration,
    /// Election timeout minimum
    pub election_timeout_min: Duration,
    /// Election timeout maximum
    pub election_timeout_max: Duration,
    /// Log entries between snapshots
    pub snapshot_threshold: u64,
    /// Snapshots kept on disk
    pub snapshot_retain: usize,
    /// Drain strategy used when the node stops
    pub leave_drain: LeaveDrain,
    /// Remove voters whose gossip member is reported failed
    pub remove_failed_voters: bool,
    /// Interval of the diagnostics reporter
    pub diagnostics_interval: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7947".to_string(),
            advertise_addr: None,
            store_path: PathBuf::from("raft"),
            max_pool: 10,
            transport_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_millis(150),
            election_timeout_min: Duration::from_millis(1000),
            election_timeout_max: Duration::from_millis(2000),
            snapshot_threshold: 8192,
            snapshot_retain: 1,
            leave_drain: LeaveDrain::default(),
            remove_failed_voters: false,
            diagnostics_interval: Duration::from_secs(10),
        }
    }
}

/// A configuration whose addresses have been parsed and checked
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    /// Node name
    pub name: String,
    /// Gossip bind address
    pub bind_addr: SocketAddr,
    /// Gossip advertise address
    pub advertise_addr: SocketAddr,
    /// Seed `host:port`, if joining; resolved when the node joins
    pub seed_addr: Option<String>,
    /// Gossip tombstone timeout
    pub node_timeout: Duration,
    /// Bound on event-driven voter mutations
    pub event_timeout: Duration,
    /// Periodic diagnostics
    pub verbose_diagnostics: bool,
    /// Consensus settings
    pub consensus: Option<ValidatedConsensus>,
}

/// Consensus settings with resolved addresses
#[derive(Debug, Clone)]
pub struct ValidatedConsensus {
    /// Raft transport bind address
    pub bind_addr: SocketAddr,
    /// Raft transport advertise address
    pub advertise_addr: SocketAddr,
    /// Remaining settings
    pub settings: ConsensusConfig,
}

/// Check that `value` has the shape `host:port`
fn host_port(field: &str, value: &str) -> Result<String> {
    let value = value.trim();
    if value.parse::<SocketAddr>().is_ok() {
        return Ok(value.to_string());
    }

    let malformed = || Error::Configuration(format!("{field} {value:?} is not a host:port address"));
    let (host, port) = value.rsplit_once(':').ok_or_else(malformed)?;
    // Bare IPv6 hosts must be bracketed
    if host.is_empty() || host.contains(':') || host.contains(char::is_whitespace) {
        return Err(malformed());
    }
    port.parse::<u16>().map_err(|_| malformed())?;

    Ok(value.to_string())
}

/// Every address `host:port` resolves to
pub(crate) async fn lookup(value: &str) -> std::io::Result<Vec<SocketAddr>> {
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(vec![addr]);
    }
    Ok(tokio::net::lookup_host(value).await?.collect())
}

async fn resolve_addr(field: &str, value: &str) -> Result<SocketAddr> {
    let value = host_port(field, value)?;
    lookup(&value)
        .await
        .map_err(|e| Error::Configuration(format!("{field} {value:?} does not resolve: {e}")))?
        .into_iter()
        .next()
        .ok_or_else(|| Error::Configuration(format!("{field} {value:?} resolved to no addresses")))
}

fn advertisable(field: &str, addr: SocketAddr) -> Result<SocketAddr> {
    if addr.ip().is_unspecified() || addr.port() == 0 {
        return Err(Error::Configuration(format!(
            "{field} {addr} is not advertisable"
        )));
    }
    Ok(addr)
}

fn non_zero(field: &str, value: Duration) -> Result<()> {
    if value.is_zero() {
        return Err(Error::Configuration(format!("{field} must be non-zero")));
    }
    Ok(())
}

impl NodeConfig {
    /// Create a config with the given name and gossip bind address
    pub fn new(name: impl Into<String>, bind_addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bind_addr: bind_addr.into(),
            ..Default::default()
        }
    }

    /// Validate the configuration and resolve its listen addresses
    ///
    /// The seed is only checked for shape here; it is resolved on join so an
    /// unknown seed host surfaces as a join failure.
    pub async fn validate(&self) -> Result<ValidatedConfig> {
        if self.name.trim().is_empty() {
            return Err(Error::Configuration("name is required".to_string()));
        }

        let bind_addr = resolve_addr("bind_addr", &self.bind_addr).await?;
        let advertise_addr = match &self.advertise_addr {
            Some(addr) => resolve_addr("advertise_addr", addr).await?,
            None => bind_addr,
        };
        let advertise_addr = advertisable("advertise_addr", advertise_addr)?;

        let seed_addr = match self.seed_addr.as_deref().map(str::trim) {
            Some("") | None => None,
            Some(addr) => Some(host_port("seed_addr", addr)?),
        };

        non_zero("node_timeout", self.node_timeout)?;
        non_zero("event_timeout", self.event_timeout)?;

        let consensus = match &self.consensus {
            Some(consensus) => Some(consensus.validate().await?),
            None => None,
        };

        Ok(ValidatedConfig {
            name: self.name.clone(),
            bind_addr,
            advertise_addr,
            seed_addr,
            node_timeout: self.node_timeout,
            event_timeout: self.event_timeout,
            verbose_diagnostics: self.verbose_diagnostics,
            consensus,
        })
    }
}

impl ConsensusConfig {
    /// Create settings with the given raft bind address and store path
    pub fn new(bind_addr: impl Into<String>, store_path: impl Into<PathBuf>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            store_path: store_path.into(),
            ..Default::default()
        }
    }

    /// Validate the settings and resolve the raft addresses
    pub async fn validate(&self) -> Result<ValidatedConsensus> {
        let bind_addr = resolve_addr("consensus.bind_addr", &self.bind_addr).await?;
        let advertise_addr = match &self.advertise_addr {
            Some(addr) => resolve_addr("consensus.advertise_addr", addr).await?,
            None => bind_addr,
        };
        let advertise_addr = advertisable("consensus.advertise_addr", advertise_addr)?;

        if self.store_path.as_os_str().is_empty() {
            return Err(Error::Configuration(
                "consensus.store_path is required".to_string(),
            ));
        }
        if self.max_pool == 0 {
            return Err(Error::Configuration(
                "consensus.max_pool must be at least 1".to_string(),
            ));
        }
        if self.snapshot_retain == 0 {
            return Err(Error::Configuration(
                "consensus.snapshot_retain must be at least 1".to_string(),
            ));
        }

        non_zero("consensus.transport_timeout", self.transport_timeout)?;
        non_zero("consensus.heartbeat_interval", self.heartbeat_interval)?;
        non_zero("consensus.diagnostics_interval", self.diagnostics_interval)?;

        if self.election_timeout_min >= self.election_timeout_max {
            return Err(Error::Configuration(
                "consensus.election_timeout_min must be below election_timeout_max".to_string(),
            ));
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(Error::Configuration(
                "consensus.heartbeat_interval must be below election_timeout_min".to_string(),
            ));
        }

        if let LeaveDrain::UntilApplied { poll, max } = self.leave_drain {
            non_zero("consensus.leave_drain.poll", poll)?;
            non_zero("consensus.leave_drain.max", max)?;
        }

        Ok(ValidatedConsensus {
            bind_addr,
            advertise_addr,
            settings: self.clone(),
        })
    }
}
