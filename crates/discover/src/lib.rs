//! Gossip membership bridged onto a replicated log
//!
//! A [`Node`] discovers peers through a [`Gossip`](proven_gossip::Gossip)
//! implementation and, when consensus is configured, keeps an openraft log
//! among them:
//! - Nodes announce their consensus address with a `node-join` event
//! - The leader turns announcements into voter additions and removals
//! - Application events are routed to named handlers
//! - Committed commands are applied to a pluggable [`StateMachine`]

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::result_large_err)]

/// Consensus bridge
pub mod bridge;

/// Configuration types
pub mod config;

/// Replicated log engine
pub mod consensus;

/// Read-only membership view
pub mod directory;

/// Application event handlers
pub mod dispatch;

/// Error types
pub mod error;

/// Application state machine interface
pub mod fsm;

/// Node lifecycle
pub mod node;

/// Gossip event pump
pub(crate) mod pump;

/// Membership events to voter changes
pub mod translator;

pub use {
    bridge::{BridgePhase, ConsensusBridge},
    config::{ConsensusConfig, LeaveDrain, NodeConfig},
    consensus::{ConsensusEngine, ConsensusError, EngineState},
    dispatch::{
        CustomEvent, EventHandlerFn, HandlerError, HandlerErrorSink, HandlerFailure, HandlerMap,
        handler,
    },
    error::{Error, Result},
    fsm::{FsmError, FsmSnapshot, LogEntry, NoopStateMachine, StateMachine},
    node::{Node, NodeBuilder, NodeState},
    translator::{CONSENSUS_ADDR_TAG, NODE_JOIN, NODE_LEAVE},
};
