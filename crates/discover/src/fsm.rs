//! Application state machine interface
//!
//! The node never calls these methods itself; they are wired into the raft
//! state machine adapter, which applies committed entries and drives
//! snapshotting.

use std::io::{Read, Write};

use bytes::Bytes;
use thiserror::Error;

/// Error raised by an application state machine
#[derive(Debug, Error)]
pub enum FsmError {
    /// I/O failure while persisting or restoring
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Application-defined failure
    #[error("{0}")]
    Other(String),
}

/// A committed log entry handed to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Raft log index
    pub index: u64,
    /// Command bytes as submitted to `apply`
    pub data: Bytes,
}

/// Replicated application state
pub trait StateMachine: Send + Sync + 'static {
    /// Apply a committed entry and return the response for the submitter
    fn apply(&self, entry: &LogEntry) -> Bytes;

    /// Capture a point-in-time snapshot
    fn snapshot(&self) -> Result<Box<dyn FsmSnapshot>, FsmError>;

    /// Replace the state with a previously persisted snapshot
    fn restore(&self, reader: &mut dyn Read) -> Result<(), FsmError>;
}

/// A captured snapshot, written out by the raft snapshot builder
pub trait FsmSnapshot: Send + Sync {
    /// Write the snapshot contents
    fn persist(&self, writer: &mut dyn Write) -> Result<(), FsmError>;

    /// Called once the snapshot has been written (or abandoned)
    fn release(&mut self) {}
}

/// State machine used when the application supplies none
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStateMachine;

struct EmptySnapshot;

impl FsmSnapshot for EmptySnapshot {
    fn persist(&self, _writer: &mut dyn Write) -> Result<(), FsmError> {
        Ok(())
    }
}

impl StateMachine for NoopStateMachine {
    fn apply(&self, _entry: &LogEntry) -> Bytes {
        Bytes::new()
    }

    fn snapshot(&self) -> Result<Box<dyn FsmSnapshot>, FsmError> {
        Ok(Box::new(EmptySnapshot))
    }

    fn restore(&self, _reader: &mut dyn Read) -> Result<(), FsmError> {
        Ok(())
    }
}
