//! Session notices for the user
//!
//! Write failures are always surfaced here as well as returned from the
//! operation. Channel degradation is surfaced but never fatal.

use crate::graph::{NodeId, Table};
use tokio::sync::broadcast;

const EVENT_BUFFER: usize = 64;

/// Which coordinator operation produced a notice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Connect,
    EditField,
    CreateNode,
    Delete,
    SavePosition,
    Vote,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Operation::Connect => "connect",
            Operation::EditField => "edit field",
            Operation::CreateNode => "create node",
            Operation::Delete => "delete",
            Operation::SavePosition => "save position",
            Operation::Vote => "vote",
        };
        f.write_str(name)
    }
}

/// A notice emitted by a view session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A store write failed; the local change has been reverted where applicable
    WriteFailed {
        operation: Operation,
        node_id: NodeId,
        message: String,
    },
    /// A local change was put back after its write failed
    RolledBack {
        operation: Operation,
        node_id: NodeId,
        field: Option<String>,
    },
    /// The view was rebuilt from fresh store data
    Refreshed { node_count: usize },
    /// Change notifications for a table are unavailable
    LiveRefreshDegraded { table: Table, message: String },
    /// Cursor presence is unavailable
    PresenceDegraded { message: String },
}

/// Fan-out of session notices
#[derive(Debug, Clone)]
pub struct SessionEvents {
    tx: broadcast::Sender<SessionEvent>,
}

impl SessionEvents {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    /// Emit a notice; nobody listening is fine
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

impl Default for SessionEvents {
    fn default() -> Self {
        Self::new()
    }
}
