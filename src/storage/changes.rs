//! Change notifications fanned out to subscribers
//!
//! Every committed write publishes one `ChangeEvent` per affected row.
//! Subscribers filter by table and row predicate on their side.

use super::traits::{Filter, Row};
use crate::graph::{NodeId, Table};
use tokio::sync::broadcast;
use tracing::warn;

const CHANGE_BUFFER: usize = 256;

/// What happened to a row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A committed row change
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    pub id: NodeId,
    /// New row for inserts and updates, the removed row for deletes
    pub row: Row,
}

/// Broadcast hub shared by a store's writers
#[derive(Debug, Clone)]
pub struct ChangeBus {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANGE_BUFFER);
        Self { tx }
    }

    /// Publish a change; having no subscribers is not an error
    pub fn publish(&self, event: ChangeEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self, table: Table, filter: Filter) -> ChangeSubscription {
        ChangeSubscription {
            table,
            filter,
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A live subscription to one table. Dropping it unsubscribes.
#[derive(Debug)]
pub struct ChangeSubscription {
    table: Table,
    filter: Filter,
    rx: broadcast::Receiver<ChangeEvent>,
}

impl ChangeSubscription {
    pub fn table(&self) -> Table {
        self.table
    }

    /// Wait for the next matching change. Returns None once the store is gone.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if event.table == self.table && self.filter.matches(&event.row) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Retained events still follow, so a refresh is not lost
                    warn!(table = %self.table, skipped, "change subscription lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {}
}
