//! Position synchronizer
//!
//! Drag events move the node in the local view immediately. The store write
//! is deferred until the node has been quiet for the configured window; each
//! node has its own timer, so drags on different nodes never reset each
//! other. Viewers cannot move nodes.

use super::cancel::CancellationToken;
use super::coordinator::{SyncError, SyncResult};
use super::events::{Operation, SessionEvent, SessionEvents};
use crate::graph::{LocalGraph, NodeId, NodeKind, Position, Role};
use crate::storage::{EntityStore, Row};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error};

struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Per-node trailing debounce of drag positions
pub struct PositionSync {
    store: Arc<dyn EntityStore>,
    graph: Arc<Mutex<LocalGraph>>,
    events: SessionEvents,
    cancel: CancellationToken,
    role: Role,
    quiet: Duration,
    timers: Arc<DashMap<NodeId, Timer>>,
    generation: AtomicU64,
}

impl PositionSync {
    pub fn new(
        store: Arc<dyn EntityStore>,
        graph: Arc<Mutex<LocalGraph>>,
        role: Role,
        quiet: Duration,
        events: SessionEvents,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            graph,
            events,
            cancel,
            role,
            quiet,
            timers: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Record a drag frame. Restarts this node's quiet window.
    ///
    /// Viewers get `ReadOnly` and the view is left alone. Must be called
    /// from within a tokio runtime.
    pub fn on_drag(&self, id: &NodeId, kind: NodeKind, x: f64, y: f64) -> SyncResult<()> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        if !self.role.can_edit() {
            return Err(SyncError::ReadOnly);
        }
        self.graph
            .lock()
            .unwrap()
            .set_position(id, Position::new(x, y));

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = tokio::spawn(persist_after_quiet(
            PersistJob {
                store: self.store.clone(),
                events: self.events.clone(),
                cancel: self.cancel.clone(),
                timers: self.timers.clone(),
                quiet: self.quiet,
                generation,
                id: id.clone(),
                kind,
            },
            Position::new(x, y),
        ));

        if let Some(previous) = self.timers.insert(id.clone(), Timer { generation, handle }) {
            previous.handle.abort();
            debug!(node = %id, "drag coalesced");
        }
        Ok(())
    }

    /// Nodes whose quiet window has not yet elapsed
    pub fn pending_count(&self) -> usize {
        self.timers.len()
    }

    /// Drop every waiting timer. Writes already issued run to completion.
    pub fn shutdown(&self) {
        let ids: Vec<NodeId> = self.timers.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, timer)) = self.timers.remove(&id) {
                timer.handle.abort();
            }
        }
    }
}

impl Drop for PositionSync {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct PersistJob {
    store: Arc<dyn EntityStore>,
    events: SessionEvents,
    cancel: CancellationToken,
    timers: Arc<DashMap<NodeId, Timer>>,
    quiet: Duration,
    generation: u64,
    id: NodeId,
    kind: NodeKind,
}

async fn persist_after_quiet(job: PersistJob, position: Position) {
    tokio::select! {
        _ = job.cancel.cancelled() => return,
        _ = tokio::time::sleep(job.quiet) => {}
    }

    // A newer drag owns the slot if the generation moved on
    if job
        .timers
        .remove_if(&job.id, |_, timer| timer.generation == job.generation)
        .is_none()
    {
        return;
    }

    let mut fields = Row::new();
    fields.insert("position_x".into(), Value::from(position.x));
    fields.insert("position_y".into(), Value::from(position.y));
    debug!(node = %job.id, x = position.x, y = position.y, "saving position");

    if let Err(err) = job.store.update(job.kind.table(), &job.id, fields).await {
        if job.cancel.is_cancelled() {
            return;
        }
        error!(node = %job.id, error = %err, "position save failed");
        job.events.emit(SessionEvent::WriteFailed {
            operation: Operation::SavePosition,
            node_id: job.id.clone(),
            message: err.to_string(),
        });
    }
}
