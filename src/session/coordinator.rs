//! Optimistic mutation coordinator
//!
//! Every mutation is applied to the local graph first, then written to the
//! store. A failed write is reported on the session notice stream and the
//! local change is reverted, unless a newer local edit to the same
//! (node, field) has superseded it.
//!
//! Successful creates and updates are recorded in the tree's activity log.
//!
//! Lock order is graph, then pending. Neither lock is held across a store call.

use super::cancel::CancellationToken;
use super::events::{Operation, SessionEvent, SessionEvents};
use super::pending::{FieldKey, PendingTable, Resolution, WriteTicket};
use super::validator::{child_kind, parent_fields, ConnectionValidator, NodeRef, Rejection};
use crate::activity::{action_name, log_activity, ActivityVerb};
use crate::config::SyncConfig;
use crate::graph::{FlowNode, LocalGraph, NodeId, NodeKind, NodeRecord, Position, Role, Table};
use crate::storage::{EntityStore, Row, StorageError, StorageResult};
use chrono::Utc;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Pending-ledger field name for a node's parent references
const PARENT_FIELDS: &str = "$parent";

/// Errors from coordinated mutations
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("viewers cannot modify this tree")]
    ReadOnly,

    #[error("mutation rejected: {0}")]
    Rejected(#[from] Rejection),

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("write failed: {0}")]
    Write(#[from] StorageError),

    #[error("view session has been torn down")]
    Cancelled,

    #[error("failed to load tree: {0}")]
    Load(StorageError),
}

/// Result type for coordinated mutations
pub type SyncResult<T> = Result<T, SyncError>;

/// Applies mutations optimistically and reconciles them with the store
pub struct MutationCoordinator {
    store: Arc<dyn EntityStore>,
    graph: Arc<Mutex<LocalGraph>>,
    tree_id: NodeId,
    pending: Mutex<PendingTable>,
    validator: ConnectionValidator,
    events: SessionEvents,
    cancel: CancellationToken,
    user_id: String,
    role: Role,
    child_offset: Position,
    outcome_spacing: f64,
}

impl MutationCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn EntityStore>,
        graph: Arc<Mutex<LocalGraph>>,
        tree_id: NodeId,
        config: &SyncConfig,
        user_id: impl Into<String>,
        role: Role,
        events: SessionEvents,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            graph,
            tree_id,
            pending: Mutex::new(PendingTable::new()),
            validator: ConnectionValidator::new(config.max_chain_depth),
            events,
            cancel,
            user_id: user_id.into(),
            role,
            child_offset: config.child_offset,
            outcome_spacing: config.outcome_spacing,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// True while any write is awaiting its store result
    pub fn has_pending(&self) -> bool {
        !self.pending.lock().unwrap().is_empty()
    }

    fn ensure_writable(&self) -> SyncResult<()> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        if !self.role.can_edit() {
            return Err(SyncError::ReadOnly);
        }
        Ok(())
    }

    /// Draw an edge `source → target`, reparenting `target`.
    ///
    /// Illegal edges are rejected without a store call. On write failure the
    /// target's previous parent references and edges are restored.
    pub async fn connect(&self, source_id: &NodeId, target_id: &NodeId) -> SyncResult<()> {
        self.ensure_writable()?;

        let (descriptor, ticket) = {
            let mut graph = self.graph.lock().unwrap();
            let source = node_ref(&graph, source_id)?;
            let target = node_ref(&graph, target_id)?;
            let descriptor = match self.validator.validate(&source, &target, graph.parent_index()) {
                Ok(descriptor) => descriptor,
                Err(rejection) => {
                    debug!(source = %source_id, target = %target_id, %rejection, "edge rejected");
                    return Err(rejection.into());
                }
            };

            let record = graph
                .record(target_id)
                .ok_or_else(|| SyncError::NodeNotFound(target_id.clone()))?;
            let previous: Row = descriptor
                .fields
                .keys()
                .map(|field| (field.clone(), record.field(field).unwrap_or(Value::Null)))
                .collect();

            graph.apply_fields(target_id, &descriptor.fields);
            graph.relink(target_id);
            let ticket = self.pending.lock().unwrap().begin(
                FieldKey::new(target_id.clone(), PARENT_FIELDS),
                Value::Object(previous),
                Value::Object(descriptor.fields.clone()),
            );
            (descriptor, ticket)
        };

        debug!(source = %source_id, target = %target_id, table = %descriptor.table, "connecting");
        let result = self
            .store
            .update(descriptor.table, &descriptor.target_id, descriptor.fields.clone())
            .await;

        let reassert = self.settle(ticket, result, Operation::Connect, |graph, restore| {
            if let Value::Object(fields) = restore {
                graph.apply_fields(target_id, &fields);
                graph.relink(target_id);
            }
        })?;
        if let Some(Value::Object(fields)) = reassert {
            self.reassert(descriptor.table, target_id, fields, Operation::Connect).await;
        }
        let mut metadata = Row::new();
        metadata.insert("connected_from".into(), Value::from(source_id));
        self.record_activity(target_id, ActivityVerb::Updated, metadata).await;
        Ok(())
    }

    /// Change one editable field of a node.
    ///
    /// On failure the field goes back to the last value the store is known to
    /// hold, never to a re-fetched row, so other in-progress edits survive.
    pub async fn edit_field(&self, node_id: &NodeId, field: &str, value: Value) -> SyncResult<()> {
        self.ensure_writable()?;

        let (table, ticket) = {
            let mut graph = self.graph.lock().unwrap();
            let record = graph
                .record(node_id)
                .ok_or_else(|| SyncError::NodeNotFound(node_id.clone()))?;
            let updated = record
                .with_field(field, value.clone())
                .map_err(|e| SyncError::Rejected(e.into()))?;
            let previous = record.field(field).unwrap_or(Value::Null);
            let table = record.kind().table();
            graph.replace_record(updated);
            let ticket = self.pending.lock().unwrap().begin(
                FieldKey::new(node_id.clone(), field),
                previous,
                value.clone(),
            );
            (table, ticket)
        };

        let result = self.store.update(table, node_id, edit_row(field, value)).await;

        let reassert = self.settle(ticket, result, Operation::EditField, |graph, restore| {
            let mut fields = Row::new();
            fields.insert(field.to_string(), restore);
            graph.apply_fields(node_id, &fields);
        })?;
        if let Some(value) = reassert {
            self.reassert(table, node_id, edit_row(field, value), Operation::EditField).await;
        }
        let mut metadata = Row::new();
        metadata.insert("field".into(), Value::from(field));
        self.record_activity(node_id, ActivityVerb::Updated, metadata).await;
        Ok(())
    }

    /// Add a default child under `parent_id`: an opportunity under an outcome,
    /// a solution under an opportunity, a sub-solution under a solution.
    ///
    /// Without an explicit position the child is placed at the parent's
    /// position plus the configured offset.
    pub async fn create_child(&self, parent_id: &NodeId, position: Option<Position>) -> SyncResult<NodeId> {
        self.ensure_writable()?;
        let (kind, row) = {
            let graph = self.graph.lock().unwrap();
            let parent = graph
                .node(parent_id)
                .ok_or_else(|| SyncError::NodeNotFound(parent_id.clone()))?;
            let kind = child_kind(parent.kind)?;
            let title = match parent.kind {
                NodeKind::Outcome => "New Opportunity",
                NodeKind::Opportunity => "New Solution",
                _ => "New Sub-Solution",
            };
            let mut row = parent_fields(parent.kind, kind, parent_id)?;
            row.insert("title".into(), Value::from(title));
            let at = position.unwrap_or_else(|| parent.position.offset(self.child_offset));
            (kind, self.new_row(row, at))
        };
        self.insert_optimistic(kind, row).await
    }

    /// Add a planned experiment under a solution
    pub async fn create_experiment(&self, solution_id: &NodeId, position: Option<Position>) -> SyncResult<NodeId> {
        self.ensure_writable()?;
        let row = {
            let graph = self.graph.lock().unwrap();
            let parent = graph
                .node(solution_id)
                .ok_or_else(|| SyncError::NodeNotFound(solution_id.clone()))?;
            let mut row = parent_fields(parent.kind, NodeKind::Experiment, solution_id)?;
            row.insert("title".into(), Value::from("New Experiment"));
            row.insert("status".into(), Value::from("planned"));
            let at = position.unwrap_or_else(|| parent.position.offset(self.child_offset));
            self.new_row(row, at)
        };
        self.insert_optimistic(NodeKind::Experiment, row).await
    }

    /// Add an outcome to the right of every existing one
    pub async fn create_outcome(&self, tree_id: &NodeId) -> SyncResult<NodeId> {
        self.ensure_writable()?;
        let row = {
            let graph = self.graph.lock().unwrap();
            let x = graph
                .nodes()
                .filter(|n| n.kind == NodeKind::Outcome)
                .map(|n| n.position.x)
                .fold(None, |max: Option<f64>, x| Some(max.map_or(x, |m| m.max(x))))
                .map_or(self.outcome_spacing, |max| max + self.outcome_spacing);
            let mut row = Row::new();
            row.insert("tree_id".into(), Value::from(tree_id));
            row.insert("title".into(), Value::from("New Outcome"));
            row.insert(
                "description".into(),
                Value::from("Describe the desired outcome"),
            );
            self.new_row(row, Position::new(x, 100.0))
        };
        self.insert_optimistic(NodeKind::Outcome, row).await
    }

    /// Delete a node. The store orphans its children; on failure the node and
    /// its edges are put back.
    pub async fn delete(&self, node_id: &NodeId) -> SyncResult<()> {
        self.ensure_writable()?;
        let (table, removed) = {
            let mut graph = self.graph.lock().unwrap();
            let table = graph
                .record(node_id)
                .map(|r| r.kind().table())
                .ok_or_else(|| SyncError::NodeNotFound(node_id.clone()))?;
            let removed = graph
                .remove_node(node_id)
                .ok_or_else(|| SyncError::NodeNotFound(node_id.clone()))?;
            (table, removed)
        };

        match self.store.delete(table, node_id).await {
            Ok(()) => {
                info!(node = %node_id, %table, "node deleted");
                Ok(())
            }
            Err(err) => {
                if self.cancel.is_cancelled() {
                    debug!(node = %node_id, "delete failed after teardown");
                    return Err(err.into());
                }
                error!(node = %node_id, error = %err, "delete failed, restoring node");
                self.graph.lock().unwrap().restore(removed);
                self.events.emit(SessionEvent::RolledBack {
                    operation: Operation::Delete,
                    node_id: node_id.clone(),
                    field: None,
                });
                self.fail(Operation::Delete, node_id, &err);
                Err(err.into())
            }
        }
    }

    /// Re-apply still-pending local intents over a freshly built graph
    pub fn overlay_pending(&self, graph: &mut LocalGraph) {
        let intents = self.pending.lock().unwrap().intents();
        for (key, value) in intents {
            if !graph.contains(&key.node) {
                continue;
            }
            if key.field == PARENT_FIELDS {
                if let Value::Object(fields) = value {
                    graph.apply_fields(&key.node, &fields);
                    graph.relink(&key.node);
                }
            } else {
                let mut fields = Row::new();
                fields.insert(key.field.clone(), value);
                graph.apply_fields(&key.node, &fields);
            }
        }
    }

    fn new_row(&self, mut row: Row, at: Position) -> Row {
        row.insert("id".into(), Value::from(NodeId::new()));
        row.insert("position_x".into(), Value::from(at.x));
        row.insert("position_y".into(), Value::from(at.y));
        row.insert("created_by".into(), Value::from(self.user_id.as_str()));
        row
    }

    async fn insert_optimistic(&self, kind: NodeKind, row: Row) -> SyncResult<NodeId> {
        let record = NodeRecord::from_row(kind, row.clone()).map_err(StorageError::from)?;
        let id = record.id().clone();
        self.graph
            .lock()
            .unwrap()
            .insert_node(FlowNode::from_record(record));

        match self.store.insert(kind.table(), row).await {
            Ok(stored) => {
                if self.cancel.is_cancelled() {
                    return Ok(id);
                }
                // Pick up store-assigned fields such as created_at
                if let Ok(stored) = NodeRecord::from_row(kind, stored) {
                    self.graph.lock().unwrap().replace_record(stored);
                }
                info!(node = %id, %kind, "node created");
                self.record_activity(&id, ActivityVerb::Created, Row::new()).await;
                Ok(id)
            }
            Err(err) => {
                if self.cancel.is_cancelled() {
                    return Err(err.into());
                }
                error!(node = %id, error = %err, "create failed, removing node");
                self.graph.lock().unwrap().remove_node(&id);
                self.fail(Operation::CreateNode, &id, &err);
                Err(err.into())
            }
        }
    }

    /// Resolve a field-level write and revert the view if it still owns the field.
    ///
    /// Returns the value to write again when this write landed after a newer
    /// one had already been confirmed.
    fn settle(
        &self,
        ticket: WriteTicket,
        result: StorageResult<()>,
        operation: Operation,
        restore: impl FnOnce(&mut LocalGraph, Value),
    ) -> SyncResult<Option<Value>> {
        let node_id = ticket.key.node.clone();
        if self.cancel.is_cancelled() {
            debug!(node = %node_id, %operation, "write settled after teardown");
            return result.map(|()| None).map_err(SyncError::from);
        }

        let err = {
            let mut graph = self.graph.lock().unwrap();
            let resolution = self.pending.lock().unwrap().resolve(&ticket, result.is_ok());
            let err = match result {
                Ok(()) => {
                    return Ok(match resolution {
                        Resolution::Reassert { value } => Some(value),
                        _ => None,
                    })
                }
                Err(err) => err,
            };
            match resolution {
                Resolution::RolledBack { restore: value } => {
                    warn!(node = %node_id, field = %ticket.key.field, %operation, "rolling back");
                    restore(&mut graph, value);
                    self.events.emit(SessionEvent::RolledBack {
                        operation,
                        node_id: node_id.clone(),
                        field: field_name(&ticket.key),
                    });
                }
                Resolution::Superseded | Resolution::Confirmed | Resolution::Reassert { .. } => {
                    debug!(node = %node_id, field = %ticket.key.field, "failed write superseded by newer edit");
                }
            }
            err
        };

        error!(node = %node_id, %operation, error = %err, "write failed");
        self.fail(operation, &node_id, &err);
        Err(err.into())
    }

    /// Append an activity row for a write that succeeded. A failed append is
    /// logged and otherwise ignored.
    async fn record_activity(&self, node_id: &NodeId, verb: ActivityVerb, mut metadata: Row) {
        if self.cancel.is_cancelled() {
            return;
        }
        let found = {
            let graph = self.graph.lock().unwrap();
            graph.record(node_id).map(|r| (r.kind(), r.title().to_string()))
        };
        let Some((kind, title)) = found else {
            return;
        };
        metadata.insert("title".into(), Value::from(title));
        let action = action_name(kind.table(), verb);
        if let Err(err) = log_activity(
            self.store.as_ref(),
            &self.tree_id,
            &self.user_id,
            &action,
            Some((node_id, kind)),
            Some(Value::Object(metadata)),
        )
        .await
        {
            warn!(node = %node_id, %action, error = %err, "activity not recorded");
        }
    }

    /// Write the view's value again after an older write overwrote it
    async fn reassert(&self, table: Table, node_id: &NodeId, fields: Row, operation: Operation) {
        debug!(node = %node_id, %operation, "older write landed last, writing newest value again");
        if let Err(err) = self.store.update(table, node_id, fields).await {
            if self.cancel.is_cancelled() {
                return;
            }
            error!(node = %node_id, %operation, error = %err, "reassert failed");
            self.fail(operation, node_id, &err);
        }
    }

    fn fail(&self, operation: Operation, node_id: &NodeId, err: &StorageError) {
        self.events.emit(SessionEvent::WriteFailed {
            operation,
            node_id: node_id.clone(),
            message: err.to_string(),
        });
    }
}

fn node_ref(graph: &LocalGraph, id: &NodeId) -> SyncResult<NodeRef> {
    graph
        .record(id)
        .map(|r| NodeRef::new(r.id().clone(), r.kind()))
        .ok_or_else(|| SyncError::NodeNotFound(id.clone()))
}

fn edit_row(field: &str, value: Value) -> Row {
    let mut fields = Row::new();
    fields.insert(field.to_string(), value);
    fields.insert(
        "updated_at".to_string(),
        Value::String(Utc::now().to_rfc3339()),
    );
    fields
}

fn field_name(key: &FieldKey) -> Option<String> {
    (key.field != PARENT_FIELDS).then(|| key.field.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{EntitySet, Solution, Table};
    use crate::storage::{select_one, to_row, Filter, MemoryStore};
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        graph: Arc<Mutex<LocalGraph>>,
        events: SessionEvents,
        cancel: CancellationToken,
        coordinator: Arc<MutationCoordinator>,
    }

    async fn fixture_with_role(role: Role) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let rows = [
            (Table::Outcomes, json!({"id": "o1", "tree_id": "t1", "title": "Retention", "position_x": 400.0, "position_y": 100.0})),
            (Table::Opportunities, json!({"id": "p1", "outcome_id": "o1", "title": "Churn", "position_x": 200.0, "position_y": 300.0})),
            (Table::Solutions, json!({"id": "s1", "opportunity_id": "p1", "title": "Guide"})),
            (Table::Solutions, json!({"id": "s2", "opportunity_id": "p1", "title": "Video"})),
        ];
        for (table, row) in rows {
            store.insert(table, to_row(&row).unwrap()).await.unwrap();
        }
        let entities = EntitySet::fetch(store.as_ref(), &NodeId::from("t1"), 64).await.unwrap();
        let graph = Arc::new(Mutex::new(LocalGraph::from_entities(&entities)));
        let events = SessionEvents::new();
        let cancel = CancellationToken::new();
        let coordinator = Arc::new(MutationCoordinator::new(
            store.clone(),
            graph.clone(),
            NodeId::from("t1"),
            &SyncConfig::default(),
            "u1",
            role,
            events.clone(),
            cancel.clone(),
        ));
        Fixture {
            store,
            graph,
            events,
            cancel,
            coordinator,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with_role(Role::Editor).await
    }

    fn title(graph: &Arc<Mutex<LocalGraph>>, id: &str) -> String {
        graph
            .lock()
            .unwrap()
            .record(&NodeId::from(id))
            .unwrap()
            .title()
            .to_string()
    }

    #[tokio::test]
    async fn connect_reparents_locally_and_in_store() {
        let f = fixture().await;
        f.coordinator
            .connect(&NodeId::from("s1"), &NodeId::from("s2"))
            .await
            .unwrap();

        let stored: Solution = select_one(f.store.as_ref(), Table::Solutions, &NodeId::from("s2"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.parent_solution_id, Some(NodeId::from("s1")));
        assert_eq!(stored.opportunity_id, None);

        let graph = f.graph.lock().unwrap();
        let incoming = graph.incoming_edges(&NodeId::from("s2"));
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].source, NodeId::from("s1"));
    }

    #[tokio::test]
    async fn rejected_connect_issues_no_write() {
        let f = fixture().await;
        let mut changes = f.store.subscribe_changes(Table::Solutions, Filter::new()).unwrap();
        let err = f
            .coordinator
            .connect(&NodeId::from("o1"), &NodeId::from("s1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Rejected(Rejection::IllegalEdge { .. })));
        assert!(tokio::time::timeout(Duration::from_millis(20), changes.next()).await.is_err());
    }

    #[tokio::test]
    async fn failed_connect_restores_old_edge() {
        let f = fixture().await;
        let mut notices = f.events.subscribe();
        f.store.fail_writes_to(Table::Solutions);

        let err = f
            .coordinator
            .connect(&NodeId::from("s1"), &NodeId::from("s2"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Write(_)));

        let graph = f.graph.lock().unwrap();
        let incoming = graph.incoming_edges(&NodeId::from("s2"));
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].source, NodeId::from("p1"));
        drop(graph);

        assert!(matches!(notices.recv().await.unwrap(), SessionEvent::RolledBack { .. }));
        assert!(matches!(notices.recv().await.unwrap(), SessionEvent::WriteFailed { .. }));
    }

    #[tokio::test]
    async fn failed_edit_restores_prior_title() {
        let f = fixture().await;
        f.store.fail_next_writes(1);
        let err = f
            .coordinator
            .edit_field(&NodeId::from("s1"), "title", json!("Onboarding guide"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Write(_)));
        assert_eq!(title(&f.graph, "s1"), "Guide");
        assert!(!f.coordinator.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn older_failure_does_not_clobber_newer_edit() {
        let f = fixture().await;
        f.store.set_write_delay(Some(Duration::from_millis(100)));
        f.store.fail_next_writes(1);

        let first = {
            let c = f.coordinator.clone();
            tokio::spawn(async move { c.edit_field(&NodeId::from("s1"), "title", json!("Draft")).await })
        };
        // Second edit starts while the first is still in flight
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = {
            let c = f.coordinator.clone();
            tokio::spawn(async move { c.edit_field(&NodeId::from("s1"), "title", json!("Final")).await })
        };

        assert!(first.await.unwrap().is_err());
        assert!(second.await.unwrap().is_ok());
        assert_eq!(title(&f.graph, "s1"), "Final");
    }

    #[tokio::test(start_paused = true)]
    async fn newer_failure_falls_back_to_older_intent() {
        let f = fixture().await;
        f.store.set_write_delay(Some(Duration::from_millis(200)));
        let first = {
            let c = f.coordinator.clone();
            tokio::spawn(async move { c.edit_field(&NodeId::from("s1"), "title", json!("Draft")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        f.store.set_write_delay(Some(Duration::from_millis(10)));
        f.store.fail_next_writes(1);
        assert!(f
            .coordinator
            .edit_field(&NodeId::from("s1"), "title", json!("Failed"))
            .await
            .is_err());
        assert_eq!(title(&f.graph, "s1"), "Draft");

        first.await.unwrap().unwrap();
        assert_eq!(title(&f.graph, "s1"), "Draft");
        let stored: Solution = select_one(f.store.as_ref(), Table::Solutions, &NodeId::from("s1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.title, "Draft");
    }

    #[tokio::test(start_paused = true)]
    async fn older_write_landing_last_is_overwritten() {
        let f = fixture().await;
        f.store.set_write_delay(Some(Duration::from_millis(200)));
        let first = {
            let c = f.coordinator.clone();
            tokio::spawn(async move { c.edit_field(&NodeId::from("s1"), "title", json!("Draft")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        f.store.set_write_delay(Some(Duration::from_millis(10)));
        f.coordinator
            .edit_field(&NodeId::from("s1"), "title", json!("Final"))
            .await
            .unwrap();
        first.await.unwrap().unwrap();

        assert_eq!(title(&f.graph, "s1"), "Final");
        let stored: Solution = select_one(f.store.as_ref(), Table::Solutions, &NodeId::from("s1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.title, "Final");
        assert!(!f.coordinator.has_pending());
    }

    #[tokio::test]
    async fn malformed_edit_is_rejected_locally() {
        let f = fixture().await;
        let err = f
            .coordinator
            .edit_field(&NodeId::from("s1"), "ice_impact", json!(42))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Rejected(Rejection::Field(_))));
        assert!(!f.coordinator.has_pending());
    }

    #[tokio::test]
    async fn create_child_uses_default_title_and_offset() {
        let f = fixture().await;
        let id = f.coordinator.create_child(&NodeId::from("p1"), None).await.unwrap();
        let graph = f.graph.lock().unwrap();
        let node = graph.node(&id).unwrap();
        assert_eq!(node.kind, NodeKind::Solution);
        assert_eq!(node.data.title(), "New Solution");
        assert_eq!(node.position, Position::new(250.0, 500.0));
        assert_eq!(graph.incoming_edges(&id)[0].source, NodeId::from("p1"));
        drop(graph);
        assert_eq!(f.store.len(Table::Solutions), 3);
    }

    #[tokio::test]
    async fn create_child_under_solution_is_sub_solution() {
        let f = fixture().await;
        let id = f.coordinator.create_child(&NodeId::from("s1"), Some(Position::new(1.0, 2.0))).await.unwrap();
        let stored: Solution = select_one(f.store.as_ref(), Table::Solutions, &id).await.unwrap().unwrap();
        assert_eq!(stored.title, "New Sub-Solution");
        assert_eq!(stored.parent_solution_id, Some(NodeId::from("s1")));
        assert_eq!(stored.position_x, Some(1.0));
    }

    #[tokio::test]
    async fn failed_create_removes_node() {
        let f = fixture().await;
        f.store.fail_writes_to(Table::Experiments);
        let before = f.graph.lock().unwrap().node_count();
        assert!(f.coordinator.create_experiment(&NodeId::from("s1"), None).await.is_err());
        assert_eq!(f.graph.lock().unwrap().node_count(), before);
    }

    #[tokio::test]
    async fn create_outcome_goes_right_of_existing() {
        let f = fixture().await;
        let id = f.coordinator.create_outcome(&NodeId::from("t1")).await.unwrap();
        let graph = f.graph.lock().unwrap();
        assert_eq!(graph.node(&id).unwrap().position, Position::new(800.0, 100.0));
        assert_eq!(graph.record(&id).unwrap().description(), Some("Describe the desired outcome"));
    }

    #[tokio::test]
    async fn failed_delete_restores_node_and_edges() {
        let f = fixture().await;
        f.store.fail_next_writes(1);
        let before = f.graph.lock().unwrap().snapshot();
        assert!(f.coordinator.delete(&NodeId::from("p1")).await.is_err());
        let after = f.graph.lock().unwrap().snapshot();
        assert_eq!(after.nodes, before.nodes);
        assert_eq!(after.edges.len(), before.edges.len());
    }

    #[tokio::test]
    async fn delete_removes_node() {
        let f = fixture().await;
        f.coordinator.delete(&NodeId::from("s2")).await.unwrap();
        assert!(!f.graph.lock().unwrap().contains(&NodeId::from("s2")));
        assert_eq!(f.store.len(Table::Solutions), 1);
    }

    #[tokio::test]
    async fn viewers_cannot_mutate() {
        let f = fixture_with_role(Role::Viewer).await;
        let err = f.coordinator.delete(&NodeId::from("s1")).await.unwrap_err();
        assert!(matches!(err, SyncError::ReadOnly));
        assert!(f.graph.lock().unwrap().contains(&NodeId::from("s1")));
    }

    #[tokio::test]
    async fn torn_down_coordinator_refuses_work() {
        let f = fixture().await;
        f.cancel.cancel();
        let err = f.coordinator.create_outcome(&NodeId::from("t1")).await.unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
    }

    #[tokio::test]
    async fn creates_and_edits_are_logged() {
        let f = fixture().await;
        let id = f.coordinator.create_child(&NodeId::from("p1"), None).await.unwrap();
        f.coordinator
            .edit_field(&id, "title", json!("Checklist"))
            .await
            .unwrap();

        let feed = crate::activity::recent_activity(f.store.as_ref(), &NodeId::from("t1"), 20)
            .await
            .unwrap();
        let labels: Vec<&str> = feed.iter().map(|i| i.label.as_str()).collect();
        assert_eq!(
            labels,
            vec![
                "updated a solution: \"Checklist\"",
                "created a solution: \"New Solution\"",
            ]
        );
        assert_eq!(feed[0].entry.node_id, Some(id));
        assert_eq!(feed[0].entry.node_type, Some(NodeKind::Solution));
        assert_eq!(feed[0].entry.user_id, "u1");
    }

    #[tokio::test]
    async fn failed_edit_is_not_logged() {
        let f = fixture().await;
        f.store.fail_next_writes(1);
        assert!(f
            .coordinator
            .edit_field(&NodeId::from("s1"), "title", json!("Nope"))
            .await
            .is_err());
        assert!(f.store.is_empty(Table::ActivityLog));
    }
}
