//! In-process entity store
//!
//! Keeps rows per table in insertion order and publishes a change event for
//! every committed write. Faults can be injected to exercise rollback paths.

use super::changes::{ChangeBus, ChangeEvent, ChangeKind, ChangeSubscription};
use super::traits::{
    prepare_insert, row_id, EntityStore, Filter, Row, StorageError, StorageResult,
};
use crate::graph::{NodeId, Table};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

/// Injected failure plan for writes
#[derive(Debug, Default)]
struct Faults {
    /// Every write to these tables fails
    tables: HashSet<Table>,
    /// The next N writes fail, whatever the table
    next_writes: usize,
    /// Artificial latency applied before each write commits
    write_delay: Option<Duration>,
}

/// In-memory `EntityStore`
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<Table, Vec<Row>>>,
    changes: ChangeBus,
    faults: Mutex<Faults>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write to `table` fail
    pub fn fail_writes_to(&self, table: Table) {
        self.faults.lock().unwrap().tables.insert(table);
    }

    /// Make the next `count` writes fail
    pub fn fail_next_writes(&self, count: usize) {
        self.faults.lock().unwrap().next_writes = count;
    }

    /// Delay each write by `delay` before it commits
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        self.faults.lock().unwrap().write_delay = delay;
    }

    pub fn clear_faults(&self) {
        *self.faults.lock().unwrap() = Faults::default();
    }

    /// Number of rows currently in `table`
    pub fn len(&self, table: Table) -> usize {
        self.tables
            .lock()
            .unwrap()
            .get(&table)
            .map_or(0, Vec::len)
    }

    pub fn is_empty(&self, table: Table) -> bool {
        self.len(table) == 0
    }

    /// Wait out the configured latency, then decide whether this write fails
    async fn admit_write(&self, table: Table) -> StorageResult<()> {
        let delay = self.faults.lock().unwrap().write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut faults = self.faults.lock().unwrap();
        if faults.next_writes > 0 {
            faults.next_writes -= 1;
            return Err(StorageError::Unavailable("injected write failure".to_string()));
        }
        if faults.tables.contains(&table) {
            return Err(StorageError::Rejected(format!("writes to {} are failing", table)));
        }
        Ok(())
    }
}

/// Null out child references to a deleted row, returning the orphaned rows
pub(crate) fn orphan_dependents(
    tables: &mut HashMap<Table, Vec<Row>>,
    parent: Table,
    id: &NodeId,
) -> Vec<ChangeEvent> {
    let target = Value::from(id);
    let mut events = Vec::new();
    for (child_table, field) in parent.dependents() {
        let Some(rows) = tables.get_mut(child_table) else {
            continue;
        };
        for row in rows.iter_mut() {
            if row.get(*field) == Some(&target) {
                row.insert(field.to_string(), Value::Null);
                if let Some(child_id) = row_id(row) {
                    events.push(ChangeEvent {
                        table: *child_table,
                        kind: ChangeKind::Update,
                        id: child_id,
                        row: row.clone(),
                    });
                }
            }
        }
    }
    events
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn select(&self, table: Table, filter: &Filter) -> StorageResult<Vec<Row>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .get(&table)
            .map(|rows| rows.iter().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default())
    }

    async fn insert(&self, table: Table, record: Row) -> StorageResult<Row> {
        self.admit_write(table).await?;
        let row = prepare_insert(record);
        let id = row_id(&row).unwrap_or_default();
        {
            let mut tables = self.tables.lock().unwrap();
            let rows = tables.entry(table).or_default();
            if rows.iter().any(|r| row_id(r).as_ref() == Some(&id)) {
                return Err(StorageError::Rejected(format!(
                    "duplicate key {}/{}",
                    table, id
                )));
            }
            rows.push(row.clone());
        }
        self.changes.publish(ChangeEvent {
            table,
            kind: ChangeKind::Insert,
            id,
            row: row.clone(),
        });
        Ok(row)
    }

    async fn update(&self, table: Table, id: &NodeId, fields: Row) -> StorageResult<()> {
        self.admit_write(table).await?;
        let updated = {
            let mut tables = self.tables.lock().unwrap();
            let row = tables
                .get_mut(&table)
                .and_then(|rows| rows.iter_mut().find(|r| row_id(r).as_ref() == Some(id)))
                .ok_or_else(|| StorageError::NotFound {
                    table,
                    id: id.clone(),
                })?;
            for (field, value) in fields {
                if field != "id" {
                    row.insert(field, value);
                }
            }
            row.clone()
        };
        self.changes.publish(ChangeEvent {
            table,
            kind: ChangeKind::Update,
            id: id.clone(),
            row: updated,
        });
        Ok(())
    }

    async fn delete(&self, table: Table, id: &NodeId) -> StorageResult<()> {
        self.admit_write(table).await?;
        let (removed, orphaned) = {
            let mut tables = self.tables.lock().unwrap();
            let rows = tables.entry(table).or_default();
            let Some(index) = rows.iter().position(|r| row_id(r).as_ref() == Some(id)) else {
                return Err(StorageError::NotFound {
                    table,
                    id: id.clone(),
                });
            };
            let removed = rows.remove(index);
            let orphaned = orphan_dependents(&mut tables, table, id);
            (removed, orphaned)
        };
        self.changes.publish(ChangeEvent {
            table,
            kind: ChangeKind::Delete,
            id: id.clone(),
            row: removed,
        });
        for event in orphaned {
            self.changes.publish(event);
        }
        Ok(())
    }

    fn subscribe_changes(&self, table: Table, filter: Filter) -> StorageResult<ChangeSubscription> {
        Ok(self.changes.subscribe(table, filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn insert_then_select_by_field() {
        let store = MemoryStore::new();
        store
            .insert(Table::Outcomes, row(json!({"id": "o1", "tree_id": "t1", "title": "Grow"})))
            .await
            .unwrap();
        store
            .insert(Table::Outcomes, row(json!({"id": "o2", "tree_id": "t2", "title": "Keep"})))
            .await
            .unwrap();

        let rows = store
            .select(Table::Outcomes, &Filter::new().eq("tree_id", "t1"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["title"], "Grow");
        assert!(rows[0]["created_at"].is_string());
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = MemoryStore::new();
        store.insert(Table::Trees, row(json!({"id": "t1"}))).await.unwrap();
        let err = store.insert(Table::Trees, row(json!({"id": "t1"}))).await.unwrap_err();
        assert!(matches!(err, StorageError::Rejected(_)));
    }

    #[tokio::test]
    async fn update_merges_fields() {
        let store = MemoryStore::new();
        store
            .insert(Table::Solutions, row(json!({"id": "s1", "title": "A", "opportunity_id": "p1"})))
            .await
            .unwrap();
        store
            .update(
                Table::Solutions,
                &NodeId::from("s1"),
                row(json!({"parent_solution_id": "s0", "opportunity_id": null})),
            )
            .await
            .unwrap();

        let rows = store.select(Table::Solutions, &Filter::new()).await.unwrap();
        assert_eq!(rows[0]["title"], "A");
        assert_eq!(rows[0]["parent_solution_id"], "s0");
        assert!(rows[0]["opportunity_id"].is_null());
    }

    #[tokio::test]
    async fn update_of_missing_row_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .update(Table::Solutions, &NodeId::from("nope"), Row::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn delete_orphans_children() {
        let store = MemoryStore::new();
        store.insert(Table::Solutions, row(json!({"id": "s1"}))).await.unwrap();
        store
            .insert(Table::Solutions, row(json!({"id": "s2", "parent_solution_id": "s1"})))
            .await
            .unwrap();
        store
            .insert(Table::Experiments, row(json!({"id": "e1", "solution_id": "s1"})))
            .await
            .unwrap();

        store.delete(Table::Solutions, &NodeId::from("s1")).await.unwrap();

        let sols = store.select(Table::Solutions, &Filter::new()).await.unwrap();
        assert_eq!(sols.len(), 1);
        assert!(sols[0]["parent_solution_id"].is_null());
        let exps = store.select(Table::Experiments, &Filter::new()).await.unwrap();
        assert!(exps[0]["solution_id"].is_null());
    }

    #[tokio::test]
    async fn injected_failures_leave_rows_untouched() {
        let store = MemoryStore::new();
        store.insert(Table::Outcomes, row(json!({"id": "o1", "title": "A"}))).await.unwrap();

        store.fail_next_writes(1);
        let err = store
            .update(Table::Outcomes, &NodeId::from("o1"), row(json!({"title": "B"})))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Unavailable(_)));

        store.fail_writes_to(Table::Outcomes);
        assert!(store.delete(Table::Outcomes, &NodeId::from("o1")).await.is_err());

        let rows = store.select(Table::Outcomes, &Filter::new()).await.unwrap();
        assert_eq!(rows[0]["title"], "A");
    }

    #[tokio::test]
    async fn writes_publish_changes() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe_changes(Table::Votes, Filter::new()).unwrap();
        store
            .insert(Table::Votes, row(json!({"id": "v1", "node_id": "s1"})))
            .await
            .unwrap();
        let event = sub.next().await.unwrap();
        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(event.id, NodeId::from("v1"));
    }
}
