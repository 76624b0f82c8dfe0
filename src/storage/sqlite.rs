//! SQLite storage backend
//!
//! All tables share one `records` table keyed by (table, id), with each row
//! kept as a JSON document. Filters are evaluated on the decoded rows.

use super::changes::{ChangeBus, ChangeEvent, ChangeKind, ChangeSubscription};
use super::memory::orphan_dependents;
use super::traits::{
    prepare_insert, row_id, EntityStore, Filter, OpenStore, Row, StorageError, StorageResult,
};
use crate::graph::{NodeId, Table};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// SQLite-backed entity store
///
/// Thread-safe via internal mutex on the connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    changes: ChangeBus,
}

impl SqliteStore {
    fn from_connection(conn: Connection) -> StorageResult<Self> {
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            changes: ChangeBus::new(),
        })
    }

    fn init_schema(conn: &Connection) -> StorageResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                tbl TEXT NOT NULL,
                id TEXT NOT NULL,
                data_json TEXT NOT NULL,
                UNIQUE (tbl, id)
            );

            CREATE INDEX IF NOT EXISTS idx_records_tbl
                ON records(tbl, seq);

            PRAGMA journal_mode = WAL;
            "#,
        )?;
        Ok(())
    }

    fn load_table(conn: &Connection, table: Table) -> StorageResult<Vec<Row>> {
        let mut stmt =
            conn.prepare("SELECT data_json FROM records WHERE tbl = ?1 ORDER BY seq")?;
        let docs = stmt
            .query_map(params![table.as_str()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        docs.iter().map(|doc| Self::decode(doc)).collect()
    }

    fn load_row(conn: &Connection, table: Table, id: &NodeId) -> StorageResult<Option<Row>> {
        let doc: Option<String> = conn
            .query_row(
                "SELECT data_json FROM records WHERE tbl = ?1 AND id = ?2",
                params![table.as_str(), id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        doc.map(|d| Self::decode(&d)).transpose()
    }

    fn decode(doc: &str) -> StorageResult<Row> {
        match serde_json::from_str::<Value>(doc)? {
            Value::Object(map) => Ok(map),
            other => Err(StorageError::Rejected(format!(
                "stored document is not an object: {}",
                other
            ))),
        }
    }

    fn write_row(conn: &Connection, table: Table, id: &NodeId, row: &Row) -> StorageResult<()> {
        conn.execute(
            "UPDATE records SET data_json = ?3 WHERE tbl = ?1 AND id = ?2",
            params![table.as_str(), id.as_str(), serde_json::to_string(row)?],
        )?;
        Ok(())
    }
}

impl OpenStore for SqliteStore {
    fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    fn open_in_memory() -> StorageResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }
}

#[async_trait]
impl EntityStore for SqliteStore {
    async fn select(&self, table: Table, filter: &Filter) -> StorageResult<Vec<Row>> {
        let conn = self.conn.lock().unwrap();
        let rows = Self::load_table(&conn, table)?;
        Ok(rows.into_iter().filter(|r| filter.matches(r)).collect())
    }

    async fn insert(&self, table: Table, record: Row) -> StorageResult<Row> {
        let row = prepare_insert(record);
        let id = row_id(&row).unwrap_or_default();
        {
            let conn = self.conn.lock().unwrap();
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO records (tbl, id, data_json) VALUES (?1, ?2, ?3)",
                params![table.as_str(), id.as_str(), serde_json::to_string(&row)?],
            )?;
            if inserted == 0 {
                return Err(StorageError::Rejected(format!(
                    "duplicate key {}/{}",
                    table, id
                )));
            }
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
        let updated = {
            let conn = self.conn.lock().unwrap();
            let mut row = Self::load_row(&conn, table, id)?.ok_or_else(|| {
                StorageError::NotFound {
                    table,
                    id: id.clone(),
                }
            })?;
            for (field, value) in fields {
                if field != "id" {
                    row.insert(field, value);
                }
            }
            Self::write_row(&conn, table, id, &row)?;
            row
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
        let (removed, orphaned) = {
            let mut conn = self.conn.lock().unwrap();
            let tx = conn.transaction()?;
            let removed = Self::load_row(&tx, table, id)?.ok_or_else(|| StorageError::NotFound {
                table,
                id: id.clone(),
            })?;
            tx.execute(
                "DELETE FROM records WHERE tbl = ?1 AND id = ?2",
                params![table.as_str(), id.as_str()],
            )?;

            // Orphan children the same way the in-memory store does
            let mut affected: HashMap<Table, Vec<Row>> = HashMap::new();
            for (child_table, _) in table.dependents() {
                if !affected.contains_key(child_table) {
                    affected.insert(*child_table, Self::load_table(&tx, *child_table)?);
                }
            }
            let orphaned = orphan_dependents(&mut affected, table, id);
            for event in &orphaned {
                Self::write_row(&tx, event.table, &event.id, &event.row)?;
            }
            tx.commit()?;
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
