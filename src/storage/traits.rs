//! Entity store trait definitions
//!
//! The store speaks in untyped rows. The core never issues anything beyond
//! select / insert / update / delete / subscribe.

use super::changes::ChangeSubscription;
use crate::graph::{NodeId, Table};
use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::path::Path;
use thiserror::Error;

/// A stored record as a JSON object
pub type Row = Map<String, Value>;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Row not found: {table}/{id}")]
    NotFound { table: Table, id: NodeId },

    #[error("Write rejected: {0}")]
    Rejected(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// A single predicate on one field
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Value),
    In(Vec<Value>),
    IsNull,
}

impl Condition {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Condition::Eq(expected) => value == expected,
            Condition::In(options) => options.contains(value),
            Condition::IsNull => value.is_null(),
        }
    }
}

/// Conjunction of field predicates. An empty filter matches every row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<(String, Condition)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((field.into(), Condition::Eq(value.into())));
        self
    }

    pub fn is_in<V: Into<Value>>(
        mut self,
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.conditions.push((field.into(), Condition::In(values)));
        self
    }

    pub fn is_null(mut self, field: impl Into<String>) -> Self {
        self.conditions.push((field.into(), Condition::IsNull));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// A missing field compares as null
    pub fn matches(&self, row: &Row) -> bool {
        self.conditions.iter().all(|(field, condition)| {
            condition.matches(row.get(field).unwrap_or(&Value::Null))
        })
    }
}

impl From<NodeId> for Value {
    fn from(id: NodeId) -> Self {
        Value::String(id.as_str().to_string())
    }
}

impl From<&NodeId> for Value {
    fn from(id: &NodeId) -> Self {
        Value::String(id.as_str().to_string())
    }
}

/// Trait for entity store backends
///
/// Implementations must be thread-safe (Send + Sync). Every method is a
/// network-boundary suspension point; callers never hold locks across them.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Rows of `table` matching `filter`, in insertion order
    async fn select(&self, table: Table, filter: &Filter) -> StorageResult<Vec<Row>>;

    /// Insert a record, assigning `id` and `created_at` when absent. Returns the stored row.
    async fn insert(&self, table: Table, record: Row) -> StorageResult<Row>;

    /// Merge `fields` into the row with the given id
    async fn update(&self, table: Table, id: &NodeId, fields: Row) -> StorageResult<()>;

    /// Delete a row; children referencing it are orphaned by the store
    async fn delete(&self, table: Table, id: &NodeId) -> StorageResult<()>;

    /// Change notifications for rows of `table` matching `filter`
    fn subscribe_changes(&self, table: Table, filter: Filter) -> StorageResult<ChangeSubscription>;
}

/// Extension trait for opening stores from paths
pub trait OpenStore: EntityStore + Sized {
    /// Open or create a store at the given path
    fn open(path: impl AsRef<Path>) -> StorageResult<Self>;

    /// Create an in-memory store (useful for testing)
    fn open_in_memory() -> StorageResult<Self>;
}

/// Select and decode rows into typed records
pub async fn select_as<T: DeserializeOwned>(
    store: &dyn EntityStore,
    table: Table,
    filter: &Filter,
) -> StorageResult<Vec<T>> {
    let rows = store.select(table, filter).await?;
    rows.into_iter()
        .map(|row| serde_json::from_value(Value::Object(row)).map_err(StorageError::from))
        .collect()
}

/// Select a single row by id
pub async fn select_one<T: DeserializeOwned>(
    store: &dyn EntityStore,
    table: Table,
    id: &NodeId,
) -> StorageResult<Option<T>> {
    let mut found: Vec<T> = select_as(store, table, &Filter::new().eq("id", id)).await?;
    Ok(if found.is_empty() {
        None
    } else {
        Some(found.swap_remove(0))
    })
}

/// Encode a typed value as a row
pub fn to_row<T: serde::Serialize>(value: &T) -> StorageResult<Row> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(StorageError::Rejected(format!(
            "expected an object, got {}",
            other
        ))),
    }
}

/// Id of a row, if it carries one
pub(crate) fn row_id(row: &Row) -> Option<NodeId> {
    row.get("id").and_then(Value::as_str).map(NodeId::from)
}

/// Fill in `id` and `created_at` for a fresh insert
pub(crate) fn prepare_insert(mut record: Row) -> Row {
    if row_id(&record).is_none() {
        record.insert("id".to_string(), Value::from(NodeId::new()));
    }
    if record.get("created_at").map_or(true, Value::is_null) {
        record.insert(
            "created_at".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
    }
    record
}
