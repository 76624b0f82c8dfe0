//! Entity store backends
//!
//! Every component touches persisted data through the `EntityStore` trait.
//! `MemoryStore` backs tests and embedded use; `SqliteStore` persists to disk.

mod changes;
mod memory;
mod sqlite;
mod traits;

pub use changes::{ChangeBus, ChangeEvent, ChangeKind, ChangeSubscription};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{
    select_as, select_one, to_row, Condition, EntityStore, Filter, OpenStore, Row, StorageError,
    StorageResult,
};
