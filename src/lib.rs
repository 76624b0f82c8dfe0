//! ostsync: collaborative opportunity-solution tree synchronization
//!
//! Keeps a four-level discovery tree (outcome, opportunity, solution with
//! unbounded sub-solutions, experiment) consistent between a remote entity
//! store and any number of live views.
//!
//! # Core Concepts
//!
//! - **Entity store**: the only path to persisted rows (`storage`)
//! - **Graph view**: positioned nodes with edges derived from parent references (`graph`)
//! - **Projections**: nested hierarchy, flattened list and timeline (`projection`)
//! - **View session**: optimistic mutations, position debounce, live refresh
//!   and cursor presence for one open tree (`session`)
//! - **Activity feed**: who created or updated what, newest first (`activity`)
//!
//! # Example
//!
//! ```
//! use ostsync::{build_graph, EntitySet};
//!
//! let model = build_graph(&EntitySet::default());
//! assert_eq!(model.node_count(), 0);
//! ```

pub mod access;
pub mod activity;
pub mod config;
pub mod export;
mod graph;
pub mod projection;
pub mod session;
pub mod storage;
pub mod votes;

pub use access::{check_node_access, AccessError, AccessResult, NodeAccess};
pub use activity::{recent_activity, ActivityEntry, ActivityItem, UserProfile};
pub use config::{ConfigError, SyncConfig};
pub use export::{export_file_name, ExportDocument};
pub use graph::{
    build_graph, ChainError, EdgeId, EntitySet, Experiment, ExperimentStatus, FieldError,
    FlowEdge, FlowNode, GraphModel, LocalGraph, Membership, NodeId, NodeKind, NodeRecord,
    Opportunity, Outcome, ParentIndex, Position, RemovedNode, Role, Solution, SolutionParent,
    Table, Tree, Vote,
};
pub use projection::{aggregate, flatten, timeline, GroupBy, Hierarchy, ListRow, Timeline};
pub use session::{
    MutationCoordinator, PresenceBroadcaster, PresenceHub, SessionEvent, SyncError, SyncResult,
    UserIdentity, ViewSession,
};
pub use storage::{EntityStore, MemoryStore, OpenStore, SqliteStore, StorageError, StorageResult};
pub use votes::{cast_vote, vote_count, VoteOutcome};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
