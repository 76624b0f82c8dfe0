//! Core graph data structures

mod builder;
mod edge;
mod entities;
mod node;
mod view;


pub use builder::{build_graph, FlowNode, GraphModel};
pub use edge::{EdgeId, FlowEdge};
pub use entities::{ChainError, EntitySet, ParentIndex, SolutionParent};
pub use node::{
    Experiment, ExperimentStatus, FieldError, Membership, NodeId, NodeKind, NodeRecord,
    Opportunity, Outcome, Position, Role, Solution, Table, Tree, Vote,
};
pub use view::{LocalGraph, RemovedNode};
