//! Connection validator
//!
//! Decides whether a dragged edge between two nodes is legal and which
//! parent reference it writes. Legal transitions:
//!
//! | source → target          | write                                                   |
//! |--------------------------|---------------------------------------------------------|
//! | outcome → opportunity    | `opportunity.outcome_id = source`                       |
//! | opportunity → solution   | `solution.opportunity_id = source`, `parent_solution_id = null` |
//! | solution → solution      | `solution.parent_solution_id = source`, `opportunity_id = null` |
//! | solution → experiment    | `experiment.solution_id = source`                       |
//!
//! Everything else is rejected and nothing is written.

use crate::graph::{ChainError, FieldError, NodeId, NodeKind, ParentIndex, Table};
use crate::storage::Row;
use serde_json::Value;
use thiserror::Error;

/// One end of an attempted edge
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub id: NodeId,
    pub kind: NodeKind,
}

impl NodeRef {
    pub fn new(id: impl Into<NodeId>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

/// The store write an approved edge implies
#[derive(Debug, Clone, PartialEq)]
pub struct MutationDescriptor {
    pub table: Table,
    pub target_id: NodeId,
    pub fields: Row,
}

/// Why a mutation was refused before reaching the store
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("cannot connect a {parent} to a {child}")]
    IllegalEdge { parent: NodeKind, child: NodeKind },

    #[error("a solution cannot be its own parent")]
    SelfParent(NodeId),

    #[error("{child} is an ancestor of {parent}")]
    Cycle { parent: NodeId, child: NodeId },

    #[error("parent chain is corrupt: {0}")]
    CorruptChain(#[from] ChainError),

    #[error("invalid field: {0}")]
    Field(#[from] FieldError),

    #[error("a {0} cannot have children")]
    NoChildKind(NodeKind),
}

/// Validates proposed parent → child edges
#[derive(Debug, Clone, Copy)]
pub struct ConnectionValidator {
    max_chain_depth: usize,
}

impl ConnectionValidator {
    pub fn new(max_chain_depth: usize) -> Self {
        Self { max_chain_depth }
    }

    /// Approve `source → target` or say why not.
    ///
    /// For solution → solution the parent chain of `source` is walked: the
    /// edge is refused if `target` is `source` or one of its ancestors, or if
    /// the walk runs past the safety depth.
    pub fn validate(
        &self,
        source: &NodeRef,
        target: &NodeRef,
        parents: &ParentIndex,
    ) -> Result<MutationDescriptor, Rejection> {
        let fields = parent_fields(source.kind, target.kind, &source.id)?;
        if source.kind == NodeKind::Solution && target.kind == NodeKind::Solution {
            if source.id == target.id {
                return Err(Rejection::SelfParent(source.id.clone()));
            }
            if parents.is_self_or_ancestor(&target.id, &source.id, self.max_chain_depth)? {
                return Err(Rejection::Cycle {
                    parent: source.id.clone(),
                    child: target.id.clone(),
                });
            }
        }
        Ok(MutationDescriptor {
            table: target.kind.table(),
            target_id: target.id.clone(),
            fields,
        })
    }
}

/// Parent-reference fields a `source → target` edge sets, if the pair is legal
pub fn parent_fields(source: NodeKind, target: NodeKind, source_id: &NodeId) -> Result<Row, Rejection> {
    let mut fields = Row::new();
    match (source, target) {
        (NodeKind::Outcome, NodeKind::Opportunity) => {
            fields.insert("outcome_id".into(), Value::from(source_id));
        }
        (NodeKind::Opportunity, NodeKind::Solution) => {
            fields.insert("opportunity_id".into(), Value::from(source_id));
            fields.insert("parent_solution_id".into(), Value::Null);
        }
        (NodeKind::Solution, NodeKind::Solution) => {
            fields.insert("parent_solution_id".into(), Value::from(source_id));
            fields.insert("opportunity_id".into(), Value::Null);
        }
        (NodeKind::Solution, NodeKind::Experiment) => {
            fields.insert("solution_id".into(), Value::from(source_id));
        }
        _ => {
            return Err(Rejection::IllegalEdge {
                parent: source,
                child: target,
            })
        }
    }
    Ok(fields)
}

/// Kind created by "add child" on a node of `parent` kind
pub fn child_kind(parent: NodeKind) -> Result<NodeKind, Rejection> {
    match parent {
        NodeKind::Outcome => Ok(NodeKind::Opportunity),
        NodeKind::Opportunity | NodeKind::Solution => Ok(NodeKind::Solution),
        NodeKind::Experiment => Err(Rejection::NoChildKind(parent)),
    }
}
