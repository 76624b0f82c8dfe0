//! Graph model builder: flat entity lists to positioned nodes and derived edges
//!
//! Pure and deterministic. The same `EntitySet` always yields the same
//! `GraphModel`, and every edge endpoint is a node of the model.

use super::edge::FlowEdge;
use super::entities::EntitySet;
use super::node::{NodeId, NodeKind, NodeRecord, Position};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One positioned node of the graph view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub position: Position,
    pub data: NodeRecord,
}

impl FlowNode {
    pub fn from_record(record: NodeRecord) -> Self {
        Self {
            id: record.id().clone(),
            kind: record.kind(),
            position: record.position(),
            data: record,
        }
    }
}

/// Nodes and edges of the graph view
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphModel {
    pub nodes: Vec<FlowNode>,
    pub edges: Vec<FlowEdge>,
}

impl GraphModel {
    pub fn node(&self, id: &NodeId) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Edges whose child end is `target`
    pub fn incoming<'a>(&'a self, target: &'a NodeId) -> impl Iterator<Item = &'a FlowEdge> + 'a {
        self.edges.iter().filter(move |e| &e.target == target)
    }
}

/// Build the graph model for one fetch result.
///
/// Nodes come out outcomes first, then opportunities, solutions and
/// experiments, each in fetch order. One edge is emitted per non-null parent
/// reference whose parent is part of the set; dangling references produce no
/// edge. Duplicate ids keep their first occurrence.
pub fn build_graph(entities: &EntitySet) -> GraphModel {
    let mut seen: HashSet<NodeId> = HashSet::new();
    let nodes: Vec<FlowNode> = entities
        .records()
        .into_iter()
        .filter(|record| seen.insert(record.id().clone()))
        .map(FlowNode::from_record)
        .collect();

    let mut edge_ids = HashSet::new();
    let mut edges = Vec::new();
    for node in &nodes {
        for (_, parent) in node.data.parent_refs() {
            if !seen.contains(&parent) {
                continue;
            }
            let edge = FlowEdge::new(parent, node.id.clone());
            if edge_ids.insert(edge.id.clone()) {
                edges.push(edge);
            }
        }
    }

    GraphModel { nodes, edges }
}
