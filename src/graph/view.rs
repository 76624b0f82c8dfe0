//! LocalGraph: the view-side copy of the graph that optimistic mutations touch
//!
//! Mutations land here before the store confirms them. Every mutating method
//! returns what it displaced so the caller can put it back on failure.

use super::builder::{build_graph, FlowNode, GraphModel};
use super::edge::{EdgeId, FlowEdge};
use super::entities::{EntitySet, ParentIndex, SolutionParent};
use super::node::{NodeId, NodeRecord, Position, Vote};
use crate::storage::Row;

/// A node taken out of the view along with its incident edges
#[derive(Debug, Clone, PartialEq)]
pub struct RemovedNode {
    pub node: FlowNode,
    pub edges: Vec<FlowEdge>,
    index: usize,
}

/// The local node/edge view of one tree
#[derive(Debug, Clone, Default)]
pub struct LocalGraph {
    nodes: Vec<FlowNode>,
    edges: Vec<FlowEdge>,
    parents: ParentIndex,
}

impl LocalGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_model(model: GraphModel) -> Self {
        let mut graph = Self {
            nodes: model.nodes,
            edges: model.edges,
            parents: ParentIndex::default(),
        };
        graph.reindex();
        graph
    }

    pub fn from_entities(entities: &EntitySet) -> Self {
        Self::from_model(build_graph(entities))
    }

    /// Swap in a freshly built model, discarding local state
    pub fn replace_all(&mut self, model: GraphModel) {
        *self = Self::from_model(model);
    }

    pub fn node(&self, id: &NodeId) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    pub fn record(&self, id: &NodeId) -> Option<&NodeRecord> {
        self.node(id).map(|n| &n.data)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.node(id).is_some()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &FlowNode> {
        self.nodes.iter()
    }

    pub fn edges(&self) -> impl Iterator<Item = &FlowEdge> {
        self.edges.iter()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn parent_index(&self) -> &ParentIndex {
        &self.parents
    }

    /// Add an edge; returns false if an edge with the same id is present
    pub fn add_edge(&mut self, edge: FlowEdge) -> bool {
        if self.edges.iter().any(|e| e.id == edge.id) {
            return false;
        }
        self.edges.push(edge);
        true
    }

    pub fn remove_edge(&mut self, id: &EdgeId) -> Option<FlowEdge> {
        let index = self.edges.iter().position(|e| &e.id == id)?;
        Some(self.edges.remove(index))
    }

    /// Edges whose child end is `target`
    pub fn incoming_edges(&self, target: &NodeId) -> Vec<FlowEdge> {
        self.edges
            .iter()
            .filter(|e| &e.target == target)
            .cloned()
            .collect()
    }

    /// Append a node. Edges to any parent already in the view are added too.
    pub fn insert_node(&mut self, node: FlowNode) {
        for (_, parent) in node.data.parent_refs() {
            if self.contains(&parent) {
                self.add_edge(FlowEdge::new(parent, node.id.clone()));
            }
        }
        self.track_parent(&node.data);
        self.nodes.push(node);
    }

    /// Take a node and its incident edges out of the view
    pub fn remove_node(&mut self, id: &NodeId) -> Option<RemovedNode> {
        let index = self.nodes.iter().position(|n| &n.id == id)?;
        let node = self.nodes.remove(index);
        let (edges, kept): (Vec<_>, Vec<_>) = self
            .edges
            .drain(..)
            .partition(|e| &e.source == id || &e.target == id);
        self.edges = kept;
        self.parents.set_parent(id.clone(), None);
        Some(RemovedNode { node, edges, index })
    }

    /// Put a removed node back where it was
    pub fn restore(&mut self, removed: RemovedNode) {
        let index = removed.index.min(self.nodes.len());
        self.track_parent(&removed.node.data);
        self.nodes.insert(index, removed.node);
        for edge in removed.edges {
            self.add_edge(edge);
        }
    }

    /// Replace a node's record, returning the previous one
    pub fn replace_record(&mut self, record: NodeRecord) -> Option<NodeRecord> {
        let id = record.id().clone();
        if !self.contains(&id) {
            return None;
        }
        self.track_parent(&record);
        let node = self.nodes.iter_mut().find(|n| n.id == id)?;
        if let Some(position) = record.stored_position() {
            node.position = position;
        }
        Some(std::mem::replace(&mut node.data, record))
    }

    /// Merge raw store fields into a node's record, returning the previous record
    pub fn apply_fields(&mut self, id: &NodeId, fields: &Row) -> Option<NodeRecord> {
        let merged = self.record(id)?.merge_fields(fields).ok()?;
        self.replace_record(merged)
    }

    /// Redraw the incoming edges of `id` from its record's parent references
    pub fn relink(&mut self, id: &NodeId) {
        let Some(record) = self.record(id) else {
            return;
        };
        let parents = record.parent_refs();
        self.edges.retain(|e| &e.target != id);
        for (_, parent) in parents {
            if self.contains(&parent) {
                self.add_edge(FlowEdge::new(parent, id.clone()));
            }
        }
    }

    /// Split the current records back into flat lists, with the given votes
    pub fn entity_set(&self, votes: Vec<Vote>) -> EntitySet {
        let mut set = EntitySet {
            votes,
            ..EntitySet::default()
        };
        for node in &self.nodes {
            match &node.data {
                NodeRecord::Outcome(r) => set.outcomes.push(r.clone()),
                NodeRecord::Opportunity(r) => set.opportunities.push(r.clone()),
                NodeRecord::Solution(r) => set.solutions.push(r.clone()),
                NodeRecord::Experiment(r) => set.experiments.push(r.clone()),
            }
        }
        set
    }

    pub fn set_position(&mut self, id: &NodeId, position: Position) -> bool {
        match self.nodes.iter_mut().find(|n| &n.id == id) {
            Some(node) => {
                node.position = position;
                node.data.set_position(position);
                true
            }
            None => false,
        }
    }

    /// Current nodes and edges as a model
    pub fn snapshot(&self) -> GraphModel {
        GraphModel {
            nodes: self.nodes.clone(),
            edges: self.edges.clone(),
        }
    }

    fn track_parent(&mut self, record: &NodeRecord) {
        if let NodeRecord::Solution(solution) = record {
            self.parents
                .set_parent(solution.id.clone(), SolutionParent::of(solution));
        }
    }

    fn reindex(&mut self) {
        self.parents = ParentIndex::from_solutions(self.nodes.iter().filter_map(|n| match &n.data {
            NodeRecord::Solution(s) => Some(s),
            _ => None,
        }));
    }
}
