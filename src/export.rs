//! JSON export of a tree's graph view
//!
//! A plain nested document with no version field; consumers should not
//! rely on it as a stable interchange format.

use crate::graph::{GraphModel, NodeId, NodeKind, Position, Tree};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportTree {
    pub id: NodeId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportNodeData {
    pub title: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportNode {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub position: Position,
    pub data: ExportNodeData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportEdge {
    pub id: String,
    pub source: NodeId,
    pub target: NodeId,
}

/// Snapshot of one tree's nodes and edges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    pub tree: ExportTree,
    pub nodes: Vec<ExportNode>,
    pub edges: Vec<ExportEdge>,
    pub exported_at: DateTime<Utc>,
}

impl ExportDocument {
    pub fn new(tree: &Tree, graph: &GraphModel, exported_at: DateTime<Utc>) -> Self {
        Self {
            tree: ExportTree {
                id: tree.id.clone(),
                name: tree.name.clone(),
            },
            nodes: graph
                .nodes
                .iter()
                .map(|node| ExportNode {
                    id: node.id.clone(),
                    kind: node.kind,
                    position: node.position,
                    data: ExportNodeData {
                        title: node.data.title().to_string(),
                        description: node.data.description().map(str::to_string),
                    },
                })
                .collect(),
            edges: graph
                .edges
                .iter()
                .map(|edge| ExportEdge {
                    id: edge.id.to_string(),
                    source: edge.source.clone(),
                    target: edge.target.clone(),
                })
                .collect(),
            exported_at,
        }
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// `<tree name with every non-alphanumeric replaced by _>_export.json`
pub fn export_file_name(tree_name: &str) -> String {
    let stem: String = tree_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}_export.json", stem)
}
