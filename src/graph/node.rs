//! Entity records of a discovery tree
//!
//! Every record mirrors one row of the backing store. Parent references are
//! optional because the store orphans children when a parent row is deleted.

use crate::storage::Row;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Opaque identifier of a stored row
///
/// Serializes as a plain string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a new random NodeId (UUID-based)
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Tables of the entity store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Trees,
    TreeMembers,
    Outcomes,
    Opportunities,
    Solutions,
    Experiments,
    Votes,
    ActivityLog,
    UserProfiles,
}

impl Table {
    pub const ALL: [Table; 9] = [
        Table::Trees,
        Table::TreeMembers,
        Table::Outcomes,
        Table::Opportunities,
        Table::Solutions,
        Table::Experiments,
        Table::Votes,
        Table::ActivityLog,
        Table::UserProfiles,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Trees => "trees",
            Table::TreeMembers => "tree_members",
            Table::Outcomes => "outcomes",
            Table::Opportunities => "opportunities",
            Table::Solutions => "solutions",
            Table::Experiments => "experiments",
            Table::Votes => "votes",
            Table::ActivityLog => "activity_log",
            Table::UserProfiles => "user_profiles",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Child references pointing at rows of this table, as (child table, field).
    ///
    /// Stores null these fields when a row of this table is deleted.
    pub fn dependents(&self) -> &'static [(Table, &'static str)] {
        match self {
            Table::Trees => &[(Table::Outcomes, "tree_id"), (Table::TreeMembers, "tree_id")],
            Table::Outcomes => &[(Table::Opportunities, "outcome_id")],
            Table::Opportunities => &[(Table::Solutions, "opportunity_id")],
            Table::Solutions => &[
                (Table::Solutions, "parent_solution_id"),
                (Table::Experiments, "solution_id"),
            ],
            Table::Experiments
            | Table::TreeMembers
            | Table::Votes
            | Table::ActivityLog
            | Table::UserProfiles => &[],
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four node kinds of a discovery tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Outcome,
    Opportunity,
    Solution,
    Experiment,
}

impl NodeKind {
    pub const ALL: [NodeKind; 4] = [
        NodeKind::Outcome,
        NodeKind::Opportunity,
        NodeKind::Solution,
        NodeKind::Experiment,
    ];

    pub fn table(self) -> Table {
        match self {
            NodeKind::Outcome => Table::Outcomes,
            NodeKind::Opportunity => Table::Opportunities,
            NodeKind::Solution => Table::Solutions,
            NodeKind::Experiment => Table::Experiments,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Outcome => "outcome",
            NodeKind::Opportunity => "opportunity",
            NodeKind::Solution => "solution",
            NodeKind::Experiment => "experiment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    /// Position used by the graph view when a record has none stored
    pub fn default_position(self) -> Position {
        match self {
            NodeKind::Outcome => Position::new(400.0, 100.0),
            NodeKind::Opportunity => Position::new(200.0, 300.0),
            NodeKind::Solution => Position::new(400.0, 500.0),
            NodeKind::Experiment => Position::new(600.0, 700.0),
        }
    }

    /// Fields a user may change through a field edit
    pub fn editable_fields(self) -> &'static [&'static str] {
        match self {
            NodeKind::Outcome => &["title", "description", "position_x", "position_y"],
            NodeKind::Opportunity => &[
                "title",
                "description",
                "position_x",
                "position_y",
                "confidence_level",
                "start_date",
                "end_date",
            ],
            NodeKind::Solution => &[
                "title",
                "description",
                "position_x",
                "position_y",
                "ice_impact",
                "ice_confidence",
                "ice_ease",
                "start_date",
                "end_date",
            ],
            NodeKind::Experiment => &[
                "title",
                "description",
                "position_x",
                "position_y",
                "status",
                "start_date",
                "end_date",
                "success_metric_target",
                "success_metric_actual",
                "success_metric_unit",
                "learnings",
                "external_link",
            ],
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown node type: {}", s))
    }
}

/// A point on the graph canvas
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn offset(self, by: Position) -> Self {
        Self::new(self.x + by.x, self.y + by.y)
    }
}

/// Lifecycle of an experiment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    #[default]
    Planned,
    Running,
    Completed,
    Failed,
}

/// Membership role within a tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Editor,
    Viewer,
}

impl Role {
    /// Viewers see the tree but get no mutation affordances
    pub fn can_edit(self) -> bool {
        !matches!(self, Role::Viewer)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Editor => "editor",
            Role::Viewer => "viewer",
        }
    }
}

/// Root of everything
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub id: NodeId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_public: Option<bool>,
    pub created_by: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Tree {
    pub fn is_public(&self) -> bool {
        self.is_public.unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub id: NodeId,
    #[serde(default)]
    pub tree_id: Option<NodeId>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub position_x: Option<f64>,
    #[serde(default)]
    pub position_y: Option<f64>,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: NodeId,
    #[serde(default)]
    pub outcome_id: Option<NodeId>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// 1-5
    #[serde(default)]
    pub confidence_level: Option<u8>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub position_x: Option<f64>,
    #[serde(default)]
    pub position_y: Option<f64>,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A solution hangs off an opportunity (top-level) or another solution
/// (sub-solution), never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    pub id: NodeId,
    #[serde(default)]
    pub opportunity_id: Option<NodeId>,
    #[serde(default)]
    pub parent_solution_id: Option<NodeId>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub ice_impact: Option<u8>,
    #[serde(default)]
    pub ice_confidence: Option<u8>,
    #[serde(default)]
    pub ice_ease: Option<u8>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub position_x: Option<f64>,
    #[serde(default)]
    pub position_y: Option<f64>,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Solution {
    /// Impact x confidence x ease, or None while any factor is unset
    pub fn ice_score(&self) -> Option<u32> {
        match (self.ice_impact, self.ice_confidence, self.ice_ease) {
            (Some(i), Some(c), Some(e)) => Some(i as u32 * c as u32 * e as u32),
            _ => None,
        }
    }

    /// True if the solution has neither an opportunity nor a parent solution
    pub fn is_orphan(&self) -> bool {
        self.opportunity_id.is_none() && self.parent_solution_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: NodeId,
    #[serde(default)]
    pub solution_id: Option<NodeId>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: ExperimentStatus,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub success_metric_target: Option<f64>,
    #[serde(default)]
    pub success_metric_actual: Option<f64>,
    #[serde(default)]
    pub success_metric_unit: Option<String>,
    #[serde(default)]
    pub learnings: Option<String>,
    #[serde(default)]
    pub external_link: Option<String>,
    #[serde(default)]
    pub position_x: Option<f64>,
    #[serde(default)]
    pub position_y: Option<f64>,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// One user's 1-5 vote on a node; at most one per (node, user)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub id: NodeId,
    pub node_id: NodeId,
    pub node_type: NodeKind,
    pub user_id: String,
    pub value: u8,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    pub id: NodeId,
    pub tree_id: NodeId,
    pub user_id: String,
    pub role: Role,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Why a field edit was refused before reaching the store
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FieldError {
    #[error("field '{field}' is not editable on a {kind}")]
    NotEditable { kind: NodeKind, field: String },

    #[error("malformed value for '{field}': {reason}")]
    Malformed { field: String, reason: String },

    #[error("'{field}' must be between {min} and {max}")]
    OutOfRange { field: String, min: u8, max: u8 },
}

/// A graph node's payload, discriminated by kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NodeRecord {
    Outcome(Outcome),
    Opportunity(Opportunity),
    Solution(Solution),
    Experiment(Experiment),
}

impl NodeRecord {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeRecord::Outcome(_) => NodeKind::Outcome,
            NodeRecord::Opportunity(_) => NodeKind::Opportunity,
            NodeRecord::Solution(_) => NodeKind::Solution,
            NodeRecord::Experiment(_) => NodeKind::Experiment,
        }
    }

    pub fn id(&self) -> &NodeId {
        match self {
            NodeRecord::Outcome(r) => &r.id,
            NodeRecord::Opportunity(r) => &r.id,
            NodeRecord::Solution(r) => &r.id,
            NodeRecord::Experiment(r) => &r.id,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            NodeRecord::Outcome(r) => &r.title,
            NodeRecord::Opportunity(r) => &r.title,
            NodeRecord::Solution(r) => &r.title,
            NodeRecord::Experiment(r) => &r.title,
        }
    }

    pub fn description(&self) -> Option<&str> {
        match self {
            NodeRecord::Outcome(r) => r.description.as_deref(),
            NodeRecord::Opportunity(r) => r.description.as_deref(),
            NodeRecord::Solution(r) => r.description.as_deref(),
            NodeRecord::Experiment(r) => r.description.as_deref(),
        }
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        match self {
            NodeRecord::Outcome(r) => r.created_at,
            NodeRecord::Opportunity(r) => r.created_at,
            NodeRecord::Solution(r) => r.created_at,
            NodeRecord::Experiment(r) => r.created_at,
        }
    }

    /// Stored position, if both coordinates are set
    pub fn stored_position(&self) -> Option<Position> {
        let (x, y) = match self {
            NodeRecord::Outcome(r) => (r.position_x, r.position_y),
            NodeRecord::Opportunity(r) => (r.position_x, r.position_y),
            NodeRecord::Solution(r) => (r.position_x, r.position_y),
            NodeRecord::Experiment(r) => (r.position_x, r.position_y),
        };
        Some(Position::new(x?, y?))
    }

    /// Stored position, falling back to the kind's default
    pub fn position(&self) -> Position {
        self.stored_position()
            .unwrap_or_else(|| self.kind().default_position())
    }

    pub fn set_position(&mut self, position: Position) {
        let (x, y) = match self {
            NodeRecord::Outcome(r) => (&mut r.position_x, &mut r.position_y),
            NodeRecord::Opportunity(r) => (&mut r.position_x, &mut r.position_y),
            NodeRecord::Solution(r) => (&mut r.position_x, &mut r.position_y),
            NodeRecord::Experiment(r) => (&mut r.position_x, &mut r.position_y),
        };
        *x = Some(position.x);
        *y = Some(position.y);
    }

    /// Non-null structural parent references, as (parent kind, parent id)
    pub fn parent_refs(&self) -> Vec<(NodeKind, NodeId)> {
        match self {
            NodeRecord::Outcome(_) => Vec::new(),
            NodeRecord::Opportunity(r) => r
                .outcome_id
                .iter()
                .map(|id| (NodeKind::Outcome, id.clone()))
                .collect(),
            NodeRecord::Solution(r) => r
                .opportunity_id
                .iter()
                .map(|id| (NodeKind::Opportunity, id.clone()))
                .chain(
                    r.parent_solution_id
                        .iter()
                        .map(|id| (NodeKind::Solution, id.clone())),
                )
                .collect(),
            NodeRecord::Experiment(r) => r
                .solution_id
                .iter()
                .map(|id| (NodeKind::Solution, id.clone()))
                .collect(),
        }
    }

    /// Decode a store row of the given kind
    pub fn from_row(kind: NodeKind, row: Row) -> serde_json::Result<Self> {
        Self::from_value(kind, Value::Object(row))
    }

    /// Encode as a store row (no kind tag)
    pub fn to_row(&self) -> serde_json::Result<Row> {
        match self.inner_value()? {
            Value::Object(map) => Ok(map),
            _ => Ok(Row::new()),
        }
    }

    /// Current value of a named field, `Value::Null` if unset
    pub fn field(&self, name: &str) -> Option<Value> {
        let value = self.inner_value().ok()?;
        value.get(name).cloned()
    }

    /// A copy of this record with one editable field replaced.
    ///
    /// Fails without touching `self` when the field is not editable for this
    /// kind or the value does not decode into the field's type.
    pub fn with_field(&self, name: &str, value: Value) -> Result<NodeRecord, FieldError> {
        let kind = self.kind();
        if !kind.editable_fields().contains(&name) {
            return Err(FieldError::NotEditable {
                kind,
                field: name.to_string(),
            });
        }
        let mut object = self.to_row().map_err(|e| FieldError::Malformed {
            field: name.to_string(),
            reason: e.to_string(),
        })?;
        object.insert(name.to_string(), value);
        let updated = Self::from_row(kind, object).map_err(|e| FieldError::Malformed {
            field: name.to_string(),
            reason: e.to_string(),
        })?;
        updated.validate()?;
        Ok(updated)
    }

    /// A copy with raw store fields merged in, bypassing the editable-field list.
    ///
    /// Used to mirror writes the core itself derives, such as reparenting.
    pub fn merge_fields(&self, fields: &Row) -> serde_json::Result<NodeRecord> {
        let mut object = self.to_row()?;
        for (name, value) in fields {
            if name != "id" {
                object.insert(name.clone(), value.clone());
            }
        }
        Self::from_row(self.kind(), object)
    }

    /// Range checks the store schema would otherwise reject
    pub fn validate(&self) -> Result<(), FieldError> {
        match self {
            NodeRecord::Opportunity(r) => check_range("confidence_level", r.confidence_level, 1, 5),
            NodeRecord::Solution(r) => {
                check_range("ice_impact", r.ice_impact, 1, 10)?;
                check_range("ice_confidence", r.ice_confidence, 1, 10)?;
                check_range("ice_ease", r.ice_ease, 1, 10)
            }
            NodeRecord::Outcome(_) | NodeRecord::Experiment(_) => Ok(()),
        }
    }

    fn inner_value(&self) -> serde_json::Result<Value> {
        match self {
            NodeRecord::Outcome(r) => serde_json::to_value(r),
            NodeRecord::Opportunity(r) => serde_json::to_value(r),
            NodeRecord::Solution(r) => serde_json::to_value(r),
            NodeRecord::Experiment(r) => serde_json::to_value(r),
        }
    }

    fn from_value(kind: NodeKind, value: Value) -> serde_json::Result<Self> {
        match kind {
            NodeKind::Outcome => serde_json::from_value(value).map(NodeRecord::Outcome),
            NodeKind::Opportunity => serde_json::from_value(value).map(NodeRecord::Opportunity),
            NodeKind::Solution => serde_json::from_value(value).map(NodeRecord::Solution),
            NodeKind::Experiment => serde_json::from_value(value).map(NodeRecord::Experiment),
        }
    }
}

fn check_range(field: &str, value: Option<u8>, min: u8, max: u8) -> Result<(), FieldError> {
    match value {
        Some(v) if v < min || v > max => Err(FieldError::OutOfRange {
            field: field.to_string(),
            min,
            max,
        }),
        _ => Ok(()),
    }
}
