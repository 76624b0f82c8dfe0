//! Nested hierarchy types and flattened list rows

use crate::graph::{
    Experiment, ExperimentStatus, NodeId, NodeKind, Opportunity, Outcome, Solution,
};
use serde::Serialize;

/// The nested view of one tree
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Hierarchy {
    pub outcomes: Vec<OutcomeEntry>,
    /// Solutions whose subtree was cut short by the depth guard or a cycle
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub truncated: Vec<NodeId>,
}

impl Hierarchy {
    /// Deepest solution nesting under any opportunity, 0 if there are no solutions
    pub fn max_solution_depth(&self) -> usize {
        self.opportunities()
            .flat_map(|o| o.solutions.iter())
            .map(SolutionEntry::depth)
            .max()
            .unwrap_or(0)
    }

    pub fn opportunities(&self) -> impl Iterator<Item = &OpportunityEntry> {
        self.outcomes.iter().flat_map(|o| o.opportunities.iter())
    }

    /// Every solution id in the hierarchy, in pre-order
    pub fn solution_ids(&self) -> Vec<&NodeId> {
        let mut ids = Vec::new();
        for opportunity in self.opportunities() {
            for solution in &opportunity.solutions {
                solution.collect_ids(&mut ids);
            }
        }
        ids
    }

    /// Find a solution entry anywhere in the hierarchy
    pub fn find_solution(&self, id: &NodeId) -> Option<&SolutionEntry> {
        self.opportunities()
            .flat_map(|o| o.solutions.iter())
            .find_map(|s| s.find(id))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutcomeEntry {
    pub outcome: Outcome,
    pub opportunities: Vec<OpportunityEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpportunityEntry {
    pub opportunity: Opportunity,
    pub vote_count: usize,
    /// Top-level solutions
    pub solutions: Vec<SolutionEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SolutionEntry {
    pub solution: Solution,
    pub vote_count: usize,
    pub ice_score: Option<u32>,
    pub experiments: Vec<Experiment>,
    /// Sub-solutions
    pub children: Vec<SolutionEntry>,
}

impl SolutionEntry {
    /// Levels of solutions rooted here: 1 for a leaf
    pub fn depth(&self) -> usize {
        1 + self.children.iter().map(SolutionEntry::depth).max().unwrap_or(0)
    }

    pub fn find(&self, id: &NodeId) -> Option<&SolutionEntry> {
        if &self.solution.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(id))
    }

    fn collect_ids<'a>(&'a self, ids: &mut Vec<&'a NodeId>) {
        ids.push(&self.solution.id);
        for child in &self.children {
            child.collect_ids(ids);
        }
    }
}

/// One row of the flattened list view
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListRow {
    pub id: NodeId,
    pub kind: NodeKind,
    pub title: String,
    /// Indentation level, outcomes at 0
    pub indent: usize,
    pub vote_count: Option<usize>,
    pub ice_score: Option<u32>,
    pub status: Option<ExperimentStatus>,
    /// Sub-solutions below the display cap, not listed
    pub hidden_children: usize,
}
