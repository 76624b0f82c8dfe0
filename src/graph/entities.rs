//! EntitySet: the flat record lists of one tree, as fetched from the store
//!
//! A fetch result is immutable per render pass. The builder and the
//! aggregator only read it, so graph, list and timeline may share one.

use super::node::{
    Experiment, NodeId, NodeKind, NodeRecord, Opportunity, Outcome, Solution, Table, Vote,
};
use crate::storage::{select_as, EntityStore, Filter, StorageResult};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::warn;

/// Flat per-tree record lists
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntitySet {
    pub outcomes: Vec<Outcome>,
    pub opportunities: Vec<Opportunity>,
    pub solutions: Vec<Solution>,
    pub experiments: Vec<Experiment>,
    pub votes: Vec<Vote>,
}

impl EntitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch every record reachable from `tree_id`.
    ///
    /// Sub-solutions are pulled level by level; `max_depth` bounds the number
    /// of levels so a cyclic store cannot loop the fetch.
    pub async fn fetch(
        store: &dyn EntityStore,
        tree_id: &NodeId,
        max_depth: usize,
    ) -> StorageResult<Self> {
        let mut set = EntitySet::new();

        set.outcomes = select_as(store, Table::Outcomes, &Filter::new().eq("tree_id", tree_id)).await?;
        let outcome_ids: Vec<&NodeId> = set.outcomes.iter().map(|o| &o.id).collect();
        if outcome_ids.is_empty() {
            return Ok(set);
        }

        set.opportunities = select_as(
            store,
            Table::Opportunities,
            &Filter::new().is_in("outcome_id", outcome_ids),
        )
        .await?;
        let opportunity_ids: Vec<&NodeId> = set.opportunities.iter().map(|o| &o.id).collect();

        if !opportunity_ids.is_empty() {
            set.solutions = select_as(
                store,
                Table::Solutions,
                &Filter::new().is_in("opportunity_id", opportunity_ids),
            )
            .await?;
        }

        let mut seen: HashSet<NodeId> = set.solutions.iter().map(|s| s.id.clone()).collect();
        let mut frontier: Vec<NodeId> = seen.iter().cloned().collect();
        let mut depth = 0;
        while !frontier.is_empty() {
            if depth >= max_depth {
                warn!(%tree_id, depth, "sub-solution fetch stopped at depth limit");
                break;
            }
            let level: Vec<Solution> = select_as(
                store,
                Table::Solutions,
                &Filter::new().is_in("parent_solution_id", frontier.iter()),
            )
            .await?;
            frontier = Vec::new();
            for solution in level {
                if seen.insert(solution.id.clone()) {
                    frontier.push(solution.id.clone());
                    set.solutions.push(solution);
                }
            }
            depth += 1;
        }

        let solution_ids: Vec<&NodeId> = set.solutions.iter().map(|s| &s.id).collect();
        if !solution_ids.is_empty() {
            set.experiments = select_as(
                store,
                Table::Experiments,
                &Filter::new().is_in("solution_id", solution_ids),
            )
            .await?;
        }

        let node_ids: Vec<NodeId> = set.node_ids().cloned().collect();
        set.votes = select_as(store, Table::Votes, &Filter::new().is_in("node_id", node_ids)).await?;

        Ok(set)
    }

    /// Ids of every node record, outcomes first
    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.outcomes
            .iter()
            .map(|r| &r.id)
            .chain(self.opportunities.iter().map(|r| &r.id))
            .chain(self.solutions.iter().map(|r| &r.id))
            .chain(self.experiments.iter().map(|r| &r.id))
    }

    /// Every node record wrapped in its tagged union, outcomes first
    pub fn records(&self) -> Vec<NodeRecord> {
        self.outcomes
            .iter()
            .cloned()
            .map(NodeRecord::Outcome)
            .chain(self.opportunities.iter().cloned().map(NodeRecord::Opportunity))
            .chain(self.solutions.iter().cloned().map(NodeRecord::Solution))
            .chain(self.experiments.iter().cloned().map(NodeRecord::Experiment))
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.outcomes.len() + self.opportunities.len() + self.solutions.len() + self.experiments.len()
    }

    /// Vote rows per (kind, node id)
    pub fn vote_counts(&self) -> HashMap<(NodeKind, NodeId), usize> {
        let mut counts = HashMap::new();
        for vote in &self.votes {
            *counts
                .entry((vote.node_type, vote.node_id.clone()))
                .or_insert(0) += 1;
        }
        counts
    }

    pub fn parent_index(&self) -> ParentIndex {
        ParentIndex::from_solutions(&self.solutions)
    }
}

/// Where a solution hangs
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SolutionParent {
    Opportunity(NodeId),
    Solution(NodeId),
}

impl SolutionParent {
    /// Structural parent of a solution record.
    ///
    /// A row carrying both references is treated as a sub-solution.
    pub fn of(solution: &Solution) -> Option<Self> {
        match (&solution.parent_solution_id, &solution.opportunity_id) {
            (Some(parent), _) => Some(SolutionParent::Solution(parent.clone())),
            (None, Some(opportunity)) => Some(SolutionParent::Opportunity(opportunity.clone())),
            (None, None) => None,
        }
    }
}

/// A parent chain walk gave up
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("parent chain of {start} exceeds depth {limit}")]
    TooDeep { start: NodeId, limit: usize },
}

/// Parent-indexed adjacency over solutions
#[derive(Debug, Clone, Default)]
pub struct ParentIndex {
    parents: HashMap<NodeId, SolutionParent>,
}

impl ParentIndex {
    pub fn from_solutions<'a>(solutions: impl IntoIterator<Item = &'a Solution>) -> Self {
        let parents = solutions
            .into_iter()
            .filter_map(|s| SolutionParent::of(s).map(|p| (s.id.clone(), p)))
            .collect();
        Self { parents }
    }

    pub fn parent_of(&self, id: &NodeId) -> Option<&SolutionParent> {
        self.parents.get(id)
    }

    pub fn set_parent(&mut self, id: NodeId, parent: Option<SolutionParent>) {
        match parent {
            Some(p) => {
                self.parents.insert(id, p);
            }
            None => {
                self.parents.remove(&id);
            }
        }
    }

    /// Solution ancestors of `id`, nearest first, ending at the top-level solution.
    ///
    /// Fails when the chain is longer than `limit`, which on real data means
    /// the store holds a cycle.
    pub fn ancestors(&self, id: &NodeId, limit: usize) -> Result<Vec<NodeId>, ChainError> {
        let mut chain = Vec::new();
        let mut current = id;
        while let Some(SolutionParent::Solution(parent)) = self.parents.get(current) {
            if chain.len() >= limit {
                return Err(ChainError::TooDeep {
                    start: id.clone(),
                    limit,
                });
            }
            chain.push(parent.clone());
            current = parent;
        }
        Ok(chain)
    }

    /// Opportunity the chain of `id` terminates at, if any
    pub fn root_opportunity(&self, id: &NodeId, limit: usize) -> Result<Option<NodeId>, ChainError> {
        let ancestors = self.ancestors(id, limit)?;
        let top = ancestors.last().unwrap_or(id);
        Ok(match self.parents.get(top) {
            Some(SolutionParent::Opportunity(opportunity)) => Some(opportunity.clone()),
            _ => None,
        })
    }

    /// True if `candidate` is `id` itself or one of its solution ancestors
    pub fn is_self_or_ancestor(
        &self,
        candidate: &NodeId,
        id: &NodeId,
        limit: usize,
    ) -> Result<bool, ChainError> {
        if candidate == id {
            return Ok(true);
        }
        Ok(self.ancestors(id, limit)?.contains(candidate))
    }
}
