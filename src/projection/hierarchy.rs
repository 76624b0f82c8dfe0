//! Hierarchical aggregator: flat entity lists to the nested outcome tree
//!
//! Solution nesting is followed by recursion on the parent index with a depth
//! guard and a visited set, so corrupt data (cycles, self-parenting) ends a
//! branch instead of looping. Records with no path to an outcome are left out.

use super::types::{Hierarchy, ListRow, OpportunityEntry, OutcomeEntry, SolutionEntry};
use crate::graph::{
    EntitySet, Experiment, NodeId, NodeKind, Opportunity, Solution,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// Build the nested hierarchy of one fetch result
pub fn aggregate(entities: &EntitySet, max_depth: usize) -> Hierarchy {
    Aggregator::new(entities, max_depth).run()
}

/// Ascending creation time; rows without a timestamp sort last
fn creation_key(created_at: Option<DateTime<Utc>>) -> (bool, Option<DateTime<Utc>>) {
    (created_at.is_none(), created_at)
}

struct Aggregator<'a> {
    entities: &'a EntitySet,
    max_depth: usize,
    votes: HashMap<(NodeKind, NodeId), usize>,
    opportunities_by_outcome: HashMap<&'a NodeId, Vec<&'a Opportunity>>,
    solutions_by_opportunity: HashMap<&'a NodeId, Vec<&'a Solution>>,
    solutions_by_parent: HashMap<&'a NodeId, Vec<&'a Solution>>,
    experiments_by_solution: HashMap<&'a NodeId, Vec<&'a Experiment>>,
    visited: HashSet<NodeId>,
    truncated: Vec<NodeId>,
}

impl<'a> Aggregator<'a> {
    fn new(entities: &'a EntitySet, max_depth: usize) -> Self {
        let mut opportunities_by_outcome: HashMap<&NodeId, Vec<&Opportunity>> = HashMap::new();
        for opportunity in &entities.opportunities {
            if let Some(outcome) = &opportunity.outcome_id {
                opportunities_by_outcome.entry(outcome).or_default().push(opportunity);
            }
        }

        let mut solutions_by_opportunity: HashMap<&NodeId, Vec<&Solution>> = HashMap::new();
        let mut solutions_by_parent: HashMap<&NodeId, Vec<&Solution>> = HashMap::new();
        for solution in &entities.solutions {
            match (&solution.parent_solution_id, &solution.opportunity_id) {
                (Some(parent), _) => solutions_by_parent.entry(parent).or_default().push(solution),
                (None, Some(opportunity)) => solutions_by_opportunity
                    .entry(opportunity)
                    .or_default()
                    .push(solution),
                (None, None) => {}
            }
        }

        let mut experiments_by_solution: HashMap<&NodeId, Vec<&Experiment>> = HashMap::new();
        for experiment in &entities.experiments {
            if let Some(solution) = &experiment.solution_id {
                experiments_by_solution.entry(solution).or_default().push(experiment);
            }
        }

        for list in opportunities_by_outcome.values_mut() {
            list.sort_by_key(|o| creation_key(o.created_at));
        }
        for list in solutions_by_opportunity
            .values_mut()
            .chain(solutions_by_parent.values_mut())
        {
            list.sort_by_key(|s| creation_key(s.created_at));
        }
        for list in experiments_by_solution.values_mut() {
            list.sort_by_key(|e| creation_key(e.created_at));
        }

        Self {
            entities,
            max_depth,
            votes: entities.vote_counts(),
            opportunities_by_outcome,
            solutions_by_opportunity,
            solutions_by_parent,
            experiments_by_solution,
            visited: HashSet::new(),
            truncated: Vec::new(),
        }
    }

    fn run(mut self) -> Hierarchy {
        let entities = self.entities;
        let mut outcomes: Vec<_> = entities.outcomes.iter().collect();
        outcomes.sort_by_key(|o| creation_key(o.created_at));

        let entries = outcomes
            .into_iter()
            .map(|outcome| {
                let opportunities = self
                    .opportunities_by_outcome
                    .get(&outcome.id)
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|opportunity| self.opportunity_entry(opportunity))
                    .collect();
                OutcomeEntry {
                    outcome: outcome.clone(),
                    opportunities,
                }
            })
            .collect();

        Hierarchy {
            outcomes: entries,
            truncated: self.truncated,
        }
    }

    fn opportunity_entry(&mut self, opportunity: &Opportunity) -> OpportunityEntry {
        let solutions = self
            .solutions_by_opportunity
            .get(&opportunity.id)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|s| self.visited.insert(s.id.clone()))
            .collect::<Vec<_>>()
            .into_iter()
            .map(|s| self.solution_entry(s, 1))
            .collect();
        OpportunityEntry {
            opportunity: opportunity.clone(),
            vote_count: self.vote_count(NodeKind::Opportunity, &opportunity.id),
            solutions,
        }
    }

    fn solution_entry(&mut self, solution: &Solution, depth: usize) -> SolutionEntry {
        let mut children = Vec::new();
        let child_solutions = self
            .solutions_by_parent
            .get(&solution.id)
            .cloned()
            .unwrap_or_default();
        if depth >= self.max_depth && !child_solutions.is_empty() {
            warn!(solution = %solution.id, depth, "solution nesting exceeds depth limit");
            self.truncated.push(solution.id.clone());
        } else {
            for child in child_solutions {
                if !self.visited.insert(child.id.clone()) {
                    warn!(solution = %child.id, "solution reached twice, parent chain is cyclic");
                    self.truncated.push(solution.id.clone());
                    continue;
                }
                children.push(self.solution_entry(child, depth + 1));
            }
        }

        let experiments = self
            .experiments_by_solution
            .get(&solution.id)
            .map(|list| list.iter().map(|e| (*e).clone()).collect())
            .unwrap_or_default();

        SolutionEntry {
            solution: solution.clone(),
            vote_count: self.vote_count(NodeKind::Solution, &solution.id),
            ice_score: solution.ice_score(),
            experiments,
            children,
        }
    }

    fn vote_count(&self, kind: NodeKind, id: &NodeId) -> usize {
        self.votes.get(&(kind, id.clone())).copied().unwrap_or(0)
    }
}

/// Flatten a hierarchy into list rows.
///
/// `display_depth` caps how many solution levels are listed; deeper
/// sub-solutions are counted on the last listed ancestor's row instead.
pub fn flatten(hierarchy: &Hierarchy, display_depth: usize) -> Vec<ListRow> {
    let mut rows = Vec::new();
    for outcome in &hierarchy.outcomes {
        rows.push(ListRow {
            id: outcome.outcome.id.clone(),
            kind: NodeKind::Outcome,
            title: outcome.outcome.title.clone(),
            indent: 0,
            vote_count: None,
            ice_score: None,
            status: None,
            hidden_children: 0,
        });
        for opportunity in &outcome.opportunities {
            rows.push(ListRow {
                id: opportunity.opportunity.id.clone(),
                kind: NodeKind::Opportunity,
                title: opportunity.opportunity.title.clone(),
                indent: 1,
                vote_count: Some(opportunity.vote_count),
                ice_score: None,
                status: None,
                hidden_children: 0,
            });
            for solution in &opportunity.solutions {
                flatten_solution(solution, 1, display_depth, &mut rows);
            }
        }
    }
    rows
}

fn flatten_solution(entry: &SolutionEntry, level: usize, display_depth: usize, rows: &mut Vec<ListRow>) {
    let at_cap = level >= display_depth;
    rows.push(ListRow {
        id: entry.solution.id.clone(),
        kind: NodeKind::Solution,
        title: entry.solution.title.clone(),
        indent: level + 1,
        vote_count: Some(entry.vote_count),
        ice_score: entry.ice_score,
        status: None,
        hidden_children: if at_cap { entry.children.len() } else { 0 },
    });
    for experiment in &entry.experiments {
        rows.push(ListRow {
            id: experiment.id.clone(),
            kind: NodeKind::Experiment,
            title: experiment.title.clone(),
            indent: level + 2,
            vote_count: None,
            ice_score: None,
            status: Some(experiment.status),
            hidden_children: 0,
        });
    }
    if !at_cap {
        for child in &entry.children {
            flatten_solution(child, level + 1, display_depth, rows);
        }
    }
}
