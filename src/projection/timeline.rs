//! Timeline projection: dated items grouped by outcome or opportunity

use crate::graph::{EntitySet, ExperimentStatus, NodeId, NodeKind, SolutionParent};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// How timeline items are grouped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupBy {
    #[default]
    Outcome,
    Opportunity,
}

impl FromStr for GroupBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "outcome" => Ok(GroupBy::Outcome),
            "opportunity" => Ok(GroupBy::Opportunity),
            other => Err(format!("unknown grouping: {}", other)),
        }
    }
}

/// A dated opportunity, solution or experiment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineItem {
    pub id: NodeId,
    pub kind: NodeKind,
    pub title: String,
    /// Start date, else end date
    pub date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub status: Option<ExperimentStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineGroup {
    pub id: NodeId,
    pub kind: NodeKind,
    pub title: String,
    pub items: Vec<TimelineItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Timeline {
    pub groups: Vec<TimelineGroup>,
    /// Earliest and latest date across the grouped items
    pub range: Option<(NaiveDate, NaiveDate)>,
}

impl Timeline {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Horizontal placement of `date` within the range, 0 to 100
    pub fn position_percent(&self, date: NaiveDate) -> f64 {
        let Some((start, end)) = self.range else {
            return 0.0;
        };
        let span = (end - start).num_days();
        if span <= 0 {
            return 0.0;
        }
        let offset = (date - start).num_days();
        (offset as f64 / span as f64 * 100.0).clamp(0.0, 100.0)
    }
}

struct Dated {
    item: TimelineItem,
    opportunity: Option<NodeId>,
}

/// Build the timeline of one fetch result.
///
/// Items are sorted ascending by date. Items whose group cannot be resolved
/// are dropped, and groups with no items are omitted.
pub fn timeline(entities: &EntitySet, group_by: GroupBy, max_depth: usize) -> Timeline {
    let parents = entities.parent_index();
    let solution_opportunity = |id: &NodeId| -> Option<NodeId> {
        parents.root_opportunity(id, max_depth).ok().flatten()
    };

    let mut dated: Vec<Dated> = Vec::new();
    for o in &entities.opportunities {
        if let Some(date) = o.start_date.or(o.end_date) {
            dated.push(Dated {
                item: TimelineItem {
                    id: o.id.clone(),
                    kind: NodeKind::Opportunity,
                    title: o.title.clone(),
                    date,
                    end_date: o.end_date,
                    status: None,
                },
                opportunity: Some(o.id.clone()),
            });
        }
    }
    for s in &entities.solutions {
        if let Some(date) = s.start_date.or(s.end_date) {
            let opportunity = match SolutionParent::of(s) {
                Some(SolutionParent::Opportunity(id)) => Some(id),
                Some(SolutionParent::Solution(_)) => solution_opportunity(&s.id),
                None => None,
            };
            dated.push(Dated {
                item: TimelineItem {
                    id: s.id.clone(),
                    kind: NodeKind::Solution,
                    title: s.title.clone(),
                    date,
                    end_date: s.end_date,
                    status: None,
                },
                opportunity,
            });
        }
    }
    for e in &entities.experiments {
        if let Some(date) = e.start_date.or(e.end_date) {
            let opportunity = e.solution_id.as_ref().and_then(|sid| {
                match parents.parent_of(sid) {
                    Some(SolutionParent::Opportunity(id)) => Some(id.clone()),
                    Some(SolutionParent::Solution(_)) => solution_opportunity(sid),
                    None => None,
                }
            });
            dated.push(Dated {
                item: TimelineItem {
                    id: e.id.clone(),
                    kind: NodeKind::Experiment,
                    title: e.title.clone(),
                    date,
                    end_date: e.end_date,
                    status: Some(e.status),
                },
                opportunity,
            });
        }
    }
    dated.sort_by_key(|d| d.item.date);

    let outcome_of: HashMap<&NodeId, &NodeId> = entities
        .opportunities
        .iter()
        .filter_map(|o| o.outcome_id.as_ref().map(|out| (&o.id, out)))
        .collect();

    let mut groups: Vec<TimelineGroup> = match group_by {
        GroupBy::Outcome => entities
            .outcomes
            .iter()
            .map(|o| TimelineGroup {
                id: o.id.clone(),
                kind: NodeKind::Outcome,
                title: o.title.clone(),
                items: Vec::new(),
            })
            .collect(),
        GroupBy::Opportunity => entities
            .opportunities
            .iter()
            .map(|o| TimelineGroup {
                id: o.id.clone(),
                kind: NodeKind::Opportunity,
                title: o.title.clone(),
                items: Vec::new(),
            })
            .collect(),
    };
    let slot: HashMap<NodeId, usize> = groups
        .iter()
        .enumerate()
        .map(|(i, g)| (g.id.clone(), i))
        .collect();

    for d in dated {
        let key = match group_by {
            GroupBy::Opportunity => d.opportunity,
            GroupBy::Outcome => d
                .opportunity
                .as_ref()
                .and_then(|p| outcome_of.get(p))
                .map(|o| (*o).clone()),
        };
        if let Some(index) = key.and_then(|k| slot.get(&k).copied()) {
            groups[index].items.push(d.item);
        }
    }
    groups.retain(|g| !g.items.is_empty());

    let range = groups
        .iter()
        .flat_map(|g| &g.items)
        .flat_map(|item| std::iter::once(item.date).chain(item.end_date))
        .fold(None, |acc: Option<(NaiveDate, NaiveDate)>, date| match acc {
            None => Some((date, date)),
            Some((lo, hi)) => Some((lo.min(date), hi.max(date))),
        });

    Timeline { groups, range }
}
