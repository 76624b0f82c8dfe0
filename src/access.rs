//! Node-details access check
//!
//! Before a single node is shown on its own, the caller's access to the tree
//! is checked and the node's ancestor chain is walked back to the tree. A
//! node whose chain is broken, cyclic or leads into another tree is
//! reported with `ancestor_chain_valid = false`.

use crate::graph::{
    Experiment, Membership, NodeId, NodeKind, NodeRecord, Opportunity, Outcome, Role, Solution,
    Table, Tree,
};
use crate::storage::{select_as, select_one, EntityStore, Filter, StorageError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("Tree not found: {0}")]
    TreeNotFound(NodeId),

    #[error("user {user_id} has no access to tree {tree_id}")]
    AccessDenied { tree_id: NodeId, user_id: String },

    #[error("{kind} not found: {id}")]
    NodeNotFound { kind: NodeKind, id: NodeId },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type AccessResult<T> = Result<T, AccessError>;

/// One ancestor on the way from the outcome down to a node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Crumb {
    pub id: NodeId,
    pub kind: NodeKind,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeAccess {
    pub node: NodeRecord,
    pub ancestor_chain_valid: bool,
    pub role: Role,
    /// Outcome first, direct parent last
    pub breadcrumb: Vec<Crumb>,
    /// Direct sub-solutions, oldest first; empty unless the node is a solution
    pub sub_solutions: Vec<Solution>,
}

/// The user's role on a tree, or None when they may not see it.
///
/// The creator is owner; members have their membership role; anyone else
/// is a viewer of a public tree.
pub async fn tree_role(store: &dyn EntityStore, tree: &Tree, user_id: &str) -> AccessResult<Option<Role>> {
    if tree.created_by == user_id {
        return Ok(Some(Role::Owner));
    }
    let members: Vec<Membership> = select_as(
        store,
        Table::TreeMembers,
        &Filter::new().eq("tree_id", &tree.id).eq("user_id", user_id),
    )
    .await?;
    if let Some(member) = members.first() {
        return Ok(Some(member.role));
    }
    Ok(tree.is_public().then_some(Role::Viewer))
}

/// Load a tree the user may see, with their role on it
pub async fn open_tree(store: &dyn EntityStore, tree_id: &NodeId, user_id: &str) -> AccessResult<(Tree, Role)> {
    let tree: Tree = select_one(store, Table::Trees, tree_id)
        .await?
        .ok_or_else(|| AccessError::TreeNotFound(tree_id.clone()))?;
    match tree_role(store, &tree, user_id).await? {
        Some(role) => Ok((tree, role)),
        None => Err(AccessError::AccessDenied {
            tree_id: tree_id.clone(),
            user_id: user_id.to_string(),
        }),
    }
}

/// Trees the user created or is a member of, plus public trees
pub async fn visible_trees(store: &dyn EntityStore, user_id: &str) -> AccessResult<Vec<(Tree, Role)>> {
    let trees: Vec<Tree> = select_as(store, Table::Trees, &Filter::new()).await?;
    let mut visible = Vec::new();
    for tree in trees {
        if let Some(role) = tree_role(store, &tree, user_id).await? {
            visible.push((tree, role));
        }
    }
    Ok(visible)
}

/// Check access to one node of a tree and verify its ancestor chain
pub async fn check_node_access(
    store: &dyn EntityStore,
    tree_id: &NodeId,
    kind: NodeKind,
    node_id: &NodeId,
    user_id: &str,
    max_depth: usize,
) -> AccessResult<NodeAccess> {
    let (_, role) = open_tree(store, tree_id, user_id).await?;

    let not_found = || AccessError::NodeNotFound {
        kind,
        id: node_id.clone(),
    };
    let row = store
        .select(kind.table(), &Filter::new().eq("id", node_id))
        .await?
        .into_iter()
        .next()
        .ok_or_else(not_found)?;
    let node = NodeRecord::from_row(kind, row).map_err(StorageError::from)?;

    let mut walk = ChainWalk {
        store,
        tree_id,
        max_depth,
        crumbs: Vec::new(),
    };
    let ancestor_chain_valid = match &node {
        NodeRecord::Outcome(outcome) => outcome.tree_id.as_ref() == Some(tree_id),
        NodeRecord::Opportunity(opportunity) => walk.from_opportunity(opportunity).await?,
        NodeRecord::Solution(solution) => walk.from_solution(solution).await?,
        NodeRecord::Experiment(experiment) => walk.from_experiment(experiment).await?,
    };
    if !ancestor_chain_valid {
        debug!(tree = %tree_id, node = %node_id, %kind, "node is not reachable from tree");
    }
    let mut breadcrumb = walk.crumbs;
    breadcrumb.reverse();

    let sub_solutions = if kind == NodeKind::Solution {
        let mut children: Vec<Solution> = select_as(
            store,
            Table::Solutions,
            &Filter::new().eq("parent_solution_id", node_id),
        )
        .await?;
        children.sort_by_key(|s| (s.created_at.is_none(), s.created_at));
        children
    } else {
        Vec::new()
    };

    Ok(NodeAccess {
        node,
        ancestor_chain_valid,
        role,
        breadcrumb,
        sub_solutions,
    })
}

/// Walks parent references upward, collecting crumbs nearest first
struct ChainWalk<'a> {
    store: &'a dyn EntityStore,
    tree_id: &'a NodeId,
    max_depth: usize,
    crumbs: Vec<Crumb>,
}

impl ChainWalk<'_> {
    fn push(&mut self, id: &NodeId, kind: NodeKind, title: &str) {
        self.crumbs.push(Crumb {
            id: id.clone(),
            kind,
            title: title.to_string(),
        });
    }

    async fn from_experiment(&mut self, experiment: &Experiment) -> AccessResult<bool> {
        let Some(solution_id) = &experiment.solution_id else {
            return Ok(false);
        };
        let Some(solution) = select_one::<Solution>(self.store, Table::Solutions, solution_id).await? else {
            return Ok(false);
        };
        self.push(&solution.id, NodeKind::Solution, &solution.title);
        self.from_solution(&solution).await
    }

    async fn from_solution(&mut self, solution: &Solution) -> AccessResult<bool> {
        let mut current = solution.clone();
        for _ in 0..self.max_depth {
            match (&current.parent_solution_id, &current.opportunity_id) {
                (Some(parent_id), _) => {
                    let Some(parent) = select_one::<Solution>(self.store, Table::Solutions, parent_id).await? else {
                        return Ok(false);
                    };
                    if parent.id == solution.id {
                        warn!(solution = %solution.id, "solution chain loops back on itself");
                        return Ok(false);
                    }
                    self.push(&parent.id, NodeKind::Solution, &parent.title);
                    current = parent;
                }
                (None, Some(opportunity_id)) => {
                    let Some(opportunity) =
                        select_one::<Opportunity>(self.store, Table::Opportunities, opportunity_id).await?
                    else {
                        return Ok(false);
                    };
                    self.push(&opportunity.id, NodeKind::Opportunity, &opportunity.title);
                    return self.from_opportunity(&opportunity).await;
                }
                (None, None) => return Ok(false),
            }
        }
        warn!(solution = %solution.id, limit = self.max_depth, "solution chain exceeds safety depth");
        Ok(false)
    }

    async fn from_opportunity(&mut self, opportunity: &Opportunity) -> AccessResult<bool> {
        let Some(outcome_id) = &opportunity.outcome_id else {
            return Ok(false);
        };
        let Some(outcome) = select_one::<Outcome>(self.store, Table::Outcomes, outcome_id).await? else {
            return Ok(false);
        };
        self.push(&outcome.id, NodeKind::Outcome, &outcome.title);
        Ok(outcome.tree_id.as_ref() == Some(self.tree_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{to_row, MemoryStore};
    use serde_json::json;

    async fn seed(store: &MemoryStore, rows: &[(Table, serde_json::Value)]) {
        for (table, row) in rows {
            store.insert(*table, to_row(row).unwrap()).await.unwrap();
        }
    }

    async fn store() -> MemoryStore {
        let store = MemoryStore::new();
        seed(
            &store,
            &[
                (Table::Trees, json!({"id": "t1", "name": "Tree", "created_by": "owner"})),
                (Table::Trees, json!({"id": "t2", "name": "Other", "created_by": "owner", "is_public": true})),
                (Table::TreeMembers, json!({"id": "m1", "tree_id": "t1", "user_id": "ed", "role": "editor"})),
                (Table::Outcomes, json!({"id": "o1", "tree_id": "t1", "title": "Grow"})),
                (Table::Outcomes, json!({"id": "o2", "tree_id": "t2", "title": "Elsewhere"})),
                (Table::Opportunities, json!({"id": "p1", "outcome_id": "o1", "title": "Churn"})),
                (Table::Opportunities, json!({"id": "p2", "outcome_id": "o2", "title": "Other"})),
                (Table::Solutions, json!({"id": "s1", "opportunity_id": "p1", "title": "Guide"})),
                (Table::Solutions, json!({"id": "s2", "parent_solution_id": "s1", "title": "Video", "created_at": "2024-01-02T00:00:00Z"})),
                (Table::Solutions, json!({"id": "s3", "parent_solution_id": "s2", "title": "Script"})),
                (Table::Solutions, json!({"id": "s4", "parent_solution_id": "s1", "title": "Text", "created_at": "2024-01-01T00:00:00Z"})),
                (Table::Solutions, json!({"id": "x1", "opportunity_id": "p2", "title": "Foreign"})),
                (Table::Experiments, json!({"id": "e1", "solution_id": "s3", "title": "Test"})),
            ],
        )
        .await;
        store
    }

    #[tokio::test]
    async fn nested_solution_chain_reaches_tree() {
        let store = store().await;
        let access = check_node_access(&store, &NodeId::from("t1"), NodeKind::Solution, &NodeId::from("s3"), "owner", 64)
            .await
            .unwrap();
        assert!(access.ancestor_chain_valid);
        assert_eq!(access.role, Role::Owner);
        let trail: Vec<&str> = access.breadcrumb.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(trail, ["o1", "p1", "s1", "s2"]);
    }

    #[tokio::test]
    async fn sub_solutions_are_listed_oldest_first() {
        let store = store().await;
        let access = check_node_access(&store, &NodeId::from("t1"), NodeKind::Solution, &NodeId::from("s1"), "ed", 64)
            .await
            .unwrap();
        assert_eq!(access.role, Role::Editor);
        let ids: Vec<&str> = access.sub_solutions.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["s4", "s2"]);
    }

    #[tokio::test]
    async fn experiment_chain_goes_through_its_solution() {
        let store = store().await;
        let access = check_node_access(&store, &NodeId::from("t1"), NodeKind::Experiment, &NodeId::from("e1"), "owner", 64)
            .await
            .unwrap();
        assert!(access.ancestor_chain_valid);
        assert_eq!(access.breadcrumb.last().unwrap().id, NodeId::from("s3"));
    }

    #[tokio::test]
    async fn node_of_another_tree_is_invalid() {
        let store = store().await;
        let access = check_node_access(&store, &NodeId::from("t1"), NodeKind::Solution, &NodeId::from("x1"), "owner", 64)
            .await
            .unwrap();
        assert!(!access.ancestor_chain_valid);
    }

    #[tokio::test]
    async fn cyclic_chain_is_invalid() {
        let store = MemoryStore::new();
        seed(
            &store,
            &[
                (Table::Trees, json!({"id": "t1", "name": "Tree", "created_by": "owner"})),
                (Table::Solutions, json!({"id": "a", "parent_solution_id": "b", "title": "a"})),
                (Table::Solutions, json!({"id": "b", "parent_solution_id": "c", "title": "b"})),
                (Table::Solutions, json!({"id": "c", "parent_solution_id": "b", "title": "c"})),
            ],
        )
        .await;
        let access = check_node_access(&store, &NodeId::from("t1"), NodeKind::Solution, &NodeId::from("a"), "owner", 16)
            .await
            .unwrap();
        assert!(!access.ancestor_chain_valid);
    }

    #[tokio::test]
    async fn strangers_are_denied_private_trees() {
        let store = store().await;
        let err = check_node_access(&store, &NodeId::from("t1"), NodeKind::Opportunity, &NodeId::from("p1"), "stranger", 64)
            .await
            .unwrap_err();
        assert!(matches!(err, AccessError::AccessDenied { .. }));
    }

    #[tokio::test]
    async fn public_trees_grant_viewer_role() {
        let store = store().await;
        let access = check_node_access(&store, &NodeId::from("t2"), NodeKind::Opportunity, &NodeId::from("p2"), "stranger", 64)
            .await
            .unwrap();
        assert_eq!(access.role, Role::Viewer);
        assert!(access.ancestor_chain_valid);
    }

    #[tokio::test]
    async fn visible_trees_include_public_ones() {
        let store = store().await;
        let names: Vec<String> = visible_trees(&store, "stranger")
            .await
            .unwrap()
            .into_iter()
            .map(|(tree, _)| tree.name)
            .collect();
        assert_eq!(names, ["Other"]);
        assert_eq!(visible_trees(&store, "ed").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn missing_tree_and_node_are_distinguished() {
        let store = store().await;
        assert!(matches!(
            check_node_access(&store, &NodeId::from("nope"), NodeKind::Solution, &NodeId::from("s1"), "owner", 64).await,
            Err(AccessError::TreeNotFound(_))
        ));
        assert!(matches!(
            check_node_access(&store, &NodeId::from("t1"), NodeKind::Solution, &NodeId::from("nope"), "owner", 64).await,
            Err(AccessError::NodeNotFound { .. })
        ));
    }
}
