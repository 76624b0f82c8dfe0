//! Votes on nodes
//!
//! At most one vote per (node, node type, user). Casting the value already
//! held removes the vote; any other value replaces it.

use crate::graph::{NodeId, NodeKind, Table, Vote};
use crate::storage::{select_as, EntityStore, Filter, Row, StorageError};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub const MIN_VOTE: u8 = 1;
pub const MAX_VOTE: u8 = 5;

#[derive(Debug, Error)]
pub enum VoteError {
    #[error("vote must be between 1 and 5, got {0}")]
    OutOfRange(u8),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type VoteResult<T> = Result<T, VoteError>;

/// What a cast did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    /// First vote by this user on the node
    Cast,
    /// Replaced an earlier vote
    Changed { previous: u8 },
    /// Same value cast twice; the vote is gone
    Removed,
}

fn vote_filter(node_id: &NodeId, kind: NodeKind) -> Filter {
    Filter::new()
        .eq("node_id", node_id)
        .eq("node_type", kind.as_str())
}

/// Toggle or upsert `user_id`'s vote on a node
pub async fn cast_vote(
    store: &dyn EntityStore,
    node_id: &NodeId,
    kind: NodeKind,
    user_id: &str,
    value: u8,
) -> VoteResult<VoteOutcome> {
    if !(MIN_VOTE..=MAX_VOTE).contains(&value) {
        return Err(VoteError::OutOfRange(value));
    }
    let existing: Vec<Vote> = select_as(
        store,
        Table::Votes,
        &vote_filter(node_id, kind).eq("user_id", user_id),
    )
    .await?;

    match existing.first() {
        Some(vote) if vote.value == value => {
            store.delete(Table::Votes, &vote.id).await?;
            debug!(node = %node_id, user = user_id, "vote removed");
            Ok(VoteOutcome::Removed)
        }
        Some(vote) => {
            let mut fields = Row::new();
            fields.insert("value".into(), Value::from(value));
            fields.insert("updated_at".into(), Value::String(Utc::now().to_rfc3339()));
            store.update(Table::Votes, &vote.id, fields).await?;
            debug!(node = %node_id, user = user_id, value, "vote changed");
            Ok(VoteOutcome::Changed {
                previous: vote.value,
            })
        }
        None => {
            let mut row = Row::new();
            row.insert("node_id".into(), Value::from(node_id));
            row.insert("node_type".into(), Value::from(kind.as_str()));
            row.insert("user_id".into(), Value::from(user_id));
            row.insert("value".into(), Value::from(value));
            store.insert(Table::Votes, row).await?;
            debug!(node = %node_id, user = user_id, value, "vote cast");
            Ok(VoteOutcome::Cast)
        }
    }
}

/// Number of votes on a node
pub async fn vote_count(store: &dyn EntityStore, node_id: &NodeId, kind: NodeKind) -> VoteResult<usize> {
    Ok(store.select(Table::Votes, &vote_filter(node_id, kind)).await?.len())
}

/// Count, mean value, and one user's own vote
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoteSummary {
    pub count: usize,
    pub average: Option<f64>,
    pub user_vote: Option<u8>,
}

impl VoteSummary {
    pub fn of(votes: &[Vote], user_id: &str) -> Self {
        let total: u32 = votes.iter().map(|v| v.value as u32).sum();
        Self {
            count: votes.len(),
            average: (!votes.is_empty()).then(|| total as f64 / votes.len() as f64),
            user_vote: votes.iter().find(|v| v.user_id == user_id).map(|v| v.value),
        }
    }
}

pub async fn vote_summary(
    store: &dyn EntityStore,
    node_id: &NodeId,
    kind: NodeKind,
    user_id: &str,
) -> VoteResult<VoteSummary> {
    let votes: Vec<Vote> = select_as(store, Table::Votes, &vote_filter(node_id, kind)).await?;
    Ok(VoteSummary::of(&votes, user_id))
}
