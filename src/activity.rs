//! Per-tree activity feed
//!
//! Creates and updates are recorded as `activity_log` rows whose action is
//! `<table>_created` or `<table>_updated`. The feed reads the newest rows of
//! one tree and renders each as "who did what".

use crate::graph::{NodeId, NodeKind, Table};
use crate::storage::{select_as, to_row, EntityStore, Filter, Row, StorageResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

/// Entries shown by default
pub const DEFAULT_FEED_LIMIT: usize = 20;

/// What happened to a row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityVerb {
    Created,
    Updated,
}

/// Action name for a write to `table`, e.g. `solutions_updated`.
///
/// The trees table is logged in the singular (`tree_created`).
pub fn action_name(table: Table, verb: ActivityVerb) -> String {
    let subject = match table {
        Table::Trees => "tree",
        other => other.as_str(),
    };
    let verb = match verb {
        ActivityVerb::Created => "created",
        ActivityVerb::Updated => "updated",
    };
    format!("{}_{}", subject, verb)
}

/// Human label for an action, with the node title appended when known.
/// Unknown actions are shown as-is.
pub fn action_label(action: &str, metadata: Option<&Value>) -> String {
    let base = match action {
        "tree_created" => "created the tree",
        "tree_updated" => "updated the tree",
        "outcomes_created" => "created an outcome",
        "outcomes_updated" => "updated an outcome",
        "opportunities_created" => "created an opportunity",
        "opportunities_updated" => "updated an opportunity",
        "solutions_created" => "created a solution",
        "solutions_updated" => "updated a solution",
        "experiments_created" => "created an experiment",
        "experiments_updated" => "updated an experiment",
        other => other,
    };
    match metadata.and_then(|m| m.get("title")).and_then(Value::as_str) {
        Some(title) if !title.is_empty() => format!("{}: \"{}\"", base, title),
        _ => base.to_string(),
    }
}

/// One `activity_log` row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: NodeId,
    pub tree_id: NodeId,
    pub user_id: String,
    pub action: String,
    #[serde(default)]
    pub node_id: Option<NodeId>,
    #[serde(default)]
    pub node_type: Option<NodeKind>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Display name and email of a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl UserProfile {
    /// Name, else email, else None
    pub fn display_name(&self) -> Option<&str> {
        [self.name.as_deref(), self.email.as_deref()]
            .into_iter()
            .flatten()
            .find(|s| !s.is_empty())
    }
}

/// A feed line: the entry, who made it and what it says
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityItem {
    #[serde(flatten)]
    pub entry: ActivityEntry,
    pub actor: String,
    pub label: String,
}

/// Append an activity row for `tree_id`
pub async fn log_activity(
    store: &dyn EntityStore,
    tree_id: &NodeId,
    user_id: &str,
    action: &str,
    node: Option<(&NodeId, NodeKind)>,
    metadata: Option<Value>,
) -> StorageResult<Row> {
    let row = to_row(&json!({
        "tree_id": tree_id,
        "user_id": user_id,
        "action": action,
        "node_id": node.map(|(id, _)| id),
        "node_type": node.map(|(_, kind)| kind),
        "metadata": metadata,
    }))?;
    store.insert(Table::ActivityLog, row).await
}

/// Create or replace a user's profile
pub async fn save_profile(store: &dyn EntityStore, profile: &UserProfile) -> StorageResult<()> {
    let id = NodeId::from(profile.id.as_str());
    let existing = store
        .select(Table::UserProfiles, &Filter::new().eq("id", &id))
        .await?;
    let row = to_row(profile)?;
    if existing.is_empty() {
        store.insert(Table::UserProfiles, row).await?;
    } else {
        store.update(Table::UserProfiles, &id, row).await?;
    }
    Ok(())
}

/// The `limit` newest entries of a tree, newest first.
///
/// Entries logged at the same instant keep reverse insertion order. A user
/// without a profile is shown as "Someone".
pub async fn recent_activity(
    store: &dyn EntityStore,
    tree_id: &NodeId,
    limit: usize,
) -> StorageResult<Vec<ActivityItem>> {
    let entries: Vec<ActivityEntry> =
        select_as(store, Table::ActivityLog, &Filter::new().eq("tree_id", tree_id)).await?;
    let mut entries: Vec<(usize, ActivityEntry)> = entries.into_iter().enumerate().collect();
    entries.sort_by(|(ia, a), (ib, b)| b.created_at.cmp(&a.created_at).then(ib.cmp(ia)));
    entries.truncate(limit);

    let mut user_ids: Vec<&str> = entries.iter().map(|(_, e)| e.user_id.as_str()).collect();
    user_ids.sort_unstable();
    user_ids.dedup();
    let profiles: HashMap<String, UserProfile> = if user_ids.is_empty() {
        HashMap::new()
    } else {
        select_as::<UserProfile>(store, Table::UserProfiles, &Filter::new().is_in("id", user_ids))
            .await?
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect()
    };

    Ok(entries
        .into_iter()
        .map(|(_, entry)| {
            let actor = profiles
                .get(&entry.user_id)
                .and_then(UserProfile::display_name)
                .unwrap_or("Someone")
                .to_string();
            let label = action_label(&entry.action, entry.metadata.as_ref());
            ActivityItem { entry, actor, label }
        })
        .collect())
}
