//! View sessions
//!
//! A `ViewSession` owns everything one open tree view needs: the local
//! graph, the mutation coordinator, per-node position timers, live refresh
//! listeners and presence. Nothing outlives `teardown`.

mod cancel;
mod coordinator;
mod events;
mod pending;
mod position;
mod presence;
mod refresh;
mod validator;

#[cfg(test)]
mod integration_tests;

pub use cancel::CancellationToken;
pub use coordinator::{MutationCoordinator, SyncError, SyncResult};
pub use events::{Operation, SessionEvent, SessionEvents};
pub use pending::{FieldKey, MutationState, PendingTable, Resolution, WriteTicket};
pub use position::PositionSync;
pub use presence::{
    channel_key, peer_style, PeerCursor, PeerStyle, PresenceBroadcaster, PresenceChannel,
    PresenceError, PresenceHandle, PresenceHub, PresencePayload, PresenceResult, PresenceState,
    Viewer,
};
pub use refresh::LiveRefresh;
pub use validator::{
    child_kind, parent_fields, ConnectionValidator, MutationDescriptor, NodeRef, Rejection,
};

use crate::config::SyncConfig;
use crate::export::ExportDocument;
use crate::graph::{EntitySet, FieldError, GraphModel, LocalGraph, NodeId, Role, Table, Tree, Vote};
use crate::projection::{aggregate, flatten, timeline, GroupBy, Hierarchy, ListRow, Timeline};
use crate::storage::{select_one, EntityStore, StorageError};
use crate::votes::{cast_vote, VoteError, VoteOutcome, MAX_VOTE, MIN_VOTE};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// The signed-in user, as supplied by the auth collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl UserIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
            name: None,
        }
    }
}

/// State shared between the session and its refresher task
struct SessionCore {
    store: Arc<dyn EntityStore>,
    tree_id: NodeId,
    max_depth: usize,
    graph: Arc<Mutex<LocalGraph>>,
    votes: Mutex<Vec<Vote>>,
    coordinator: Arc<MutationCoordinator>,
    events: SessionEvents,
}

impl SessionCore {
    /// Re-fetch the whole tree and swap it in under any still-pending edits
    async fn refresh(&self) -> Result<usize, StorageError> {
        let entities = EntitySet::fetch(self.store.as_ref(), &self.tree_id, self.max_depth).await?;
        let mut fresh = LocalGraph::from_entities(&entities);
        let node_count = fresh.node_count();
        {
            let mut graph = self.graph.lock().unwrap();
            self.coordinator.overlay_pending(&mut fresh);
            *graph = fresh;
        }
        *self.votes.lock().unwrap() = entities.votes;
        self.events.emit(SessionEvent::Refreshed { node_count });
        Ok(node_count)
    }

    fn entities(&self) -> EntitySet {
        let votes = self.votes.lock().unwrap().clone();
        self.graph.lock().unwrap().entity_set(votes)
    }
}

/// One open view of one tree
pub struct ViewSession {
    core: Arc<SessionCore>,
    tree: Tree,
    user: UserIdentity,
    role: Role,
    config: SyncConfig,
    positions: PositionSync,
    presence: Option<PresenceBroadcaster>,
    live: LiveRefresh,
    refresher: JoinHandle<()>,
    cancel: CancellationToken,
}

impl ViewSession {
    /// Load the tree, start live refresh, and join presence if a channel is
    /// given. Presence trouble degrades the session instead of failing it.
    pub async fn open(
        store: Arc<dyn EntityStore>,
        tree_id: &NodeId,
        user: UserIdentity,
        role: Role,
        config: SyncConfig,
        presence: Option<Arc<dyn PresenceChannel>>,
    ) -> SyncResult<Self> {
        let tree: Tree = select_one(store.as_ref(), Table::Trees, tree_id)
            .await
            .map_err(SyncError::Load)?
            .ok_or_else(|| {
                SyncError::Load(StorageError::NotFound {
                    table: Table::Trees,
                    id: tree_id.clone(),
                })
            })?;

        let events = SessionEvents::new();
        let cancel = CancellationToken::new();
        let graph = Arc::new(Mutex::new(LocalGraph::new()));
        let coordinator = Arc::new(MutationCoordinator::new(
            store.clone(),
            graph.clone(),
            tree_id.clone(),
            &config,
            user.id.clone(),
            role,
            events.clone(),
            cancel.clone(),
        ));
        let core = Arc::new(SessionCore {
            store: store.clone(),
            tree_id: tree_id.clone(),
            max_depth: config.max_chain_depth,
            graph: graph.clone(),
            votes: Mutex::new(Vec::new()),
            coordinator,
            events: events.clone(),
        });
        core.refresh().await.map_err(SyncError::Load)?;

        let notify = Arc::new(Notify::new());
        let live = LiveRefresh::start(
            store.clone(),
            tree_id,
            notify.clone(),
            events.clone(),
            cancel.clone(),
        );
        let refresher = tokio::spawn(run_refresher(core.clone(), notify, cancel.clone()));

        let positions = PositionSync::new(
            store,
            graph,
            role,
            config.position_quiet(),
            events.clone(),
            cancel.clone(),
        );

        let presence = match presence {
            Some(channel) => {
                match PresenceBroadcaster::join(channel, tree_id.as_str(), user.clone(), config.cursor_throttle()).await {
                    Ok(broadcaster) => Some(broadcaster),
                    Err(err) => {
                        warn!(tree = %tree_id, error = %err, "presence unavailable");
                        events.emit(SessionEvent::PresenceDegraded {
                            message: err.to_string(),
                        });
                        None
                    }
                }
            }
            None => None,
        };

        info!(tree = %tree_id, user = %user.id, role = role.as_str(), "view session opened");
        Ok(Self {
            core,
            tree,
            user,
            role,
            config,
            positions,
            presence,
            live,
            refresher,
            cancel,
        })
    }

    /// Re-fetch everything now. Returns the node count of the new view.
    pub async fn refresh(&self) -> SyncResult<usize> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        self.core.refresh().await.map_err(SyncError::Load)
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn user(&self) -> &UserIdentity {
        &self.user
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Current graph view, optimistic changes included
    pub fn graph(&self) -> GraphModel {
        self.core.graph.lock().unwrap().snapshot()
    }

    /// Nested outcome / opportunity / solution view of the current graph
    pub fn hierarchy(&self) -> Hierarchy {
        aggregate(&self.core.entities(), self.config.max_chain_depth)
    }

    /// Flattened list rows, cut at the configured display depth
    pub fn list_rows(&self) -> Vec<ListRow> {
        flatten(&self.hierarchy(), self.config.display_depth)
    }

    pub fn timeline(&self, group_by: GroupBy) -> Timeline {
        timeline(&self.core.entities(), group_by, self.config.max_chain_depth)
    }

    pub fn export(&self) -> ExportDocument {
        ExportDocument::new(&self.tree, &self.graph(), Utc::now())
    }

    pub fn coordinator(&self) -> &MutationCoordinator {
        &self.core.coordinator
    }

    pub fn positions(&self) -> &PositionSync {
        &self.positions
    }

    pub fn presence(&self) -> Option<&PresenceBroadcaster> {
        self.presence.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.core.events.subscribe()
    }

    pub fn live_listeners(&self) -> usize {
        self.live.listener_count()
    }

    /// Toggle this user's vote on a node of the view
    pub async fn vote(&self, node_id: &NodeId, value: u8) -> SyncResult<VoteOutcome> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        if !self.role.can_edit() {
            return Err(SyncError::ReadOnly);
        }
        if !(MIN_VOTE..=MAX_VOTE).contains(&value) {
            return Err(SyncError::Rejected(Rejection::Field(FieldError::OutOfRange {
                field: "value".to_string(),
                min: MIN_VOTE,
                max: MAX_VOTE,
            })));
        }
        let kind = self
            .core
            .graph
            .lock()
            .unwrap()
            .record(node_id)
            .map(|r| r.kind())
            .ok_or_else(|| SyncError::NodeNotFound(node_id.clone()))?;

        match cast_vote(self.core.store.as_ref(), node_id, kind, &self.user.id, value).await {
            Ok(outcome) => Ok(outcome),
            Err(VoteError::OutOfRange(_)) => Err(SyncError::Rejected(Rejection::Field(
                FieldError::OutOfRange {
                    field: "value".to_string(),
                    min: MIN_VOTE,
                    max: MAX_VOTE,
                },
            ))),
            Err(VoteError::Storage(err)) => {
                warn!(node = %node_id, error = %err, "vote failed");
                self.core.events.emit(SessionEvent::WriteFailed {
                    operation: Operation::Vote,
                    node_id: node_id.clone(),
                    message: err.to_string(),
                });
                Err(SyncError::Write(err))
            }
        }
    }

    /// Votes currently known to the view for one node
    pub fn votes_for(&self, node_id: &NodeId) -> Vec<Vote> {
        self.core
            .votes
            .lock()
            .unwrap()
            .iter()
            .filter(|v| &v.node_id == node_id)
            .cloned()
            .collect()
    }

    /// Stop listeners and timers, then retract presence and leave.
    ///
    /// Writes already issued complete in the background; their results no
    /// longer touch the view.
    pub async fn teardown(mut self) {
        self.cancel.cancel();
        self.positions.shutdown();
        self.live.stop();
        self.refresher.abort();
        if let Some(presence) = self.presence.take() {
            if let Err(err) = presence.leave().await {
                warn!(error = %err, "presence leave failed");
            }
        }
        info!(tree = %self.core.tree_id, user = %self.user.id, "view session closed");
    }
}

async fn run_refresher(core: Arc<SessionCore>, notify: Arc<Notify>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = notify.notified() => {
                if let Err(err) = core.refresh().await {
                    warn!(tree = %core.tree_id, error = %err, "live refresh fetch failed");
                }
            }
        }
    }
}
