//! Live refresh trigger
//!
//! One listener per entity table. Any change notification, whichever row it
//! names, signals the owning session to re-fetch everything. Bursts collapse
//! into a single pending signal.

use super::cancel::CancellationToken;
use super::events::{SessionEvent, SessionEvents};
use crate::graph::{NodeId, Table};
use crate::storage::{ChangeSubscription, EntityStore, Filter};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Tables a tree view listens on, with the filter for each
fn watched_tables(tree_id: &NodeId) -> Vec<(Table, Filter)> {
    vec![
        (Table::Outcomes, Filter::new().eq("tree_id", tree_id)),
        (Table::Opportunities, Filter::new()),
        (Table::Solutions, Filter::new()),
        (Table::Experiments, Filter::new()),
        (Table::Votes, Filter::new()),
    ]
}

/// Running change listeners of one view
pub struct LiveRefresh {
    tasks: Vec<JoinHandle<()>>,
}

impl LiveRefresh {
    /// Subscribe to every watched table. A table whose subscription fails is
    /// reported and skipped; the others still run.
    pub fn start(
        store: Arc<dyn EntityStore>,
        tree_id: &NodeId,
        notify: Arc<Notify>,
        events: SessionEvents,
        cancel: CancellationToken,
    ) -> Self {
        let mut tasks = Vec::new();
        for (table, filter) in watched_tables(tree_id) {
            match store.subscribe_changes(table, filter) {
                Ok(subscription) => tasks.push(tokio::spawn(listen(
                    subscription,
                    notify.clone(),
                    events.clone(),
                    cancel.clone(),
                ))),
                Err(err) => {
                    warn!(%table, error = %err, "live refresh unavailable");
                    events.emit(SessionEvent::LiveRefreshDegraded {
                        table,
                        message: err.to_string(),
                    });
                }
            }
        }
        info!(tree = %tree_id, listeners = tasks.len(), "live refresh started");
        Self { tasks }
    }

    pub fn listener_count(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_finished()).count()
    }

    /// Unsubscribe every listener
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for LiveRefresh {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn listen(
    mut subscription: ChangeSubscription,
    notify: Arc<Notify>,
    events: SessionEvents,
    cancel: CancellationToken,
) {
    let table = subscription.table();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            change = subscription.next() => match change {
                Some(change) => {
                    debug!(%table, id = %change.id, "change received");
                    notify.notify_one();
                }
                None => {
                    warn!(%table, "change stream closed");
                    events.emit(SessionEvent::LiveRefreshDegraded {
                        table,
                        message: "change stream closed".to_string(),
                    });
                    break;
                }
            },
        }
    }
    subscription.unsubscribe();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{to_row, MemoryStore};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn any_table_change_signals_refresh() {
        let store = Arc::new(MemoryStore::new());
        let notify = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let refresh = LiveRefresh::start(
            store.clone(),
            &NodeId::from("t1"),
            notify.clone(),
            SessionEvents::new(),
            cancel.clone(),
        );
        assert_eq!(refresh.listener_count(), 5);

        store
            .insert(Table::Experiments, to_row(&json!({"id": "e1", "title": "x"})).unwrap())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), notify.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn outcomes_of_other_trees_are_ignored() {
        let store = Arc::new(MemoryStore::new());
        let notify = Arc::new(Notify::new());
        let _refresh = LiveRefresh::start(
            store.clone(),
            &NodeId::from("t1"),
            notify.clone(),
            SessionEvents::new(),
            CancellationToken::new(),
        );
        store
            .insert(
                Table::Outcomes,
                to_row(&json!({"id": "o9", "tree_id": "t2", "title": "x"})).unwrap(),
            )
            .await
            .unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(50), notify.notified())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn cancel_ends_listeners() {
        let store = Arc::new(MemoryStore::new());
        let cancel = CancellationToken::new();
        let refresh = LiveRefresh::start(
            store.clone(),
            &NodeId::from("t1"),
            Arc::new(Notify::new()),
            SessionEvents::new(),
            cancel.clone(),
        );
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(refresh.listener_count(), 0);
    }
}
