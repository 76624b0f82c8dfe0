//! End-to-end tests of a view session over the in-memory store

use super::*;
use crate::graph::{NodeKind, Solution};
use crate::storage::{to_row, MemoryStore};
use serde_json::json;
use std::time::Duration;

async fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    let rows = [
        (Table::Trees, json!({"id": "t1", "name": "Activation", "created_by": "alice"})),
        (Table::Outcomes, json!({"id": "o1", "tree_id": "t1", "title": "Activation"})),
        (Table::Opportunities, json!({"id": "p1", "outcome_id": "o1", "title": "Setup is slow"})),
        (Table::Solutions, json!({"id": "s1", "opportunity_id": "p1", "title": "Wizard"})),
        (Table::Solutions, json!({"id": "s2", "opportunity_id": "p1", "title": "Templates"})),
    ];
    for (table, row) in rows {
        store.insert(table, to_row(&row).unwrap()).await.unwrap();
    }
    store
}

async fn open(store: &Arc<MemoryStore>, user: &str, role: Role) -> ViewSession {
    open_with_presence(store, user, role, None).await
}

async fn open_with_presence(
    store: &Arc<MemoryStore>,
    user: &str,
    role: Role,
    presence: Option<Arc<dyn PresenceChannel>>,
) -> ViewSession {
    ViewSession::open(
        store.clone(),
        &NodeId::from("t1"),
        UserIdentity::new(user),
        role,
        SyncConfig::default(),
        presence,
    )
    .await
    .unwrap()
}

/// Wait for the next refresh notice
async fn next_refresh(rx: &mut broadcast::Receiver<SessionEvent>) -> usize {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no refresh within timeout")
            .unwrap();
        if let SessionEvent::Refreshed { node_count } = event {
            return node_count;
        }
    }
}

#[tokio::test]
async fn open_builds_graph_and_hierarchy() {
    let store = seeded_store().await;
    let session = open(&store, "alice", Role::Owner).await;

    let graph = session.graph();
    assert_eq!(graph.node_count(), 4);
    assert_eq!(graph.edge_count(), 3);

    let hierarchy = session.hierarchy();
    assert_eq!(hierarchy.outcomes.len(), 1);
    assert_eq!(hierarchy.outcomes[0].opportunities[0].solutions.len(), 2);
    assert_eq!(session.live_listeners(), 5);
    session.teardown().await;
}

#[tokio::test]
async fn missing_tree_fails_to_open() {
    let store = Arc::new(MemoryStore::new());
    let result = ViewSession::open(
        store,
        &NodeId::from("nope"),
        UserIdentity::new("alice"),
        Role::Owner,
        SyncConfig::default(),
        None,
    )
    .await;
    assert!(matches!(result, Err(SyncError::Load(StorageError::NotFound { .. }))));
}

#[tokio::test]
async fn connecting_solutions_nests_them() {
    let store = seeded_store().await;
    let session = open(&store, "alice", Role::Owner).await;

    session
        .coordinator()
        .connect(&NodeId::from("s1"), &NodeId::from("s2"))
        .await
        .unwrap();

    let hierarchy = session.hierarchy();
    let top: Vec<&str> = hierarchy.outcomes[0].opportunities[0]
        .solutions
        .iter()
        .map(|s| s.solution.id.as_str())
        .collect();
    assert_eq!(top, ["s1"]);
    let s1 = hierarchy.find_solution(&NodeId::from("s1")).unwrap();
    assert_eq!(s1.children[0].solution.id, NodeId::from("s2"));
    session.teardown().await;
}

#[tokio::test]
async fn other_writers_trigger_refresh() {
    let store = seeded_store().await;
    let session = open(&store, "alice", Role::Owner).await;
    let mut rx = session.subscribe();

    store
        .insert(
            Table::Experiments,
            to_row(&json!({"id": "e1", "solution_id": "s1", "title": "Smoke test"})).unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(next_refresh(&mut rx).await, 5);
    assert!(session.graph().node(&NodeId::from("e1")).is_some());
    session.teardown().await;
}

#[tokio::test]
async fn sessions_see_each_others_edits() {
    let store = seeded_store().await;
    let alice = open(&store, "alice", Role::Owner).await;
    let bob = open(&store, "bob", Role::Editor).await;
    let mut bob_rx = bob.subscribe();

    alice
        .coordinator()
        .edit_field(&NodeId::from("s1"), "title", json!("Guided wizard"))
        .await
        .unwrap();

    next_refresh(&mut bob_rx).await;
    let graph = bob.graph();
    assert_eq!(graph.node(&NodeId::from("s1")).unwrap().data.title(), "Guided wizard");
    alice.teardown().await;
    bob.teardown().await;
}

#[tokio::test]
async fn refresh_keeps_pending_local_edit() {
    let store = seeded_store().await;
    let session = Arc::new(open(&store, "alice", Role::Owner).await);
    store.set_write_delay(Some(Duration::from_millis(200)));

    let editing = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .coordinator()
                .edit_field(&NodeId::from("s2"), "title", json!("Starter kits"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(session.coordinator().has_pending());

    session.refresh().await.unwrap();
    let title = session.graph().node(&NodeId::from("s2")).unwrap().data.title().to_string();
    assert_eq!(title, "Starter kits");

    editing.await.unwrap().unwrap();
}

fn title_of(session: &ViewSession, id: &str) -> String {
    session
        .graph()
        .node(&NodeId::from(id))
        .unwrap()
        .data
        .title()
        .to_string()
}

#[tokio::test]
async fn refresh_between_newer_failure_and_older_success() {
    let store = seeded_store().await;
    let session = Arc::new(open(&store, "alice", Role::Owner).await);
    store.set_write_delay(Some(Duration::from_millis(200)));

    let drafting = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .coordinator()
                .edit_field(&NodeId::from("s1"), "title", json!("Draft"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    store.set_write_delay(Some(Duration::from_millis(10)));
    store.fail_next_writes(1);
    assert!(session
        .coordinator()
        .edit_field(&NodeId::from("s1"), "title", json!("Failed"))
        .await
        .is_err());
    assert_eq!(title_of(&session, "s1"), "Draft");

    session.refresh().await.unwrap();
    assert_eq!(title_of(&session, "s1"), "Draft");

    drafting.await.unwrap().unwrap();
    session.refresh().await.unwrap();
    assert_eq!(title_of(&session, "s1"), "Draft");
    let stored: Solution = select_one(store.as_ref(), Table::Solutions, &NodeId::from("s1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.title, "Draft");
}

#[tokio::test]
async fn refresh_after_both_writes_fail_shows_original() {
    let store = seeded_store().await;
    let session = Arc::new(open(&store, "alice", Role::Owner).await);
    store.set_write_delay(Some(Duration::from_millis(150)));

    let drafting = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .coordinator()
                .edit_field(&NodeId::from("s1"), "title", json!("Draft"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    store.set_write_delay(Some(Duration::from_millis(10)));
    store.fail_writes_to(Table::Solutions);
    assert!(session
        .coordinator()
        .edit_field(&NodeId::from("s1"), "title", json!("Failed"))
        .await
        .is_err());
    session.refresh().await.unwrap();
    assert_eq!(title_of(&session, "s1"), "Draft");

    assert!(drafting.await.unwrap().is_err());
    assert_eq!(title_of(&session, "s1"), "Wizard");
    session.refresh().await.unwrap();
    assert_eq!(title_of(&session, "s1"), "Wizard");
    assert!(!session.coordinator().has_pending());
}

#[tokio::test]
async fn failed_edit_leaves_title_untouched() {
    let store = seeded_store().await;
    let session = open(&store, "alice", Role::Owner).await;
    let mut rx = session.subscribe();
    store.fail_writes_to(Table::Solutions);

    let err = session
        .coordinator()
        .edit_field(&NodeId::from("s1"), "title", json!("Broken"))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Write(_)));
    assert_eq!(session.graph().node(&NodeId::from("s1")).unwrap().data.title(), "Wizard");

    let mut saw_failure = false;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, SessionEvent::WriteFailed { .. }) {
            saw_failure = true;
        }
    }
    assert!(saw_failure);
    session.teardown().await;
}

#[tokio::test]
async fn viewers_get_no_mutations() {
    let store = seeded_store().await;
    let session = open(&store, "carol", Role::Viewer).await;
    assert!(matches!(
        session.coordinator().create_child(&NodeId::from("p1"), None).await,
        Err(SyncError::ReadOnly)
    ));
    assert!(matches!(
        session.vote(&NodeId::from("s1"), 3).await,
        Err(SyncError::ReadOnly)
    ));

    tokio::time::pause();
    assert!(matches!(
        session
            .positions()
            .on_drag(&NodeId::from("s1"), NodeKind::Solution, 999.0, 888.0),
        Err(SyncError::ReadOnly)
    ));
    tokio::time::sleep(Duration::from_millis(700)).await;
    let stored: Solution = select_one(store.as_ref(), Table::Solutions, &NodeId::from("s1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!((stored.position_x, stored.position_y), (None, None));
    assert_eq!(
        session.graph().node(&NodeId::from("s1")).unwrap().position,
        NodeKind::Solution.default_position()
    );
    session.teardown().await;
}

#[tokio::test]
async fn votes_show_up_after_refresh() {
    let store = seeded_store().await;
    let session = open(&store, "alice", Role::Owner).await;

    assert_eq!(session.vote(&NodeId::from("s1"), 4).await.unwrap(), VoteOutcome::Cast);
    session.refresh().await.unwrap();
    let hierarchy = session.hierarchy();
    assert_eq!(hierarchy.find_solution(&NodeId::from("s1")).unwrap().vote_count, 1);

    assert_eq!(session.vote(&NodeId::from("s1"), 4).await.unwrap(), VoteOutcome::Removed);
    session.refresh().await.unwrap();
    assert!(session.votes_for(&NodeId::from("s1")).is_empty());

    assert!(matches!(
        session.vote(&NodeId::from("s1"), 0).await,
        Err(SyncError::Rejected(_))
    ));
    session.teardown().await;
}

#[tokio::test]
async fn presence_joins_and_leaves_with_session() {
    let store = seeded_store().await;
    let hub: Arc<PresenceHub> = Arc::new(PresenceHub::new());
    let alice = open_with_presence(&store, "alice", Role::Owner, Some(hub.clone())).await;
    let bob = open_with_presence(&store, "bob", Role::Editor, Some(hub.clone())).await;

    let peers = alice.presence().unwrap().peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].user_id, "bob");

    let mut updates = alice.presence().unwrap().subscribe();
    updates.borrow_and_update();
    bob.teardown().await;
    updates.changed().await.unwrap();
    assert!(alice.presence().unwrap().viewers().is_empty());
    alice.teardown().await;
}

#[tokio::test]
async fn closed_presence_degrades_without_failing() {
    let store = seeded_store().await;
    let hub = Arc::new(PresenceHub::new());
    hub.close();
    let session = open_with_presence(&store, "alice", Role::Owner, Some(hub)).await;
    assert!(session.presence().is_none());
    assert_eq!(session.graph().node_count(), 4);
    session.teardown().await;
}

#[tokio::test]
async fn torn_down_session_stops_reacting() {
    let store = seeded_store().await;
    let session = open(&store, "alice", Role::Owner).await;
    let mut rx = session.subscribe();
    session.teardown().await;

    store
        .update(Table::Solutions, &NodeId::from("s1"), to_row(&json!({"title": "Later"})).unwrap())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!matches!(rx.try_recv(), Ok(SessionEvent::Refreshed { .. })));

    let stored: Solution = select_one(store.as_ref(), Table::Solutions, &NodeId::from("s1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.title, "Later");
}

#[tokio::test]
async fn drag_persists_after_quiet_window() {
    let store = seeded_store().await;
    let session = open(&store, "alice", Role::Owner).await;
    tokio::time::pause();

    session
        .positions()
        .on_drag(&NodeId::from("p1"), NodeKind::Opportunity, 10.0, 20.0)
        .unwrap();
    session
        .positions()
        .on_drag(&NodeId::from("p1"), NodeKind::Opportunity, 30.0, 40.0)
        .unwrap();
    assert_eq!(session.positions().pending_count(), 1);
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(session.positions().pending_count(), 0);

    let rows = store
        .select(Table::Opportunities, &crate::storage::Filter::new().eq("id", "p1"))
        .await
        .unwrap();
    assert_eq!(rows[0]["position_x"], json!(30.0));
    session.teardown().await;
}
