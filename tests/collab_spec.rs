use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use pathsync::client::{DiagramStore, StoreContext};
use pathsync::collab::{
    Change, ChangeError, ClientFrame, CollabError, DiagramDoc, DocumentStore, EditMark, Outbound,
    Participant, ServerFrame, SessionConfig, SessionHandle, SessionManager,
    CLOSE_DOCUMENT_DELETED,
};
use pathsync::models::*;
use tokio::sync::mpsc::{error::TryRecvError, Receiver};

#[derive(Default)]
struct MemoryStore {
    docs: Mutex<HashMap<String, DiagramContent>>,
    fail_loads: AtomicBool,
    fail_saves: AtomicBool,
    refuse_create: AtomicBool,
    save_delay_ms: AtomicU64,
    saves: AtomicUsize,
}

impl MemoryStore {
    fn with_template(key: &str) -> Arc<Self> {
        let store = Self::default();
        store
            .docs
            .lock()
            .unwrap()
            .insert(key.to_string(), DiagramContent::template());
        Arc::new(store)
    }

    fn content(&self, key: &str) -> Option<DiagramContent> {
        self.docs.lock().unwrap().get(key).cloned()
    }

    fn remove(&self, key: &str) -> bool {
        self.docs.lock().unwrap().remove(key).is_some()
    }
}

impl DocumentStore for MemoryStore {
    fn load_document(&self, key: &str) -> anyhow::Result<Option<DiagramContent>> {
        if self.fail_loads.load(Ordering::SeqCst) {
            anyhow::bail!("store offline");
        }
        Ok(self.content(key))
    }

    fn save_document(&self, key: &str, content: &DiagramContent) -> anyhow::Result<()> {
        let delay = self.save_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.fail_saves.load(Ordering::SeqCst) {
            anyhow::bail!("store offline");
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.docs
            .lock()
            .unwrap()
            .insert(key.to_string(), content.clone());
        Ok(())
    }

    fn can_create(&self, _key: &str) -> anyhow::Result<bool> {
        Ok(!self.refuse_create.load(Ordering::SeqCst))
    }
}

fn test_config() -> SessionConfig {
    SessionConfig {
        flush_interval: Duration::from_secs(60),
        retry_attempts: 2,
        retry_base_delay: Duration::from_millis(1),
        ..SessionConfig::default()
    }
}

fn manager(store: Arc<MemoryStore>) -> SessionManager {
    SessionManager::new(store, test_config())
}

fn participant(user: &str) -> Participant {
    Participant {
        user_id: user.to_string(),
        name: user.to_string(),
    }
}

fn drain(rx: &mut Receiver<Outbound>) -> Vec<Outbound> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

/// Joins `user` and returns the encoded snapshot it receives first.
async fn join_raw(
    sessions: &SessionManager,
    document: &str,
    user: &str,
) -> (SessionHandle, Vec<u8>, Receiver<Outbound>) {
    let (tx, mut rx) = sessions.outbound_channel();
    let handle = sessions
        .join(document, participant(user), tx)
        .await
        .expect("Join failed");
    match rx.try_recv() {
        Ok(Outbound::Frame(ServerFrame::Snapshot(state))) => (handle, state, rx),
        other => panic!("expected snapshot first, got {:?}", other),
    }
}

/// Joins `user` and builds a client mirror from the snapshot it receives.
async fn connect(
    sessions: &SessionManager,
    document: &str,
    user: &str,
) -> (SessionHandle, DiagramStore, Receiver<Outbound>) {
    let (handle, state, rx) = join_raw(sessions, document, user).await;
    let mut mirror = DiagramStore::new(StoreContext {
        user: participant(user),
        view_only: false,
    });
    mirror.apply_server_frame(ServerFrame::Snapshot(state));
    (handle, mirror, rx)
}

fn send(handle: &SessionHandle, mirror: &mut DiagramStore) -> Result<usize, CollabError> {
    match mirror.take_outbox() {
        Some(ClientFrame::Update(update)) => handle.apply(&update),
        _ => Ok(0),
    }
}

fn deliver(rx: &mut Receiver<Outbound>, mirror: &mut DiagramStore) {
    for msg in drain(rx) {
        if let Outbound::Frame(frame) = msg {
            mirror.apply_server_frame(frame);
        }
    }
}

fn relabeled(label: &str) -> NodeBody {
    let mut body = NodeBody::template(NodeKind::Topic, Position::new(0.0, 200.0));
    body.set_label(label);
    body
}

#[tokio::test]
async fn join_sends_snapshot_then_peers() {
    let sessions = manager(MemoryStore::with_template("lp-1"));
    let (_ada, mirror, mut rx) = connect(&sessions, "lp-1", "ada").await;

    assert_eq!(mirror.content(), DiagramContent::template());
    match drain(&mut rx).as_slice() {
        [Outbound::Frame(ServerFrame::Peers { participants })] => {
            assert_eq!(participants, &vec![participant("ada")]);
        }
        other => panic!("unexpected frames: {:?}", other),
    }
}

#[tokio::test]
async fn concurrent_edits_converge() {
    let store = MemoryStore::with_template("lp-1");
    let sessions = manager(store.clone());
    let (ada, mut ada_view, mut ada_rx) = connect(&sessions, "lp-1", "ada").await;
    let (bob, mut bob_view, mut bob_rx) = connect(&sessions, "lp-1", "bob").await;
    drain(&mut ada_rx);

    ada_view.set_label("topic-1", "Ownership").unwrap();
    bob_view
        .add_node(NodeKind::Subtopic, Some(Position::new(-200.0, 150.0)))
        .unwrap();
    bob_view.move_node("topic-1", Position::new(40.0, 220.0)).unwrap();

    send(&ada, &mut ada_view).expect("ada update rejected");
    send(&bob, &mut bob_view).expect("bob update rejected");
    deliver(&mut ada_rx, &mut ada_view);
    deliver(&mut bob_rx, &mut bob_view);

    assert_eq!(ada_view.content(), bob_view.content());
    let topic = ada_view.node("topic-1").unwrap();
    assert_eq!(topic.label(), "Ownership");
    assert_eq!(topic.position, Position::new(40.0, 220.0));
    assert_eq!(ada_view.nodes().len(), 3);

    ada.leave().await;
    bob.leave().await;

    assert!(!sessions.is_resident("lp-1").await);
    assert_eq!(store.content("lp-1"), Some(ada_view.content()));
}

#[tokio::test]
async fn names_with_community_prefix_share_a_session() {
    let sessions = manager(MemoryStore::with_template("lp-1"));
    let (_ada, _, _ada_rx) = connect(&sessions, "lp-1", "ada").await;
    let (_bob, _, _bob_rx) = connect(&sessions, "rustaceans/lp-1", "bob").await;

    let stats = sessions.stats().await;
    assert_eq!(stats.sessions, 1);
    assert_eq!(stats.participants, 2);
}

#[tokio::test]
async fn invalid_update_is_rejected_whole() {
    let sessions = manager(MemoryStore::with_template("lp-1"));
    let (ada, snapshot, mut ada_rx) = join_raw(&sessions, "lp-1", "ada").await;
    let (_bob, _, mut bob_rx) = join_raw(&sessions, "lp-1", "bob").await;
    drain(&mut ada_rx);
    drain(&mut bob_rx);

    // A valid label change next to a field write for a node nobody has.
    let mut forged = DiagramDoc::from_update(&snapshot).unwrap();
    forged.write(&[
        Change::SetBody {
            id: "topic-1".to_string(),
            body: relabeled("Kept locally"),
        },
        Change::SetBody {
            id: "ghost".to_string(),
            body: relabeled("Ghost"),
        },
    ]);

    let result = ada.apply(&forged.encode_state());
    assert!(matches!(
        result,
        Err(CollabError::Rejected(ChangeError::UnknownNode(ref id))) if id == "ghost"
    ));

    let frames = drain(&mut ada_rx);
    assert!(matches!(
        frames.first(),
        Some(Outbound::Frame(ServerFrame::Rejected { .. }))
    ));
    let Some(Outbound::Frame(ServerFrame::Snapshot(state))) = frames.get(1) else {
        panic!("expected a snapshot after the rejection, got {:?}", frames);
    };
    assert!(drain(&mut bob_rx).is_empty());

    let server = DiagramDoc::from_update(state).unwrap();
    assert_eq!(server.node("topic-1").unwrap().label(), "Topic");
    assert!(server.node("ghost").is_none());
}

#[tokio::test]
async fn edit_mark_for_another_user_is_rejected() {
    let sessions = manager(MemoryStore::with_template("lp-1"));
    let (bob, snapshot, mut bob_rx) = join_raw(&sessions, "lp-1", "bob").await;
    drain(&mut bob_rx);

    let mut forged = DiagramDoc::from_update(&snapshot).unwrap();
    let update = forged.write(&[Change::SetEditMark {
        id: "topic-1".to_string(),
        mark: EditMark::held_by("ada", Utc::now()),
    }]);

    assert!(matches!(
        bob.apply(&update),
        Err(CollabError::Rejected(ChangeError::ForeignMark { ref by, .. })) if by == "ada"
    ));

    let mut own = DiagramDoc::from_update(&snapshot).unwrap();
    let update = own.write(&[Change::SetEditMark {
        id: "topic-1".to_string(),
        mark: EditMark::held_by("bob", Utc::now()),
    }]);
    assert_eq!(bob.apply(&update).unwrap(), 1);
}

#[tokio::test]
async fn locked_node_refuses_edits_from_other_users() {
    let sessions = manager(MemoryStore::with_template("lp-1"));
    let (ada, mut ada_view, _ada_rx) = connect(&sessions, "lp-1", "ada").await;
    ada_view.acquire_lock("topic-1").unwrap();
    send(&ada, &mut ada_view).unwrap();

    let (bob, snapshot, _bob_rx) = join_raw(&sessions, "lp-1", "bob").await;

    let mut relabel = DiagramDoc::from_update(&snapshot).unwrap();
    let update = relabel.write(&[Change::SetBody {
        id: "topic-1".to_string(),
        body: relabeled("Mine now"),
    }]);
    assert!(matches!(
        bob.apply(&update),
        Err(CollabError::Rejected(ChangeError::Locked { ref holder, .. })) if holder == "ada"
    ));

    let mut remove = DiagramDoc::from_update(&snapshot).unwrap();
    let update = remove.write(&[Change::RemoveNode {
        id: "topic-1".to_string(),
    }]);
    assert!(matches!(
        bob.apply(&update),
        Err(CollabError::Rejected(ChangeError::Locked { .. }))
    ));

    let mut nudge = DiagramDoc::from_update(&snapshot).unwrap();
    let update = nudge.write(&[Change::MoveNode {
        id: "topic-1".to_string(),
        position: Position::new(30.0, 200.0),
    }]);
    assert_eq!(bob.apply(&update).unwrap(), 1);

    let mut own = DiagramDoc::from_update(&snapshot).unwrap();
    let update = own.write(&[Change::SetBody {
        id: "topic-1".to_string(),
        body: relabeled("Lifetimes"),
    }]);
    assert_eq!(ada.apply(&update).unwrap(), 1);
}

#[tokio::test]
async fn malformed_update_is_rejected() {
    let sessions = manager(MemoryStore::with_template("lp-1"));
    let (ada, _, mut rx) = join_raw(&sessions, "lp-1", "ada").await;
    drain(&mut rx);

    assert!(matches!(
        ada.apply(&[0xff, 0xff, 0xff]),
        Err(CollabError::Rejected(ChangeError::Malformed(_)))
    ));
    assert!(matches!(
        drain(&mut rx).as_slice(),
        [
            Outbound::Frame(ServerFrame::Rejected { .. }),
            Outbound::Frame(ServerFrame::Snapshot(_))
        ]
    ));
}

#[tokio::test]
async fn leaving_releases_the_users_locks() {
    let sessions = manager(MemoryStore::with_template("lp-1"));
    let (ada, mut ada_view, _ada_rx) = connect(&sessions, "lp-1", "ada").await;
    let (_bob, mut bob_view, mut bob_rx) = connect(&sessions, "lp-1", "bob").await;

    ada_view.acquire_lock("topic-1").unwrap();
    send(&ada, &mut ada_view).unwrap();
    deliver(&mut bob_rx, &mut bob_view);
    assert_eq!(bob_view.lock_holder("topic-1").as_deref(), Some("ada"));

    ada.leave().await;
    deliver(&mut bob_rx, &mut bob_view);

    assert!(bob_view.lock_holder("topic-1").is_none());
    assert_eq!(bob_view.peers(), &[participant("bob")]);
}

#[tokio::test]
async fn second_tab_of_same_user_keeps_locks() {
    let sessions = manager(MemoryStore::with_template("lp-1"));
    let (tab1, mut view1, _rx1) = connect(&sessions, "lp-1", "ada").await;
    let (_tab2, mut view2, mut rx2) = connect(&sessions, "lp-1", "ada").await;

    view1.acquire_lock("topic-1").unwrap();
    send(&tab1, &mut view1).unwrap();
    tab1.leave().await;
    deliver(&mut rx2, &mut view2);

    assert_eq!(view2.lock_holder("topic-1").as_deref(), Some("ada"));
}

#[tokio::test]
async fn missing_document_starts_empty_and_is_created_on_leave() {
    let store = Arc::new(MemoryStore::default());
    let sessions = manager(store.clone());
    let (ada, mut view, _rx) = connect(&sessions, "lp-new", "ada").await;
    assert!(view.nodes().is_empty());

    view.add_node(NodeKind::Topic, None).unwrap();
    send(&ada, &mut view).unwrap();
    ada.leave().await;

    let saved = store.content("lp-new").expect("document was not written");
    assert_eq!(saved.nodes.len(), 1);
}

#[tokio::test]
async fn untouched_session_is_released_without_write() {
    let store = MemoryStore::with_template("lp-1");
    let sessions = manager(store.clone());
    let (ada, _, _rx) = connect(&sessions, "lp-1", "ada").await;
    ada.leave().await;

    assert!(!sessions.is_resident("lp-1").await);
    assert_eq!(store.saves.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn load_failure_is_reported_and_not_cached() {
    let store = MemoryStore::with_template("lp-1");
    store.fail_loads.store(true, Ordering::SeqCst);
    let sessions = manager(store.clone());

    let (tx, _rx) = sessions.outbound_channel();
    let result = sessions.join("lp-1", participant("ada"), tx).await;
    assert!(matches!(result, Err(CollabError::StoreUnavailable(_))));
    assert!(!sessions.is_resident("lp-1").await);

    store.fail_loads.store(false, Ordering::SeqCst);
    let (_ada, view, _rx) = connect(&sessions, "lp-1", "ada").await;
    assert_eq!(view.nodes().len(), 2);
}

#[tokio::test]
async fn unknown_document_cannot_be_joined() {
    let store = Arc::new(MemoryStore::default());
    store.refuse_create.store(true, Ordering::SeqCst);
    let sessions = manager(store.clone());

    let (tx, _rx) = sessions.outbound_channel();
    let result = sessions.join("lp-missing", participant("ada"), tx).await;
    assert!(matches!(result, Err(CollabError::NotFound(ref key)) if key == "lp-missing"));
    assert!(!sessions.is_resident("lp-missing").await);
    assert_eq!(sessions.stats().await.participants, 0);
}

#[tokio::test]
async fn failed_final_write_keeps_session_until_flushed() {
    let store = MemoryStore::with_template("lp-1");
    let sessions = manager(store.clone());
    let (ada, mut view, _rx) = connect(&sessions, "lp-1", "ada").await;

    view.set_label("topic-1", "Borrowing").unwrap();
    send(&ada, &mut view).unwrap();

    store.fail_saves.store(true, Ordering::SeqCst);
    ada.leave().await;
    assert!(sessions.is_resident("lp-1").await);
    assert_eq!(store.content("lp-1"), Some(DiagramContent::template()));

    store.fail_saves.store(false, Ordering::SeqCst);
    sessions.flush_all().await;

    assert!(!sessions.is_resident("lp-1").await);
    let saved = store.content("lp-1").unwrap();
    assert_eq!(saved.nodes[1].label(), "Borrowing");
}

#[tokio::test]
async fn periodic_flush_writes_dirty_sessions() {
    let store = MemoryStore::with_template("lp-1");
    let sessions = manager(store.clone());
    let (ada, mut view, _rx) = connect(&sessions, "lp-1", "ada").await;

    view.move_node("start", Position::new(10.0, 10.0)).unwrap();
    send(&ada, &mut view).unwrap();
    sessions.flush_all().await;

    assert!(sessions.is_resident("lp-1").await);
    assert_eq!(store.saves.load(Ordering::SeqCst), 1);
    assert_eq!(
        store.content("lp-1").unwrap().nodes[0].position,
        Position::new(10.0, 10.0)
    );

    sessions.flush_all().await;
    assert_eq!(store.saves.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn abandoned_session_is_dropped_after_repeated_write_failures() {
    let store = MemoryStore::with_template("lp-1");
    let sessions = SessionManager::new(
        store.clone(),
        SessionConfig {
            max_write_failures: 3,
            ..test_config()
        },
    );
    let (ada, mut view, _rx) = connect(&sessions, "lp-1", "ada").await;
    view.set_label("topic-1", "Unsaved").unwrap();
    send(&ada, &mut view).unwrap();

    store.fail_saves.store(true, Ordering::SeqCst);
    ada.leave().await;
    sessions.flush_all().await;
    assert!(sessions.is_resident("lp-1").await);

    sessions.flush_all().await;
    assert!(!sessions.is_resident("lp-1").await);

    store.fail_saves.store(false, Ordering::SeqCst);
    sessions.flush_all().await;
    assert_eq!(store.saves.load(Ordering::SeqCst), 0);
    assert_eq!(store.content("lp-1"), Some(DiagramContent::template()));
}

#[tokio::test]
async fn participant_that_falls_behind_is_dropped() {
    let sessions = SessionManager::new(
        MemoryStore::with_template("lp-1"),
        SessionConfig {
            outbound_capacity: 2,
            ..test_config()
        },
    );
    // Ada never reads: her queue holds her own peers frame, then bob's.
    let (_ada, _, mut ada_rx) = join_raw(&sessions, "lp-1", "ada").await;
    let (bob, mut bob_view, _bob_rx) = connect(&sessions, "lp-1", "bob").await;
    assert_eq!(sessions.stats().await.participants, 2);

    bob_view.move_node("start", Position::new(5.0, 5.0)).unwrap();
    send(&bob, &mut bob_view).unwrap();

    assert_eq!(sessions.stats().await.participants, 1);
    assert_eq!(drain(&mut ada_rx).len(), 2);
    assert!(matches!(ada_rx.try_recv(), Err(TryRecvError::Disconnected)));
}

#[tokio::test]
async fn eviction_closes_participants_without_writing() {
    let store = MemoryStore::with_template("lp-1");
    let sessions = manager(store.clone());
    let (ada, mut view, mut rx) = connect(&sessions, "lp-1", "ada").await;
    drain(&mut rx);

    view.set_label("topic-1", "Doomed").unwrap();
    send(&ada, &mut view).unwrap();

    assert!(sessions.evict("lp-1").await);
    assert!(matches!(
        drain(&mut rx).as_slice(),
        [Outbound::Close { code: CLOSE_DOCUMENT_DELETED, .. }]
    ));
    assert!(matches!(ada.apply(&[]), Err(CollabError::SessionClosed)));

    ada.leave().await;
    assert_eq!(store.saves.load(Ordering::SeqCst), 0);
    assert!(!sessions.evict("lp-1").await);
}

#[tokio::test]
async fn delete_during_slow_flush_is_not_undone() {
    let store = MemoryStore::with_template("lp-1");
    let sessions = manager(store.clone());
    let (ada, mut view, _rx) = connect(&sessions, "lp-1", "ada").await;
    view.set_label("topic-1", "In flight").unwrap();
    send(&ada, &mut view).unwrap();

    store.save_delay_ms.store(200, Ordering::SeqCst);
    let flushing = tokio::spawn({
        let sessions = sessions.clone();
        async move { sessions.flush_all().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (resident, deleted) = sessions
        .evict_while("lp-1", async { store.remove("lp-1") })
        .await;
    assert!(resident);
    assert!(deleted);

    flushing.await.unwrap();
    ada.leave().await;
    sessions.flush_all().await;

    assert_eq!(store.saves.load(Ordering::SeqCst), 1);
    assert_eq!(store.content("lp-1"), None);
    assert!(!sessions.is_resident("lp-1").await);
}

#[tokio::test]
async fn reconcile_pushes_store_writes_to_participants() {
    let sessions = manager(MemoryStore::with_template("lp-1"));
    let (_ada, mut view, mut rx) = connect(&sessions, "lp-1", "ada").await;
    drain(&mut rx);

    let mut content = DiagramContent::template();
    content.nodes.pop();
    content.edges.clear();

    assert_eq!(sessions.reconcile("lp-1", &content).await, 2);
    deliver(&mut rx, &mut view);
    assert_eq!(view.content(), content);

    assert_eq!(sessions.reconcile("lp-1", &content).await, 0);
    assert_eq!(sessions.reconcile("not-open", &content).await, 0);
}
