//! WebSocket gateway: join, relay, auth close codes and frame handling.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pathsync::api::{create_router, AppState};
use pathsync::auth::{AuthConfig, Claims};
use pathsync::client::{DiagramStore, StoreContext};
use pathsync::collab::{ClientFrame, DiagramDoc, Participant, ServerFrame, SessionConfig};
use pathsync::db::Database;
use pathsync::models::*;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SECRET: &str = "ws-secret";

/// Starts the server on a random port with one template diagram for `lp-1`.
async fn start_test_server(auth: AuthConfig) -> SocketAddr {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let db = Database::open(tmp_dir.path().join("pathsync.db")).expect("Failed to open store");
    db.migrate().expect("Failed to migrate");
    db.create_diagram_for_learning_path("lp-1", Some("Rust"))
        .expect("Failed to seed diagram");

    let state = AppState::new(db, auth, SessionConfig::default());
    let app = create_router(state, vec![]);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
        let _keep = tmp_dir;
    });

    addr
}

fn token(sub: &str, community: Option<&str>) -> String {
    AuthConfig::with_secret(SECRET, vec![])
        .issue(&Claims::new(sub, &format!("{}@example.com", sub), community, 3600))
        .expect("Failed to sign token")
}

async fn open(addr: SocketAddr, path: &str) -> Socket {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}{}", addr, path))
        .await
        .expect("Failed to connect");
    ws
}

/// Next server frame, skipping control messages.
async fn next_frame(ws: &mut Socket) -> ServerFrame {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("Timed out waiting for frame")
            .expect("Stream ended")
            .expect("Receive failed");
        match msg {
            Message::Binary(data) => return ServerFrame::decode(&data).expect("Bad frame"),
            Message::Close(frame) => panic!("unexpected close: {:?}", frame),
            _ => continue,
        }
    }
}

/// Reads until the server closes and returns the close code.
async fn close_code(ws: &mut Socket) -> Option<u16> {
    loop {
        match tokio::time::timeout(Duration::from_secs(2), ws.next()).await {
            Ok(Some(Ok(Message::Close(frame)))) => return frame.map(|f| u16::from(f.code)),
            Ok(Some(Ok(_))) => continue,
            _ => return None,
        }
    }
}

async fn send_frame(ws: &mut Socket, frame: &ClientFrame) {
    let bytes = frame.encode().expect("Encode failed");
    ws.send(Message::Binary(bytes.into())).await.expect("Send failed");
}

fn mirror(user: &str) -> DiagramStore {
    DiagramStore::new(StoreContext {
        user: Participant {
            user_id: user.to_string(),
            name: user.to_string(),
        },
        view_only: false,
    })
}

#[tokio::test]
async fn join_receives_stored_snapshot() {
    let addr = start_test_server(AuthConfig::disabled()).await;
    let mut ws = open(addr, "/ws/lp-1").await;

    match next_frame(&mut ws).await {
        ServerFrame::Snapshot(state) => assert_eq!(
            DiagramDoc::from_update(&state).unwrap().content(),
            DiagramContent::template()
        ),
        other => panic!("expected snapshot, got {:?}", other),
    }
    assert!(matches!(next_frame(&mut ws).await, ServerFrame::Peers { .. }));
}

#[tokio::test]
async fn updates_are_relayed_to_other_participants() {
    let addr = start_test_server(AuthConfig::disabled()).await;

    let mut ada_ws = open(addr, "/ws/lp-1").await;
    let mut ada = mirror("ada");
    ada.apply_server_frame(next_frame(&mut ada_ws).await);
    next_frame(&mut ada_ws).await;

    let mut bob_ws = open(addr, "/ws/community/lp-1").await;
    let mut bob = mirror("bob");
    bob.apply_server_frame(next_frame(&mut bob_ws).await);
    next_frame(&mut bob_ws).await;
    // ada learns about the second participant
    assert!(matches!(next_frame(&mut ada_ws).await, ServerFrame::Peers { .. }));

    ada.set_label("topic-1", "Fearless concurrency").unwrap();
    let frame = ada.take_outbox().unwrap();
    send_frame(&mut ada_ws, &frame).await;

    let update = next_frame(&mut bob_ws).await;
    assert!(matches!(update, ServerFrame::Update(_)));
    bob.apply_server_frame(update);
    assert_eq!(bob.node("topic-1").unwrap().label(), "Fearless concurrency");
}

#[tokio::test]
async fn ping_frame_gets_pong() {
    let addr = start_test_server(AuthConfig::disabled()).await;
    let mut ws = open(addr, "/ws/lp-1").await;
    next_frame(&mut ws).await;
    next_frame(&mut ws).await;

    send_frame(&mut ws, &ClientFrame::Ping).await;
    assert_eq!(next_frame(&mut ws).await, ServerFrame::Pong);
}

#[tokio::test]
async fn malformed_frame_is_rejected_without_closing() {
    let addr = start_test_server(AuthConfig::disabled()).await;
    let mut ws = open(addr, "/ws/lp-1").await;
    next_frame(&mut ws).await;
    next_frame(&mut ws).await;

    ws.send(Message::Binary(b"\x02{not json".to_vec().into()))
        .await
        .unwrap();
    assert!(matches!(
        next_frame(&mut ws).await,
        ServerFrame::Rejected { .. }
    ));

    send_frame(&mut ws, &ClientFrame::Ping).await;
    assert_eq!(next_frame(&mut ws).await, ServerFrame::Pong);
}

#[tokio::test]
async fn missing_token_closes_with_4401() {
    let addr = start_test_server(AuthConfig::with_secret(SECRET, vec![])).await;
    let mut ws = open(addr, "/ws/lp-1").await;
    assert_eq!(close_code(&mut ws).await, Some(4401));
}

#[tokio::test]
async fn query_token_is_accepted() {
    let addr = start_test_server(AuthConfig::with_secret(SECRET, vec![])).await;
    let path = format!("/ws/lp-1?token={}", token("ada", None));
    let mut ws = open(addr, &path).await;
    assert!(matches!(
        next_frame(&mut ws).await,
        ServerFrame::Snapshot(_)
    ));
}

#[tokio::test]
async fn foreign_community_closes_with_4403() {
    let addr = start_test_server(AuthConfig::with_secret(SECRET, vec![])).await;
    let path = format!("/ws/rustaceans/lp-1?token={}", token("ada", Some("gophers")));
    let mut ws = open(addr, &path).await;
    assert_eq!(close_code(&mut ws).await, Some(4403));
}

#[tokio::test]
async fn own_community_is_allowed() {
    let addr = start_test_server(AuthConfig::with_secret(SECRET, vec![])).await;
    let path = format!("/ws/rustaceans/lp-1?token={}", token("ada", Some("rustaceans")));
    let mut ws = open(addr, &path).await;
    assert!(matches!(
        next_frame(&mut ws).await,
        ServerFrame::Snapshot(_)
    ));
}

#[tokio::test]
async fn unknown_document_closes_with_4404() {
    let addr = start_test_server(AuthConfig::disabled()).await;
    let mut ws = open(addr, "/ws/lp-unknown").await;
    assert_eq!(close_code(&mut ws).await, Some(4404));
}

#[tokio::test]
async fn update_touching_a_locked_node_is_rejected() {
    let addr = start_test_server(AuthConfig::disabled()).await;

    let mut ada_ws = open(addr, "/ws/lp-1").await;
    let mut ada = mirror("ada");
    ada.apply_server_frame(next_frame(&mut ada_ws).await);
    next_frame(&mut ada_ws).await;
    ada.acquire_lock("topic-1").unwrap();
    send_frame(&mut ada_ws, &ada.take_outbox().unwrap()).await;
    // Frames are handled in order, so the pong means the lock is merged.
    send_frame(&mut ada_ws, &ClientFrame::Ping).await;
    assert_eq!(next_frame(&mut ada_ws).await, ServerFrame::Pong);

    let mut bob_ws = open(addr, "/ws/lp-1").await;
    let ServerFrame::Snapshot(state) = next_frame(&mut bob_ws).await else {
        panic!("expected snapshot");
    };
    next_frame(&mut bob_ws).await;

    let mut forged = DiagramDoc::from_update(&state).unwrap();
    let update = forged.write(&[pathsync::collab::Change::RemoveNode {
        id: "topic-1".to_string(),
    }]);
    send_frame(&mut bob_ws, &ClientFrame::Update(update)).await;

    assert!(matches!(
        next_frame(&mut bob_ws).await,
        ServerFrame::Rejected { .. }
    ));
    let ServerFrame::Snapshot(state) = next_frame(&mut bob_ws).await else {
        panic!("expected snapshot after rejection");
    };
    assert!(DiagramDoc::from_update(&state).unwrap().node("topic-1").is_some());
}
