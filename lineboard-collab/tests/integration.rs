//! Integration tests for end-to-end board updates over WebSocket.
//!
//! These tests start a real server and connect real clients,
//! verifying the full pipeline from registry mutation to client mirror.

use std::sync::Arc;

use futures_util::SinkExt;
use lineboard_collab::board::{BoardConfig, DeletePolicy, ROOT_LINE_ID};
use lineboard_collab::client::{BoardClient, BoardEvent, ClientError, ConnectionState};
use lineboard_collab::protocol::{BoardId, LineEdit, LineId, LineSnapshot};
use lineboard_collab::registry::BoardRegistry;
use lineboard_collab::server::{BoardServer, ServerConfig};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

/// Start a server on a free port, return its URL and registry.
async fn start_test_server(queue_capacity: usize) -> (String, Arc<BoardRegistry>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        board: BoardConfig {
            queue_capacity,
            delete_policy: DeletePolicy::ProtectRoot,
        },
    };
    let server = BoardServer::new(config);
    let registry = server.registry().clone();
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    (format!("ws://127.0.0.1:{port}"), registry)
}

async fn connect(url: &str, board: BoardId) -> (BoardClient, UnboundedReceiver<BoardEvent>) {
    let mut client = BoardClient::connect(url, board).await.unwrap();
    let events = client.take_event_rx().unwrap();
    (client, events)
}

async fn next_line(events: &mut UnboundedReceiver<BoardEvent>) -> LineSnapshot {
    match timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(BoardEvent::Line(snapshot))) => snapshot,
        other => panic!("expected a line snapshot, got {other:?}"),
    }
}

async fn assert_silent(events: &mut UnboundedReceiver<BoardEvent>) {
    let event = timeout(Duration::from_millis(200), events.recv()).await;
    assert!(event.is_err(), "unexpected event: {event:?}");
}

#[tokio::test]
async fn test_snapshot_on_connect() {
    let (url, registry) = start_test_server(3).await;
    let board = registry
        .load_board(vec![json!("a"), json!({"text": "b"}), json!(3)])
        .unwrap();

    let (client, mut events) = connect(&url, board).await;

    // More lines than the queue bound, all delivered, in order.
    let values: Vec<_> = [
        next_line(&mut events).await,
        next_line(&mut events).await,
        next_line(&mut events).await,
    ]
    .into_iter()
    .map(|line| line.value)
    .collect();
    assert_eq!(values, vec![json!("a"), json!({"text": "b"}), json!(3)]);

    let mirrored: Vec<LineId> = client.mirror().await.into_iter().map(|l| l.id).collect();
    let live: Vec<LineId> = registry
        .resolve(&board)
        .unwrap()
        .lines()
        .into_iter()
        .map(|l| l.id)
        .collect();
    assert_eq!(mirrored, live);
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_unknown_board_rejected() {
    let (url, _registry) = start_test_server(3).await;

    match BoardClient::connect(&url, Uuid::new_v4()).await {
        Err(ClientError::Connect(tungstenite::Error::Http(response))) => {
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }
        Err(other) => panic!("expected HTTP 404, got {other}"),
        Ok(_) => panic!("connection to an unknown board should be refused"),
    }

    let malformed = tokio_tungstenite::connect_async(format!("{url}/socket/not-a-uuid")).await;
    assert!(malformed.is_err());
}

#[tokio::test]
async fn test_write_value_excludes_sender() {
    let (url, registry) = start_test_server(3).await;
    let board = registry.create_board();

    let (alice, mut alice_events) = connect(&url, board).await;
    assert_eq!(next_line(&mut alice_events).await.id, ROOT_LINE_ID);
    let (_bob, mut bob_events) = connect(&url, board).await;
    assert_eq!(next_line(&mut bob_events).await.id, ROOT_LINE_ID);

    alice.write_value(ROOT_LINE_ID, json!("X")).await.unwrap();

    let update = next_line(&mut bob_events).await;
    assert_eq!(
        update,
        LineSnapshot {
            id: ROOT_LINE_ID,
            value: json!("X"),
            number: 0,
        }
    );
    assert_silent(&mut alice_events).await;

    let stored = registry.resolve(&board).unwrap().line(ROOT_LINE_ID).unwrap();
    assert_eq!(stored.value, json!("X"));
}

#[tokio::test]
async fn test_admin_changes_reach_clients() {
    let (url, registry) = start_test_server(3).await;
    let board = registry.create_board();

    let (client, mut events) = connect(&url, board).await;
    next_line(&mut events).await;

    let line = registry.create_line(&board, ROOT_LINE_ID, json!("new")).unwrap();
    let created = next_line(&mut events).await;
    assert_eq!(created.id, line);
    assert_eq!(created.value, json!("new"));
    assert_eq!(created.number, lineboard_collab::GAP);
    assert_eq!(client.mirror().await.len(), 2);

    registry.delete_line(&board, line).unwrap();
    let removed = next_line(&mut events).await;
    assert_eq!(removed.id, line);
    assert!(removed.is_tombstone());

    let mirrored = client.mirror().await;
    assert_eq!(mirrored.len(), 1);
    assert_eq!(mirrored[0].id, ROOT_LINE_ID);
    assert!(client.line(&line).await.is_none());
}

#[tokio::test]
async fn test_bad_frames_keep_connection_open() {
    let (url, registry) = start_test_server(3).await;
    let board = registry.create_board();

    let (_observer, mut events) = connect(&url, board).await;
    next_line(&mut events).await;

    let (mut raw, _) = tokio_tungstenite::connect_async(format!("{url}/socket/{board}"))
        .await
        .unwrap();
    raw.send(Message::text("not json".to_string())).await.unwrap();
    raw.send(Message::text(r#"{"value": 1}"#.to_string())).await.unwrap();
    let edit = LineEdit::new(ROOT_LINE_ID, json!("after garbage"));
    raw.send(Message::text(edit.encode().unwrap())).await.unwrap();

    let update = next_line(&mut events).await;
    assert_eq!(update.value, json!("after garbage"));
}

#[tokio::test]
async fn test_unknown_line_edit_is_ignored() {
    let (url, registry) = start_test_server(3).await;
    let board = registry.create_board();

    let (writer, mut writer_events) = connect(&url, board).await;
    next_line(&mut writer_events).await;
    let (_reader, mut reader_events) = connect(&url, board).await;
    next_line(&mut reader_events).await;

    writer.write_value(Uuid::new_v4(), json!("ghost")).await.unwrap();
    assert_silent(&mut reader_events).await;
    assert_eq!(registry.resolve(&board).unwrap().line_count(), 1);
}

#[tokio::test]
async fn test_close_detaches_peer() {
    let (url, registry) = start_test_server(3).await;
    let board = registry.create_board();
    let shared = registry.resolve(&board).unwrap();

    let (client, mut events) = connect(&url, board).await;
    next_line(&mut events).await;
    assert_eq!(shared.peer_count(), 1);

    client.close().await.unwrap();
    let event = timeout(Duration::from_secs(2), events.recv()).await;
    assert!(matches!(event, Ok(Some(BoardEvent::Disconnected))));
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);

    let detached = timeout(Duration::from_secs(2), async {
        while shared.peer_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(detached.is_ok(), "peer still attached after close");
}

#[tokio::test]
async fn test_mirror_converges_through_renumbering() {
    let (url, registry) = start_test_server(4096).await;
    let board = registry.create_board();

    let (client, mut events) = connect(&url, board).await;
    next_line(&mut events).await;

    // Repeated inserts after the root exhaust the gap and force cascades.
    for i in 0..40 {
        registry.create_line(&board, ROOT_LINE_ID, json!(i)).unwrap();
    }
    let live: Vec<LineId> = registry
        .resolve(&board)
        .unwrap()
        .lines()
        .into_iter()
        .map(|l| l.id)
        .collect();

    let converged = timeout(Duration::from_secs(2), async {
        loop {
            let mirrored: Vec<LineId> = client.mirror().await.into_iter().map(|l| l.id).collect();
            if mirrored == live {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(converged.is_ok(), "mirror never matched the board order");
}
