//! WebSocket client for a single board.
//!
//! Provides:
//! - Connection to `/socket/{board_id}`
//! - A local mirror reconciled from every snapshot the board sends
//! - Value edits for existing lines

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::protocol::{BoardId, LineEdit, LineId, LineSnapshot, ProtocolError};
use crate::server::SOCKET_PATH_PREFIX;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Events emitted by the board client.
#[derive(Debug, Clone, PartialEq)]
pub enum BoardEvent {
    /// A line snapshot arrived (already applied to the mirror)
    Line(LineSnapshot),
    /// Connection lost
    Disconnected,
}

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connect(#[from] tungstenite::Error),
    #[error("connection closed")]
    ConnectionClosed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Local copy of a board, rebuilt from snapshots.
///
/// Lines are matched by id: a tombstone removes the line (and is ignored
/// for an id never seen), anything else inserts or replaces it.
#[derive(Debug, Clone, Default)]
pub struct BoardMirror {
    lines: HashMap<LineId, LineSnapshot>,
}

impl BoardMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one snapshot. Returns whether the mirror changed.
    pub fn apply(&mut self, snapshot: LineSnapshot) -> bool {
        if snapshot.is_tombstone() {
            return self.lines.remove(&snapshot.id).is_some();
        }
        match self.lines.get(&snapshot.id) {
            Some(current) if *current == snapshot => false,
            _ => {
                self.lines.insert(snapshot.id, snapshot);
                true
            }
        }
    }

    /// Lines in order key order.
    pub fn lines(&self) -> Vec<LineSnapshot> {
        let mut lines: Vec<LineSnapshot> = self.lines.values().cloned().collect();
        lines.sort_by_key(|line| line.number);
        lines
    }

    pub fn get(&self, id: &LineId) -> Option<&LineSnapshot> {
        self.lines.get(id)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// A live connection to one board.
pub struct BoardClient {
    board_id: BoardId,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Mirror kept current by the reader task
    mirror: Arc<RwLock<BoardMirror>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: mpsc::Sender<Message>,

    /// Event receiver for the application
    event_rx: Option<mpsc::UnboundedReceiver<BoardEvent>>,
}

impl BoardClient {
    /// Connect to `{server_url}/socket/{board_id}`.
    ///
    /// Spawns background tasks for reading and writing WebSocket messages.
    /// An unknown board fails the handshake with `ClientError::Connect`.
    pub async fn connect(server_url: &str, board_id: BoardId) -> Result<Self, ClientError> {
        let url = format!(
            "{}{SOCKET_PATH_PREFIX}{board_id}",
            server_url.trim_end_matches('/')
        );
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        log::debug!("Connected to {url}");

        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let state = Arc::new(RwLock::new(ConnectionState::Connected));
        let mirror = Arc::new(RwLock::new(BoardMirror::new()));
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // Writer task: forward outgoing channel to WebSocket
        let (outgoing_tx, mut out_rx) = mpsc::channel::<Message>(256);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        // Reader task: reconcile snapshots into the mirror
        let reader_state = state.clone();
        let reader_mirror = mirror.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let decoded = match msg {
                    Ok(Message::Text(text)) => LineSnapshot::decode(text.as_str().as_bytes()),
                    Ok(Message::Binary(data)) => LineSnapshot::decode(&data),
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match decoded {
                    Ok(snapshot) => {
                        reader_mirror.write().await.apply(snapshot.clone());
                        let _ = event_tx.send(BoardEvent::Line(snapshot));
                    }
                    Err(e) => log::warn!("Ignoring snapshot: {e}"),
                }
            }

            // Connection lost
            *reader_state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(BoardEvent::Disconnected);
        });

        Ok(Self {
            board_id,
            state,
            mirror,
            outgoing_tx,
            event_rx: Some(event_rx),
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<BoardEvent>> {
        self.event_rx.take()
    }

    /// Replace the value of an existing line. Other peers see the change;
    /// this client's mirror does not, since the board never echoes to the
    /// sender.
    pub async fn write_value(&self, line_id: LineId, value: Value) -> Result<(), ClientError> {
        let encoded = LineEdit::new(line_id, value).encode()?;
        self.outgoing_tx
            .send(Message::text(encoded))
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Current mirrored lines in order.
    pub async fn mirror(&self) -> Vec<LineSnapshot> {
        self.mirror.read().await.lines()
    }

    /// One mirrored line.
    pub async fn line(&self, id: &LineId) -> Option<LineSnapshot> {
        self.mirror.read().await.get(id).cloned()
    }

    /// Send a close frame. The reader task emits `BoardEvent::Disconnected`
    /// once the server acknowledges.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.outgoing_tx
            .send(Message::Close(None))
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Get the board ID.
    pub fn board_id(&self) -> BoardId {
        self.board_id
    }
}
