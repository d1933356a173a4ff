//! WebSocket server routing peers to boards.
//!
//! Architecture:
//! ```text
//! Client A ──┐  /socket/{board_id}
//!             ├── handshake ── BoardRegistry::resolve ── Board
//! Client B ──┘                                            │
//!                                          ┌──────────────┼──────────────┐
//!                                          ▼              ▼              ▼
//!                                    delivery task  delivery task  delivery task
//!                                          │              │              │
//!                                       Client A       Client B       Client C
//! ```
//!
//! Each connection runs two independent loops:
//! - a read loop (this module) decoding `LineEdit` frames into
//!   `Board::write_value`, with the connection itself as the excluded sender
//! - a delivery task (owned by the board's fan-out) writing snapshots out
//!
//! Unknown boards are refused during the handshake with `404 Not Found`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{future, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::board::{Board, BoardConfig};
use crate::fanout::Payload;
use crate::protocol::{BoardId, LineEdit};
use crate::registry::BoardRegistry;

/// Path prefix of the live update endpoint.
pub const SOCKET_PATH_PREFIX: &str = "/socket/";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Settings for every board the server creates
    pub board: BoardConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            board: BoardConfig::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub invalid_messages: u64,
}

/// Lock-free counters behind `ServerStats`.
#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
    total_messages: AtomicU64,
    invalid_messages: AtomicU64,
}

impl AtomicServerStats {
    fn snapshot(&self) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            total_messages: self.total_messages.load(Ordering::Relaxed),
            invalid_messages: self.invalid_messages.load(Ordering::Relaxed),
        }
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

/// Extract the board id from `/socket/{board_id}`.
pub fn board_id_from_path(path: &str) -> Option<BoardId> {
    let id = path.strip_prefix(SOCKET_PATH_PREFIX)?.trim_end_matches('/');
    BoardId::parse_str(id).ok()
}

/// The board server.
pub struct BoardServer {
    config: ServerConfig,
    registry: Arc<BoardRegistry>,
    stats: Arc<AtomicServerStats>,
}

impl BoardServer {
    /// Create a server with its own empty registry.
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(BoardRegistry::new(config.board.clone()));
        Self::with_registry(config, registry)
    }

    /// Create a server over an existing registry, shared with whatever
    /// creates boards and lines.
    pub fn with_registry(config: ServerConfig, registry: Arc<BoardRegistry>) -> Self {
        Self {
            config,
            registry,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Board server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve an already-bound listener forever.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<BoardRegistry>,
        stats: Arc<AtomicServerStats>,
    ) -> Result<(), ServerError> {
        let mut routed: Option<Arc<Board>> = None;
        let route = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let path = request.uri().path();
            match board_id_from_path(path).and_then(|id| registry.resolve(&id).ok()) {
                Some(board) => {
                    routed = Some(board);
                    Ok(response)
                }
                None => {
                    let mut rejection = ErrorResponse::new(Some(format!("no board at {path}")));
                    *rejection.status_mut() = StatusCode::NOT_FOUND;
                    Err(rejection)
                }
            }
        };

        let handshake = tokio_tungstenite::accept_hdr_async(stream, route).await;
        let (ws_stream, board) = match (handshake, routed) {
            (Ok(ws_stream), Some(board)) => (ws_stream, board),
            (Err(_), None) => {
                stats.rejected_connections.fetch_add(1, Ordering::Relaxed);
                log::info!("Rejected connection from {addr}: unknown board");
                return Ok(());
            }
            (Err(e), Some(_)) => return Err(e.into()),
            (Ok(_), None) => return Ok(()),
        };

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let (ws_sender, mut ws_receiver) = ws_stream.split();
        let sink = ws_sender.with(|payload: Payload| {
            future::ready(Ok::<_, tungstenite::Error>(Message::text(payload.as_str().to_owned())))
        });
        let handle = board.attach(sink);
        log::info!("{addr} joined board {} as {handle}", board.id());

        while let Some(msg) = ws_receiver.next().await {
            let frame = match msg {
                Ok(Message::Text(text)) => LineEdit::decode(text.as_str().as_bytes()),
                Ok(Message::Binary(data)) => LineEdit::decode(&data),
                Ok(Message::Close(_)) => {
                    log::info!("Connection closed from {addr}");
                    break;
                }
                // Ping/pong are answered by tungstenite itself.
                Ok(_) => continue,
                Err(e) => {
                    log::warn!("WebSocket error from {addr}: {e}");
                    break;
                }
            };
            stats.total_messages.fetch_add(1, Ordering::Relaxed);

            match frame {
                Ok(edit) => {
                    board.write_value(edit.id, edit.value, Some(handle));
                }
                Err(e) => {
                    stats.invalid_messages.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Ignoring frame from {addr}: {e}");
                }
            }
        }

        board.detach(handle);
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    /// Get server statistics.
    pub fn stats(&self) -> ServerStats {
        self.stats.snapshot()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Registry shared with the administrative layer.
    pub fn registry(&self) -> &Arc<BoardRegistry> {
        &self.registry
    }
}
