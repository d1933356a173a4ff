//! Board registry: maps board ids to boards.
//!
//! Boards are created on demand and live for the process lifetime. The map
//! lock is held only for lookup and insertion; board operations run after it
//! is released, so boards never contend with each other.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures_util::Sink;
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use crate::board::{Board, BoardConfig, BoardError, ROOT_LINE_ID};
use crate::fanout::{Payload, PeerHandle};
use crate::protocol::{BoardId, LineId};

/// Directory of all boards in the process.
pub struct BoardRegistry {
    boards: RwLock<HashMap<BoardId, Arc<Board>>>,
    config: BoardConfig,
}

impl Default for BoardRegistry {
    fn default() -> Self {
        Self::new(BoardConfig::default())
    }
}

impl BoardRegistry {
    /// Create an empty registry; every board it creates uses `config`.
    pub fn new(config: BoardConfig) -> Self {
        Self {
            boards: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    /// Create an empty board (root line only).
    pub fn create_board(&self) -> BoardId {
        let board = Board::new(Uuid::new_v4(), &self.config);
        let id = board.id();
        self.publish(board);
        log::info!("Created board {id}");
        id
    }

    /// Create a board from ordered values: the first becomes the root line's
    /// value, each following one is inserted after the previous.
    ///
    /// The board is published only once fully built.
    pub fn load_board(&self, values: Vec<Value>) -> Result<BoardId, BoardError> {
        let board = Board::new(Uuid::new_v4(), &self.config);
        let count = values.len();

        let mut values = values.into_iter();
        if let Some(first) = values.next() {
            board.write_value(ROOT_LINE_ID, first, None);
            let mut parent = ROOT_LINE_ID;
            for value in values {
                parent = board.create_line(parent, value, None)?;
            }
        }

        let id = board.id();
        self.publish(board);
        log::info!("Loaded board {id} with {count} lines");
        Ok(id)
    }

    fn publish(&self, board: Board) {
        self.boards.write().insert(board.id(), Arc::new(board));
    }

    pub fn exists(&self, board_id: &BoardId) -> bool {
        self.boards.read().contains_key(board_id)
    }

    /// Look up a board. The returned handle outlives the registry lock.
    pub fn resolve(&self, board_id: &BoardId) -> Result<Arc<Board>, BoardError> {
        self.boards
            .read()
            .get(board_id)
            .cloned()
            .ok_or(BoardError::BoardNotFound(*board_id))
    }

    pub fn create_line(
        &self,
        board_id: &BoardId,
        parent_id: LineId,
        value: Value,
    ) -> Result<LineId, BoardError> {
        self.resolve(board_id)?.create_line(parent_id, value, None)
    }

    pub fn delete_line(&self, board_id: &BoardId, line_id: LineId) -> Result<(), BoardError> {
        self.resolve(board_id)?.delete_line(line_id)
    }

    /// Returns whether the line existed.
    pub fn write_value(
        &self,
        board_id: &BoardId,
        line_id: LineId,
        value: Value,
        sender: Option<PeerHandle>,
    ) -> Result<bool, BoardError> {
        Ok(self.resolve(board_id)?.write_value(line_id, value, sender))
    }

    /// Attach a peer to a board's update stream.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime (see [`Board::attach`]).
    pub fn attach<S>(&self, board_id: &BoardId, sink: S) -> Result<(Arc<Board>, PeerHandle), BoardError>
    where
        S: Sink<Payload> + Send + 'static,
        S::Error: fmt::Display + Send,
    {
        let board = self.resolve(board_id)?;
        let handle = board.attach(sink);
        Ok((board, handle))
    }

    pub fn detach(&self, board_id: &BoardId, handle: PeerHandle) -> Result<bool, BoardError> {
        Ok(self.resolve(board_id)?.detach(handle))
    }

    pub fn board_count(&self) -> usize {
        self.boards.read().len()
    }

    pub fn board_ids(&self) -> Vec<BoardId> {
        self.boards.read().keys().copied().collect()
    }
}
