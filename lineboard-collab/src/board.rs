//! A single collaborative board.
//!
//! ```text
//!            ┌──────────────── Mutex<BoardState> ────────────────┐
//!  create ──►│ lines: HashMap<LineId, Line>   (arena + index)    │
//!  delete ──►│ order: LineOrder               (key → id, sorted) │──► ConnectionFanout
//!  write  ──►│ fanout: ConnectionFanout       (peer queues)      │
//!            └───────────────────────────────────────────────────┘
//! ```
//!
//! Every public operation holds the lock for its full duration, broadcast
//! included, so peers observe mutations in lock order and never see half of
//! an insert. Broadcasting only enqueues; it never waits on a socket.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures_util::Sink;
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use crate::fanout::{ConnectionFanout, FanoutStats, Payload, PeerHandle, DEFAULT_QUEUE_CAPACITY};
use crate::ordering::{LineOrder, OrderingError};
use crate::protocol::{BoardId, LineId, LineSnapshot, TOMBSTONE_NUMBER};

/// Id of the line every board starts with.
pub const ROOT_LINE_ID: LineId = Uuid::nil();

/// Which deletions a board refuses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeletePolicy {
    /// The root line is permanent. Every other line may be deleted, so the
    /// board always keeps at least the root.
    #[default]
    ProtectRoot,
    /// Any line, root included, may be deleted while another line remains.
    KeepLastLine,
}

/// Per-board settings.
#[derive(Debug, Clone)]
pub struct BoardConfig {
    /// Pending messages per peer before drops
    pub queue_capacity: usize,
    pub delete_policy: DeletePolicy,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            delete_policy: DeletePolicy::default(),
        }
    }
}

/// Errors returned by board and registry operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BoardError {
    #[error("board {0} does not exist")]
    BoardNotFound(BoardId),
    #[error("line {0} does not exist")]
    LineNotFound(LineId),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("ordering failed: {0}")]
    Ordering(#[from] OrderingError),
}

impl BoardError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::BoardNotFound(_) | Self::LineNotFound(_))
    }
}

#[derive(Debug)]
struct Line {
    id: LineId,
    value: Value,
    number: i64,
}

impl Line {
    fn snapshot(&self) -> LineSnapshot {
        LineSnapshot {
            id: self.id,
            value: self.value.clone(),
            number: self.number,
        }
    }
}

struct BoardState {
    lines: HashMap<LineId, Line>,
    order: LineOrder,
    fanout: ConnectionFanout,
}

impl BoardState {
    fn ordered_snapshots(&self) -> Vec<LineSnapshot> {
        self.order
            .ids()
            .filter_map(|id| self.lines.get(&id))
            .map(Line::snapshot)
            .collect()
    }

    fn broadcast(&mut self, snapshot: &LineSnapshot, excluded: Option<PeerHandle>) {
        match snapshot.encode() {
            Ok(encoded) => {
                let report = self.fanout.deliver_all_except(&Arc::new(encoded), excluded);
                log::trace!(
                    "Line {} broadcast: {} queued, {} dropped",
                    snapshot.id,
                    report.queued,
                    report.dropped
                );
            }
            Err(e) => log::error!("Failed to encode line {}: {e}", snapshot.id),
        }
    }
}

/// One board: its ordered lines and attached peers.
pub struct Board {
    id: BoardId,
    delete_policy: DeletePolicy,
    state: Mutex<BoardState>,
}

impl Board {
    /// Create a board holding only the root line.
    pub fn new(id: BoardId, config: &BoardConfig) -> Self {
        let root = Line {
            id: ROOT_LINE_ID,
            value: Value::Null,
            number: 0,
        };
        let mut order = LineOrder::new();
        order.insert(root.number, root.id);
        let mut lines = HashMap::new();
        lines.insert(root.id, root);

        Self {
            id,
            delete_policy: config.delete_policy,
            state: Mutex::new(BoardState {
                lines,
                order,
                fanout: ConnectionFanout::new(config.queue_capacity),
            }),
        }
    }

    pub fn id(&self) -> BoardId {
        self.id
    }

    pub fn delete_policy(&self) -> DeletePolicy {
        self.delete_policy
    }

    /// Attach a peer. Every live line is queued for it, in order, ahead of any
    /// later broadcast.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime, since the peer's delivery
    /// task is spawned onto the current one.
    pub fn attach<S>(&self, sink: S) -> PeerHandle
    where
        S: Sink<Payload> + Send + 'static,
        S::Error: fmt::Display + Send,
    {
        let mut state = self.state.lock();
        let backlog: Vec<Payload> = state
            .ordered_snapshots()
            .iter()
            .filter_map(|snapshot| match snapshot.encode() {
                Ok(encoded) => Some(Arc::new(encoded)),
                Err(e) => {
                    log::error!("Failed to encode line {}: {e}", snapshot.id);
                    None
                }
            })
            .collect();
        let line_count = backlog.len();
        let handle = state.fanout.register_with_backlog(sink, backlog);
        log::info!("{handle} attached to board {} ({line_count} lines)", self.id);
        handle
    }

    /// Detach a peer. Returns `false` if it was already gone (detached before,
    /// or pruned after a failed write).
    pub fn detach(&self, handle: PeerHandle) -> bool {
        let removed = self.state.lock().fanout.unregister(handle);
        if removed {
            log::info!("{handle} detached from board {}", self.id);
        }
        removed
    }

    /// Insert a line directly after `parent_id` and broadcast it to every
    /// peer except `sender`. Lines pushed right to make room are broadcast to
    /// every peer first.
    pub fn create_line(
        &self,
        parent_id: LineId,
        value: Value,
        sender: Option<PeerHandle>,
    ) -> Result<LineId, BoardError> {
        let mut state = self.state.lock();
        let parent_key = state
            .lines
            .get(&parent_id)
            .map(|line| line.number)
            .ok_or(BoardError::LineNotFound(parent_id))?;

        let allocation = state.order.allocate_after(parent_key)?;
        if !allocation.renumbered.is_empty() {
            log::debug!(
                "Board {}: renumbered {} lines after {parent_id}",
                self.id,
                allocation.renumbered.len()
            );
        }
        let has_peers = state.fanout.peer_count() > 0;
        for (id, key) in &allocation.renumbered {
            let Some(line) = state.lines.get_mut(id) else {
                continue;
            };
            line.number = *key;
            if has_peers {
                let snapshot = line.snapshot();
                state.broadcast(&snapshot, None);
            }
        }

        let line = Line {
            id: Uuid::new_v4(),
            value,
            number: allocation.key,
        };
        let id = line.id;
        let snapshot = line.snapshot();
        state.order.insert(line.number, id);
        state.lines.insert(id, line);
        state.broadcast(&snapshot, sender);

        log::debug!("Board {}: created line {id} after {parent_id}", self.id);
        Ok(id)
    }

    /// Remove a line and broadcast its tombstone to every peer.
    pub fn delete_line(&self, line_id: LineId) -> Result<(), BoardError> {
        let mut state = self.state.lock();
        if !state.lines.contains_key(&line_id) {
            return Err(BoardError::LineNotFound(line_id));
        }
        if state.lines.len() == 1 {
            return Err(BoardError::InvalidState("this is the last line"));
        }
        if self.delete_policy == DeletePolicy::ProtectRoot && line_id == ROOT_LINE_ID {
            return Err(BoardError::InvalidState("the root line cannot be deleted"));
        }

        if let Some(mut line) = state.lines.remove(&line_id) {
            state.order.remove(line.number);
            line.number = TOMBSTONE_NUMBER;
            let snapshot = line.snapshot();
            state.broadcast(&snapshot, None);
        }

        log::debug!("Board {}: deleted line {line_id}", self.id);
        Ok(())
    }

    /// Replace a line's value and broadcast it to every peer except `sender`.
    ///
    /// Unknown lines are ignored and `false` is returned: the edit raced a
    /// deletion.
    pub fn write_value(&self, line_id: LineId, value: Value, sender: Option<PeerHandle>) -> bool {
        let mut state = self.state.lock();
        let Some(line) = state.lines.get_mut(&line_id) else {
            log::debug!("Board {}: ignoring edit to missing line {line_id}", self.id);
            return false;
        };
        line.value = value;
        let snapshot = line.snapshot();
        state.broadcast(&snapshot, sender);
        true
    }

    /// Copies of all live lines in order.
    pub fn lines(&self) -> Vec<LineSnapshot> {
        self.state.lock().ordered_snapshots()
    }

    pub fn line(&self, line_id: LineId) -> Option<LineSnapshot> {
        self.state.lock().lines.get(&line_id).map(Line::snapshot)
    }

    pub fn line_count(&self) -> usize {
        self.state.lock().lines.len()
    }

    pub fn peer_count(&self) -> usize {
        self.state.lock().fanout.peer_count()
    }

    pub fn stats(&self) -> FanoutStats {
        self.state.lock().fanout.stats()
    }
}
