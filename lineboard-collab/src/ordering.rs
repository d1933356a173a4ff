//! Fractional order keys for board lines.
//!
//! Lines are ordered by a sparse `i64` key. A new line placed after `L`
//! receives a key between `L` and its right neighbour `R`:
//!
//! ```text
//!   L ─────────────── K ──────── R        K = L + ⌊(R - L) · 2/3⌋
//!     (reserve kept                       leaves the larger gap right
//!      for more inserts after L)          after L
//! ```
//!
//! When `R - L <= 1` there is no room. `R` is then moved right by the same
//! rule applied to `(R, R's right neighbour)`, cascading through the packed
//! run until a gap or the tail (`+GAP`) is found. Only that run is renumbered.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};

use crate::protocol::LineId;

/// Spacing used when appending after the last line.
pub const GAP: i64 = 65536;

/// Errors from key allocation. Exhaustion is unreachable while the order keys
/// stay well below `i64::MAX`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderingError {
    #[error("order key {0} is not in the sequence")]
    UnknownKey(i64),
    #[error("order key space exhausted after {0}")]
    KeySpaceExhausted(i64),
}

/// A key allocation: the new key plus every line that had to move, deepest
/// first, so each move is applied before the move that depends on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub key: i64,
    pub renumbered: Vec<(LineId, i64)>,
}

struct Move {
    id: LineId,
    from: i64,
    to: i64,
}

/// Key of a new item between `left` and `right`, or `None` if they are
/// adjacent. `right == None` means `left` is the tail.
pub fn key_between(left: i64, right: Option<i64>) -> Option<i64> {
    match right {
        None => left.checked_add(GAP),
        Some(right) => {
            let delta = i128::from(right) - i128::from(left);
            if delta > 1 {
                // fits: left < result < right
                Some((i128::from(left) + delta * 2 / 3) as i64)
            } else {
                None
            }
        }
    }
}

/// Ordered index of live line keys.
#[derive(Debug, Default, Clone)]
pub struct LineOrder {
    keys: BTreeMap<i64, LineId>,
}

impl LineOrder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Place `id` at `key`. Returns the id previously holding that key.
    pub fn insert(&mut self, key: i64, id: LineId) -> Option<LineId> {
        self.keys.insert(key, id)
    }

    pub fn remove(&mut self, key: i64) -> Option<LineId> {
        self.keys.remove(&key)
    }

    pub fn get(&self, key: i64) -> Option<LineId> {
        self.keys.get(&key).copied()
    }

    /// First live line after `key`.
    pub fn next_after(&self, key: i64) -> Option<(i64, LineId)> {
        self.keys
            .range((Excluded(key), Unbounded))
            .next()
            .map(|(k, id)| (*k, *id))
    }

    /// Ids in order.
    pub fn ids(&self) -> impl Iterator<Item = LineId> + '_ {
        self.keys.values().copied()
    }

    /// `(key, id)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (i64, LineId)> + '_ {
        self.keys.iter().map(|(k, id)| (*k, *id))
    }

    /// Allocate a key directly after the line at `left`, renumbering the
    /// packed run to its right if needed. The new key is not inserted; the
    /// renumbered lines are already moved.
    ///
    /// On error the order is left untouched.
    pub fn allocate_after(&mut self, left: i64) -> Result<Allocation, OrderingError> {
        if !self.keys.contains_key(&left) {
            return Err(OrderingError::UnknownKey(left));
        }
        let mut moves = Vec::new();
        let key = self.release_space(left, &mut moves)?;
        // Deepest first: each line moves into space vacated or never used.
        for mv in &moves {
            self.keys.remove(&mv.from);
            self.keys.insert(mv.to, mv.id);
        }
        Ok(Allocation {
            key,
            renumbered: moves.into_iter().map(|mv| (mv.id, mv.to)).collect(),
        })
    }

    /// Key strictly after `left` and before its right neighbour, planning
    /// (not applying) the moves of any packed neighbours.
    ///
    /// Walks right from `left` over the packed run until a gap or the tail,
    /// then assigns new keys right to left, so `moved` ends up deepest first.
    /// The walk visits each line at most once.
    fn release_space(&self, left: i64, moved: &mut Vec<Move>) -> Result<i64, OrderingError> {
        let mut run: Vec<(LineId, i64)> = Vec::new();
        let mut cursor = left;
        let mut bound = None;
        while let Some((right_key, right_id)) = self.next_after(cursor) {
            if key_between(cursor, Some(right_key)).is_some() {
                bound = Some(right_key);
                break;
            }
            run.push((right_id, right_key));
            cursor = right_key;
        }

        for (id, from) in run.into_iter().rev() {
            let to = key_between(from, bound).ok_or(OrderingError::KeySpaceExhausted(from))?;
            moved.push(Move { id, from, to });
            bound = Some(to);
        }
        key_between(left, bound).ok_or(OrderingError::KeySpaceExhausted(left))
    }
}
