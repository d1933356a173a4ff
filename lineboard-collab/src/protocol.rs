//! JSON wire protocol between peers and boards.
//!
//! Inbound (peer → board), one text frame per edit:
//! ```text
//! { "id": "<line uuid>", "value": <any JSON> }
//! ```
//!
//! Outbound (board → peers), one text frame per line snapshot:
//! ```text
//! { "id": "<line uuid>", "value": <any JSON>, "number": <order key | -1> }
//! ```
//!
//! A snapshot with `number == -1` is a tombstone: the line was deleted and
//! will never be reported again.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifier of a line within a board.
pub type LineId = Uuid;

/// Identifier of a board within a registry.
pub type BoardId = Uuid;

/// Order key carried by the final snapshot of a deleted line.
pub const TOMBSTONE_NUMBER: i64 = -1;

/// A peer's request to replace the value of one line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineEdit {
    pub id: LineId,
    /// Missing values decode as `null`.
    #[serde(default)]
    pub value: Value,
}

impl LineEdit {
    pub fn new(id: LineId, value: Value) -> Self {
        Self { id, value }
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a text or binary frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Copy of a line as broadcast to peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineSnapshot {
    pub id: LineId,
    pub value: Value,
    pub number: i64,
}

impl LineSnapshot {
    pub fn is_tombstone(&self) -> bool {
        self.number == TOMBSTONE_NUMBER
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}
