//! # lineboard-collab — real-time collaborative line boards
//!
//! A board is an ordered sequence of lines, each holding an opaque JSON
//! value. Peers connected over WebSocket see every change as it happens.
//!
//! Peers can only edit the values of existing lines. Creating boards and
//! creating or deleting lines is a library-only surface: call
//! [`BoardRegistry`] from the embedding process. No HTTP or WebSocket
//! endpoint exposes it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ BoardClient │ ◄─────────────────► │ BoardServer │
//! │ (per user)  │     JSON frames     │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ BoardMirror │                     │BoardRegistry│
//! │ (local)     │                     │  └─ Board   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                   ┌────────┴────────┐
//!                                   │ConnectionFanout │
//!                                   │ (per-peer queue)│
//!                                   └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire frames (`LineEdit` in, `LineSnapshot` out)
//! - [`ordering`] — fractional order keys with cascading renumbering
//! - [`fanout`] — bounded per-peer delivery queues, drop on full
//! - [`board`] — lines, ordering and fan-out under one lock
//! - [`registry`] — board directory shared by the server and admin code
//! - [`server`] — WebSocket server routing `/socket/{board_id}`
//! - [`client`] — WebSocket client with a reconciled local mirror

pub mod protocol;
pub mod ordering;
pub mod fanout;
pub mod board;
pub mod registry;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{BoardId, LineEdit, LineId, LineSnapshot, ProtocolError, TOMBSTONE_NUMBER};
pub use ordering::{Allocation, LineOrder, OrderingError, GAP};
pub use fanout::{
    ConnectionFanout, DeliveryOutcome, FanoutReport, FanoutStats, Payload, PeerHandle,
    DEFAULT_QUEUE_CAPACITY,
};
pub use board::{Board, BoardConfig, BoardError, DeletePolicy, ROOT_LINE_ID};
pub use registry::BoardRegistry;
pub use server::{BoardServer, ServerConfig, ServerError, ServerStats};
pub use client::{BoardClient, BoardEvent, BoardMirror, ClientError, ConnectionState};
