//! Per-peer fan-out with drop-on-full backpressure.
//!
//! Every attached peer owns a small bounded queue and one delivery task that
//! drains it into the peer's connection:
//!
//! ```text
//!             try_send (never blocks)        ┌──────────────┐
//! Board ──┬─► [q: 3] ──► delivery task ──►   │ peer A sink  │
//!  lock   ├─► [q: 3] ──► delivery task ──►   │ peer B sink  │
//!         └─► [q: 3] ──► delivery task ──►   │ peer C sink  │
//!                                            └──────────────┘
//! ```
//!
//! A full or closed queue drops the message for that peer only. The board's
//! critical section never waits on a socket.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;

/// Encoded message shared by every queue it is pushed to.
pub type Payload = Arc<String>;

/// Pending messages per peer before new ones are dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 3;

static NEXT_PEER: AtomicU64 = AtomicU64::new(1);

/// Opaque reference to one attached peer. Unique for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerHandle(u64);

impl PeerHandle {
    fn next() -> Self {
        Self(NEXT_PEER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Result of a single enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Queued,
    /// The peer is behind; the message was dropped.
    QueueFull,
    /// The delivery task exited after a write failure; the peer was pruned.
    Closed,
    UnknownPeer,
}

impl DeliveryOutcome {
    pub fn is_queued(self) -> bool {
        self == Self::Queued
    }
}

/// Summary of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub queued: usize,
    pub dropped: usize,
}

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Sending side of one peer's delivery task.
struct Peer {
    queue: mpsc::Sender<Payload>,
    /// Fired (or dropped) on detach; ends the task even mid-write.
    shutdown: oneshot::Sender<()>,
}

/// The set of delivery queues for one board.
///
/// Not synchronized on its own: the owning board's lock serializes access,
/// which also fixes the order messages enter each queue.
pub struct ConnectionFanout {
    peers: HashMap<PeerHandle, Peer>,
    capacity: usize,
    messages_sent: u64,
    messages_dropped: u64,
}

impl ConnectionFanout {
    /// Create a fan-out whose peers buffer up to `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            peers: HashMap::new(),
            capacity: capacity.max(1),
            messages_sent: 0,
            messages_dropped: 0,
        }
    }

    /// Attach a connection.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime, since the delivery task is
    /// spawned onto the current one.
    pub fn register<S>(&mut self, sink: S) -> PeerHandle
    where
        S: Sink<Payload> + Send + 'static,
        S::Error: fmt::Display + Send,
    {
        self.register_with_backlog(sink, Vec::new())
    }

    /// Attach a connection whose delivery task first writes `backlog`, then
    /// the queue. The backlog does not count against the queue bound.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn register_with_backlog<S>(&mut self, sink: S, backlog: Vec<Payload>) -> PeerHandle
    where
        S: Sink<Payload> + Send + 'static,
        S::Error: fmt::Display + Send,
    {
        let handle = PeerHandle::next();
        let (queue, rx) = mpsc::channel(self.capacity);
        let (shutdown, stop) = oneshot::channel();
        log::debug!("Registering {handle} with {} backlog messages", backlog.len());
        tokio::spawn(deliver(handle, sink, backlog, rx, stop));
        self.peers.insert(handle, Peer { queue, shutdown });
        handle
    }

    /// Detach a connection. Its delivery task stops at once, abandoning any
    /// queued messages and any write in progress, and drops the sink.
    /// Returns whether the peer was still registered.
    pub fn unregister(&mut self, handle: PeerHandle) -> bool {
        match self.peers.remove(&handle) {
            Some(peer) => {
                let _ = peer.shutdown.send(());
                true
            }
            None => false,
        }
    }

    /// Best-effort enqueue to a single peer.
    pub fn deliver_to(&mut self, handle: PeerHandle, payload: Payload) -> DeliveryOutcome {
        let outcome = match self.peers.get(&handle) {
            Some(peer) => try_enqueue(&peer.queue, payload),
            None => return DeliveryOutcome::UnknownPeer,
        };
        self.record(handle, outcome);
        outcome
    }

    /// Best-effort enqueue to every peer except `excluded`.
    pub fn deliver_all_except(
        &mut self,
        payload: &Payload,
        excluded: Option<PeerHandle>,
    ) -> FanoutReport {
        let outcomes: Vec<(PeerHandle, DeliveryOutcome)> = self
            .peers
            .iter()
            .filter(|(handle, _)| Some(**handle) != excluded)
            .map(|(handle, peer)| (*handle, try_enqueue(&peer.queue, payload.clone())))
            .collect();

        let mut report = FanoutReport::default();
        for (handle, outcome) in outcomes {
            if outcome.is_queued() {
                report.queued += 1;
            } else {
                report.dropped += 1;
            }
            self.record(handle, outcome);
        }
        report
    }

    fn record(&mut self, handle: PeerHandle, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Queued => self.messages_sent += 1,
            DeliveryOutcome::QueueFull => {
                self.messages_dropped += 1;
                log::warn!("{handle} is lagging, message dropped");
            }
            DeliveryOutcome::Closed => {
                self.messages_dropped += 1;
                self.peers.remove(&handle);
                log::info!("{handle} connection failed, detached");
            }
            DeliveryOutcome::UnknownPeer => {}
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn has_peer(&self, handle: PeerHandle) -> bool {
        self.peers.contains_key(&handle)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> FanoutStats {
        FanoutStats {
            messages_sent: self.messages_sent,
            messages_dropped: self.messages_dropped,
            active_peers: self.peers.len(),
        }
    }
}

fn try_enqueue(tx: &mpsc::Sender<Payload>, payload: Payload) -> DeliveryOutcome {
    match tx.try_send(payload) {
        Ok(()) => DeliveryOutcome::Queued,
        Err(TrySendError::Full(_)) => DeliveryOutcome::QueueFull,
        Err(TrySendError::Closed(_)) => DeliveryOutcome::Closed,
    }
}

/// Delivery task: backlog first, then the queue, in order, until the queue
/// closes, a write fails or the peer is detached.
async fn deliver<S>(
    handle: PeerHandle,
    sink: S,
    backlog: Vec<Payload>,
    mut rx: mpsc::Receiver<Payload>,
    mut stop: oneshot::Receiver<()>,
) where
    S: Sink<Payload> + Send + 'static,
    S::Error: fmt::Display + Send,
{
    let mut sink = Box::pin(sink);

    let pump = async {
        for payload in backlog {
            if let Err(e) = sink.send(payload).await {
                log::warn!("Initial sync to {handle} failed: {e}");
                return;
            }
        }

        while let Some(payload) = rx.recv().await {
            if let Err(e) = sink.send(payload).await {
                log::warn!("Write to {handle} failed: {e}");
                return;
            }
        }

        let _ = sink.close().await;
    };

    tokio::select! {
        biased;
        _ = &mut stop => log::debug!("Delivery task for {handle} stopped on detach"),
        _ = pump => log::debug!("Delivery task for {handle} finished"),
    }
}
