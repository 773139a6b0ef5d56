//! Handle to one live transport connection.
//!
//! The transport task owns the socket; everyone else talks to the peer by
//! pushing frames into a bounded queue through this handle. A push never
//! waits: a full or closed queue counts as a failed delivery.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use parley_core::ConnectionId;
use tokio::sync::mpsc;

use crate::protocol::ServerMessage;

/// A connected peer, as seen by the router.
pub struct ClientConnection {
    id: ConnectionId,
    tx: mpsc::Sender<Arc<String>>,
    connected_at: Instant,
    closed: AtomicBool,
    is_alive: AtomicBool,
    last_seen: Mutex<Instant>,
    dropped_messages: AtomicU64,
}

impl ClientConnection {
    /// Wrap an outbound queue, minting a fresh connection ID.
    pub fn new(tx: mpsc::Sender<Arc<String>>) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::new(),
            tx,
            connected_at: now,
            closed: AtomicBool::new(false),
            is_alive: AtomicBool::new(true),
            last_seen: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Create a connection together with the receiving end of its queue.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Server-assigned identity.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Queue a frame for the peer.
    ///
    /// Returns `false` when the connection is closed or its queue is full,
    /// and counts the frame as dropped.
    pub fn send(&self, frame: Arc<String>) -> bool {
        if !self.is_closed() && self.tx.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Serialize and queue a server message.
    pub fn send_message(&self, message: &ServerMessage) -> bool {
        match message.to_frame() {
            Ok(frame) => self.send(frame),
            Err(_) => false,
        }
    }

    /// Frames refused so far.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Stop accepting frames. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }

    /// Record inbound activity (a pong or any frame).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_seen.lock() = Instant::now();
    }

    /// Check and reset the alive flag; `true` if there was activity since
    /// the previous check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Time since the last inbound activity.
    pub fn last_seen_elapsed(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .field("dropped_messages", &self.drop_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_reaches_queue() {
        let (conn, mut rx) = ClientConnection::channel(8);
        assert!(conn.send(Arc::new("hello".into())));
        assert_eq!(rx.recv().await.unwrap().as_str(), "hello");
        assert_eq!(conn.drop_count(), 0);
    }

    #[test]
    fn full_queue_drops() {
        let (conn, _rx) = ClientConnection::channel(1);
        assert!(conn.send(Arc::new("one".into())));
        assert!(!conn.send(Arc::new("two".into())));
        assert_eq!(conn.drop_count(), 1);
    }

    #[test]
    fn dropped_receiver_counts_as_closed() {
        let (conn, rx) = ClientConnection::channel(8);
        drop(rx);
        assert!(conn.is_closed());
        assert!(!conn.send(Arc::new("late".into())));
    }

    #[test]
    fn close_refuses_further_frames() {
        let (conn, _rx) = ClientConnection::channel(8);
        conn.close();
        conn.close();
        assert!(conn.is_closed());
        assert!(!conn.send(Arc::new("late".into())));
        assert_eq!(conn.drop_count(), 1);
    }

    #[tokio::test]
    async fn send_message_serializes() {
        let (conn, mut rx) = ClientConnection::channel(8);
        assert!(conn.send_message(&ServerMessage::Registered {
            success: true,
            client_id: "alice".into(),
        }));
        let frame = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "registered");
        assert_eq!(value["clientId"], "alice");
    }

    #[test]
    fn ids_are_distinct() {
        let (a, _ra) = ClientConnection::channel(1);
        let (b, _rb) = ClientConnection::channel(1);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn check_alive_resets() {
        let (conn, _rx) = ClientConnection::channel(1);
        assert!(conn.check_alive());
        assert!(!conn.check_alive());
        conn.mark_alive();
        assert!(conn.check_alive());
        assert!(conn.last_seen_elapsed() < Duration::from_secs(5));
    }
}
