//! State of one live browser connection.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::backend::PushTarget;
use crate::protocol::ServerEvent;

/// One browser's bidirectional channel.
///
/// Owned by the socket task; the registry only holds `Arc` references.
pub struct ClientConnection {
    pub id: String,
    binding: Mutex<Option<PushTarget>>,
    rooms: Mutex<HashSet<String>>,
    open: AtomicBool,
    tx: mpsc::UnboundedSender<ServerEvent>,
    pub connected_at: Instant,
}

impl ClientConnection {
    pub fn new(tx: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), tx)
    }

    pub fn with_id(id: String, tx: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self {
            id,
            binding: Mutex::new(None),
            rooms: Mutex::new(HashSet::new()),
            open: AtomicBool::new(true),
            tx,
            connected_at: Instant::now(),
        }
    }

    /// Identity bound by a successful login, if any.
    pub fn identity(&self) -> Option<String> {
        self.binding.lock().as_ref().map(|target| target.identity.clone())
    }

    /// Whether the binding is the push target named by `token`.
    pub fn holds_token(&self, token: &str) -> bool {
        self.binding
            .lock()
            .as_ref()
            .is_some_and(|target| target.token == token)
    }

    pub fn bind_identity(&self, target: PushTarget) {
        *self.binding.lock() = Some(target);
    }

    /// Clear the binding and leave every room. Returns the old binding.
    pub fn detach(&self) -> Option<PushTarget> {
        self.rooms.lock().clear();
        self.binding.lock().take()
    }

    pub fn join_room(&self, room: &str) {
        let _ = self.rooms.lock().insert(room.to_string());
    }

    pub fn in_room(&self, room: &str) -> bool {
        self.rooms.lock().contains(room)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Mark closed. Only the first call returns `true`.
    pub fn close(&self) -> bool {
        self.open.swap(false, Ordering::AcqRel)
    }

    /// Queue an event for the writer task.
    ///
    /// Returns `false` without retrying when the connection is closing.
    pub fn send(&self, event: ServerEvent) -> bool {
        if !self.is_open() {
            debug!(conn_id = %self.id, event = event.name(), "dropping event for closed connection");
            return false;
        }
        self.tx.send(event).is_ok()
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
