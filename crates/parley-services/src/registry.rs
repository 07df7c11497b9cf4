//! Session registry: who is online and how to reach them.
//!
//! The registry never touches sockets. Each entry holds the sending side of a
//! connection's outbound queue plus an eviction signal; the connection's own
//! handler owns the stream, drains the queue, and removes the entry when it
//! closes.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex, Notify};

// ── Connection identity ───────────────────────────────────────────────────────

/// Process-unique id for one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ── Session handle ────────────────────────────────────────────────────────────

/// Result of offering one frame to a session's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Queue at capacity: the recipient is not keeping up.
    Full,
    /// Writer is gone: the connection is already closing.
    Closed,
}

/// The registry's reference to one live connection.
#[derive(Clone)]
pub struct SessionHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<Bytes>,
    evict: Arc<Notify>,
}

impl SessionHandle {
    /// New handle with a fresh id and an outbound queue of `depth` frames.
    /// The receiver goes to the connection's writer task.
    pub fn with_queue(depth: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (outbound, rx) = mpsc::channel(depth.max(1));
        let handle = Self {
            id: ConnectionId::next(),
            outbound,
            evict: Arc::new(Notify::new()),
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a frame without waiting.
    pub fn try_deliver(&self, frame: Bytes) -> Delivery {
        match self.outbound.try_send(frame) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Ask the owning handler to close. The signal is remembered if the
    /// handler is not waiting yet.
    pub fn evict(&self) {
        self.evict.notify_one();
    }

    /// Resolves once `evict` has been called.
    pub async fn evicted(&self) {
        self.evict.notified().await;
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("queue_capacity", &self.outbound.capacity())
            .finish()
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Username → live session. Shared by every connection task.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace. Returns the handle that was replaced, if any.
    pub async fn register(&self, username: &str, handle: SessionHandle) -> Option<SessionHandle> {
        self.sessions
            .lock()
            .await
            .insert(username.to_string(), handle)
    }

    /// Remove `username` only if it still maps to connection `id`.
    ///
    /// A connection that was replaced by a newer registration under the same
    /// name must not remove the newer entry when it closes.
    pub async fn unregister_if_current(&self, username: &str, id: ConnectionId) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(username) {
            Some(handle) if handle.id == id => {
                sessions.remove(username);
                true
            }
            _ => false,
        }
    }

    /// Every session except `excluded`, copied out under the lock.
    pub async fn snapshot_except(&self, excluded: &str) -> Vec<(String, SessionHandle)> {
        self.sessions
            .lock()
            .await
            .iter()
            .filter(|(name, _)| name.as_str() != excluded)
            .map(|(name, handle)| (name.clone(), handle.clone()))
            .collect()
    }

    /// Visit every session except `excluded`. The lock is released before
    /// the first call to `f`.
    pub async fn for_each_except<F>(&self, excluded: &str, mut f: F)
    where
        F: FnMut(&str, &SessionHandle),
    {
        for (name, handle) in self.snapshot_except(excluded).await {
            f(&name, &handle);
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    pub async fn contains(&self, username: &str) -> bool {
        self.sessions.lock().await.contains_key(username)
    }

    pub async fn current_id(&self, username: &str) -> Option<ConnectionId> {
        self.sessions.lock().await.get(username).map(|h| h.id)
    }

    /// Online usernames, sorted.
    pub async fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        names.sort();
        names
    }
}
