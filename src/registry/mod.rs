//! Session registry: live connection <-> user mapping.
//!
//! The registry is the sole shared mutable structure between session
//! workers and the broker consumer loop. It keeps two indexes under one
//! `RwLock` so either direction of lookup sees a consistent snapshot:
//! connection id to session handle, and user id to the set of that user's
//! live connection ids (a user may hold several sessions at once).
//!
//! No I/O happens under the lock: pushes to a session go through a bounded
//! channel with `try_send`, and lookups clone `Arc` handles out of the map.

use std::collections::{HashMap, HashSet};
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors that can occur during registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("connection '{0}' is already registered")]
    DuplicateSession(ConnectionId),

    #[error("connection '{0}' not found")]
    NotFound(ConnectionId),
}

/// Opaque identifier for one live socket connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a fresh connection id.
    pub fn generate() -> Self {
        Self(format!("conn-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Authenticated user identifier, set once at connect time.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a push into a session's outbound queue failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// Bounded send queue is full (slow client); payload dropped.
    QueueFull,
    /// Session writer has gone away; connection is closing or closed.
    Closed,
}

/// What goes down a session's outbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMessage {
    /// Opaque relayed payload, delivered as a binary frame.
    Payload(Bytes),
    /// Control event (JSON), delivered as a text frame.
    Event(String),
}

/// One live, authenticated socket session.
///
/// The handle carries the bounded sender used to push outbound messages to
/// the session's writer task. `push` never blocks; a slow client fills its
/// own queue without stalling the caller.
#[derive(Debug)]
pub struct SessionHandle {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    tx: mpsc::Sender<SessionMessage>,
}

impl SessionHandle {
    pub fn new(
        connection_id: ConnectionId,
        user_id: UserId,
        tx: mpsc::Sender<SessionMessage>,
    ) -> Self {
        Self {
            connection_id,
            user_id,
            created_at: Utc::now(),
            tx,
        }
    }

    /// Queue a payload for delivery to this session, without blocking.
    pub fn push(&self, payload: Bytes) -> std::result::Result<(), PushError> {
        self.send(SessionMessage::Payload(payload))
    }

    /// Queue a control event for this session, without blocking.
    pub fn notify(&self, event: String) -> std::result::Result<(), PushError> {
        self.send(SessionMessage::Event(event))
    }

    fn send(&self, message: SessionMessage) -> std::result::Result<(), PushError> {
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(PushError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PushError::Closed),
        }
    }
}

#[derive(Default)]
struct Indexes {
    by_connection: HashMap<ConnectionId, std::sync::Arc<SessionHandle>>,
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
}

/// Concurrency-safe bidirectional session index.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<Indexes>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new session.
    ///
    /// Fails with `DuplicateSession` if the connection id is already
    /// present; the earlier session is kept and the later add rejected.
    pub async fn add(&self, handle: SessionHandle) -> Result<std::sync::Arc<SessionHandle>> {
        let mut inner = self.inner.write().await;
        if inner.by_connection.contains_key(&handle.connection_id) {
            return Err(RegistryError::DuplicateSession(handle.connection_id));
        }

        let handle = std::sync::Arc::new(handle);
        inner
            .by_user
            .entry(handle.user_id.clone())
            .or_default()
            .insert(handle.connection_id.clone());
        inner
            .by_connection
            .insert(handle.connection_id.clone(), std::sync::Arc::clone(&handle));
        Ok(handle)
    }

    /// Remove a session. Idempotent: removing an absent connection is a
    /// no-op, which covers the race between an explicit close and a
    /// transport-detected failure both triggering removal.
    pub async fn remove(&self, connection_id: &ConnectionId) {
        let mut inner = self.inner.write().await;
        if let Some(handle) = inner.by_connection.remove(connection_id) {
            if let Some(conns) = inner.by_user.get_mut(&handle.user_id) {
                conns.remove(connection_id);
                if conns.is_empty() {
                    inner.by_user.remove(&handle.user_id);
                }
            }
        }
    }

    /// All live sessions for a user; empty when none.
    pub async fn lookup_by_user(&self, user_id: &UserId) -> Vec<std::sync::Arc<SessionHandle>> {
        let inner = self.inner.read().await;
        match inner.by_user.get(user_id) {
            Some(conns) => conns
                .iter()
                .filter_map(|c| inner.by_connection.get(c).cloned())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Resolve a connection id back to its session.
    pub async fn lookup_by_connection(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<std::sync::Arc<SessionHandle>> {
        let inner = self.inner.read().await;
        inner
            .by_connection
            .get(connection_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(connection_id.clone()))
    }

    /// Snapshot of every live session (broadcast fan-out).
    pub async fn all_sessions(&self) -> Vec<std::sync::Arc<SessionHandle>> {
        let inner = self.inner.read().await;
        inner.by_connection.values().cloned().collect()
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.inner.read().await.by_connection.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Tear down all sessions at shutdown, returning the handles so the
    /// caller can force-close them.
    pub async fn drain(&self) -> Vec<std::sync::Arc<SessionHandle>> {
        let mut inner = self.inner.write().await;
        inner.by_user.clear();
        inner.by_connection.drain().map(|(_, h)| h).collect()
    }
}
