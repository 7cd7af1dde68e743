use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info};
use uuid::Uuid;

use super::ChatMessage;
use crate::error::SessionError;

/// The room's handle on one live session: identity plus its outbound queue.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: Uuid,
    username: String,
    color: String,
    outbound: mpsc::Sender<Arc<ChatMessage>>,
    evicted: Arc<Notify>,
    replayed_through: u64,
}

impl SessionHandle {
    pub fn new(
        username: String,
        color: String,
        outbound: mpsc::Sender<Arc<ChatMessage>>,
        replayed_through: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            username,
            color,
            outbound,
            evicted: Arc::new(Notify::new()),
            replayed_through,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn color(&self) -> &str {
        &self.color
    }

    /// Last archived sequence number this session received through replay.
    pub fn replayed_through(&self) -> u64 {
        self.replayed_through
    }

    /// Queues a message without waiting. A full queue means the peer is not
    /// keeping up and the session has to go.
    pub fn send(&self, message: Arc<ChatMessage>) -> Result<(), SessionError> {
        self.outbound.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => SessionError::Evicted,
            TrySendError::Closed(_) => SessionError::PeerWrite("outbound queue closed".to_string()),
        })
    }

    /// Asks the session's handler to shut down.
    pub fn evict(&self) {
        self.evicted.notify_one();
    }

    /// Resolves once `evict` has been called, including calls made before this one.
    pub async fn evicted(&self) {
        self.evicted.notified().await
    }
}

#[derive(Debug, Default)]
struct Index {
    sessions: HashMap<Uuid, SessionHandle>,
    by_username: HashMap<String, Uuid>,
}

/// Authoritative set of active sessions.
///
/// Both indices are only ever changed together under one write lock.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    index: RwLock<Index>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, session: SessionHandle) -> Result<(), SessionError> {
        let mut index = self.index.write().await;
        if index.by_username.contains_key(&session.username) {
            return Err(SessionError::DuplicateUsername(session.username));
        }

        info!("Registered session {} for {}", session.id, session.username);
        index.by_username.insert(session.username.clone(), session.id);
        index.sessions.insert(session.id, session);
        Ok(())
    }

    /// Removes the session from both indices. Calling it twice is harmless.
    pub async fn unregister(&self, id: &Uuid) -> Option<SessionHandle> {
        let mut index = self.index.write().await;
        let removed = index.sessions.remove(id)?;
        index.by_username.remove(&removed.username);
        debug!("Unregistered session {} for {}", removed.id, removed.username);
        Some(removed)
    }

    /// Point-in-time copy for fan-out; the lock is released before it is used.
    pub async fn snapshot_all(&self) -> Vec<SessionHandle> {
        self.index.read().await.sessions.values().cloned().collect()
    }

    pub async fn get_by_username(&self, username: &str) -> Option<SessionHandle> {
        let index = self.index.read().await;
        index
            .by_username
            .get(username)
            .and_then(|id| index.sessions.get(id))
            .cloned()
    }

    pub async fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.index.read().await.by_username.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.read().await.sessions.is_empty()
    }
}
