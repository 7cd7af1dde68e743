//! Shared chat-room state
//!
//! The room owns the session registry, the recent-history buffer, the
//! rate guard and the publishing side of the relay. Session handlers hold
//! an `Arc<ChatRoom>` and never touch each other's connections.

pub mod history;
pub mod rate_guard;
pub mod registry;
pub mod relay;

use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::info;

use crate::config::{ChatConfig, RateConfig};
use crate::error::SessionError;

pub use history::{Archived, HistoryBuffer};
pub use rate_guard::{RateDecision, RateGuard};
pub use registry::{SessionHandle, SessionRegistry};
pub use relay::{Delivery, Relay, RelayWorker};

pub const SYSTEM_USERNAME: &str = "System";
pub const SYSTEM_COLOR: &str = "#00FF00";

/// One chat line as it travels through the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub username: String,
    pub message: String,
    pub color: String,
    #[serde(rename = "isSystem", default)]
    pub is_system: bool,
}

impl ChatMessage {
    pub fn user(username: &str, message: &str, color: &str) -> Self {
        Self {
            username: username.to_string(),
            message: message.to_string(),
            color: color.to_string(),
            is_system: false,
        }
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self {
            username: SYSTEM_USERNAME.to_string(),
            message: message.into(),
            color: SYSTEM_COLOR.to_string(),
            is_system: true,
        }
    }
}

/// Escapes `<` so no client that renders HTML can be fed markup.
pub fn sanitize(input: &str) -> String {
    input.replace('<', "&lt;")
}

/// What a session gets back from a successful join.
pub struct Admission {
    pub handle: SessionHandle,
    pub outbound: mpsc::Receiver<Arc<ChatMessage>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomStats {
    pub online: usize,
    pub usernames: Vec<String>,
    pub history_len: usize,
}

pub struct ChatRoom {
    config: ChatConfig,
    registry: Arc<SessionRegistry>,
    // Lock order: history before registry.
    history: Mutex<HistoryBuffer>,
    rate_guard: RateGuard,
    relay: Relay,
}

impl ChatRoom {
    /// Builds the room and hands back the relay worker, which the caller must run.
    pub fn new(config: ChatConfig, rate: RateConfig) -> (Arc<Self>, RelayWorker) {
        let registry = Arc::new(SessionRegistry::new());
        let (relay, worker) = Relay::new(registry.clone());
        let room = Self {
            history: Mutex::new(HistoryBuffer::new(config.history_limit)),
            rate_guard: RateGuard::new(rate),
            config,
            registry,
            relay,
        };
        (Arc::new(room), worker)
    }

    /// Builds the room and spawns its relay worker on the current runtime.
    pub fn spawn(config: ChatConfig, rate: RateConfig) -> Arc<Self> {
        let (room, worker) = Self::new(config, rate);
        tokio::spawn(worker.run());
        room
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub fn rate_guard(&self) -> &RateGuard {
        &self.rate_guard
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Registers a new session and queues the history replay for it.
    ///
    /// The replay and the registration happen under the history lock, so the
    /// relay can tell which archived messages the newcomer has already seen.
    pub async fn admit(&self, username: &str, color: &str) -> Result<Admission, SessionError> {
        // Room for a full replay plus the join notice, whatever the configured capacity.
        let capacity = self.config.outbound_queue_capacity.max(self.config.history_limit + 1);
        let (tx, outbound) = mpsc::channel(capacity);

        let history = self.history.lock().await;
        let handle = SessionHandle::new(
            username.to_string(),
            color.to_string(),
            tx,
            history.last_seq(),
        );
        self.registry.register(handle.clone()).await?;

        for archived in history.replay() {
            if let Err(e) = handle.send(archived.message) {
                self.registry.unregister(&handle.id()).await;
                return Err(e);
            }
        }
        drop(history);

        info!("A new user {} has connected to the chat", username);
        self.relay
            .publish(Arc::new(ChatMessage::system(format!("{} has joined the chat.", username))));

        Ok(Admission { handle, outbound })
    }

    /// Archives a user message and hands it to the relay.
    pub async fn archive_and_publish(&self, message: ChatMessage) -> u64 {
        let message = Arc::new(message);
        let mut history = self.history.lock().await;
        let seq = history.append(message.clone());
        // Enqueued under the lock so relay order matches archive order.
        self.relay.publish_archived(seq, message);
        seq
    }

    /// Sends a message to one session only, bypassing history and relay.
    pub fn notify(
        &self,
        session: &SessionHandle,
        message: ChatMessage,
    ) -> Result<(), SessionError> {
        session.send(Arc::new(message))
    }

    /// Tears down a session. Clears the history once nobody is left.
    pub async fn release(&self, session: &SessionHandle) {
        let mut history = self.history.lock().await;
        self.registry.unregister(&session.id()).await;
        let now_empty = self.registry.is_empty().await;
        if now_empty {
            history.clear();
            info!("Room is empty, chat history cleared");
        }
        // Still under the history lock, so a rejoin under the same name
        // cannot be admitted before its old rate state is gone.
        if !self.rate_guard.config().persist_across_sessions {
            self.rate_guard.forget(session.username()).await;
        }
        drop(history);

        info!("User {} has left the chat", session.username());
        if !now_empty {
            self.relay.publish(Arc::new(ChatMessage::system(format!(
                "{} has left the chat.",
                session.username()
            ))));
        }
    }

    pub async fn stats(&self) -> RoomStats {
        let history_len = self.history.lock().await.len();
        let usernames = self.registry.usernames().await;
        RoomStats {
            online: usernames.len(),
            usernames,
            history_len,
        }
    }

    pub async fn replay(&self) -> Vec<Archived> {
        self.history.lock().await.replay()
    }
}
