pub mod chat;
pub mod config;
pub mod error;
pub mod http;
pub mod session;
pub mod transport;

use std::sync::Arc;

pub use error::{AppError, SessionError};
pub type Result<T> = std::result::Result<T, AppError>;
pub use config::Settings;

pub use chat::{ChatMessage, ChatRoom};

/// Application state shared across all components
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub room: Arc<ChatRoom>,
}

impl AppState {
    /// Builds the room and starts its relay worker. Must be called inside a
    /// tokio runtime.
    pub fn new(config: Settings) -> Self {
        let room = ChatRoom::spawn(config.chat.clone(), config.rate.clone());
        Self {
            config: Arc::new(config),
            room,
        }
    }
}
