//! Session module
//!
//! A session is one participant bound to one connection. The handler in
//! `handler` drives the protocol; transports only provide the two halves
//! defined here.

mod handler;

use async_trait::async_trait;

use crate::chat::ChatMessage;
use crate::error::SessionError;

pub use handler::SessionHandler;

/// Identity claimed by a client when it connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub username: String,
    pub color: String,
}

impl Handshake {
    /// Trims both fields; an empty username is not a handshake.
    pub fn parse(username: &str, color: &str) -> Result<Self, SessionError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(SessionError::MalformedHandshake("empty username".to_string()));
        }
        Ok(Self {
            username: username.to_string(),
            color: color.trim().to_string(),
        })
    }
}

/// One unit read from an established session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    /// The peer answered a heartbeat or pinged us; it carries no chat text.
    Alive,
}

/// Inbound half of a connection.
#[async_trait]
pub trait FrameReader: Send {
    /// Reads the first unit of the connection. `Ok(None)` means the peer went
    /// away before saying anything.
    async fn receive_handshake(&mut self) -> Result<Option<Handshake>, SessionError>;

    /// Reads the next unit. `Ok(None)` means a clean close.
    async fn receive_one(&mut self) -> Result<Option<Inbound>, SessionError>;

    /// Whether this transport yields `Inbound::Alive` for heartbeat answers.
    /// Silent peers on transports without it are never timed out once admitted.
    fn proves_liveness(&self) -> bool {
        false
    }
}

/// Outbound half of a connection.
#[async_trait]
pub trait FrameWriter: Send {
    async fn send_one(&mut self, message: &ChatMessage) -> Result<(), SessionError>;

    /// Called periodically while the session is idle on the outbound side.
    async fn heartbeat(&mut self) -> Result<(), SessionError> {
        Ok(())
    }

    async fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_trims_fields() {
        let handshake = Handshake::parse("  alice ", " #ff0000 ").unwrap();
        assert_eq!(handshake, Handshake { username: "alice".into(), color: "#ff0000".into() });
    }

    #[test]
    fn test_handshake_requires_username() {
        assert!(matches!(
            Handshake::parse("   ", "red"),
            Err(SessionError::MalformedHandshake(_))
        ));
        // An empty color is allowed.
        assert!(Handshake::parse("bob", "").is_ok());
    }
}
