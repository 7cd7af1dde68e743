//! Structured protocol: one JSON record per WebSocket text frame.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::chat::{ChatMessage, ChatRoom};
use crate::error::SessionError;
use crate::session::{FrameReader, FrameWriter, Handshake, Inbound, SessionHandler};

/// Inbound record. Clients send `{username, color}` to join and
/// `{username, message, color}` afterwards; only `message` matters once
/// the session is established.
#[derive(Debug, Deserialize)]
struct InboundRecord {
    username: Option<String>,
    message: Option<String>,
    color: Option<String>,
}

pub struct WsReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
    peer: String,
}

pub struct WsWriter<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

pub fn split<S>(ws: WebSocketStream<S>, peer: &str) -> (WsReader<S>, WsWriter<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (sink, stream) = ws.split();
    (WsReader { stream, peer: peer.to_string() }, WsWriter { sink })
}

impl<S: AsyncRead + AsyncWrite + Unpin> WsReader<S> {
    /// Next text frame or liveness signal. Pings are answered by tungstenite
    /// itself; both directions count as the peer being alive.
    async fn next_inbound(&mut self) -> Result<Option<Inbound>, SessionError> {
        while let Some(message) = self.stream.next().await {
            match message {
                Ok(Message::Text(text)) => return Ok(Some(Inbound::Text(text))),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => return Ok(Some(Inbound::Alive)),
                Ok(Message::Binary(bin)) => {
                    warn!("Ignoring binary frame of {} bytes from {}", bin.len(), self.peer);
                }
                Ok(Message::Close(reason)) => {
                    info!("WebSocket closed from {}: {:?}", self.peer, reason);
                    return Ok(None);
                }
                Ok(_) => {}
                Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => return Ok(None),
                Err(e) => return Err(SessionError::PeerRead(e.to_string())),
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> FrameReader for WsReader<S> {
    async fn receive_handshake(&mut self) -> Result<Option<Handshake>, SessionError> {
        let text = loop {
            match self.next_inbound().await? {
                Some(Inbound::Text(text)) => break text,
                Some(Inbound::Alive) => continue,
                None => return Ok(None),
            }
        };
        let record: InboundRecord = serde_json::from_str(&text)
            .map_err(|e| SessionError::MalformedHandshake(format!("invalid record: {}", e)))?;

        match (record.username, record.color) {
            (Some(username), Some(color)) => Handshake::parse(&username, &color).map(Some),
            (None, _) => Err(SessionError::MalformedHandshake("missing username".to_string())),
            (_, None) => Err(SessionError::MalformedHandshake("missing color".to_string())),
        }
    }

    async fn receive_one(&mut self) -> Result<Option<Inbound>, SessionError> {
        loop {
            let text = match self.next_inbound().await? {
                Some(Inbound::Text(text)) => text,
                other => return Ok(other),
            };

            let record: InboundRecord = match serde_json::from_str(&text) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Failed to parse message from {}: {}", self.peer, e);
                    continue;
                }
            };

            match record.message.as_deref().map(str::trim) {
                Some(message) if !message.is_empty() => {
                    return Ok(Some(Inbound::Text(message.to_string())))
                }
                _ => continue,
            }
        }
    }

    fn proves_liveness(&self) -> bool {
        true
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> FrameWriter for WsWriter<S> {
    async fn send_one(&mut self, message: &ChatMessage) -> Result<(), SessionError> {
        let json = serde_json::to_string(message)
            .map_err(|e| SessionError::PeerWrite(format!("Failed to serialize message: {}", e)))?;
        self.sink
            .send(Message::Text(json))
            .await
            .map_err(|e| SessionError::PeerWrite(e.to_string()))
    }

    async fn heartbeat(&mut self) -> Result<(), SessionError> {
        self.sink
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| SessionError::PeerWrite(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.sink.close().await {
            debug!("Error closing WebSocket connection: {}", e);
        }
    }
}

/// Upgrades one TCP connection and runs a structured-protocol session on it.
pub async fn handle_connection(
    room: Arc<ChatRoom>,
    raw_stream: tokio::net::TcpStream,
    addr: SocketAddr,
) {
    let ws_stream = match tokio_tungstenite::accept_async(raw_stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("Error during WebSocket handshake with {}: {}", addr, e);
            return;
        }
    };

    let peer = addr.to_string();
    let (reader, writer) = split(ws_stream, &peer);
    let _ = SessionHandler::new(room, reader, writer, peer).run().await;
}

/// Accepts WebSocket clients until the listener fails.
pub async fn serve(listener: TcpListener, room: Arc<ChatRoom>) -> io::Result<()> {
    info!("WebSocket server listening on ws://{}", listener.local_addr()?);

    loop {
        let (stream, addr) = listener.accept().await.map_err(|e| {
            error!("Error accepting connection: {}", e);
            e
        })?;
        tokio::spawn(handle_connection(room.clone(), stream, addr));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChatConfig, RateConfig};
    use tokio::io::{duplex, DuplexStream};
    use tokio_tungstenite::tungstenite::protocol::Role;

    type Duplex = WebSocketStream<DuplexStream>;

    async fn pair() -> (Duplex, Duplex) {
        let (a, b) = duplex(4096);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        (server, client)
    }

    #[tokio::test]
    async fn test_handshake_requires_username_and_color() {
        let (server, mut client) = pair().await;
        let (mut reader, _writer) = split(server, "test");

        client.send(Message::Text(r#"{"username":"alice"}"#.into())).await.unwrap();
        assert!(matches!(
            reader.receive_handshake().await,
            Err(SessionError::MalformedHandshake(_))
        ));

        client.send(Message::Text("not json".into())).await.unwrap();
        assert!(matches!(
            reader.receive_handshake().await,
            Err(SessionError::MalformedHandshake(_))
        ));

        client
            .send(Message::Text(r##"{"username":"alice","color":"#61dafb"}"##.into()))
            .await
            .unwrap();
        let handshake = reader.receive_handshake().await.unwrap().unwrap();
        assert_eq!(handshake.color, "#61dafb");
    }

    #[tokio::test]
    async fn test_reader_skips_noise() {
        let (server, mut client) = pair().await;
        let (mut reader, _writer) = split(server, "test");

        client.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
        client.send(Message::Text("garbage".into())).await.unwrap();
        client.send(Message::Text(r#"{"username":"alice","message":"  "}"#.into())).await.unwrap();
        client
            .send(Message::Text(r#"{"username":"mallory","message":"hi","color":"red"}"#.into()))
            .await
            .unwrap();

        assert_eq!(reader.receive_one().await.unwrap(), Some(Inbound::Text("hi".into())));

        client.close(None).await.unwrap();
        assert_eq!(reader.receive_one().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_writer_sends_json_records() {
        let (server, mut client) = pair().await;
        let (_reader, mut writer) = split(server, "test");

        writer.send_one(&ChatMessage::user("alice", "hello", "red")).await.unwrap();

        let Some(Ok(Message::Text(text))) = client.next().await else {
            panic!("expected a text frame");
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["username"], "alice");
        assert_eq!(value["message"], "hello");
        assert_eq!(value["color"], "red");
        assert_eq!(value["isSystem"], false);
    }

    #[tokio::test]
    async fn test_pong_is_reported_as_alive() {
        let (server, mut client) = pair().await;
        let (mut reader, _writer) = split(server, "test");

        client.send(Message::Pong(Vec::new())).await.unwrap();
        assert_eq!(reader.receive_one().await.unwrap(), Some(Inbound::Alive));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_client_answering_pings_stays_connected() {
        let config = ChatConfig { idle_timeout_secs: 45, ..ChatConfig::default() };
        let room = ChatRoom::spawn(config, RateConfig::default());
        let (server, mut client) = pair().await;
        let (reader, writer) = split(server, "silent");
        let handler = SessionHandler::new(room.clone(), reader, writer, "silent");
        let session = tokio::spawn(handler.run());

        let handshake = r##"{"username":"alice","color":"#61dafb"}"##;
        client.send(Message::Text(handshake.into())).await.unwrap();

        // Reading lets tungstenite answer each ping.
        let mut pings = 0;
        let _ = tokio::time::timeout(std::time::Duration::from_secs(100), async {
            while let Some(Ok(message)) = client.next().await {
                if message.is_ping() {
                    pings += 1;
                }
            }
        })
        .await;

        assert!(pings >= 2);
        assert!(!session.is_finished());
        assert_eq!(room.stats().await.usernames, vec!["alice"]);
    }
}
