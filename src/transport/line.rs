//! Line protocol: `username:color` handshake, then one raw message per line.
//!
//! Outbound user frames are `username:message:color`, system frames are
//! `System: text`.

use std::io;
use std::sync::Arc;
use async_trait::async_trait;
use tokio::io::{
    split, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    ReadHalf, WriteHalf,
};
use tracing::{debug, error, info, warn};

use crate::chat::{ChatMessage, ChatRoom};
use crate::error::SessionError;
use crate::session::{FrameReader, FrameWriter, Handshake, Inbound, SessionHandler};

/// Bytes allowed on top of the worst-case UTF-8 size of a maximal message,
/// for a bridge prefix and surrounding whitespace.
const LINE_SLACK_BYTES: usize = 256;

pub struct LineReader<R> {
    inner: BufReader<R>,
    max_chars: usize,
    max_line_bytes: usize,
    username: Option<String>,
}

/// A line as read off the wire.
#[derive(Debug)]
enum RawLine {
    Complete(String),
    /// Longer than the byte cap; the rest of it was discarded unbuffered.
    Overlong { chars: usize },
}

pub struct LineWriter<W> {
    inner: W,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    /// `max_chars` is the message limit; lines are never buffered beyond what
    /// such a message can take in UTF-8.
    pub fn new(inner: R, max_chars: usize) -> Self {
        Self {
            inner: BufReader::new(inner),
            max_chars,
            max_line_bytes: max_chars.saturating_mul(4).saturating_add(LINE_SLACK_BYTES),
            username: None,
        }
    }

    async fn next_line(&mut self) -> Result<Option<RawLine>, SessionError> {
        let mut buf = Vec::new();
        let read = (&mut self.inner)
            .take(self.max_line_bytes as u64)
            .read_until(b'\n', &mut buf)
            .await
            .map_err(read_error)?;

        if read == 0 {
            return Ok(None);
        }
        if buf.ends_with(b"\n") || read < self.max_line_bytes {
            // Invalid UTF-8 is replaced rather than ending the session.
            return Ok(Some(RawLine::Complete(String::from_utf8_lossy(&buf).into_owned())));
        }

        let chars = char_count(&buf) + self.discard_rest_of_line().await?;
        Ok(Some(RawLine::Overlong { chars }))
    }

    /// Skips input up to and including the next newline, returning how many
    /// characters were dropped.
    async fn discard_rest_of_line(&mut self) -> Result<usize, SessionError> {
        let mut chars = 0;
        loop {
            let available = self.inner.fill_buf().await.map_err(read_error)?;
            if available.is_empty() {
                return Ok(chars);
            }
            let (taken, done) = match available.iter().position(|&b| b == b'\n') {
                Some(pos) => (pos + 1, true),
                None => (available.len(), false),
            };
            chars += char_count(&available[..taken]);
            self.inner.consume(taken);
            if done {
                return Ok(chars);
            }
        }
    }
}

fn read_error(e: io::Error) -> SessionError {
    SessionError::PeerRead(e.to_string())
}

/// Counts characters in UTF-8 input without decoding it; a trailing newline
/// is not counted.
fn char_count(bytes: &[u8]) -> usize {
    let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    bytes.iter().filter(|&&b| b & 0xC0 != 0x80).count()
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

/// Parses a `username:color` handshake line.
pub fn parse_handshake(line: &str) -> Result<Handshake, SessionError> {
    let mut fields = line.trim().split(':');
    match (fields.next(), fields.next()) {
        (Some(username), Some(color)) => Handshake::parse(username, color),
        _ => Err(SessionError::MalformedHandshake(format!(
            "expected username:color, got {:?}",
            line.trim()
        ))),
    }
}

pub fn format_frame(message: &ChatMessage) -> String {
    if message.is_system {
        format!("System: {}\n", message.message)
    } else {
        format!("{}:{}:{}\n", message.username, message.message, message.color)
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameReader for LineReader<R> {
    async fn receive_handshake(&mut self) -> Result<Option<Handshake>, SessionError> {
        let line = match self.next_line().await? {
            None => return Ok(None),
            Some(RawLine::Complete(line)) => line,
            Some(RawLine::Overlong { chars }) => {
                return Err(SessionError::MalformedHandshake(format!(
                    "handshake line of {} characters",
                    chars
                )))
            }
        };
        let handshake = parse_handshake(&line)?;
        self.username = Some(handshake.username.clone());
        Ok(Some(handshake))
    }

    async fn receive_one(&mut self) -> Result<Option<Inbound>, SessionError> {
        loop {
            let line = match self.next_line().await? {
                None => return Ok(None),
                Some(RawLine::Complete(line)) => line,
                Some(RawLine::Overlong { chars }) => {
                    warn!("Discarded a line of {} characters", chars);
                    return Err(SessionError::MessageTooLong {
                        length: chars,
                        max: self.max_chars,
                    });
                }
            };

            let mut text = line.trim();
            if text.is_empty() {
                continue;
            }

            // Bridges prefix each line with the sender's name.
            if let Some(username) = &self.username {
                let prefixed = text.strip_prefix(username.as_str());
                if let Some(rest) = prefixed.and_then(|r| r.strip_prefix(": ")) {
                    text = rest;
                }
            }
            return Ok(Some(Inbound::Text(text.to_string())));
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameWriter for LineWriter<W> {
    async fn send_one(&mut self, message: &ChatMessage) -> Result<(), SessionError> {
        let frame = format_frame(message);
        self.inner
            .write_all(frame.as_bytes())
            .await
            .map_err(|e| SessionError::PeerWrite(e.to_string()))?;
        self.inner
            .flush()
            .await
            .map_err(|e| SessionError::PeerWrite(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.inner.shutdown().await {
            debug!("Error shutting down line connection: {}", e);
        }
    }
}

/// Runs a line-protocol session over any byte stream.
pub async fn handle_stream<S>(
    room: Arc<ChatRoom>,
    stream: S,
    peer: impl Into<String>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half): (ReadHalf<S>, WriteHalf<S>) = split(stream);
    let reader = LineReader::new(read_half, room.config().max_message_chars);
    SessionHandler::new(room, reader, LineWriter::new(write_half), peer)
        .run()
        .await
}

/// Binds the Unix socket, removing a stale socket file first.
#[cfg(unix)]
pub async fn bind_unix(path: &str) -> io::Result<tokio::net::UnixListener> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!("Removed old socket file {}", path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::net::UnixListener::bind(path)
}

/// Accepts line-protocol clients until the listener fails.
#[cfg(unix)]
pub async fn serve_unix(
    listener: tokio::net::UnixListener,
    room: Arc<ChatRoom>,
) -> io::Result<()> {
    info!("Line protocol server listening on {:?}", listener.local_addr()?);
    let mut accepted: u64 = 0;

    loop {
        let (stream, _) = listener.accept().await.map_err(|e| {
            error!("Error accepting connection: {}", e);
            e
        })?;
        accepted += 1;

        let room = room.clone();
        tokio::spawn(async move {
            let _ = handle_stream(room, stream, format!("unix#{}", accepted)).await;
        });
    }
}
