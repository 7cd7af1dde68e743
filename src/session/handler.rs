use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{FrameReader, FrameWriter, Inbound};
use crate::chat::{sanitize, Admission, ChatMessage, ChatRoom, RateDecision, SessionHandle};
use crate::error::SessionError;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Drives one connection through handshake, active chat and teardown.
///
/// Reading happens on the caller's task; writing happens on a dedicated task
/// fed by the session's outbound queue, so a slow peer only ever stalls
/// itself.
pub struct SessionHandler<R, W> {
    room: Arc<ChatRoom>,
    reader: R,
    writer: W,
    peer: String,
}

enum Event {
    Frame(Result<Option<Inbound>, SessionError>),
    Evicted,
    WriterFinished(Result<(), SessionError>),
}

impl<R, W> SessionHandler<R, W>
where
    R: FrameReader,
    W: FrameWriter + 'static,
{
    pub fn new(room: Arc<ChatRoom>, reader: R, writer: W, peer: impl Into<String>) -> Self {
        Self {
            room,
            reader,
            writer,
            peer: peer.into(),
        }
    }

    /// Runs the session to completion. `Ok(())` is a clean close by the peer;
    /// any error is the reason the session ended.
    pub async fn run(self) -> Result<(), SessionError> {
        let Self { room, mut reader, mut writer, peer } = self;
        let handshake_deadline = room.config().idle_timeout();
        let idle = if reader.proves_liveness() {
            handshake_deadline
        } else {
            None
        };
        info!("New connection established from {}", peer);

        let handshake = match with_deadline(handshake_deadline, reader.receive_handshake()).await {
            Ok(Some(handshake)) => handshake,
            Ok(None) => {
                info!("Connection closed by client {} before handshake", peer);
                writer.close().await;
                return Ok(());
            }
            Err(e) => {
                warn!("Invalid user info from client {}: {}", peer, e);
                writer.close().await;
                return Err(e);
            }
        };

        let Admission { handle, outbound } =
            match room.admit(&handshake.username, &handshake.color).await {
                Ok(admission) => admission,
                Err(e) => {
                    warn!("Rejected {} from {}: {}", handshake.username, peer, e);
                    let notice = ChatMessage::system(notice_for(&e));
                    if let Err(send_err) = writer.send_one(&notice).await {
                        debug!("Could not deliver rejection to {}: {}", peer, send_err);
                    }
                    writer.close().await;
                    return Err(e);
                }
            };

        let mut writer_task: JoinHandle<Result<(), SessionError>> =
            tokio::spawn(write_loop(writer, outbound));
        let mut writer_finished = false;

        let outcome = loop {
            let event = tokio::select! {
                _ = handle.evicted() => Event::Evicted,
                result = &mut writer_task, if !writer_finished => Event::WriterFinished(
                    result.unwrap_or_else(|e| Err(SessionError::PeerWrite(e.to_string()))),
                ),
                frame = with_deadline(idle, reader.receive_one()) => Event::Frame(frame),
            };

            match event {
                Event::Frame(Ok(Some(Inbound::Text(text)))) => {
                    if let Err(e) = process(&room, &handle, text).await {
                        if let Err(e) = reject(&room, &handle, e) {
                            break Err(e);
                        }
                    }
                }
                // A fresh deadline starts with the next iteration.
                Event::Frame(Ok(Some(Inbound::Alive))) => {}
                Event::Frame(Ok(None)) => break Ok(()),
                Event::Frame(Err(e)) => {
                    if let Err(e) = reject(&room, &handle, e) {
                        break Err(e);
                    }
                }
                Event::Evicted => break Err(SessionError::Evicted),
                Event::WriterFinished(result) => {
                    writer_finished = true;
                    break result;
                }
            }
        };

        match &outcome {
            Ok(()) => info!("Connection closed by client {}", peer),
            Err(SessionError::IdleTimeout(limit)) => {
                info!("Closing idle connection {} after {:?}", peer, limit)
            }
            Err(e) => error!("Session {} from {} ended: {}", handle.username(), peer, e),
        }

        room.release(&handle).await;
        drop(handle);

        if !writer_finished {
            if matches!(outcome, Err(SessionError::Evicted)) {
                writer_task.abort();
            } else if timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task).await.is_err() {
                warn!("Writer for {} did not drain in time", peer);
                writer_task.abort();
            }
        }

        outcome
    }
}

/// Validates, sanitizes and rate-checks one inbound text, then archives and
/// relays it.
async fn process(
    room: &ChatRoom,
    handle: &SessionHandle,
    text: String,
) -> Result<(), SessionError> {
    let max = room.config().max_message_chars;
    let length = text.chars().count();
    if length > max {
        return Err(SessionError::MessageTooLong { length, max });
    }

    match room.rate_guard().check(handle.username()).await {
        RateDecision::Allowed => {}
        RateDecision::Throttled { retry_after } | RateDecision::Suspended { retry_after } => {
            return Err(SessionError::RateLimited { retry_after });
        }
    }

    debug!("{} sent message: \"{}\"", handle.username(), text);
    let message = ChatMessage::user(handle.username(), &sanitize(&text), handle.color());
    room.archive_and_publish(message).await;
    Ok(())
}

/// Answers a recoverable error with a notice to the sender; anything else
/// ends the session.
fn reject(
    room: &ChatRoom,
    handle: &SessionHandle,
    error: SessionError,
) -> Result<(), SessionError> {
    if !error.is_recoverable() {
        return Err(error);
    }
    debug!("Rejected message from {}: {}", handle.username(), error);
    room.notify(handle, ChatMessage::system(notice_for(&error)))
}

async fn write_loop<W: FrameWriter>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Arc<ChatMessage>>,
) -> Result<(), SessionError> {
    let mut heartbeat = interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;

    let result = loop {
        tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => {
                    if let Err(e) = writer.send_one(&message).await {
                        break Err(e);
                    }
                }
                None => break Ok(()),
            },
            _ = heartbeat.tick() => {
                if let Err(e) = writer.heartbeat().await {
                    break Err(e);
                }
            }
        }
    };

    writer.close().await;
    result
}

async fn with_deadline<T>(
    limit: Option<Duration>,
    fut: impl Future<Output = Result<T, SessionError>>,
) -> Result<T, SessionError> {
    match limit {
        Some(limit) => timeout(limit, fut)
            .await
            .map_err(|_| SessionError::IdleTimeout(limit))?,
        None => fut.await,
    }
}

/// Text of the system reply sent to the peer for a rejected unit.
fn notice_for(error: &SessionError) -> String {
    match error {
        SessionError::DuplicateUsername(name) => {
            format!("Username is already taken: {}. Please choose another one.", name)
        }
        SessionError::MessageTooLong { length, max } => {
            format!(
                "Your message is {} characters long. The limit is {} characters.",
                length, max
            )
        }
        SessionError::RateLimited { retry_after } => {
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            format!("You are sending messages too quickly. Please wait {} seconds.", secs)
        }
        other => other.to_string(),
    }
}
