use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::registry::SessionRegistry;
use super::ChatMessage;
use crate::error::SessionError;

#[derive(Debug)]
struct Publication {
    seq: Option<u64>,
    message: Arc<ChatMessage>,
}

/// Counts from one fan-out pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub skipped: usize,
    pub dropped: usize,
}

/// Publishing side of the fan-out path. Publishing only enqueues; the
/// `RelayWorker` does the delivery.
#[derive(Debug, Clone)]
pub struct Relay {
    tx: mpsc::UnboundedSender<Publication>,
}

/// Drains the publication queue in order and copies each message into every
/// registered session's outbound queue. A session whose queue is full or
/// closed is signalled to close; it stays registered until it releases itself.
pub struct RelayWorker {
    rx: mpsc::UnboundedReceiver<Publication>,
    registry: Arc<SessionRegistry>,
}

impl Relay {
    pub fn new(registry: Arc<SessionRegistry>) -> (Self, RelayWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, RelayWorker { rx, registry })
    }

    /// Fans out a message that is not part of the history.
    pub fn publish(&self, message: Arc<ChatMessage>) {
        self.enqueue(Publication { seq: None, message });
    }

    /// Fans out an archived message. Sessions that already got `seq` through
    /// history replay are skipped.
    pub fn publish_archived(&self, seq: u64, message: Arc<ChatMessage>) {
        self.enqueue(Publication { seq: Some(seq), message });
    }

    fn enqueue(&self, publication: Publication) {
        if self.tx.send(publication).is_err() {
            warn!("Relay worker is gone, dropping message");
        }
    }
}

impl RelayWorker {
    pub async fn run(mut self) {
        info!("Relay worker started");
        while let Some(publication) = self.rx.recv().await {
            self.deliver(publication).await;
        }
        info!("Relay worker stopped");
    }

    async fn deliver(&self, publication: Publication) -> Delivery {
        let mut report = Delivery::default();

        for session in self.registry.snapshot_all().await {
            if let Some(seq) = publication.seq {
                if seq <= session.replayed_through() {
                    report.skipped += 1;
                    continue;
                }
            }

            match session.send(publication.message.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    match e {
                        SessionError::Evicted => {
                            warn!("Outbound queue full for {}, disconnecting", session.username())
                        }
                        _ => debug!("Session {} already closing: {}", session.username(), e),
                    }
                    // Removal is left to the session's own teardown, which
                    // also clears history once the room is empty.
                    session.evict();
                    report.dropped += 1;
                }
            }
        }

        debug!(
            "Relayed message from {} to {} sessions ({} skipped, {} dropped)",
            publication.message.username, report.delivered, report.skipped, report.dropped
        );
        report
    }
}
