use std::collections::VecDeque;
use std::sync::Arc;

use super::ChatMessage;

/// A message kept in the history buffer, tagged with its archive sequence number.
#[derive(Debug, Clone)]
pub struct Archived {
    pub seq: u64,
    pub message: Arc<ChatMessage>,
}

/// Bounded FIFO of the most recent chat messages, replayed to newcomers.
///
/// Sequence numbers keep increasing across `clear` so a number handed out
/// once is never reused.
#[derive(Debug)]
pub struct HistoryBuffer {
    entries: VecDeque<Archived>,
    limit: usize,
    next_seq: u64,
}

impl HistoryBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit + 1),
            limit,
            next_seq: 1,
        }
    }

    /// Pushes to the back, evicting from the front past the limit. Returns the
    /// sequence number assigned to the message.
    pub fn append(&mut self, message: Arc<ChatMessage>) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.entries.push_back(Archived { seq, message });
        while self.entries.len() > self.limit {
            self.entries.pop_front();
        }
        seq
    }

    /// Current contents, oldest first.
    pub fn replay(&self) -> Vec<Archived> {
        self.entries.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Highest sequence number handed out so far, 0 if none.
    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(text: &str) -> Arc<ChatMessage> {
        Arc::new(ChatMessage::user("alice", text, "red"))
    }

    fn texts(history: &HistoryBuffer) -> Vec<String> {
        history.replay().into_iter().map(|a| a.message.message.clone()).collect()
    }

    #[test]
    fn test_keeps_most_recent_in_arrival_order() {
        let mut history = HistoryBuffer::new(5);
        for i in 1..=8 {
            history.append(msg(&i.to_string()));
            assert!(history.len() <= 5);
        }

        assert_eq!(texts(&history), vec!["4", "5", "6", "7", "8"]);
    }

    #[test]
    fn test_replay_does_not_consume() {
        let mut history = HistoryBuffer::new(5);
        history.append(msg("a"));
        history.append(msg("b"));

        assert_eq!(texts(&history), vec!["a", "b"]);
        assert_eq!(texts(&history), vec!["a", "b"]);
    }

    #[test]
    fn test_sequence_survives_clear() {
        let mut history = HistoryBuffer::new(5);
        assert_eq!(history.last_seq(), 0);
        assert_eq!(history.append(msg("a")), 1);
        assert_eq!(history.append(msg("b")), 2);

        history.clear();
        assert!(history.is_empty());
        assert!(history.replay().is_empty());
        assert_eq!(history.last_seq(), 2);
        assert_eq!(history.append(msg("c")), 3);
    }
}
