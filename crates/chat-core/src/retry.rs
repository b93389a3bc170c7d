use std::collections::HashMap;

use crate::types::MediaSource;

/// One failed send awaiting a connectivity-restored signal.
///
/// Carries enough state to replay the full pipeline with the original temp
/// id, which is what keeps retries idempotent in the message log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEntry {
    /// Client temp id of the optimistic message.
    pub local_id: String,
    /// Receiver of the original send.
    pub receiver_id: String,
    /// Text body, for text messages.
    pub text: Option<String>,
    /// Media source. `Remote` when the upload already succeeded, so the
    /// retry does not replay it.
    pub media: Option<MediaSource>,
    /// Original creation timestamp, reused on replay.
    pub created_at_ms: u64,
}

/// Holding area for failed outbound sends, keyed by local temp id.
///
/// Keying by id (rather than a plain list) means a message that fails twice
/// before any drain produces one replay attempt, not two.
#[derive(Debug, Clone, Default)]
pub struct RetryQueue {
    entries: HashMap<String, RetryEntry>,
}

impl RetryQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queue (or overwrite) the entry for a failed send.
    pub fn enqueue(&mut self, entry: RetryEntry) {
        self.entries.insert(entry.local_id.clone(), entry);
    }

    /// Clear the queue and return its entries, oldest first.
    ///
    /// Clearing before dispatch lets a failure during redispatch re-enqueue
    /// cleanly without racing the drain loop.
    pub fn drain(&mut self) -> Vec<RetryEntry> {
        let mut drained: Vec<RetryEntry> = self.entries.drain().map(|(_, entry)| entry).collect();
        drained.sort_by_key(|entry| entry.created_at_ms);
        drained
    }
}
