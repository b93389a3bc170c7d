//! Bounded cache codec for per-conversation message snapshots.
//!
//! The cache is a derived view, never authoritative: it is always safe to
//! discard and rebuild from a remote fetch plus realtime replay. Decoding
//! therefore fails soft, and writers overwrite wholesale.

use crate::error::{ChatError, ChatErrorCategory};
use crate::types::Message;

/// Maximum number of messages persisted per conversation.
pub const CACHE_MESSAGE_CAP: usize = 50;

const CACHE_KEY_PREFIX: &str = "chat-cache";

/// Key-value store key for one conversation's cached messages.
pub fn cache_key(conversation_id: &str) -> String {
    format!("{CACHE_KEY_PREFIX}:{conversation_id}")
}

/// Serialize at most `cap` most-recent messages (by creation time) to JSON.
///
/// The input is re-sorted before trimming so the kept entries are the newest
/// regardless of input order.
pub fn encode_bounded(messages: &[Message], cap: usize) -> Result<String, ChatError> {
    let mut recent: Vec<&Message> = messages.iter().collect();
    recent.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
    recent.truncate(cap.max(1));

    serde_json::to_string(&recent).map_err(|err| {
        ChatError::new(
            ChatErrorCategory::Serialization,
            "cache_encode_failed",
            err.to_string(),
        )
    })
}

/// Deserialize a cached snapshot, treating any corruption as a cache miss.
pub fn decode_cached(raw: &str) -> Vec<Message> {
    serde_json::from_str(raw).unwrap_or_default()
}
