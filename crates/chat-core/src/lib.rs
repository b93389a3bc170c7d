//! Core contract of the chat synchronization engine.
//!
//! This crate defines the message/conversation model, the delivery-state
//! machine, the ordered message log, the bounded cache codec, the retry
//! queue, and the command/event channel abstractions. It performs no I/O;
//! the async engine and platform collaborators live in sibling crates.

/// Bounded cache codec for per-conversation message snapshots.
pub mod cache;
/// Async command/event channel primitives.
pub mod channel;
/// Stable chat error types.
pub mod error;
/// Newest-first ordered message list and merge rules.
pub mod message_log;
/// Retry queue for failed outbound sends.
pub mod retry;
/// Message, conversation, and engine protocol types.
pub mod types;

pub use cache::{cache_key, decode_cached, encode_bounded, CACHE_MESSAGE_CAP};
pub use channel::{EngineChannelError, EngineChannels, EventStream};
pub use error::{ChatError, ChatErrorCategory};
pub use message_log::{MergeError, MessageLog};
pub use retry::{RetryEntry, RetryQueue};
pub use types::{
    ChatCommand, ChatEvent, ConversationSummary, DeliveryState, MediaSource, Message,
    MessageContent, MessageId, SendRequest, IMAGE_PREVIEW_PLACEHOLDER,
};
