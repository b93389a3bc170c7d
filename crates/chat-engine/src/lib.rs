//! Async orchestration of the chat synchronization engine.
//!
//! A [`ConversationSession`] reconciles the local cache, a one-shot remote
//! fetch, and the realtime stream into one consistent message list, and runs
//! the outbound send pipeline with optimistic state and offline retry.

/// Conversation session: hydration, reconciliation, send pipeline, retry.
pub mod session;
/// Injectable periodic job with explicit start/stop/status lifecycle.
pub mod sweep;

pub use session::{ConversationSession, EngineContext};
pub use sweep::{SweepJob, SweepStatus};
