use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad error category used for retry decisions and logging.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatErrorCategory {
    /// Missing or invalid configuration; no retry can fix it.
    Config,
    /// Transient network/transport failure.
    Network,
    /// Document-store or file-storage failure.
    Storage,
    /// Serialization/deserialization failure.
    Serialization,
    /// Invalid caller input, rejected before any side effect.
    Invalid,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable error payload used across the engine boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct ChatError {
    /// High-level error category.
    pub category: ChatErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl ChatError {
    /// Construct a new error.
    pub fn new(
        category: ChatErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Standard invalid-input error, rejected before the send pipeline runs.
    pub fn invalid_input(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ChatErrorCategory::Invalid, code, message)
    }

    /// Standard transient network error.
    pub fn network(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ChatErrorCategory::Network, code, message)
    }

    /// Whether the failure is transient and worth a queued retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category,
            ChatErrorCategory::Network | ChatErrorCategory::Storage
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_categories_are_retryable() {
        assert!(ChatError::network("offline", "no route").is_retryable());
        assert!(ChatError::new(ChatErrorCategory::Storage, "write_failed", "disk").is_retryable());
        assert!(!ChatError::invalid_input("empty_send", "no content").is_retryable());
        assert!(!ChatError::new(ChatErrorCategory::Config, "missing_bucket", "x").is_retryable());
    }

    #[test]
    fn persists_retry_after_in_millis() {
        let err = ChatError::network("rate_limited", "slow down")
            .with_retry_after(Duration::from_secs(2));
        assert_eq!(err.retry_after_ms, Some(2000));
    }
}
