use serde::{Deserialize, Serialize};

use crate::error::ChatError;

/// Preview text recorded on a conversation summary for image messages.
pub const IMAGE_PREVIEW_PLACEHOLDER: &str = "[Hình ảnh]";

/// Delivery lifecycle of an outbound message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeliveryState {
    /// Optimistically inserted, persistence in flight.
    Sending,
    /// Confirmed persisted by the document store.
    Sent,
    /// Persistence failed; the message sits on the retry queue.
    Error,
}

impl DeliveryState {
    /// Whether `next` is a legal transition from this state.
    ///
    /// `Sent` is terminal; `Error` is re-enterable into `Sending` via retry.
    pub fn can_transition_to(self, next: DeliveryState) -> bool {
        use DeliveryState::*;
        matches!((self, next), (Sending, Sent) | (Sending, Error) | (Error, Sending))
    }
}

/// Message payload, tagged by kind so internal code never branches on
/// optional-field presence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    /// Plain text body.
    Text {
        /// Message body.
        body: String,
    },
    /// Image by durable (or, while optimistic, local) URL.
    Image {
        /// Media URL.
        url: String,
    },
}

impl MessageContent {
    /// Conversation-summary preview text for this content.
    pub fn preview(&self) -> &str {
        match self {
            MessageContent::Text { body } => body,
            MessageContent::Image { .. } => IMAGE_PREVIEW_PLACEHOLDER,
        }
    }
}

/// Message identity: a client-generated local id, plus the server id once
/// the document store has confirmed the message.
///
/// List matching always uses `local`; `remote` only disambiguates against
/// realtime/fetch payloads after confirmation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageId {
    /// Client-generated temporary id, stable across retries.
    pub local: String,
    /// Server-assigned id, present once persisted.
    pub remote: Option<String>,
}

impl MessageId {
    /// Identity for a message that has not been persisted yet.
    pub fn local_only(local: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            remote: None,
        }
    }
}

/// One chat message as held by the in-memory log and the cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Local/remote identity pair.
    pub id: MessageId,
    /// Conversation this message belongs to.
    pub conversation_id: String,
    /// Sender user id.
    pub sender_id: String,
    /// Receiver user id.
    pub receiver_id: String,
    /// Text or image payload.
    pub content: MessageContent,
    /// Creation timestamp in milliseconds since the Unix epoch.
    pub created_at_ms: u64,
    /// Delivery lifecycle state.
    pub state: DeliveryState,
}

/// Denormalized conversation metadata, kept in step with the most recently
/// persisted (not merely optimistic) message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationSummary {
    /// Stable conversation id.
    pub conversation_id: String,
    /// The two participants.
    pub participants: [String; 2],
    /// Preview of the last persisted message.
    pub last_preview: String,
    /// Timestamp of the last persisted message.
    pub last_message_ms: u64,
}

/// Where outbound media comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MediaSource {
    /// Local resource that must be uploaded before persisting.
    Local(String),
    /// Already-durable URL; upload is skipped (a retried send whose upload
    /// succeeded is not replayed).
    Remote(String),
}

/// Input to the outbound send pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendRequest {
    /// Text body, for text messages.
    pub text: Option<String>,
    /// Media source, for image messages.
    pub media: Option<MediaSource>,
}

impl SendRequest {
    /// Text-only send.
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            text: Some(body.into()),
            media: None,
        }
    }

    /// Image-only send.
    pub fn image(media: MediaSource) -> Self {
        Self {
            text: None,
            media: Some(media),
        }
    }

    /// Reject invalid input before the pipeline creates any optimistic state.
    ///
    /// Text and image are mutually exclusive content types; exactly one must
    /// be present and text must be non-blank.
    pub fn validate(&self) -> Result<(), ChatError> {
        match (&self.text, &self.media) {
            (None, None) => Err(ChatError::invalid_input(
                "empty_send",
                "send requires text or media",
            )),
            (Some(_), Some(_)) => Err(ChatError::invalid_input(
                "ambiguous_send",
                "send accepts text or media, not both",
            )),
            (Some(text), None) if text.trim().is_empty() => Err(ChatError::invalid_input(
                "empty_send",
                "text message body is blank",
            )),
            _ => Ok(()),
        }
    }
}

/// Command channel input accepted by a conversation session loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatCommand {
    /// Send a message in the open conversation.
    Send(SendRequest),
    /// Tear the session down, cancelling its realtime subscription.
    Close,
}

/// Event channel output emitted by a conversation session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatEvent {
    /// Full replacement of the visible message list (newest-first).
    Snapshot {
        /// Conversation the snapshot belongs to.
        conversation_id: String,
        /// Messages, newest-first.
        messages: Vec<Message>,
    },
    /// A single message changed delivery state.
    MessageState {
        /// Conversation the message belongs to.
        conversation_id: String,
        /// Local id of the affected message.
        local_id: String,
        /// New delivery state.
        state: DeliveryState,
        /// Server id, attached on confirmation.
        remote_id: Option<String>,
    },
    /// The conversation summary was updated after a persisted send.
    SummaryUpdated(ConversationSummary),
    /// The retry queue was drained on a reconnect edge.
    RetryDrained {
        /// Number of entries redispatched.
        dispatched: usize,
    },
    /// A send was rejected before entering the pipeline.
    SendRejected {
        /// Stable error code.
        code: String,
        /// Human-readable reason.
        message: String,
    },
    /// An irrecoverable failure no retry can fix (for example missing
    /// storage configuration).
    FatalError {
        /// Stable error code.
        code: String,
        /// Human-readable message.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_only_documented_delivery_transitions() {
        use DeliveryState::*;

        assert!(Sending.can_transition_to(Sent));
        assert!(Sending.can_transition_to(Error));
        assert!(Error.can_transition_to(Sending));

        assert!(!Sent.can_transition_to(Sending));
        assert!(!Sent.can_transition_to(Error));
        assert!(!Error.can_transition_to(Sent));
        assert!(!Sending.can_transition_to(Sending));
    }

    #[test]
    fn image_preview_uses_placeholder_not_url() {
        let content = MessageContent::Image {
            url: "https://files.example/1.jpg".to_owned(),
        };
        assert_eq!(content.preview(), IMAGE_PREVIEW_PLACEHOLDER);

        let content = MessageContent::Text {
            body: "Xin chào".to_owned(),
        };
        assert_eq!(content.preview(), "Xin chào");
    }

    #[test]
    fn rejects_empty_and_ambiguous_sends() {
        let err = SendRequest {
            text: None,
            media: None,
        }
        .validate()
        .expect_err("empty send must be rejected");
        assert_eq!(err.code, "empty_send");

        let err = SendRequest {
            text: Some("   ".to_owned()),
            media: None,
        }
        .validate()
        .expect_err("blank text must be rejected");
        assert_eq!(err.code, "empty_send");

        let err = SendRequest {
            text: Some("hi".to_owned()),
            media: Some(MediaSource::Local("file:///a.jpg".to_owned())),
        }
        .validate()
        .expect_err("text and media together must be rejected");
        assert_eq!(err.code, "ambiguous_send");

        SendRequest::text("hello").validate().expect("text send is valid");
        SendRequest::image(MediaSource::Local("file:///a.jpg".to_owned()))
            .validate()
            .expect("image send is valid");
    }
}
