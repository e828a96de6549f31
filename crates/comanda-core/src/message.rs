use serde::{Deserialize, Serialize};

/// A normalized inbound message from the messaging network.
///
/// One `InboundMessage` is produced per physical inbound message, including
/// ones with no extractable text (those carry a placeholder body and
/// [`MessageKind::NonText`] so the batch stays one-entry-per-message).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Conversation address on the network (e.g. `573000000000@s.whatsapp.net`).
    pub conversation_id: String,
    /// Bare user identifier (phone number without the address suffix).
    pub sender_id: String,
    /// Display name if the network provides one, else the phone number.
    pub sender_label: String,
    /// Extracted text content, or a placeholder for non-text messages.
    pub text: String,
    /// Network timestamp in milliseconds since the epoch.
    pub timestamp_ms: i64,
    pub kind: MessageKind,
}

/// Classification of an inbound message's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Plain or extended text.
    Text,
    /// Caption attached to a media message.
    Caption,
    /// Media or system message with no extractable text.
    NonText,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Caption => "caption",
            Self::NonText => "non-text",
        }
    }
}

/// Placeholder body used for messages with no extractable text.
pub const NON_TEXT_PLACEHOLDER: &str = "[media message]";

/// A batch of inbound messages for one conversation, flushed after the
/// debounce window elapsed with no new arrivals.
#[derive(Debug, Clone)]
pub struct Batch {
    pub conversation_id: String,
    pub user_id: String,
    pub sender_label: String,
    /// Message texts joined in arrival order, one per line.
    pub combined_query: String,
    pub message_count: usize,
}

/// A document to deliver as an attachment (the onboarding menu).
#[derive(Debug, Clone)]
pub struct DocumentPayload {
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub mimetype: String,
    pub caption: String,
}
