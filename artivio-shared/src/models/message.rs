use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

use super::Timestamp;
use super::user::{User, UserView};

/// The author class of a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Authored by a human participant.
    Human,
    /// Authored by the AI companion; such messages carry no sender.
    Ai,
    /// Produced by the system itself (notices, status updates).
    System,
}

impl MessageType {
    /// Canonical string representation expected by persistence layers.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Human => "HUMAN",
            Self::Ai => "AI",
            Self::System => "SYSTEM",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "HUMAN" => Ok(Self::Human),
            "AI" => Ok(Self::Ai),
            "SYSTEM" => Ok(Self::System),
            _ => Err("unknown message type"),
        }
    }
}

/// Delivery lifecycle state of a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    /// Persisted and handed to the fan-out channel.
    Sent,
    /// Acknowledged by at least one recipient transport.
    Delivered,
    /// Read by a participant other than the sender.
    Read,
    /// Persistence or delivery failed terminally.
    Failed,
}

impl MessageStatus {
    /// Canonical string representation expected by persistence layers.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "SENT",
            Self::Delivered => "DELIVERED",
            Self::Read => "READ",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "SENT" => Ok(Self::Sent),
            "DELIVERED" => Ok(Self::Delivered),
            "READ" => Ok(Self::Read),
            "FAILED" => Ok(Self::Failed),
            _ => Err("unknown message status"),
        }
    }
}

/// A persisted message within a conversation.
///
/// Invariant: `sender_id` is `None` if and only if `message_type` is
/// [`MessageType::Ai`]. Content is immutable once persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct Message {
    /// Unique identifier for the message.
    pub id: Uuid,

    /// The conversation this message belongs to; immutable after creation.
    pub conversation_id: Uuid,

    /// The authoring user, absent for AI messages.
    pub sender_id: Option<Uuid>,

    /// The message body.
    pub content: String,

    /// The author class.
    pub message_type: MessageType,

    /// Delivery lifecycle state.
    pub status: MessageStatus,

    /// Whether a non-sender participant has read the message.
    pub is_read: bool,

    /// Whether the message reached the fan-out channel.
    pub is_delivered: bool,

    /// When the message was persisted.
    pub created_at: Timestamp,

    /// When the message row last changed.
    pub updated_at: Timestamp,
}

impl Message {
    /// Whether the message was authored by the AI companion.
    #[must_use]
    pub fn is_from_ai(&self) -> bool {
        self.sender_id.is_none()
    }
}

/// The fields a caller supplies when appending a message; the store assigns
/// identity and timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub sender_id: Option<Uuid>,
    pub content: String,
    pub message_type: MessageType,
    pub status: MessageStatus,
    pub is_read: bool,
    pub is_delivered: bool,
}

impl NewMessage {
    /// A freshly sent human message: SENT, delivered, unread.
    #[must_use]
    pub fn human(conversation_id: Uuid, sender_id: Uuid, content: String) -> Self {
        Self {
            conversation_id,
            sender_id: Some(sender_id),
            content,
            message_type: MessageType::Human,
            status: MessageStatus::Sent,
            is_read: false,
            is_delivered: true,
        }
    }

    /// A freshly generated AI message: no sender, SENT, delivered, unread.
    #[must_use]
    pub fn ai(conversation_id: Uuid, content: String) -> Self {
        Self {
            conversation_id,
            sender_id: None,
            content,
            message_type: MessageType::Ai,
            status: MessageStatus::Sent,
            is_read: false,
            is_delivered: true,
        }
    }
}

/// Transport projection of a [`Message`].
///
/// The sender is embedded as a [`UserView`]; `None` marks an AI-authored
/// message. Clients reconcile streamed updates against the persisted row by
/// the message `id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct MessageView {
    /// Unique identifier for the message.
    pub id: Uuid,
    /// The conversation this message belongs to.
    pub conversation_id: Uuid,
    /// The authoring user, absent for AI messages.
    pub sender: Option<UserView>,
    /// The message body.
    pub content: String,
    /// The author class.
    pub message_type: MessageType,
    /// Delivery lifecycle state.
    pub status: MessageStatus,
    /// Whether a non-sender participant has read the message.
    pub is_read: bool,
    /// Whether the message reached the fan-out channel.
    pub is_delivered: bool,
    /// When the message was persisted.
    pub created_at: Timestamp,
    /// When the message row last changed.
    pub updated_at: Timestamp,
}

impl MessageView {
    /// Projects a persisted [`Message`] plus its resolved sender into the
    /// transport shape.
    #[must_use]
    pub fn project(message: &Message, sender: Option<&User>) -> Self {
        Self {
            id: message.id,
            conversation_id: message.conversation_id,
            sender: sender.map(UserView::project),
            content: message.content.clone(),
            message_type: message.message_type,
            status: message.status,
            is_read: message.is_read,
            is_delivered: message.is_delivered,
            created_at: message.created_at.clone(),
            updated_at: message.updated_at.clone(),
        }
    }

    /// Returns a copy of the view carrying different content, used by the
    /// incremental delivery protocol to publish cumulative prefixes.
    #[must_use]
    pub fn with_content(&self, content: impl Into<String>) -> Self {
        let mut view = self.clone();
        view.content = content.into();
        view
    }
}

/// Request body for sending a chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ChatMessageRequest {
    /// The conversation to append to.
    pub conversation_id: Uuid,
    /// The message body.
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_message(sender_id: Option<Uuid>, message_type: MessageType) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sender_id,
            content: "Hello, world!".to_string(),
            message_type,
            status: MessageStatus::Sent,
            is_read: false,
            is_delivered: true,
            created_at: Timestamp(Utc::now()),
            updated_at: Timestamp(Utc::now()),
        }
    }

    #[test]
    fn type_and_status_round_trip() {
        for (text, message_type) in [
            ("HUMAN", MessageType::Human),
            ("AI", MessageType::Ai),
            ("SYSTEM", MessageType::System),
        ] {
            assert_eq!(message_type.as_str(), text);
            assert_eq!(MessageType::from_str(text).unwrap(), message_type);
        }

        for (text, status) in [
            ("SENT", MessageStatus::Sent),
            ("DELIVERED", MessageStatus::Delivered),
            ("READ", MessageStatus::Read),
            ("FAILED", MessageStatus::Failed),
        ] {
            assert_eq!(status.as_str(), text);
            assert_eq!(MessageStatus::from_str(text).unwrap(), status);
        }

        assert!(MessageType::from_str("ROBOT").is_err());
        assert!(MessageStatus::from_str("PENDING").is_err());
    }

    #[test]
    fn ai_constructor_has_no_sender() {
        let draft = NewMessage::ai(Uuid::new_v4(), "reply".into());
        assert_eq!(draft.sender_id, None);
        assert_eq!(draft.message_type, MessageType::Ai);
        assert_eq!(draft.status, MessageStatus::Sent);
        assert!(draft.is_delivered);
        assert!(!draft.is_read);
    }

    #[test]
    fn human_constructor_carries_sender() {
        let sender = Uuid::new_v4();
        let draft = NewMessage::human(Uuid::new_v4(), sender, "hi".into());
        assert_eq!(draft.sender_id, Some(sender));
        assert_eq!(draft.message_type, MessageType::Human);
    }

    #[test]
    fn ai_messages_are_detected_by_missing_sender() {
        assert!(sample_message(None, MessageType::Ai).is_from_ai());
        assert!(!sample_message(Some(Uuid::new_v4()), MessageType::Human).is_from_ai());
    }

    #[test]
    fn projection_embeds_sender_view() {
        let user = User {
            id: Uuid::new_v4(),
            username: "bob".to_string(),
            display_name: "Bob".to_string(),
            is_online: false,
            last_seen: Timestamp(Utc::now()),
            created_at: Timestamp(Utc::now()),
        };
        let message = sample_message(Some(user.id), MessageType::Human);

        let view = MessageView::project(&message, Some(&user));
        assert_eq!(view.id, message.id);
        assert_eq!(view.sender.as_ref().unwrap().username, "bob");

        let ai_view = MessageView::project(&sample_message(None, MessageType::Ai), None);
        assert!(ai_view.sender.is_none());
    }

    #[test]
    fn with_content_replaces_only_the_body() {
        let message = sample_message(None, MessageType::Ai);
        let view = MessageView::project(&message, None);
        let partial = view.with_content("partial");

        assert_eq!(partial.content, "partial");
        assert_eq!(partial.id, view.id);
        assert_eq!(partial.status, view.status);
    }

    #[test]
    fn serializes_enums_in_wire_case() {
        let message = sample_message(None, MessageType::Ai);
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"AI\""));
        assert!(json.contains("\"SENT\""));
    }
}
