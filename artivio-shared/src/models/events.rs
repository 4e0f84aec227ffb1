use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Push addresses understood by the fan-out channel.
///
/// User-addressed events name one of the queue addresses; topic events are
/// broadcast to every subscriber of the topic.
pub mod addresses {
    use uuid::Uuid;

    /// Per-user address for complete chat messages (and the empty-content
    /// announcement that precedes a streamed AI reply).
    pub const MESSAGES: &str = "messages";

    /// Per-user address for cumulative streaming updates of an AI reply.
    pub const MESSAGE_UPDATES: &str = "message-updates";

    /// Topic carrying online/offline presence events for all users.
    pub const USER_STATUS_TOPIC: &str = "user.status";

    /// Topic carrying typing notifications for one conversation.
    #[must_use]
    pub fn typing_topic(conversation_id: Uuid) -> String {
        format!("typing/{conversation_id}")
    }

    /// Topic carrying read receipts for one conversation.
    #[must_use]
    pub fn read_receipt_topic(conversation_id: Uuid) -> String {
        format!("read-receipts/{conversation_id}")
    }
}

/// Broadcast on a conversation's typing topic while a participant composes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct TypingNotification {
    /// Username of the participant typing; filled in by the server from the
    /// authenticated identity.
    pub sender: String,
    /// The conversation being typed into.
    pub conversation_id: Uuid,
    /// `true` while composing, `false` once stopped.
    pub typing: bool,
}

/// Broadcast on the user-status topic when a connection opens or closes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct UserStatusEvent {
    /// The user whose presence changed.
    pub username: String,
    /// Whether the user is now online.
    pub online: bool,
}

/// Broadcast on a conversation's read-receipt topic after a participant
/// marks messages read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ReadReceiptEvent {
    /// The participant who read.
    pub reader: String,
    /// The conversation the receipt applies to.
    pub conversation_id: Uuid,
    /// The single message read, absent when the whole conversation was
    /// marked.
    pub message_id: Option<Uuid>,
}

/// Request to mark a message, a whole conversation, or both as read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ReadNotification {
    /// A single message to mark read.
    #[serde(default)]
    pub message_id: Option<Uuid>,
    /// A conversation whose unread messages should all be marked read.
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
}
