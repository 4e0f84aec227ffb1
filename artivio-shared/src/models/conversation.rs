use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

use super::Timestamp;
use super::message::MessageView;
use super::user::{User, UserView};

/// The kind of conversation: between two humans, or between one human and
/// the AI companion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationType {
    HumanToHuman,
    HumanToAi,
}

impl ConversationType {
    /// Canonical string representation expected by persistence layers.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HumanToHuman => "HUMAN_TO_HUMAN",
            Self::HumanToAi => "HUMAN_TO_AI",
        }
    }
}

impl fmt::Display for ConversationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationType {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "HUMAN_TO_HUMAN" => Ok(Self::HumanToHuman),
            "HUMAN_TO_AI" => Ok(Self::HumanToAi),
            _ => Err("unknown conversation type"),
        }
    }
}

/// A persisted thread between two humans or between one human and the AI.
///
/// Invariants: `participant_id` is present iff the type is
/// [`ConversationType::HumanToHuman`]; at most one active human-to-human
/// conversation exists per unordered user pair, and at most one active AI
/// conversation per user. Conversations are never hard-deleted; "delete"
/// flips `is_active` off.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct Conversation {
    /// Unique identifier for the conversation.
    pub id: Uuid,

    /// Whether this is a human-to-human or human-to-AI thread.
    pub conversation_type: ConversationType,

    /// Display title, assigned at creation.
    pub title: String,

    /// The user who opened the conversation.
    pub created_by: Uuid,

    /// The human peer, present only for human-to-human conversations.
    pub participant_id: Option<Uuid>,

    /// Soft-close flag; inactive conversations are excluded from listings
    /// and lookups.
    pub is_active: bool,

    /// Timestamp of the most recent message.
    pub last_message_at: Timestamp,

    /// When the conversation was created.
    pub created_at: Timestamp,

    /// When the conversation row last changed.
    pub updated_at: Timestamp,
}

impl Conversation {
    /// Whether the given user is the creator or the participant.
    #[must_use]
    pub fn involves(&self, user_id: Uuid) -> bool {
        self.created_by == user_id || self.participant_id == Some(user_id)
    }
}

/// The fields a caller supplies when opening a conversation; the store
/// assigns identity and timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConversation {
    pub conversation_type: ConversationType,
    pub title: String,
    pub created_by: Uuid,
    pub participant_id: Option<Uuid>,
}

/// Request body for creating (or fetching) a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct CreateConversationRequest {
    /// The human peer; required for human-to-human conversations.
    #[serde(default)]
    pub recipient_id: Option<Uuid>,

    /// The kind of conversation to open.
    #[serde(default = "default_conversation_type")]
    pub conversation_type: ConversationType,
}

fn default_conversation_type() -> ConversationType {
    ConversationType::HumanToAi
}

/// Transport projection of a [`Conversation`] with its resolved users,
/// unread count, and a window of recent messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ConversationView {
    /// Unique identifier for the conversation.
    pub id: Uuid,
    /// Whether this is a human-to-human or human-to-AI thread.
    pub conversation_type: ConversationType,
    /// Display title.
    pub title: String,
    /// The user who opened the conversation.
    pub created_by: UserView,
    /// The human peer, present only for human-to-human conversations.
    pub participant: Option<UserView>,
    /// Soft-close flag.
    pub is_active: bool,
    /// Timestamp of the most recent message.
    pub last_message_at: Timestamp,
    /// When the conversation was created.
    pub created_at: Timestamp,
    /// When the conversation row last changed.
    pub updated_at: Timestamp,
    /// Messages not yet read by the requesting user.
    pub unread_count: i64,
    /// The most recent message, if any.
    pub last_message: Option<MessageView>,
    /// A window of the most recent messages, oldest first.
    pub messages: Vec<MessageView>,
}

impl ConversationView {
    /// Projects a persisted [`Conversation`] plus its resolved collaborators
    /// into the transport shape.
    #[must_use]
    pub fn project(
        conversation: &Conversation,
        created_by: &User,
        participant: Option<&User>,
        unread_count: i64,
        last_message: Option<MessageView>,
        messages: Vec<MessageView>,
    ) -> Self {
        Self {
            id: conversation.id,
            conversation_type: conversation.conversation_type,
            title: conversation.title.clone(),
            created_by: UserView::project(created_by),
            participant: participant.map(UserView::project),
            is_active: conversation.is_active,
            last_message_at: conversation.last_message_at.clone(),
            created_at: conversation.created_at.clone(),
            updated_at: conversation.updated_at.clone(),
            unread_count,
            last_message,
            messages,
        }
    }
}
