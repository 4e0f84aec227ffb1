//! Repository traits over the durable conversation store.
//!
//! The relational store is an external collaborator; the engine only sees
//! these traits. `pg` implements them over Postgres, `memory` provides the
//! in-process fallback used by tests and database-less runs.

use async_trait::async_trait;
use shared::models::{Conversation, Message, NewConversation, NewMessage, User};
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod pg;

/// Errors surfaced by the durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Read access to user accounts plus presence toggling. Accounts themselves
/// are owned by the external identity layer.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_username(&self, username: &str) -> StoreResult<Option<User>>;

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>>;

    /// Flips the presence flag and stamps `last_seen`.
    async fn set_online(&self, username: &str, online: bool) -> StoreResult<()>;

    async fn online_users(&self) -> StoreResult<Vec<User>>;
}

/// Durable conversation state.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// The active human-to-human conversation between two users, regardless
    /// of which of them created it.
    async fn find_active_between(&self, user_a: Uuid, user_b: Uuid)
    -> StoreResult<Option<Conversation>>;

    /// The user's active human-to-AI conversation.
    async fn find_active_ai_conversation(&self, user: Uuid) -> StoreResult<Option<Conversation>>;

    async fn insert(&self, conversation: NewConversation) -> StoreResult<Conversation>;

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Conversation>>;

    /// Active conversations the user takes part in, most recent activity
    /// first.
    async fn list_for_user(&self, user: Uuid) -> StoreResult<Vec<Conversation>>;

    /// Stamps `last_message_at` with the current instant; atomic per row.
    async fn touch_last_message_at(&self, id: Uuid) -> StoreResult<()>;

    /// Soft close: flips `is_active` off, leaving messages in place.
    async fn deactivate(&self, id: Uuid) -> StoreResult<()>;
}

/// Durable message state within conversations.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(&self, message: NewMessage) -> StoreResult<Message>;

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Message>>;

    /// All messages of a conversation in insertion order.
    async fn find_by_conversation(&self, conversation_id: Uuid) -> StoreResult<Vec<Message>>;

    /// Unread messages not authored by the given user (AI messages count as
    /// authored by nobody and are always included).
    async fn find_unread(
        &self,
        conversation_id: Uuid,
        excluding_sender: Uuid,
    ) -> StoreResult<Vec<Message>>;

    /// Marks a single message read; atomic per row.
    async fn mark_read(&self, message_id: Uuid) -> StoreResult<()>;

    async fn last_message(&self, conversation_id: Uuid) -> StoreResult<Option<Message>>;

    async fn unread_count(
        &self,
        conversation_id: Uuid,
        excluding_sender: Uuid,
    ) -> StoreResult<i64>;

    /// The `limit` most recent messages in insertion order.
    async fn recent(&self, conversation_id: Uuid, limit: i64) -> StoreResult<Vec<Message>>;
}
