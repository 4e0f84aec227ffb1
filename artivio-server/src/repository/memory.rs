//! In-memory implementations of the repository traits.
//!
//! Back the engine in tests and in database-less development runs. State
//! lives in lock-protected vectors; locks are never held across an await.

use async_trait::async_trait;
use shared::models::{
    Conversation, ConversationType, Message, MessageStatus, NewConversation, NewMessage,
    Timestamp, User,
};
use std::sync::Mutex;
use uuid::Uuid;

use super::{ConversationStore, MessageStore, StoreResult, UserStore};

/// User accounts held in memory. Accounts must be seeded up front; this
/// store never provisions them.
#[derive(Debug, Default)]
pub struct InMemoryUserStore {
    users: Mutex<Vec<User>>,
}

impl InMemoryUserStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_users(users: Vec<User>) -> Self {
        Self {
            users: Mutex::new(users),
        }
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn find_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        let users = self.users.lock().expect("user store lock poisoned");
        Ok(users.iter().find(|user| user.username == username).cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        let users = self.users.lock().expect("user store lock poisoned");
        Ok(users.iter().find(|user| user.id == id).cloned())
    }

    async fn set_online(&self, username: &str, online: bool) -> StoreResult<()> {
        let mut users = self.users.lock().expect("user store lock poisoned");
        if let Some(user) = users.iter_mut().find(|user| user.username == username) {
            user.is_online = online;
            user.last_seen = Timestamp::now();
        }
        Ok(())
    }

    async fn online_users(&self) -> StoreResult<Vec<User>> {
        let users = self.users.lock().expect("user store lock poisoned");
        let mut online: Vec<User> = users.iter().filter(|user| user.is_online).cloned().collect();
        online.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(online)
    }
}

/// Conversations held in memory.
#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
    conversations: Mutex<Vec<Conversation>>,
}

impl InMemoryConversationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn find_active_between(
        &self,
        user_a: Uuid,
        user_b: Uuid,
    ) -> StoreResult<Option<Conversation>> {
        let conversations = self
            .conversations
            .lock()
            .expect("conversation store lock poisoned");
        Ok(conversations
            .iter()
            .find(|conversation| {
                conversation.is_active
                    && conversation.conversation_type == ConversationType::HumanToHuman
                    && ((conversation.created_by == user_a
                        && conversation.participant_id == Some(user_b))
                        || (conversation.created_by == user_b
                            && conversation.participant_id == Some(user_a)))
            })
            .cloned())
    }

    async fn find_active_ai_conversation(&self, user: Uuid) -> StoreResult<Option<Conversation>> {
        let conversations = self
            .conversations
            .lock()
            .expect("conversation store lock poisoned");
        Ok(conversations
            .iter()
            .find(|conversation| {
                conversation.is_active
                    && conversation.conversation_type == ConversationType::HumanToAi
                    && conversation.created_by == user
            })
            .cloned())
    }

    async fn insert(&self, conversation: NewConversation) -> StoreResult<Conversation> {
        let now = Timestamp::now();
        let stored = Conversation {
            id: Uuid::new_v4(),
            conversation_type: conversation.conversation_type,
            title: conversation.title,
            created_by: conversation.created_by,
            participant_id: conversation.participant_id,
            is_active: true,
            last_message_at: now.clone(),
            created_at: now.clone(),
            updated_at: now,
        };

        let mut conversations = self
            .conversations
            .lock()
            .expect("conversation store lock poisoned");
        conversations.push(stored.clone());
        Ok(stored)
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Conversation>> {
        let conversations = self
            .conversations
            .lock()
            .expect("conversation store lock poisoned");
        Ok(conversations
            .iter()
            .find(|conversation| conversation.id == id)
            .cloned())
    }

    async fn list_for_user(&self, user: Uuid) -> StoreResult<Vec<Conversation>> {
        let conversations = self
            .conversations
            .lock()
            .expect("conversation store lock poisoned");
        let mut owned: Vec<Conversation> = conversations
            .iter()
            .filter(|conversation| conversation.is_active && conversation.involves(user))
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        Ok(owned)
    }

    async fn touch_last_message_at(&self, id: Uuid) -> StoreResult<()> {
        let mut conversations = self
            .conversations
            .lock()
            .expect("conversation store lock poisoned");
        if let Some(conversation) = conversations
            .iter_mut()
            .find(|conversation| conversation.id == id)
        {
            conversation.last_message_at = Timestamp::now();
            conversation.updated_at = Timestamp::now();
        }
        Ok(())
    }

    async fn deactivate(&self, id: Uuid) -> StoreResult<()> {
        let mut conversations = self
            .conversations
            .lock()
            .expect("conversation store lock poisoned");
        if let Some(conversation) = conversations
            .iter_mut()
            .find(|conversation| conversation.id == id)
        {
            conversation.is_active = false;
            conversation.updated_at = Timestamp::now();
        }
        Ok(())
    }
}

/// Messages held in memory, in insertion order.
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    messages: Mutex<Vec<Message>>,
}

impl InMemoryMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn append(&self, message: NewMessage) -> StoreResult<Message> {
        let now = Timestamp::now();
        let stored = Message {
            id: Uuid::new_v4(),
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            content: message.content,
            message_type: message.message_type,
            status: message.status,
            is_read: message.is_read,
            is_delivered: message.is_delivered,
            created_at: now.clone(),
            updated_at: now,
        };

        let mut messages = self.messages.lock().expect("message store lock poisoned");
        messages.push(stored.clone());
        Ok(stored)
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Message>> {
        let messages = self.messages.lock().expect("message store lock poisoned");
        Ok(messages.iter().find(|message| message.id == id).cloned())
    }

    async fn find_by_conversation(&self, conversation_id: Uuid) -> StoreResult<Vec<Message>> {
        let messages = self.messages.lock().expect("message store lock poisoned");
        Ok(messages
            .iter()
            .filter(|message| message.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn find_unread(
        &self,
        conversation_id: Uuid,
        excluding_sender: Uuid,
    ) -> StoreResult<Vec<Message>> {
        let messages = self.messages.lock().expect("message store lock poisoned");
        Ok(messages
            .iter()
            .filter(|message| {
                message.conversation_id == conversation_id
                    && !message.is_read
                    && message.sender_id != Some(excluding_sender)
            })
            .cloned()
            .collect())
    }

    async fn mark_read(&self, message_id: Uuid) -> StoreResult<()> {
        let mut messages = self.messages.lock().expect("message store lock poisoned");
        if let Some(message) = messages.iter_mut().find(|message| message.id == message_id) {
            message.is_read = true;
            message.status = MessageStatus::Read;
            message.updated_at = Timestamp::now();
        }
        Ok(())
    }

    async fn last_message(&self, conversation_id: Uuid) -> StoreResult<Option<Message>> {
        let messages = self.messages.lock().expect("message store lock poisoned");
        Ok(messages
            .iter()
            .filter(|message| message.conversation_id == conversation_id)
            .next_back()
            .cloned())
    }

    async fn unread_count(
        &self,
        conversation_id: Uuid,
        excluding_sender: Uuid,
    ) -> StoreResult<i64> {
        let messages = self.messages.lock().expect("message store lock poisoned");
        Ok(messages
            .iter()
            .filter(|message| {
                message.conversation_id == conversation_id
                    && !message.is_read
                    && message.sender_id != Some(excluding_sender)
            })
            .count() as i64)
    }

    async fn recent(&self, conversation_id: Uuid, limit: i64) -> StoreResult<Vec<Message>> {
        let messages = self.messages.lock().expect("message store lock poisoned");
        let owned: Vec<Message> = messages
            .iter()
            .filter(|message| message.conversation_id == conversation_id)
            .cloned()
            .collect();
        let skip = owned.len().saturating_sub(usize::try_from(limit).unwrap_or(0));
        Ok(owned.into_iter().skip(skip).collect())
    }
}
