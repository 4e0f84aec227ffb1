//! The conversation/message lifecycle engine.
//!
//! Accepts an inbound message, persists it, fans it out to connected
//! recipients, and for AI conversations spawns an asynchronous reply
//! pipeline that generates, persists, and streams back the companion's
//! answer. The engine mediates between the store, the context cache, the
//! generator, and the fan-out channel; it holds no state of its own beyond
//! the injected components.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use shared::config::server::AiConfig;
use shared::models::{
    Conversation, ConversationType, ConversationView, MessageView, NewConversation, NewMessage,
    ReadReceiptEvent, TypingNotification, User, UserStatusEvent, UserView, addresses,
};
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::fanout::FanoutChannel;
use crate::repository::{ConversationStore, MessageStore, StoreError, UserStore};
use crate::services::context_cache::ContextCache;
use crate::services::reply_generator::ReplyGenerator;

/// Display name the AI companion signs context lines with.
pub const AI_DISPLAY_NAME: &str = "Artivio AI";

/// Title given to a freshly created AI conversation.
pub const AI_CONVERSATION_TITLE: &str = "Chat with Artivio AI";

/// Fixed apology persisted and delivered when the reply pipeline fails past
/// generation. History must reflect what the user was actually shown.
pub const REPLY_FAILURE_MESSAGE: &str =
    "Sorry, I'm having trouble processing your message right now. Please try again.";

/// Number of recent messages embedded in a conversation listing.
const RECENT_MESSAGE_WINDOW: i64 = 10;

/// Errors surfaced to callers of the engine's synchronous operations.
#[derive(Debug, Error)]
pub enum ChatEngineError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("access denied: {0}")]
    PermissionDenied(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type ChatEngineResult<T> = Result<T, ChatEngineError>;

/// The orchestrator composing store, cache, generator, and fan-out.
pub struct ChatEngine {
    users: Arc<dyn UserStore>,
    conversations: Arc<dyn ConversationStore>,
    messages: Arc<dyn MessageStore>,
    context: Arc<ContextCache>,
    generator: Arc<dyn ReplyGenerator>,
    fanout: Arc<dyn FanoutChannel>,
    context_lines: usize,
    stream_delay: Duration,
}

impl fmt::Debug for ChatEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatEngine")
            .field("context_lines", &self.context_lines)
            .field("stream_delay", &self.stream_delay)
            .finish()
    }
}

fn encode<T: Serialize>(value: &T) -> Option<Value> {
    match serde_json::to_value(value) {
        Ok(value) => Some(value),
        Err(err) => {
            error!(error = %err, "failed to encode push payload");
            None
        }
    }
}

impl ChatEngine {
    pub fn new(
        users: Arc<dyn UserStore>,
        conversations: Arc<dyn ConversationStore>,
        messages: Arc<dyn MessageStore>,
        context: Arc<ContextCache>,
        generator: Arc<dyn ReplyGenerator>,
        fanout: Arc<dyn FanoutChannel>,
        ai: &AiConfig,
    ) -> Self {
        Self {
            users,
            conversations,
            messages,
            context,
            generator,
            fanout,
            context_lines: ai.context_lines,
            stream_delay: Duration::from_millis(ai.stream_delay_ms),
        }
    }

    async fn resolve_user(&self, username: &str) -> ChatEngineResult<User> {
        self.users
            .find_by_username(username)
            .await?
            .ok_or_else(|| ChatEngineError::NotFound(format!("user '{username}' not found")))
    }

    async fn resolve_user_by_id(&self, id: Uuid) -> ChatEngineResult<User> {
        self.users
            .find_by_id(id)
            .await?
            .ok_or_else(|| ChatEngineError::NotFound(format!("user {id} not found")))
    }

    async fn resolve_conversation(&self, id: Uuid) -> ChatEngineResult<Conversation> {
        self.conversations
            .find_by_id(id)
            .await?
            .ok_or_else(|| ChatEngineError::NotFound(format!("conversation {id} not found")))
    }

    /// Access check guarding every mutating operation on a conversation and
    /// its message listing: the actor must be the creator or the participant.
    fn validate_access(conversation: &Conversation, user: &User) -> ChatEngineResult<()> {
        if conversation.involves(user.id) {
            Ok(())
        } else {
            Err(ChatEngineError::PermissionDenied(format!(
                "user '{}' is not part of conversation {}",
                user.username, conversation.id
            )))
        }
    }

    /// Returns the caller's conversation with the recipient (or with the
    /// AI), creating it on first contact. Idempotent; the human-to-human
    /// lookup is symmetric in creator and participant.
    #[instrument(name = "chat.create_or_get_conversation", skip(self), err)]
    pub async fn create_or_get_conversation(
        &self,
        username: &str,
        recipient_id: Option<Uuid>,
        conversation_type: ConversationType,
    ) -> ChatEngineResult<ConversationView> {
        let user = self.resolve_user(username).await?;

        let conversation = match conversation_type {
            ConversationType::HumanToHuman => {
                let recipient_id = recipient_id.ok_or_else(|| {
                    ChatEngineError::InvalidArgument(
                        "recipient id is required for a human-to-human conversation".to_string(),
                    )
                })?;
                let recipient = self.resolve_user_by_id(recipient_id).await?;

                match self
                    .conversations
                    .find_active_between(user.id, recipient.id)
                    .await?
                {
                    Some(existing) => existing,
                    None => {
                        let created = self
                            .conversations
                            .insert(NewConversation {
                                conversation_type: ConversationType::HumanToHuman,
                                title: format!("Chat with {}", recipient.display_name),
                                created_by: user.id,
                                participant_id: Some(recipient.id),
                            })
                            .await?;
                        info!(conversation_id = %created.id, "created conversation");
                        created
                    }
                }
            }
            ConversationType::HumanToAi => {
                match self.conversations.find_active_ai_conversation(user.id).await? {
                    Some(existing) => existing,
                    None => {
                        let created = self
                            .conversations
                            .insert(NewConversation {
                                conversation_type: ConversationType::HumanToAi,
                                title: AI_CONVERSATION_TITLE.to_string(),
                                created_by: user.id,
                                participant_id: None,
                            })
                            .await?;
                        info!(conversation_id = %created.id, "created AI conversation");
                        created
                    }
                }
            }
        };

        self.conversation_view(&conversation, &user).await
    }

    /// The hot path: persists the sender's message, fans it out, and for AI
    /// conversations spawns the reply pipeline before returning.
    ///
    /// Resolution, access, and persistence failures abort the call; cache
    /// and fan-out failures past the persisted write are contained.
    #[instrument(name = "chat.send_message", skip(self, content), err)]
    pub async fn send_message(
        &self,
        sender_username: &str,
        conversation_id: Uuid,
        content: &str,
    ) -> ChatEngineResult<MessageView> {
        let sender = self.resolve_user(sender_username).await?;
        let conversation = self.resolve_conversation(conversation_id).await?;
        Self::validate_access(&conversation, &sender)?;

        let trimmed = content.trim().to_string();
        let message = self
            .messages
            .append(NewMessage::human(conversation.id, sender.id, trimmed.clone()))
            .await?;
        self.conversations
            .touch_last_message_at(conversation.id)
            .await?;

        metrics::counter!("artivio_messages_sent_total").increment(1);

        self.context
            .store(conversation.id, &sender.display_name, &trimmed);

        let view = MessageView::project(&message, Some(&sender));
        self.fan_out_message(&conversation, &view, &sender).await;

        if conversation.conversation_type == ConversationType::HumanToAi {
            self.spawn_reply(conversation, trimmed, sender);
        }

        Ok(view)
    }

    /// Fans a persisted message out per the addressing rules: both sides
    /// individually for human-to-human, the sender only for AI threads.
    /// Delivery failures are logged and contained.
    async fn fan_out_message(
        &self,
        conversation: &Conversation,
        view: &MessageView,
        sender: &User,
    ) {
        let Some(payload) = encode(view) else {
            return;
        };

        let mut recipients: Vec<String> = Vec::new();
        if conversation.conversation_type == ConversationType::HumanToHuman {
            for id in std::iter::once(conversation.created_by).chain(conversation.participant_id) {
                if id == sender.id {
                    recipients.push(sender.username.clone());
                    continue;
                }
                match self.users.find_by_id(id).await {
                    Ok(Some(user)) => recipients.push(user.username),
                    Ok(None) => warn!(user_id = %id, "fan-out recipient no longer exists"),
                    Err(err) => warn!(error = %err, "failed to resolve fan-out recipient"),
                }
            }
        } else {
            recipients.push(sender.username.clone());
        }

        for username in recipients {
            if let Err(err) = self
                .fanout
                .send_to_user(&username, addresses::MESSAGES, payload.clone())
                .await
            {
                warn!(error = %err, username = %username, "failed to fan out message");
            }
        }
    }

    fn spawn_reply(&self, conversation: Conversation, user_message: String, sender: User) {
        let pipeline = ReplyPipeline {
            conversations: Arc::clone(&self.conversations),
            messages: Arc::clone(&self.messages),
            context: Arc::clone(&self.context),
            generator: Arc::clone(&self.generator),
            fanout: Arc::clone(&self.fanout),
            context_lines: self.context_lines,
            stream_delay: self.stream_delay,
        };
        tokio::spawn(async move {
            pipeline.run(conversation, user_message, sender).await;
        });
    }

    /// The caller's active conversations, most recent activity first.
    #[instrument(name = "chat.list_conversations", skip(self), err)]
    pub async fn list_conversations(
        &self,
        username: &str,
    ) -> ChatEngineResult<Vec<ConversationView>> {
        let user = self.resolve_user(username).await?;
        let conversations = self.conversations.list_for_user(user.id).await?;

        let mut views = Vec::with_capacity(conversations.len());
        for conversation in &conversations {
            views.push(self.conversation_view(conversation, &user).await?);
        }
        Ok(views)
    }

    /// Every message of the conversation in insertion order. Guarded by the
    /// same access check as the mutating operations.
    #[instrument(name = "chat.list_messages", skip(self), err)]
    pub async fn list_messages(
        &self,
        conversation_id: Uuid,
        username: &str,
    ) -> ChatEngineResult<Vec<MessageView>> {
        let user = self.resolve_user(username).await?;
        let conversation = self.resolve_conversation(conversation_id).await?;
        Self::validate_access(&conversation, &user)?;

        let participants = self.conversation_participants(&conversation, &user).await?;
        let messages = self.messages.find_by_conversation(conversation.id).await?;

        Ok(messages
            .iter()
            .map(|message| {
                let sender = message
                    .sender_id
                    .and_then(|id| participants.iter().find(|user| user.id == id));
                MessageView::project(message, sender)
            })
            .collect())
    }

    /// Marks one message read, unless the caller authored it: self-sent
    /// messages never flip their read flag.
    #[instrument(name = "chat.mark_message_read", skip(self), err)]
    pub async fn mark_message_read(
        &self,
        message_id: Uuid,
        username: &str,
    ) -> ChatEngineResult<()> {
        let user = self.resolve_user(username).await?;
        let message = self
            .messages
            .find_by_id(message_id)
            .await?
            .ok_or_else(|| ChatEngineError::NotFound(format!("message {message_id} not found")))?;
        let conversation = self.resolve_conversation(message.conversation_id).await?;
        Self::validate_access(&conversation, &user)?;

        if message.sender_id == Some(user.id) {
            return Ok(());
        }

        self.messages.mark_read(message.id).await?;
        Ok(())
    }

    /// Marks every unread message not authored by the caller as read.
    #[instrument(name = "chat.mark_conversation_read", skip(self), err)]
    pub async fn mark_conversation_read(
        &self,
        conversation_id: Uuid,
        username: &str,
    ) -> ChatEngineResult<()> {
        let user = self.resolve_user(username).await?;
        let conversation = self.resolve_conversation(conversation_id).await?;
        Self::validate_access(&conversation, &user)?;

        let unread = self.messages.find_unread(conversation.id, user.id).await?;
        let count = unread.len();
        for message in unread {
            self.messages.mark_read(message.id).await?;
        }

        info!(conversation_id = %conversation.id, count, "marked conversation read");
        Ok(())
    }

    /// Soft-closes the conversation. Messages stay persisted; the thread
    /// drops out of listings and lookups, and the next contact between the
    /// same parties creates a fresh conversation.
    #[instrument(name = "chat.delete_conversation", skip(self), err)]
    pub async fn delete_conversation(
        &self,
        conversation_id: Uuid,
        username: &str,
    ) -> ChatEngineResult<()> {
        let user = self.resolve_user(username).await?;
        let conversation = self.resolve_conversation(conversation_id).await?;
        Self::validate_access(&conversation, &user)?;

        self.conversations.deactivate(conversation.id).await?;
        info!(conversation_id = %conversation.id, "conversation closed");
        Ok(())
    }

    /// Connection-lifecycle hook: flips presence on and broadcasts the
    /// status change. Failures are contained; the transport owns the
    /// connection either way.
    pub async fn handle_connect(&self, username: &str) {
        self.toggle_presence(username, true).await;
    }

    /// Connection-lifecycle hook: flips presence off and broadcasts.
    pub async fn handle_disconnect(&self, username: &str) {
        self.toggle_presence(username, false).await;
    }

    async fn toggle_presence(&self, username: &str, online: bool) {
        if let Err(err) = self.users.set_online(username, online).await {
            warn!(error = %err, username, "failed to update presence");
            return;
        }

        let event = UserStatusEvent {
            username: username.to_string(),
            online,
        };
        let Some(payload) = encode(&event) else {
            return;
        };
        if let Err(err) = self
            .fanout
            .send_to_topic(addresses::USER_STATUS_TOPIC, payload)
            .await
        {
            warn!(error = %err, username, "failed to broadcast presence");
        }
        info!(username, online, "presence updated");
    }

    /// Broadcasts a typing notification on the conversation's topic. Topic
    /// events bypass the persisted-state access check; subscription control
    /// is the transport caller's responsibility.
    pub async fn broadcast_typing(&self, username: &str, conversation_id: Uuid, typing: bool) {
        let notification = TypingNotification {
            sender: username.to_string(),
            conversation_id,
            typing,
        };
        let Some(payload) = encode(&notification) else {
            return;
        };
        if let Err(err) = self
            .fanout
            .send_to_topic(&addresses::typing_topic(conversation_id), payload)
            .await
        {
            warn!(error = %err, username, "failed to broadcast typing notification");
        }
    }

    /// Broadcasts a read receipt on the conversation's topic. Like typing,
    /// receipts are outside the persisted-state path: no access re-check,
    /// subscription control belongs to the transport caller.
    pub async fn broadcast_read_receipt(
        &self,
        username: &str,
        conversation_id: Uuid,
        message_id: Option<Uuid>,
    ) {
        let receipt = ReadReceiptEvent {
            reader: username.to_string(),
            conversation_id,
            message_id,
        };
        let Some(payload) = encode(&receipt) else {
            return;
        };
        if let Err(err) = self
            .fanout
            .send_to_topic(&addresses::read_receipt_topic(conversation_id), payload)
            .await
        {
            warn!(error = %err, username, "failed to broadcast read receipt");
        }
    }

    /// Everyone currently online, excluding the caller.
    #[instrument(name = "chat.online_users", skip(self), err)]
    pub async fn online_users(&self, username: &str) -> ChatEngineResult<Vec<UserView>> {
        let online = self.users.online_users().await?;
        Ok(online
            .iter()
            .filter(|user| user.username != username)
            .map(UserView::project)
            .collect())
    }

    /// The resolved creator and participant of a conversation, reusing the
    /// already-resolved caller where possible.
    async fn conversation_participants(
        &self,
        conversation: &Conversation,
        caller: &User,
    ) -> ChatEngineResult<Vec<User>> {
        let mut participants = Vec::with_capacity(2);
        for id in
            std::iter::once(conversation.created_by).chain(conversation.participant_id)
        {
            if id == caller.id {
                participants.push(caller.clone());
            } else {
                participants.push(self.resolve_user_by_id(id).await?);
            }
        }
        Ok(participants)
    }

    async fn conversation_view(
        &self,
        conversation: &Conversation,
        caller: &User,
    ) -> ChatEngineResult<ConversationView> {
        let participants = self.conversation_participants(conversation, caller).await?;
        let creator = participants
            .iter()
            .find(|user| user.id == conversation.created_by)
            .ok_or_else(|| {
                ChatEngineError::NotFound(format!(
                    "creator of conversation {} not found",
                    conversation.id
                ))
            })?;
        let participant = conversation
            .participant_id
            .and_then(|id| participants.iter().find(|user| user.id == id));

        let project = |message: &shared::models::Message| {
            let sender = message
                .sender_id
                .and_then(|id| participants.iter().find(|user| user.id == id));
            MessageView::project(message, sender)
        };

        let unread_count = self
            .messages
            .unread_count(conversation.id, caller.id)
            .await?;
        let last_message = self
            .messages
            .last_message(conversation.id)
            .await?
            .as_ref()
            .map(project);
        let recent = self
            .messages
            .recent(conversation.id, RECENT_MESSAGE_WINDOW)
            .await?;

        Ok(ConversationView::project(
            conversation,
            creator,
            participant,
            unread_count,
            last_message,
            recent.iter().map(project).collect(),
        ))
    }
}

/// The asynchronous reply pipeline, detached from the request that
/// triggered it. Terminal at its own boundary: every run ends in either a
/// persisted AI reply or a persisted apology, never an unhandled fault.
pub(crate) struct ReplyPipeline {
    conversations: Arc<dyn ConversationStore>,
    messages: Arc<dyn MessageStore>,
    context: Arc<ContextCache>,
    generator: Arc<dyn ReplyGenerator>,
    fanout: Arc<dyn FanoutChannel>,
    context_lines: usize,
    stream_delay: Duration,
}

impl ReplyPipeline {
    pub(crate) async fn run(&self, conversation: Conversation, user_message: String, sender: User) {
        // Cache reads are total; an empty window just means no priming.
        let context = self.context.retrieve(conversation.id, self.context_lines);
        let context = (!context.is_empty()).then_some(context);

        let reply = self
            .generator
            .generate(&user_message, context.as_deref())
            .await;

        match self.persist_and_stream(&conversation, reply, &sender).await {
            Ok(()) => {
                metrics::counter!("artivio_ai_replies_total", "outcome" => "ok").increment(1);
                info!(conversation_id = %conversation.id, "AI reply delivered");
            }
            Err(err) => {
                error!(error = %err, conversation_id = %conversation.id,
                    "error completing AI reply; falling back to apology");
                metrics::counter!("artivio_ai_replies_total", "outcome" => "apology").increment(1);
                if let Err(err) = self.deliver_apology(&conversation, &sender).await {
                    // Terminal: the pipeline never propagates further.
                    error!(error = %err, conversation_id = %conversation.id,
                        "failed to persist AI apology message");
                }
            }
        }
    }

    async fn persist_and_stream(
        &self,
        conversation: &Conversation,
        reply: String,
        sender: &User,
    ) -> Result<(), StoreError> {
        let message = self
            .messages
            .append(NewMessage::ai(conversation.id, reply))
            .await?;

        self.context
            .store(conversation.id, AI_DISPLAY_NAME, &message.content);
        self.conversations
            .touch_last_message_at(conversation.id)
            .await?;

        let view = MessageView::project(&message, None);
        self.stream_to_user(&sender.username, &view).await;
        Ok(())
    }

    /// Incremental delivery: the full text is already persisted; this only
    /// simulates progressive reveal. An empty-content announcement goes out
    /// on the message address, then cumulative whitespace-token prefixes on
    /// the update address. A delivery error mid-stream degrades to a single
    /// full delivery.
    async fn stream_to_user(&self, username: &str, view: &MessageView) {
        let Some(announce) = encode(&view.with_content("")) else {
            return;
        };
        if self
            .fanout
            .send_to_user(username, addresses::MESSAGES, announce)
            .await
            .is_err()
        {
            self.deliver_full(username, view).await;
            return;
        }

        let tokens: Vec<&str> = view.content.split_whitespace().collect();
        let mut cumulative = String::new();
        for (index, token) in tokens.iter().enumerate() {
            tokio::time::sleep(self.stream_delay).await;
            if index > 0 {
                cumulative.push(' ');
            }
            cumulative.push_str(token);

            let Some(update) = encode(&view.with_content(cumulative.clone())) else {
                continue;
            };
            if self
                .fanout
                .send_to_user(username, addresses::MESSAGE_UPDATES, update)
                .await
                .is_err()
            {
                warn!(username, "streaming interrupted; delivering full message");
                self.deliver_full(username, view).await;
                return;
            }
        }
    }

    async fn deliver_full(&self, username: &str, view: &MessageView) {
        let Some(payload) = encode(view) else {
            return;
        };
        if let Err(err) = self
            .fanout
            .send_to_user(username, addresses::MESSAGES, payload)
            .await
        {
            warn!(error = %err, username, "failed to deliver full AI message");
        }
    }

    async fn deliver_apology(
        &self,
        conversation: &Conversation,
        sender: &User,
    ) -> Result<(), StoreError> {
        let message = self
            .messages
            .append(NewMessage::ai(
                conversation.id,
                REPLY_FAILURE_MESSAGE.to_string(),
            ))
            .await?;

        let view = MessageView::project(&message, None);
        self.deliver_full(&sender.username, &view).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::{FanoutError, FanoutResult};
    use crate::repository::StoreResult;
    use crate::repository::memory::{
        InMemoryConversationStore, InMemoryMessageStore, InMemoryUserStore,
    };
    use async_trait::async_trait;
    use shared::models::{Message, MessageStatus, MessageType, Timestamp};
    use std::sync::Mutex;

    const STUB_REPLY: &str = "Hello from the Artivio assistant";

    struct StubGenerator {
        reply: String,
    }

    #[async_trait]
    impl ReplyGenerator for StubGenerator {
        async fn generate(&self, _prompt: &str, _context: Option<&str>) -> String {
            self.reply.clone()
        }

        fn is_configured(&self) -> bool {
            true
        }

        fn model_name(&self) -> &str {
            "stub"
        }
    }

    #[derive(Debug, Clone)]
    enum Recorded {
        User {
            username: String,
            address: String,
            payload: Value,
        },
        Topic {
            topic: String,
            payload: Value,
        },
    }

    #[derive(Default)]
    struct RecordingFanout {
        events: Mutex<Vec<Recorded>>,
        // address -> successful sends allowed before erroring
        fail_address: Mutex<Option<(String, usize)>>,
    }

    impl RecordingFanout {
        fn new() -> Self {
            Self::default()
        }

        fn failing_address_after(address: &str, successes: usize) -> Self {
            Self {
                events: Mutex::new(Vec::new()),
                fail_address: Mutex::new(Some((address.to_string(), successes))),
            }
        }

        fn user_events(&self, address: &str) -> Vec<(String, Value)> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|event| match event {
                    Recorded::User {
                        username,
                        address: recorded,
                        payload,
                    } if recorded == address => Some((username.clone(), payload.clone())),
                    _ => None,
                })
                .collect()
        }

        fn topic_events(&self, topic: &str) -> Vec<Value> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|event| match event {
                    Recorded::Topic {
                        topic: recorded,
                        payload,
                    } if recorded == topic => Some(payload.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl FanoutChannel for RecordingFanout {
        async fn send_to_user(
            &self,
            username: &str,
            address: &str,
            payload: Value,
        ) -> FanoutResult {
            {
                let mut fail = self.fail_address.lock().unwrap();
                if let Some((failing, remaining)) = fail.as_mut() {
                    if failing == address {
                        if *remaining == 0 {
                            return Err(FanoutError::ChannelClosed);
                        }
                        *remaining -= 1;
                    }
                }
            }
            self.events.lock().unwrap().push(Recorded::User {
                username: username.to_string(),
                address: address.to_string(),
                payload,
            });
            Ok(())
        }

        async fn send_to_topic(&self, topic: &str, payload: Value) -> FanoutResult {
            self.events.lock().unwrap().push(Recorded::Topic {
                topic: topic.to_string(),
                payload,
            });
            Ok(())
        }
    }

    /// Message store that fails the next N appends, then behaves normally.
    struct FlakyMessageStore {
        inner: InMemoryMessageStore,
        fail_appends: Mutex<u32>,
    }

    impl FlakyMessageStore {
        fn failing_appends(count: u32) -> Self {
            Self {
                inner: InMemoryMessageStore::new(),
                fail_appends: Mutex::new(count),
            }
        }
    }

    #[async_trait]
    impl MessageStore for FlakyMessageStore {
        async fn append(&self, message: NewMessage) -> StoreResult<Message> {
            {
                let mut remaining = self.fail_appends.lock().unwrap();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(StoreError::Unavailable("simulated outage".into()));
                }
            }
            self.inner.append(message).await
        }

        async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Message>> {
            self.inner.find_by_id(id).await
        }

        async fn find_by_conversation(&self, conversation_id: Uuid) -> StoreResult<Vec<Message>> {
            self.inner.find_by_conversation(conversation_id).await
        }

        async fn find_unread(
            &self,
            conversation_id: Uuid,
            excluding_sender: Uuid,
        ) -> StoreResult<Vec<Message>> {
            self.inner.find_unread(conversation_id, excluding_sender).await
        }

        async fn mark_read(&self, message_id: Uuid) -> StoreResult<()> {
            self.inner.mark_read(message_id).await
        }

        async fn last_message(&self, conversation_id: Uuid) -> StoreResult<Option<Message>> {
            self.inner.last_message(conversation_id).await
        }

        async fn unread_count(
            &self,
            conversation_id: Uuid,
            excluding_sender: Uuid,
        ) -> StoreResult<i64> {
            self.inner.unread_count(conversation_id, excluding_sender).await
        }

        async fn recent(&self, conversation_id: Uuid, limit: i64) -> StoreResult<Vec<Message>> {
            self.inner.recent(conversation_id, limit).await
        }
    }

    fn user(username: &str, display_name: &str) -> User {
        User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            display_name: display_name.to_string(),
            is_online: false,
            last_seen: Timestamp::now(),
            created_at: Timestamp::now(),
        }
    }

    struct Harness {
        engine: ChatEngine,
        messages: Arc<InMemoryMessageStore>,
        fanout: Arc<RecordingFanout>,
        cache: Arc<ContextCache>,
        alice: User,
        bob: User,
        carol: User,
    }

    fn harness() -> Harness {
        harness_with(RecordingFanout::new(), STUB_REPLY)
    }

    fn harness_with(fanout: RecordingFanout, reply: &str) -> Harness {
        let alice = user("alice", "Alice");
        let bob = user("bob", "Bob");
        let carol = user("carol", "Carol");

        let users = Arc::new(InMemoryUserStore::with_users(vec![
            alice.clone(),
            bob.clone(),
            carol.clone(),
        ]));
        let conversations = Arc::new(InMemoryConversationStore::new());
        let messages = Arc::new(InMemoryMessageStore::new());
        let cache = Arc::new(ContextCache::new(10));
        let fanout = Arc::new(fanout);
        let generator = Arc::new(StubGenerator {
            reply: reply.to_string(),
        });
        let ai = AiConfig {
            stream_delay_ms: 1,
            ..AiConfig::default()
        };

        let engine = ChatEngine::new(
            users,
            conversations.clone(),
            messages.clone(),
            cache.clone(),
            generator,
            fanout.clone(),
            &ai,
        );

        Harness {
            engine,
            messages,
            fanout,
            cache,
            alice,
            bob,
            carol,
        }
    }

    fn pipeline_for(messages: Arc<dyn MessageStore>, reply: &str) -> ReplyPipeline {
        ReplyPipeline {
            conversations: Arc::new(InMemoryConversationStore::new()),
            messages,
            context: Arc::new(ContextCache::new(10)),
            generator: Arc::new(StubGenerator {
                reply: reply.to_string(),
            }),
            fanout: Arc::new(RecordingFanout::new()),
            context_lines: 5,
            stream_delay: Duration::from_millis(1),
        }
    }

    async fn wait_for_messages(
        store: &Arc<InMemoryMessageStore>,
        conversation_id: Uuid,
        expected: usize,
    ) -> Vec<Message> {
        for _ in 0..500 {
            let messages = store.find_by_conversation(conversation_id).await.unwrap();
            if messages.len() >= expected {
                return messages;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {expected} messages");
    }

    fn ai_conversation(harness: &Harness) -> Conversation {
        Conversation {
            id: Uuid::new_v4(),
            conversation_type: ConversationType::HumanToAi,
            title: AI_CONVERSATION_TITLE.to_string(),
            created_by: harness.alice.id,
            participant_id: None,
            is_active: true,
            last_message_at: Timestamp::now(),
            created_at: Timestamp::now(),
            updated_at: Timestamp::now(),
        }
    }

    #[tokio::test]
    async fn send_persists_one_sent_message_and_fans_out_to_both_sides() {
        let harness = harness();
        let conversation = harness
            .engine
            .create_or_get_conversation(
                "alice",
                Some(harness.bob.id),
                ConversationType::HumanToHuman,
            )
            .await
            .unwrap();

        let view = harness
            .engine
            .send_message("alice", conversation.id, "Hello Bob")
            .await
            .unwrap();

        assert_eq!(view.status, MessageStatus::Sent);
        assert_eq!(view.message_type, MessageType::Human);
        assert!(!view.is_read);

        let stored = harness
            .messages
            .find_by_conversation(conversation.id)
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content, "Hello Bob");

        let deliveries = harness.fanout.user_events(addresses::MESSAGES);
        let mut recipients: Vec<&str> = deliveries
            .iter()
            .map(|(username, _)| username.as_str())
            .collect();
        recipients.sort_unstable();
        assert_eq!(recipients, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn outsider_send_is_denied_and_writes_nothing() {
        let harness = harness();
        let conversation = harness
            .engine
            .create_or_get_conversation(
                "alice",
                Some(harness.bob.id),
                ConversationType::HumanToHuman,
            )
            .await
            .unwrap();

        let result = harness
            .engine
            .send_message("carol", conversation.id, "let me in")
            .await;

        assert!(matches!(result, Err(ChatEngineError::PermissionDenied(_))));
        assert!(
            harness
                .messages
                .find_by_conversation(conversation.id)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn conversation_creation_is_idempotent_and_symmetric() {
        let harness = harness();

        let first = harness
            .engine
            .create_or_get_conversation(
                "alice",
                Some(harness.bob.id),
                ConversationType::HumanToHuman,
            )
            .await
            .unwrap();
        let second = harness
            .engine
            .create_or_get_conversation(
                "bob",
                Some(harness.alice.id),
                ConversationType::HumanToHuman,
            )
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.title, "Chat with Bob");

        let listed = harness.engine.list_conversations("alice").await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn human_conversation_requires_recipient() {
        let harness = harness();
        let result = harness
            .engine
            .create_or_get_conversation("alice", None, ConversationType::HumanToHuman)
            .await;
        assert!(matches!(result, Err(ChatEngineError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn unknown_sender_is_not_found() {
        let harness = harness();
        let result = harness
            .engine
            .send_message("mallory", Uuid::new_v4(), "hi")
            .await;
        assert!(matches!(result, Err(ChatEngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn ai_send_spawns_reply_and_streams_to_sender_only() {
        let harness = harness();
        let conversation = harness
            .engine
            .create_or_get_conversation("alice", None, ConversationType::HumanToAi)
            .await
            .unwrap();
        assert_eq!(conversation.title, AI_CONVERSATION_TITLE);

        harness
            .engine
            .send_message("alice", conversation.id, "Hello")
            .await
            .unwrap();

        let stored = wait_for_messages(&harness.messages, conversation.id, 2).await;
        assert_eq!(stored[0].message_type, MessageType::Human);
        assert_eq!(stored[1].message_type, MessageType::Ai);
        assert!(stored[1].sender_id.is_none());
        assert_eq!(stored[1].content, STUB_REPLY);

        // Wait for the streaming loop to finish all token updates.
        let token_count = STUB_REPLY.split_whitespace().count();
        for _ in 0..500 {
            if harness.fanout.user_events(addresses::MESSAGE_UPDATES).len() >= token_count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let message_events = harness.fanout.user_events(addresses::MESSAGES);
        // The human message plus the empty-content announcement, all to alice.
        assert!(message_events.iter().all(|(username, _)| username == "alice"));
        assert_eq!(message_events.len(), 2);
        assert_eq!(message_events[1].1["content"], "");

        let updates = harness.fanout.user_events(addresses::MESSAGE_UPDATES);
        assert_eq!(updates.len(), token_count);
        let last = updates.last().unwrap();
        assert_eq!(last.1["content"], STUB_REPLY);
    }

    #[tokio::test]
    async fn pipeline_streams_cumulative_prefixes() {
        let harness = harness();
        let conversation = ai_conversation(&harness);
        let fanout = Arc::new(RecordingFanout::new());
        let messages: Arc<InMemoryMessageStore> = Arc::new(InMemoryMessageStore::new());

        let pipeline = ReplyPipeline {
            conversations: Arc::new(InMemoryConversationStore::new()),
            messages: messages.clone(),
            context: harness.cache.clone(),
            generator: Arc::new(StubGenerator {
                reply: "one two three".to_string(),
            }),
            fanout: fanout.clone(),
            context_lines: 5,
            stream_delay: Duration::from_millis(1),
        };

        pipeline
            .run(conversation.clone(), "hi".into(), harness.alice.clone())
            .await;

        let announce = fanout.user_events(addresses::MESSAGES);
        assert_eq!(announce.len(), 1);
        assert_eq!(announce[0].1["content"], "");

        let updates: Vec<String> = fanout
            .user_events(addresses::MESSAGE_UPDATES)
            .into_iter()
            .map(|(_, payload)| payload["content"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(updates, vec!["one", "one two", "one two three"]);

        let stored = messages
            .find_by_conversation(conversation.id)
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content, "one two three");
        // Every update carries the persisted message id for reconciliation.
        assert_eq!(
            announce[0].1["id"].as_str().unwrap(),
            stored[0].id.to_string()
        );

        // The reply landed in the context cache under the AI's name.
        let context = harness.cache.retrieve(conversation.id, 5);
        assert!(context.contains("[Artivio AI]: one two three"));
    }

    #[tokio::test]
    async fn pipeline_persistence_failure_persists_apology() {
        let harness = harness();
        let conversation = ai_conversation(&harness);
        let flaky: Arc<FlakyMessageStore> = Arc::new(FlakyMessageStore::failing_appends(1));
        let fanout = Arc::new(RecordingFanout::new());

        let pipeline = ReplyPipeline {
            conversations: Arc::new(InMemoryConversationStore::new()),
            messages: flaky.clone(),
            context: Arc::new(ContextCache::new(10)),
            generator: Arc::new(StubGenerator {
                reply: STUB_REPLY.to_string(),
            }),
            fanout: fanout.clone(),
            context_lines: 5,
            stream_delay: Duration::from_millis(1),
        };

        pipeline
            .run(conversation.clone(), "hi".into(), harness.alice.clone())
            .await;

        let stored = flaky.find_by_conversation(conversation.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content, REPLY_FAILURE_MESSAGE);
        assert_eq!(stored[0].message_type, MessageType::Ai);
        assert!(stored[0].sender_id.is_none());

        let deliveries = fanout.user_events(addresses::MESSAGES);
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].1["content"], REPLY_FAILURE_MESSAGE);
    }

    #[tokio::test]
    async fn generator_apology_is_persisted_as_a_normal_turn() {
        use crate::services::reply_generator::apologies;

        let harness = harness();
        let conversation = ai_conversation(&harness);
        let messages: Arc<InMemoryMessageStore> = Arc::new(InMemoryMessageStore::new());

        // The human turn is already persisted when the pipeline starts.
        let human = messages
            .append(NewMessage::human(
                conversation.id,
                harness.alice.id,
                "Hello".into(),
            ))
            .await
            .unwrap();

        let pipeline = pipeline_for(messages.clone(), apologies::SERVICE_UNAVAILABLE);
        pipeline
            .run(conversation.clone(), "Hello".into(), harness.alice.clone())
            .await;

        let stored = messages
            .find_by_conversation(conversation.id)
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);

        // The provider timeout surfaced as one AI message with the fixed
        // apology; the human's turn is untouched.
        assert_eq!(stored[1].content, apologies::SERVICE_UNAVAILABLE);
        assert_eq!(stored[1].message_type, MessageType::Ai);
        assert_eq!(stored[0].id, human.id);
        assert_eq!(stored[0].content, "Hello");
        assert_eq!(stored[0].status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn mid_stream_delivery_error_falls_back_to_full_message() {
        let harness = harness();
        let conversation = ai_conversation(&harness);
        let fanout = Arc::new(RecordingFanout::failing_address_after(
            addresses::MESSAGE_UPDATES,
            1,
        ));
        let messages: Arc<InMemoryMessageStore> = Arc::new(InMemoryMessageStore::new());

        let pipeline = ReplyPipeline {
            conversations: Arc::new(InMemoryConversationStore::new()),
            messages: messages.clone(),
            context: Arc::new(ContextCache::new(10)),
            generator: Arc::new(StubGenerator {
                reply: "alpha beta gamma".to_string(),
            }),
            fanout: fanout.clone(),
            context_lines: 5,
            stream_delay: Duration::from_millis(1),
        };

        pipeline
            .run(conversation.clone(), "hi".into(), harness.alice.clone())
            .await;

        // One successful update before the stream broke.
        let updates = fanout.user_events(addresses::MESSAGE_UPDATES);
        assert_eq!(updates.len(), 1);

        // Announcement first, then the full-message fallback.
        let deliveries = fanout.user_events(addresses::MESSAGES);
        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[0].1["content"], "");
        assert_eq!(deliveries[1].1["content"], "alpha beta gamma");
    }

    #[tokio::test]
    async fn self_read_never_flips_but_peer_read_does() {
        let harness = harness();
        let conversation = harness
            .engine
            .create_or_get_conversation(
                "alice",
                Some(harness.bob.id),
                ConversationType::HumanToHuman,
            )
            .await
            .unwrap();

        let sent = harness
            .engine
            .send_message("alice", conversation.id, "unread?")
            .await
            .unwrap();

        harness
            .engine
            .mark_message_read(sent.id, "alice")
            .await
            .unwrap();
        let after_self = harness.messages.find_by_id(sent.id).await.unwrap().unwrap();
        assert!(!after_self.is_read);
        assert_eq!(after_self.status, MessageStatus::Sent);

        harness
            .engine
            .mark_message_read(sent.id, "bob")
            .await
            .unwrap();
        let after_peer = harness.messages.find_by_id(sent.id).await.unwrap().unwrap();
        assert!(after_peer.is_read);
        assert_eq!(after_peer.status, MessageStatus::Read);
    }

    #[tokio::test]
    async fn mark_conversation_read_clears_only_foreign_messages() {
        let harness = harness();
        let conversation = harness
            .engine
            .create_or_get_conversation(
                "alice",
                Some(harness.bob.id),
                ConversationType::HumanToHuman,
            )
            .await
            .unwrap();

        harness
            .engine
            .send_message("alice", conversation.id, "one")
            .await
            .unwrap();
        harness
            .engine
            .send_message("bob", conversation.id, "two")
            .await
            .unwrap();

        harness
            .engine
            .mark_conversation_read(conversation.id, "bob")
            .await
            .unwrap();

        let stored = harness
            .messages
            .find_by_conversation(conversation.id)
            .await
            .unwrap();
        // Alice's message is now read from Bob's side; Bob's own stays unread.
        assert!(stored.iter().any(|m| m.content == "one" && m.is_read));
        assert!(stored.iter().any(|m| m.content == "two" && !m.is_read));
    }

    #[tokio::test]
    async fn soft_close_leads_to_a_fresh_conversation() {
        let harness = harness();
        let first = harness
            .engine
            .create_or_get_conversation("alice", None, ConversationType::HumanToAi)
            .await
            .unwrap();

        harness
            .engine
            .delete_conversation(first.id, "alice")
            .await
            .unwrap();

        assert!(harness.engine.list_conversations("alice").await.unwrap().is_empty());

        let second = harness
            .engine
            .create_or_get_conversation("alice", None, ConversationType::HumanToAi)
            .await
            .unwrap();
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn list_messages_requires_membership() {
        let harness = harness();
        let conversation = harness
            .engine
            .create_or_get_conversation(
                "alice",
                Some(harness.bob.id),
                ConversationType::HumanToHuman,
            )
            .await
            .unwrap();

        let result = harness.engine.list_messages(conversation.id, "carol").await;
        assert!(matches!(result, Err(ChatEngineError::PermissionDenied(_))));

        let _ = harness.carol;
    }

    #[tokio::test]
    async fn connect_toggles_presence_and_broadcasts() {
        let harness = harness();

        harness.engine.handle_connect("alice").await;
        let online = harness.engine.online_users("bob").await.unwrap();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].username, "alice");

        // The caller is excluded from their own listing.
        assert!(harness.engine.online_users("alice").await.unwrap().is_empty());

        harness.engine.handle_disconnect("alice").await;
        assert!(harness.engine.online_users("bob").await.unwrap().is_empty());

        let broadcasts = harness.fanout.topic_events(addresses::USER_STATUS_TOPIC);
        assert_eq!(broadcasts.len(), 2);
        assert_eq!(broadcasts[0]["online"], true);
        assert_eq!(broadcasts[1]["online"], false);
    }

    #[tokio::test]
    async fn typing_broadcast_reaches_the_conversation_topic() {
        let harness = harness();
        let conversation_id = Uuid::new_v4();

        harness
            .engine
            .broadcast_typing("alice", conversation_id, true)
            .await;

        let events = harness
            .fanout
            .topic_events(&addresses::typing_topic(conversation_id));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["sender"], "alice");
        assert_eq!(events[0]["typing"], true);
    }

    #[tokio::test]
    async fn read_receipt_broadcast_reaches_the_conversation_topic() {
        let harness = harness();
        let conversation_id = Uuid::new_v4();

        harness
            .engine
            .broadcast_read_receipt("bob", conversation_id, None)
            .await;

        let events = harness
            .fanout
            .topic_events(&addresses::read_receipt_topic(conversation_id));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["reader"], "bob");
        assert!(events[0]["message_id"].is_null());
    }

    #[tokio::test]
    async fn content_is_trimmed_and_cached_with_the_sender_label() {
        let harness = harness();
        let conversation = harness
            .engine
            .create_or_get_conversation("alice", None, ConversationType::HumanToAi)
            .await
            .unwrap();

        let view = harness
            .engine
            .send_message("alice", conversation.id, "  hi there  ")
            .await
            .unwrap();
        assert_eq!(view.content, "hi there");

        let context = harness.cache.retrieve(conversation.id, 5);
        assert!(context.contains("[Alice]: hi there"));
    }
}
