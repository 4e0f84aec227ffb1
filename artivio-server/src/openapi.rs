#![allow(clippy::needless_for_each)] // Derive macro emits a for_each internally

use shared::models::{
    ChatMessageRequest, ConversationView, CreateConversationRequest, ErrorResponse, MessageView,
    ReadNotification, TypingNotification, UserView,
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Artivio API",
        version = "1.0.0",
        description = "API documentation for the Artivio chat backend"
    ),
    paths(
        crate::handlers::chat::list_conversations,
        crate::handlers::chat::create_or_get_conversation,
        crate::handlers::chat::list_messages,
        crate::handlers::chat::send_message,
        crate::handlers::chat::mark_message_read,
        crate::handlers::chat::mark_conversation_read,
        crate::handlers::chat::apply_read_notification,
        crate::handlers::chat::delete_conversation,
        crate::handlers::chat::online_users,
        crate::handlers::chat::typing,
    ),
    components(
        schemas(
            ChatMessageRequest,
            ConversationView,
            CreateConversationRequest,
            ErrorResponse,
            MessageView,
            ReadNotification,
            TypingNotification,
            UserView,
        )
    ),
    tags(
        (name = "Chat", description = "Conversation and message endpoints")
    )
)]
pub struct ApiDoc;
