//! REST surface of the chat engine.
//!
//! Every handler reads the authenticated username from the request context
//! bound by the identity middleware; the engine trusts it.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, State},
    http::StatusCode,
};
use shared::models::{
    ChatMessageRequest, ConversationView, CreateConversationRequest, ErrorResponse, MessageView,
    ReadNotification, TypingNotification, UserView,
};
use uuid::Uuid;

use crate::{
    app_state::AppState,
    http::error::AppResult,
    middleware::request_context::RequestContext,
};

#[utoipa::path(
    get,
    path = "/api/chat/conversations",
    responses(
        (status = 200, description = "Conversations retrieved", body = Vec<ConversationView>),
        (status = 401, description = "Missing identity", body = ErrorResponse)
    ),
    tag = "Chat"
)]
pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
) -> AppResult<Json<Vec<ConversationView>>> {
    let username = ctx.require_username()?;
    let conversations = state.engine.list_conversations(username).await?;
    Ok(Json(conversations))
}

#[utoipa::path(
    post,
    path = "/api/chat/conversations",
    request_body = CreateConversationRequest,
    responses(
        (status = 200, description = "Conversation created or retrieved", body = ConversationView),
        (status = 400, description = "Missing recipient", body = ErrorResponse),
        (status = 404, description = "User not found", body = ErrorResponse)
    ),
    tag = "Chat"
)]
pub async fn create_or_get_conversation(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Json(request): Json<CreateConversationRequest>,
) -> AppResult<Json<ConversationView>> {
    let username = ctx.require_username()?;
    let conversation = state
        .engine
        .create_or_get_conversation(username, request.recipient_id, request.conversation_type)
        .await?;
    Ok(Json(conversation))
}

#[utoipa::path(
    get,
    path = "/api/chat/conversations/{conversation_id}/messages",
    responses(
        (status = 200, description = "Messages retrieved", body = Vec<MessageView>),
        (status = 403, description = "Not a participant", body = ErrorResponse),
        (status = 404, description = "Conversation not found", body = ErrorResponse)
    ),
    tag = "Chat"
)]
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(conversation_id): Path<Uuid>,
) -> AppResult<Json<Vec<MessageView>>> {
    let username = ctx.require_username()?;
    let messages = state.engine.list_messages(conversation_id, username).await?;
    Ok(Json(messages))
}

#[utoipa::path(
    post,
    path = "/api/chat/messages",
    request_body = ChatMessageRequest,
    responses(
        (status = 200, description = "Message persisted and fanned out", body = MessageView),
        (status = 403, description = "Not a participant", body = ErrorResponse),
        (status = 404, description = "Conversation not found", body = ErrorResponse)
    ),
    tag = "Chat"
)]
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Json(request): Json<ChatMessageRequest>,
) -> AppResult<Json<MessageView>> {
    let username = ctx.require_username()?;
    let message = state
        .engine
        .send_message(username, request.conversation_id, &request.content)
        .await?;
    Ok(Json(message))
}

#[utoipa::path(
    put,
    path = "/api/chat/messages/{message_id}/read",
    responses(
        (status = 200, description = "Message marked read"),
        (status = 404, description = "Message not found", body = ErrorResponse)
    ),
    tag = "Chat"
)]
pub async fn mark_message_read(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(message_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let username = ctx.require_username()?;
    state.engine.mark_message_read(message_id, username).await?;
    Ok(StatusCode::OK)
}

#[utoipa::path(
    put,
    path = "/api/chat/conversations/{conversation_id}/read",
    responses(
        (status = 200, description = "Conversation marked read"),
        (status = 404, description = "Conversation not found", body = ErrorResponse)
    ),
    tag = "Chat"
)]
pub async fn mark_conversation_read(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(conversation_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let username = ctx.require_username()?;
    state
        .engine
        .mark_conversation_read(conversation_id, username)
        .await?;
    state
        .engine
        .broadcast_read_receipt(username, conversation_id, None)
        .await;
    Ok(StatusCode::OK)
}

/// Marks a message, a conversation, or both as read in one call; mirrors
/// the read receipts clients send over the push channel.
#[utoipa::path(
    post,
    path = "/api/chat/read",
    request_body = ReadNotification,
    responses(
        (status = 200, description = "Read receipts applied"),
        (status = 404, description = "Target not found", body = ErrorResponse)
    ),
    tag = "Chat"
)]
pub async fn apply_read_notification(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Json(notification): Json<ReadNotification>,
) -> AppResult<StatusCode> {
    let username = ctx.require_username()?;

    if let Some(message_id) = notification.message_id {
        state.engine.mark_message_read(message_id, username).await?;
    }
    if let Some(conversation_id) = notification.conversation_id {
        state
            .engine
            .mark_conversation_read(conversation_id, username)
            .await?;
        state
            .engine
            .broadcast_read_receipt(username, conversation_id, notification.message_id)
            .await;
    }
    Ok(StatusCode::OK)
}

#[utoipa::path(
    delete,
    path = "/api/chat/conversations/{conversation_id}",
    responses(
        (status = 200, description = "Conversation closed"),
        (status = 403, description = "Not a participant", body = ErrorResponse),
        (status = 404, description = "Conversation not found", body = ErrorResponse)
    ),
    tag = "Chat"
)]
pub async fn delete_conversation(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path(conversation_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let username = ctx.require_username()?;
    state
        .engine
        .delete_conversation(conversation_id, username)
        .await?;
    Ok(StatusCode::OK)
}

#[utoipa::path(
    get,
    path = "/api/chat/users/online",
    responses(
        (status = 200, description = "Online users retrieved", body = Vec<UserView>)
    ),
    tag = "Chat"
)]
pub async fn online_users(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
) -> AppResult<Json<Vec<UserView>>> {
    let username = ctx.require_username()?;
    let users = state.engine.online_users(username).await?;
    Ok(Json(users))
}

/// Topic broadcast; the sender field is overwritten with the authenticated
/// identity before fan-out.
#[utoipa::path(
    post,
    path = "/api/chat/typing",
    request_body = TypingNotification,
    responses(
        (status = 200, description = "Typing notification broadcast")
    ),
    tag = "Chat"
)]
pub async fn typing(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Json(notification): Json<TypingNotification>,
) -> AppResult<StatusCode> {
    let username = ctx.require_username()?;
    state
        .engine
        .broadcast_typing(username, notification.conversation_id, notification.typing)
        .await;
    Ok(StatusCode::OK)
}
