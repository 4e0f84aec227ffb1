use std::sync::Arc;

use axum::{
    Router,
    routing::{delete, get, post, put},
};

use crate::{app_state::AppState, handlers};

/// Routes under `/api/chat`.
pub fn create_chat_router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/conversations",
            get(handlers::chat::list_conversations).post(handlers::chat::create_or_get_conversation),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            get(handlers::chat::list_messages),
        )
        .route(
            "/conversations/{conversation_id}/read",
            put(handlers::chat::mark_conversation_read),
        )
        .route(
            "/conversations/{conversation_id}",
            delete(handlers::chat::delete_conversation),
        )
        .route("/messages", post(handlers::chat::send_message))
        .route(
            "/messages/{message_id}/read",
            put(handlers::chat::mark_message_read),
        )
        .route("/read", post(handlers::chat::apply_read_notification))
        .route("/users/online", get(handlers::chat::online_users))
        .route("/typing", post(handlers::chat::typing))
        .route("/stream", get(handlers::events::stream))
}
