//! The push channel endpoint.
//!
//! Each authenticated user holds at most one SSE stream. Opening the stream
//! drives the connect presence hook; dropping it (client disconnect) drives
//! the disconnect hook. The engine never manages the connection itself.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Extension, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::Stream;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tracing::info;

use crate::{
    app_state::AppState,
    http::error::ApiError,
    middleware::request_context::RequestContext,
    services::chat_engine::ChatEngine,
};

/// Fires the disconnect presence hook when the client stream goes away.
struct DisconnectGuard {
    engine: Arc<ChatEngine>,
    username: String,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let engine = Arc::clone(&self.engine);
        let username = std::mem::take(&mut self.username);
        tokio::spawn(async move {
            engine.handle_disconnect(&username).await;
        });
    }
}

/// `GET /api/chat/stream`: subscribes the authenticated user to their push
/// stream.
pub async fn stream(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let username = ctx.require_username()?.to_string();

    let receiver = state
        .coordinator
        .subscribe(&username)
        .await
        .map_err(|_| ApiError::conflict("a push stream is already open for this user"))?;

    info!(username = %username, "push stream opened");
    state.engine.handle_connect(&username).await;

    let guard = DisconnectGuard {
        engine: Arc::clone(&state.engine),
        username,
    };

    let stream = ReceiverStream::new(receiver).map(move |event| {
        // The guard lives as long as the stream; dropping the stream fires
        // the disconnect hook.
        let _keep_alive = &guard;
        Ok::<_, Infallible>(Event::default().event(event.event).data(event.data))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
