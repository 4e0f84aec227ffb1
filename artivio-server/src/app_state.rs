use std::sync::Arc;

use shared::config::server::Config;

use crate::{fanout::SseCoordinator, services::chat_engine::ChatEngine};

/// Application state shared across all routes.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ChatEngine>,
    pub coordinator: Arc<SseCoordinator>,
    pub config: Arc<Config>,
}
