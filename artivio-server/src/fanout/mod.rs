//! Addressable push fan-out.
//!
//! The engine addresses recipients two ways: `send_to_user` delivers one
//! copy to a specific authenticated user, `send_to_topic` broadcasts to
//! every subscriber of a topic. Duplication across multiple sessions of the
//! same user is the transport's concern, not the engine's.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub mod sse;

pub use sse::{SseCoordinator, SubscriptionError};

/// Errors surfaced by the push channel.
///
/// Publishing to a user with no open connection is not an error; delivery
/// is best-effort and the persisted store remains the source of truth.
#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("subscriber channel closed")]
    ChannelClosed,
}

pub type FanoutResult = Result<(), FanoutError>;

/// Addressable push mechanism consumed by the chat engine.
#[async_trait]
pub trait FanoutChannel: Send + Sync {
    /// Delivers a payload to one user at the given address. A no-op when
    /// the user holds no open connection.
    async fn send_to_user(&self, username: &str, address: &str, payload: Value) -> FanoutResult;

    /// Broadcasts a payload to every subscriber of the topic.
    async fn send_to_topic(&self, topic: &str, payload: Value) -> FanoutResult;
}
