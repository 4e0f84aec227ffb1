//! SSE-backed implementation of the fan-out channel.
//!
//! One mpsc-buffered event stream per connected username. User-addressed
//! events carry their queue address in the SSE `event` field; topic events
//! carry the topic name and are fanned to every connected stream, leaving
//! subscription filtering to clients.

use async_trait::async_trait;
use serde_json::{Value, json};
use shared::models::addresses;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, trace};

use super::{FanoutChannel, FanoutError, FanoutResult};

/// A single event flowing to one client stream.
#[derive(Debug, Clone)]
pub struct PushEvent {
    /// SSE event name: a queue address or a topic.
    pub event: String,
    /// JSON payload, already serialized.
    pub data: String,
}

/// Errors raised when opening a stream.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("user already holds an open stream")]
    AlreadyConnected,
}

#[derive(Default)]
struct UserStreamState {
    sender: Option<mpsc::Sender<PushEvent>>,
}

impl std::fmt::Debug for UserStreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserStreamState")
            .field("connected", &self.sender.is_some())
            .finish()
    }
}

/// Tracks one outbound channel per connected username.
#[derive(Debug)]
pub struct SseCoordinator {
    capacity: usize,
    inner: Mutex<HashMap<String, UserStreamState>>,
}

impl SseCoordinator {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Opens the user's event stream, refusing a second concurrent stream
    /// for the same username.
    ///
    /// # Errors
    /// Returns [`SubscriptionError::AlreadyConnected`] while a previous
    /// stream for this username is still live.
    pub async fn subscribe(
        &self,
        username: &str,
    ) -> Result<mpsc::Receiver<PushEvent>, SubscriptionError> {
        let (sender, receiver) = {
            let mut guard = self.inner.lock().await;
            let entry = guard.entry(username.to_string()).or_default();

            if let Some(existing) = entry.sender.as_ref() {
                if !existing.is_closed() {
                    return Err(SubscriptionError::AlreadyConnected);
                }
            }

            let (tx, rx) = mpsc::channel(self.capacity);
            entry.sender = Some(tx.clone());
            (tx, rx)
        };

        // Connection acknowledgement so clients know the stream is live.
        let ack = PushEvent {
            event: "connection".to_string(),
            data: json!({ "message": "Connected to Artivio stream" }).to_string(),
        };
        let _ = sender.send(ack).await;

        Ok(receiver)
    }

    async fn sender_for(&self, username: &str) -> Option<mpsc::Sender<PushEvent>> {
        let guard = self.inner.lock().await;
        guard.get(username).and_then(|state| state.sender.clone())
    }

    async fn clear_sender(&self, username: &str) {
        let mut guard = self.inner.lock().await;
        if let Some(state) = guard.get_mut(username) {
            state.sender = None;
        }
    }

    async fn dispatch(
        &self,
        username: &str,
        sender: mpsc::Sender<PushEvent>,
        message: PushEvent,
    ) -> FanoutResult {
        match sender.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(message)) => {
                // Streaming-update frames are droppable under backpressure;
                // everything else must reach a live channel.
                if message.event == addresses::MESSAGE_UPDATES {
                    trace!(username, "dropping streaming update frame: channel full");
                    Ok(())
                } else if sender.send(message).await.is_err() {
                    self.clear_sender(username).await;
                    Err(FanoutError::ChannelClosed)
                } else {
                    Ok(())
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(username, "push channel closed; clearing sender");
                self.clear_sender(username).await;
                Err(FanoutError::ChannelClosed)
            }
        }
    }
}

#[async_trait]
impl FanoutChannel for SseCoordinator {
    async fn send_to_user(&self, username: &str, address: &str, payload: Value) -> FanoutResult {
        let Some(sender) = self.sender_for(username).await else {
            trace!(username, address, "no open stream; dropping user event");
            return Ok(());
        };

        let message = PushEvent {
            event: address.to_string(),
            data: payload.to_string(),
        };
        self.dispatch(username, sender, message).await
    }

    async fn send_to_topic(&self, topic: &str, payload: Value) -> FanoutResult {
        let senders: Vec<(String, mpsc::Sender<PushEvent>)> = {
            let guard = self.inner.lock().await;
            guard
                .iter()
                .filter_map(|(username, state)| {
                    state
                        .sender
                        .clone()
                        .map(|sender| (username.clone(), sender))
                })
                .collect()
        };

        let data = payload.to_string();
        for (username, sender) in senders {
            let message = PushEvent {
                event: topic.to_string(),
                data: data.clone(),
            };
            // Topic broadcasts are ephemeral; a lagging or closed subscriber
            // never fails the broadcast.
            match sender.try_send(message) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    trace!(username = %username, topic, "dropping topic event: channel full");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.clear_sender(&username).await;
                }
            }
        }
        Ok(())
    }
}
