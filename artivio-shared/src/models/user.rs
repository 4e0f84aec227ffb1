use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::Timestamp;

/// Represents a user in the system.
///
/// Accounts are provisioned by the external identity layer; the chat core
/// only reads them and toggles presence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct User {
    /// Unique identifier for the user.
    pub id: Uuid,

    /// The user's login name, as authenticated upstream.
    pub username: String,

    /// The name shown to other participants.
    pub display_name: String,

    /// Whether the user currently holds an open push connection.
    pub is_online: bool,

    /// Last time the user's connection state changed.
    pub last_seen: Timestamp,

    /// When the account was created.
    pub created_at: Timestamp,
}

/// Transport projection of a [`User`] embedded in message and conversation
/// payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct UserView {
    /// Unique identifier for the user.
    pub id: Uuid,
    /// The user's login name.
    pub username: String,
    /// The name shown to other participants.
    pub display_name: String,
    /// Whether the user currently holds an open push connection.
    pub is_online: bool,
}

impl UserView {
    /// Projects a persisted [`User`] into its transport shape.
    #[must_use]
    pub fn project(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            display_name: user.display_name.clone(),
            is_online: user.is_online,
        }
    }
}
