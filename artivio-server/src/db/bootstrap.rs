//! Schema bootstrap for the relational store.
//!
//! Statements are idempotent; running against an already-bootstrapped
//! database is a no-op. Accounts land in `users` via the external identity
//! layer; this schema only has to agree on the shape.

use sqlx::PgPool;
use tracing::info;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id UUID PRIMARY KEY,
        username TEXT NOT NULL UNIQUE,
        display_name TEXT NOT NULL,
        is_online BOOLEAN NOT NULL DEFAULT FALSE,
        last_seen TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE TABLE IF NOT EXISTS conversations (
        id UUID PRIMARY KEY,
        conversation_type TEXT NOT NULL,
        title TEXT NOT NULL,
        created_by UUID NOT NULL REFERENCES users(id),
        participant_id UUID REFERENCES users(id),
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        last_message_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        id UUID PRIMARY KEY,
        conversation_id UUID NOT NULL REFERENCES conversations(id),
        sender_id UUID REFERENCES users(id),
        content TEXT NOT NULL,
        message_type TEXT NOT NULL,
        status TEXT NOT NULL,
        is_read BOOLEAN NOT NULL DEFAULT FALSE,
        is_delivered BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_conversation_created_at \
     ON messages (conversation_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_conversations_last_message_at \
     ON conversations (last_message_at DESC)",
];

/// Simple liveness check used during startup.
///
/// # Errors
/// Returns an error if the database is unreachable.
pub async fn ensure_liveness(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await.map(|_| ())
}

/// Applies the chat schema.
///
/// # Errors
/// Returns an error if any schema statement fails.
pub async fn run(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    info!(statements = SCHEMA.len(), "database schema bootstrapped");
    Ok(())
}
