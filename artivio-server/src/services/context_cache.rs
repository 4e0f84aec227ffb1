//! Bounded in-memory context for AI replies.
//!
//! Keeps the most recent conversation lines per conversation so the reply
//! generator can be primed with context. This is a recency buffer, not a
//! search index: entries are evicted oldest-first once a conversation
//! exceeds its capacity. Every operation is total; an unknown conversation
//! id degrades to an empty result.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

/// Lock-protected map of conversation id to its bounded line buffer.
///
/// Constructed once at process start and injected into the engine; cleared
/// only through [`ContextCache::clear`], never persisted. Safe under
/// concurrent producers; the lock is never held across an await.
#[derive(Debug)]
pub struct ContextCache {
    capacity: usize,
    entries: Mutex<HashMap<Uuid, VecDeque<String>>>,
}

impl ContextCache {
    /// Creates a cache retaining up to `capacity` lines per conversation.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Appends a `"[speaker]: text"` line for the conversation, evicting the
    /// oldest lines beyond capacity.
    pub fn store(&self, conversation_id: Uuid, speaker: &str, text: &str) {
        let line = format!("[{speaker}]: {text}");

        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let queue = entries.entry(conversation_id).or_default();
        queue.push_back(line);
        while queue.len() > self.capacity {
            queue.pop_front();
        }
    }

    /// Returns up to `max_lines` of the most recently stored lines, oldest
    /// of that window first, joined by newlines. Empty string when nothing
    /// is cached.
    #[must_use]
    pub fn retrieve(&self, conversation_id: Uuid, max_lines: usize) -> String {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(queue) = entries.get(&conversation_id) else {
            return String::new();
        };

        let skip = queue.len().saturating_sub(max_lines);
        queue
            .iter()
            .skip(skip)
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Drops every cached line for the conversation.
    pub fn clear(&self, conversation_id: Uuid) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        entries.remove(&conversation_id);
    }
}
