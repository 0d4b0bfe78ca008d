//! Session storage traits and types for per-user conversation history.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default maximum number of turns retained per session (20 exchanges).
pub const DEFAULT_MAX_TURNS: usize = 40;

/// Author of a stored turn. The system prompt is never stored, so it has no variant here.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message in a conversation. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    role: Role,
    content: String,
    created_at: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// A user's conversation: ordered turns, oldest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub turns: Vec<Turn>,
}

impl Session {
    pub fn new(user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            created_at: now,
            last_activity: now,
            turns: Vec::new(),
        }
    }

    /// Append one user/assistant pair, then drop the oldest turns beyond `max_turns`.
    pub(crate) fn push_exchange(&mut self, user: Turn, assistant: Turn, max_turns: usize) {
        self.turns.push(user);
        self.turns.push(assistant);

        let overflow = self.turns.len().saturating_sub(max_turns);
        if overflow > 0 {
            self.turns.drain(..overflow);
        }
        self.last_activity = Utc::now();
    }

    pub(crate) fn reset(&mut self) {
        self.turns.clear();
        self.last_activity = Utc::now();
    }
}

/// Volatile per-user conversation storage.
///
/// Every operation is infallible and atomic with respect to other operations on
/// the same user id. Operations on different users never wait on each other's
/// session lock.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Return the user's session, creating an empty one on first contact.
    async fn get_or_create(&self, user_id: &str) -> Session;

    /// Append a user turn followed by an assistant turn, then trim to the
    /// store's turn limit by dropping the oldest turns.
    async fn append_exchange(&self, user_id: &str, user_text: &str, assistant_text: &str);

    /// Reset the user's history to empty. Idempotent.
    async fn clear(&self, user_id: &str);

    /// Copy of the user's current history, oldest first.
    async fn snapshot(&self, user_id: &str) -> Vec<Turn>;

    /// Number of stored turns for the user (0 when unknown).
    async fn len(&self, user_id: &str) -> usize {
        self.snapshot(user_id).await.len()
    }

    /// Number of sessions currently held.
    fn session_count(&self) -> usize;

    /// Maximum number of turns retained per session.
    fn max_turns(&self) -> usize;

    /// The name of this session store implementation.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
        assert_eq!(
            serde_json::to_string(&Role::Assistant).unwrap(),
            "\"assistant\""
        );
        assert_eq!(Role::Assistant.to_string(), "assistant");
    }

    #[test]
    fn push_exchange_trims_oldest_pairs() {
        let mut session = Session::new("42");
        for i in 0..3 {
            session.push_exchange(
                Turn::user(format!("q{i}")),
                Turn::assistant(format!("a{i}")),
                4,
            );
        }

        let contents: Vec<&str> = session.turns.iter().map(Turn::content).collect();
        assert_eq!(contents, vec!["q1", "a1", "q2", "a2"]);
        assert_eq!(session.turns[0].role(), Role::User);
    }

    #[test]
    fn reset_keeps_identity() {
        let mut session = Session::new("42");
        session.push_exchange(Turn::user("hi"), Turn::assistant("OK"), 40);
        let created = session.created_at;

        session.reset();
        assert!(session.turns.is_empty());
        assert_eq!(session.user_id, "42");
        assert_eq!(session.created_at, created);
    }
}
