//! In-memory session store implementation.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

use super::traits::{Session, SessionStore, Turn, DEFAULT_MAX_TURNS};

/// An in-memory session store: a map of per-user sessions, each behind its own mutex.
///
/// The map lock is only held to look up or insert a session handle, so a slow
/// operation on one user never blocks another user's session.
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    max_turns: usize,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::with_max_turns(DEFAULT_MAX_TURNS)
    }

    /// `max_turns` must be positive and even so trimming never splits an exchange.
    pub fn with_max_turns(max_turns: usize) -> Self {
        debug_assert!(max_turns > 0 && max_turns % 2 == 0);
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_turns,
        }
    }

    fn session(&self, user_id: &str) -> Arc<Mutex<Session>> {
        if let Some(existing) = self.existing(user_id) {
            return existing;
        }

        let mut sessions = self.sessions.write();
        Arc::clone(sessions.entry(user_id.to_string()).or_insert_with(|| {
            tracing::debug!(user_id, "session created");
            Arc::new(Mutex::new(Session::new(user_id)))
        }))
    }

    fn existing(&self, user_id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().get(user_id).map(Arc::clone)
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get_or_create(&self, user_id: &str) -> Session {
        self.session(user_id).lock().clone()
    }

    async fn append_exchange(&self, user_id: &str, user_text: &str, assistant_text: &str) {
        let session = self.session(user_id);
        let mut session = session.lock();
        session.push_exchange(
            Turn::user(user_text),
            Turn::assistant(assistant_text),
            self.max_turns,
        );
    }

    async fn clear(&self, user_id: &str) {
        self.session(user_id).lock().reset();
    }

    async fn snapshot(&self, user_id: &str) -> Vec<Turn> {
        self.session(user_id).lock().turns.clone()
    }

    async fn len(&self, user_id: &str) -> usize {
        self.existing(user_id)
            .map_or(0, |session| session.lock().turns.len())
    }

    fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    fn max_turns(&self) -> usize {
        self.max_turns
    }

    fn name(&self) -> &str {
        "in_memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::Role;

    #[tokio::test]
    async fn get_or_create_starts_empty() {
        let store = InMemorySessionStore::new();

        let session = store.get_or_create("1001").await;
        assert_eq!(session.user_id, "1001");
        assert!(session.turns.is_empty());
        assert_eq!(store.session_count(), 1);

        store.get_or_create("1001").await;
        assert_eq!(store.session_count(), 1);
    }

    #[tokio::test]
    async fn single_exchange_is_recorded_in_order() {
        let store = InMemorySessionStore::new();
        store.append_exchange("1001", "hi", "OK").await;

        let history = store.snapshot("1001").await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role(), Role::User);
        assert_eq!(history[0].content(), "hi");
        assert_eq!(history[1].role(), Role::Assistant);
        assert_eq!(history[1].content(), "OK");
    }

    #[tokio::test]
    async fn history_length_is_min_of_two_n_and_limit() {
        for n in [1_usize, 5, 19, 20, 21, 37] {
            let store = InMemorySessionStore::new();
            for i in 0..n {
                store
                    .append_exchange("u", &format!("q{i}"), &format!("a{i}"))
                    .await;
            }

            let history = store.snapshot("u").await;
            let expected_len = (2 * n).min(40);
            assert_eq!(history.len(), expected_len, "n = {n}");

            let first_kept = n - expected_len / 2;
            for (pair, i) in history.chunks(2).zip(first_kept..n) {
                assert_eq!(pair[0].content(), format!("q{i}"));
                assert_eq!(pair[1].content(), format!("a{i}"));
            }
        }
    }

    #[tokio::test]
    async fn twenty_five_exchanges_keep_six_through_twenty_five() {
        let store = InMemorySessionStore::new();
        for i in 1..=25 {
            store
                .append_exchange("u", &format!("question {i}"), &format!("answer {i}"))
                .await;
        }

        let history = store.snapshot("u").await;
        assert_eq!(history.len(), 40);
        assert_eq!(history.first().unwrap().content(), "question 6");
        assert_eq!(history.last().unwrap().content(), "answer 25");
    }

    #[tokio::test]
    async fn custom_limit_is_respected() {
        let store = InMemorySessionStore::with_max_turns(4);
        for i in 0..10 {
            store.append_exchange("u", &format!("q{i}"), "a").await;
        }
        assert_eq!(store.len("u").await, 4);
        assert_eq!(store.snapshot("u").await[0].content(), "q8");
        assert_eq!(store.max_turns(), 4);
    }

    #[tokio::test]
    async fn clear_empties_history_and_is_idempotent() {
        let store = InMemorySessionStore::new();
        for i in 0..10 {
            store.append_exchange("u", &format!("q{i}"), "a").await;
        }

        store.clear("u").await;
        assert_eq!(store.len("u").await, 0);
        store.clear("u").await;
        assert_eq!(store.len("u").await, 0);
        assert_eq!(store.session_count(), 1);
    }

    #[tokio::test]
    async fn clear_unknown_user_does_not_fail() {
        let store = InMemorySessionStore::new();
        store.clear("ghost").await;
        assert!(store.snapshot("ghost").await.is_empty());
    }

    #[tokio::test]
    async fn len_does_not_create_sessions() {
        let store = InMemorySessionStore::new();
        assert_eq!(store.len("nobody").await, 0);
        assert_eq!(store.session_count(), 0);
    }

    #[tokio::test]
    async fn snapshot_is_detached_from_later_writes() {
        let store = InMemorySessionStore::new();
        store.append_exchange("u", "one", "1").await;
        let before = store.snapshot("u").await;

        store.append_exchange("u", "two", "2").await;
        assert_eq!(before.len(), 2);
        assert_eq!(store.len("u").await, 4);
    }

    #[tokio::test]
    async fn concurrent_appends_stay_paired() {
        let store = Arc::new(InMemorySessionStore::with_max_turns(400));
        let mut handles = Vec::new();
        for worker in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                for i in 0..20 {
                    store
                        .append_exchange("shared", &format!("q{worker}-{i}"), &format!("a{worker}-{i}"))
                        .await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let history = store.snapshot("shared").await;
        assert_eq!(history.len(), 320);
        for pair in history.chunks(2) {
            assert_eq!(pair[0].role(), Role::User);
            assert_eq!(pair[1].role(), Role::Assistant);
            assert_eq!(&pair[0].content()[1..], &pair[1].content()[1..]);
        }
    }

    #[tokio::test]
    async fn users_never_share_history() {
        let store = Arc::new(InMemorySessionStore::new());
        let a = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.append_exchange("alice", "from alice", "to alice").await })
        };
        let b = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.append_exchange("bob", "from bob", "to bob").await })
        };
        a.await.unwrap();
        b.await.unwrap();

        let alice = store.snapshot("alice").await;
        let bob = store.snapshot("bob").await;
        assert!(alice.iter().all(|t| t.content().contains("alice")));
        assert!(bob.iter().all(|t| t.content().contains("bob")));
        assert_eq!(alice.len(), 2);
        assert_eq!(bob.len(), 2);
    }
}
