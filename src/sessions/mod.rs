//! Session management: per-user conversation history, bounded and volatile.

pub mod in_memory;
pub mod traits;

pub use in_memory::InMemorySessionStore;
pub use traits::{Role, Session, SessionStore, Turn, DEFAULT_MAX_TURNS};

use crate::config::SessionConfig;
use std::sync::Arc;

/// Create the session store described by config.
pub fn create_session_store(config: &SessionConfig) -> Arc<dyn SessionStore> {
    Arc::new(InMemorySessionStore::with_max_turns(config.max_turns))
}
