//! Conversation context store
//!
//! Turn-scoped, per-session state used to carry slot-filling progress
//! between otherwise independent requests. Each session has its own lock;
//! sessions never contend with one another.

pub mod store;

pub use store::{normalize_name, ConversationContext, SessionContexts};

use crate::models::Parameters;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub type SessionHandle = Arc<Mutex<SessionContexts>>;

pub struct ContextStore {
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Handle to a session's contexts, created on first use.
    ///
    /// Holding the inner lock serialises every read and write for that
    /// session; the turn loop keeps it for the whole turn.
    pub async fn session(&self, session_id: &str) -> SessionHandle {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SessionContexts::new())))
            .clone()
    }

    pub async fn get(&self, session_id: &str, name: &str) -> Option<ConversationContext> {
        let handle = self.session(session_id).await;
        let session = handle.lock().await;
        session.get(name).cloned()
    }

    pub async fn set(&self, session_id: &str, name: &str, parameters: Parameters, lifespan: u32) {
        let handle = self.session(session_id).await;
        let mut session = handle.lock().await;
        session.set(name, parameters, lifespan);
        debug!(session_id = %session_id, context = %name, lifespan, "Context set");
    }

    pub async fn clear(&self, session_id: &str, name: &str) {
        self.set(session_id, name, Parameters::new(), 0).await;
    }

    pub async fn advance_turn(&self, session_id: &str) {
        let handle = self.session(session_id).await;
        let mut session = handle.lock().await;
        session.advance_turn();
    }

    /// Forget a session that has no live contexts and no other users
    pub async fn prune(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().await;

        let idle = match sessions.get(session_id) {
            // New handles are only cloned under the map lock, so a count of
            // one means nobody else holds this session.
            Some(handle) if Arc::strong_count(handle) == 1 => handle
                .try_lock()
                .map(|session| session.is_empty())
                .unwrap_or(false),
            _ => false,
        };

        if idle {
            sessions.remove(session_id);
            debug!(session_id = %session_id, "Idle session pruned");
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

impl Default for ContextStore {
    fn default() -> Self {
        Self::new()
    }
}
