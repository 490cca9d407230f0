//! The per-turn agent handed to intent handlers
//!
//! Handlers see exactly five capabilities: append reply text, read a
//! context as it stood before the turn, write or clear a context, and read
//! the raw user query. Writes are buffered as mutations and applied by the
//! turn loop after the handler returns.

use crate::context::{ConversationContext, SessionContexts};
use crate::models::{ContextMutation, Parameters};

pub trait ConversationAgent: Send {
    fn append_reply(&mut self, text: &str);

    /// Context as it stood before this turn, `None` if absent or expired
    fn read_context(&self, name: &str) -> Option<&ConversationContext>;

    fn write_context(&mut self, name: &str, parameters: Parameters, lifespan: u32);

    fn clear_context(&mut self, name: &str);

    fn raw_query(&self) -> &str;
}

/// Buffering agent used by the turn loop
pub struct TurnAgent {
    snapshot: SessionContexts,
    query: String,
    replies: Vec<String>,
    mutations: Vec<ContextMutation>,
}

impl TurnAgent {
    pub fn new(snapshot: SessionContexts, query: impl Into<String>) -> Self {
        Self {
            snapshot,
            query: query.into(),
            replies: Vec::new(),
            mutations: Vec::new(),
        }
    }

    pub fn reply_text(&self) -> String {
        self.replies.join("\n")
    }

    pub fn mutations(&self) -> &[ContextMutation] {
        &self.mutations
    }

    pub fn into_parts(self) -> (String, Vec<ContextMutation>) {
        (self.replies.join("\n"), self.mutations)
    }
}

impl ConversationAgent for TurnAgent {
    fn append_reply(&mut self, text: &str) {
        self.replies.push(text.to_string());
    }

    fn read_context(&self, name: &str) -> Option<&ConversationContext> {
        self.snapshot.get(name)
    }

    fn write_context(&mut self, name: &str, parameters: Parameters, lifespan: u32) {
        self.mutations.push(ContextMutation {
            name: name.to_string(),
            parameters,
            lifespan,
        });
    }

    fn clear_context(&mut self, name: &str) {
        self.write_context(name, Parameters::new(), 0);
    }

    fn raw_query(&self) -> &str {
        &self.query
    }
}
