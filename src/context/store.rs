//! Per-session context state
//!
//! A context is a named bag of parameters with a turn counter. It is
//! readable while the counter is above zero and dropped when it hits zero.

use crate::models::{ContextMutation, Parameters};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationContext {
    pub name: String,
    pub parameters: Parameters,
    pub remaining_turns: u32,
}

impl ConversationContext {
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(|v| v.as_str())
    }
}

/// Context names are matched case-insensitively
pub fn normalize_name(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

/// All contexts of one session
#[derive(Debug, Clone, Default)]
pub struct SessionContexts {
    contexts: BTreeMap<String, ConversationContext>,
}

impl SessionContexts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&ConversationContext> {
        self.contexts
            .get(&normalize_name(name))
            .filter(|ctx| ctx.remaining_turns > 0)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Set or refresh a context for `lifespan` future turns.
    ///
    /// Fields in `parameters` overwrite the stored ones; fields not named
    /// keep their value. A lifespan of zero clears the context.
    pub fn set(&mut self, name: &str, parameters: Parameters, lifespan: u32) {
        let key = normalize_name(name);

        if lifespan == 0 {
            self.contexts.remove(&key);
            return;
        }

        let ctx = self
            .contexts
            .entry(key.clone())
            .or_insert_with(|| ConversationContext {
                name: key,
                parameters: Parameters::new(),
                remaining_turns: 0,
            });

        for (field, value) in parameters {
            ctx.parameters.insert(field, value);
        }
        ctx.remaining_turns = lifespan;
    }

    pub fn clear(&mut self, name: &str) {
        self.contexts.remove(&normalize_name(name));
    }

    pub fn apply(&mut self, mutation: &ContextMutation) {
        self.set(&mutation.name, mutation.parameters.clone(), mutation.lifespan);
    }

    /// One turn has passed: every context loses a turn, expired ones go
    pub fn advance_turn(&mut self) {
        for ctx in self.contexts.values_mut() {
            ctx.remaining_turns = ctx.remaining_turns.saturating_sub(1);
        }
        self.contexts.retain(|_, ctx| ctx.remaining_turns > 0);
    }

    pub fn active(&self) -> impl Iterator<Item = &ConversationContext> {
        self.contexts.values().filter(|ctx| ctx.remaining_turns > 0)
    }

    pub fn len(&self) -> usize {
        self.active().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: serde_json::Value) -> Parameters {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_lifespan_two_survives_one_advance() {
        let mut session = SessionContexts::new();
        session.set("collecting_name", Parameters::new(), 2);

        session.advance_turn();
        assert!(session.contains("collecting_name"));

        session.advance_turn();
        assert!(!session.contains("collecting_name"));
        assert!(session.is_empty());
    }

    #[test]
    fn test_set_merges_fields() {
        let mut session = SessionContexts::new();
        session.set("user_details", params(json!({"name": "Asha"})), 10);
        session.set("user_details", params(json!({"mobile": "9876543210"})), 10);

        let ctx = session.get("user_details").unwrap();
        assert_eq!(ctx.param_str("name"), Some("Asha"));
        assert_eq!(ctx.param_str("mobile"), Some("9876543210"));
    }

    #[test]
    fn test_set_overwrites_named_field_and_resets_lifespan() {
        let mut session = SessionContexts::new();
        session.set("user_details", params(json!({"name": "Asha"})), 3);
        session.advance_turn();
        session.set("user_details", params(json!({"name": "Ravi"})), 3);

        let ctx = session.get("user_details").unwrap();
        assert_eq!(ctx.param_str("name"), Some("Ravi"));
        assert_eq!(ctx.remaining_turns, 3);
    }

    #[test]
    fn test_zero_lifespan_clears() {
        let mut session = SessionContexts::new();
        session.set("awaiting_confirmation", Parameters::new(), 2);
        session.set("awaiting_confirmation", Parameters::new(), 0);
        assert!(session.get("awaiting_confirmation").is_none());

        session.set("awaiting_confirmation", Parameters::new(), 2);
        session.clear("Awaiting_Confirmation");
        assert!(session.get("awaiting_confirmation").is_none());
    }
}
