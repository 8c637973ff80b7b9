//! Tokens and Process State
//!
//! A token records that execution is currently "at" a flow object. Tokens
//! are kept in insertion order; "the first token at X" always means the
//! earliest inserted one. A call-activity token additionally names the
//! nested process it spawned and, in persisted snapshots, carries that
//! process's complete state as `substate`.

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    /// Name of the flow object holding this token.
    pub position: String,

    pub owning_process_id: String,

    /// Set for call-activity tokens only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub called_process_id: Option<String>,

    /// Nested state of the called process (snapshots only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substate: Option<ProcessState>,
}

impl Token {
    pub fn new(position: impl Into<String>, owning_process_id: impl Into<String>) -> Self {
        Self {
            position: position.into(),
            owning_process_id: owning_process_id.into(),
            called_process_id: None,
            substate: None,
        }
    }

    pub fn is_call_activity_token(&self) -> bool {
        self.called_process_id.is_some()
    }
}

/// Ordered token collection of one process instance.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ProcessState {
    #[serde(default)]
    pub tokens: Vec<Token>,
}

impl ProcessState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a token; a call-activity token when `called_process_id` is set.
    pub fn create_token_at(
        &mut self,
        name: &str,
        owning_process_id: &str,
        called_process_id: Option<String>,
    ) -> &Token {
        let mut token = Token::new(name, owning_process_id);
        token.called_process_id = called_process_id;
        self.tokens.push(token);
        &self.tokens[self.tokens.len() - 1]
    }

    /// Removes the first token at `name`, whatever process owns it.
    pub fn remove_token_at(&mut self, name: &str) -> Option<Token> {
        let index = self.tokens.iter().position(|t| t.position == name)?;
        Some(self.tokens.remove(index))
    }

    /// Removes every token at `name` and returns how many were removed.
    pub fn remove_all_tokens_at(&mut self, name: &str) -> usize {
        let before = self.tokens.len();
        self.tokens.retain(|t| t.position != name);
        before - self.tokens.len()
    }

    /// Depth-first search through nested substates.
    pub fn find_tokens(&self, name: &str) -> Vec<&Token> {
        let mut found = Vec::new();
        self.collect_tokens(name, &mut found);
        found
    }

    fn collect_tokens<'a>(&'a self, name: &str, found: &mut Vec<&'a Token>) {
        for token in &self.tokens {
            if token.position == name {
                found.push(token);
            }
            if let Some(substate) = &token.substate {
                substate.collect_tokens(name, found);
            }
        }
    }

    pub fn first_token_at(&self, name: &str) -> Option<&Token> {
        self.tokens.iter().find(|t| t.position == name)
    }

    pub fn has_tokens_at(&self, name: &str) -> bool {
        self.first_token_at(name).is_some()
    }

    /// Counts exact matches at the top level only.
    pub fn number_of_tokens_at(&self, name: &str) -> usize {
        self.tokens.iter().filter(|t| t.position == name).count()
    }

    pub fn has_tokens(&self) -> bool {
        !self.tokens.is_empty()
    }

    /// Call-activity tokens in insertion order.
    pub fn call_activity_tokens(&self) -> impl Iterator<Item = &Token> {
        self.tokens.iter().filter(|t| t.is_call_activity_token())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_remove_first_match() {
        let mut state = ProcessState::new();
        state.create_token_at("A", "p1", None);
        state.create_token_at("B", "p1", None);
        state.create_token_at("A", "p2", None);

        let removed = state.remove_token_at("A").unwrap();
        assert_eq!(removed.owning_process_id, "p1");
        assert_eq!(state.tokens.len(), 2);
        assert_eq!(state.first_token_at("A").unwrap().owning_process_id, "p2");
        assert!(state.remove_token_at("missing").is_none());
    }

    #[test]
    fn test_remove_all_tokens_at() {
        let mut state = ProcessState::new();
        state.create_token_at("Join", "p", None);
        state.create_token_at("Other", "p", None);
        state.create_token_at("Join", "p", None);

        assert_eq!(state.number_of_tokens_at("Join"), 2);
        assert_eq!(state.remove_all_tokens_at("Join"), 2);
        assert_eq!(state.number_of_tokens_at("Join"), 0);
        assert_eq!(state.tokens.len(), 1);
    }

    #[test]
    fn test_find_tokens_searches_substates() {
        let mut nested = ProcessState::new();
        nested.create_token_at("Inner Task", "p::Call", None);

        let mut state = ProcessState::new();
        state.create_token_at("Call", "p", Some("p::Call".to_string()));
        state.tokens[0].substate = Some(nested);

        assert_eq!(state.find_tokens("Inner Task").len(), 1);
        assert_eq!(state.number_of_tokens_at("Inner Task"), 0);
        assert!(state.tokens[0].is_call_activity_token());
        assert_eq!(state.call_activity_tokens().count(), 1);
    }

    #[test]
    fn test_serialization_shape() {
        let mut state = ProcessState::new();
        state.create_token_at("Task", "main", None);

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["tokens"][0]["position"], "Task");
        assert_eq!(json["tokens"][0]["owningProcessId"], "main");
        assert!(json["tokens"][0].get("substate").is_none());
    }
}
