//! Tool calls awaiting resolution from outside the run (human approval, client tools).
//!
//! The registry lives for one run; its contents are loaded from and written back to
//! the conversation state, which is what lets a paused run resume in a later request.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::store::ConversationState;

/// Serialized camelCase, like the `RUN_FINISHED` payload that carries it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingToolCall {
    #[serde(alias = "call_id")]
    pub call_id: String,
    #[serde(alias = "tool_name")]
    pub tool_name: String,
    #[serde(alias = "requested_at")]
    pub requested_at: DateTime<Utc>,
    #[serde(default = "default_awaiting", alias = "awaiting_result")]
    pub awaiting_result: bool,
}

fn default_awaiting() -> bool {
    true
}

impl PendingToolCall {
    pub fn new(call_id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            requested_at: Utc::now(),
            awaiting_result: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PendingToolRegistry {
    calls: BTreeMap<String, PendingToolCall>,
}

impl PendingToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from the pending set stored on a conversation.
    pub fn load(state: &ConversationState) -> Self {
        let calls = state
            .pending_tools
            .iter()
            .map(|call| (call.call_id.clone(), call.clone()))
            .collect();
        Self { calls }
    }

    /// Write the current pending set back onto a conversation.
    pub fn persist(&self, state: &mut ConversationState) {
        state.pending_tools = self.snapshot();
    }

    /// Register a long-running call. An id that is already pending keeps its entry.
    pub fn register(&mut self, call_id: &str, tool_name: &str) {
        if self.calls.contains_key(call_id) {
            debug!(call_id, "tool call already pending");
            return;
        }
        self.calls
            .insert(call_id.to_string(), PendingToolCall::new(call_id, tool_name));
    }

    /// Remove a pending call. Returns `false` for unknown or already-resolved ids.
    pub fn resolve(&mut self, call_id: &str) -> bool {
        self.calls.remove(call_id).is_some()
    }

    pub fn get(&self, call_id: &str) -> Option<&PendingToolCall> {
        self.calls.get(call_id)
    }

    pub fn contains(&self, call_id: &str) -> bool {
        self.calls.contains_key(call_id)
    }

    /// The pending set as stored on a conversation.
    pub fn snapshot(&self) -> Vec<PendingToolCall> {
        self.list_pending()
    }

    /// Pending calls, oldest first.
    pub fn list_pending(&self) -> Vec<PendingToolCall> {
        let mut calls: Vec<_> = self.calls.values().cloned().collect();
        calls.sort_by(|a, b| {
            a.requested_at
                .cmp(&b.requested_at)
                .then_with(|| a.call_id.cmp(&b.call_id))
        });
        calls
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionKey;

    #[test]
    fn resolve_is_idempotent() {
        let mut registry = PendingToolRegistry::new();
        registry.register("X", "approve");
        assert_eq!((registry.resolve("X"), registry.resolve("X")), (true, false));
        assert!(registry.is_empty());
    }

    #[test]
    fn resolving_unknown_id_leaves_registry_unchanged() {
        let mut registry = PendingToolRegistry::new();
        registry.register("X", "approve");
        assert!(!registry.resolve("Y"));
        assert!(registry.contains("X"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn wire_form_is_camel_case_and_reads_snake_case() {
        let call = PendingToolCall::new("X", "approve");
        let value = serde_json::to_value(&call).unwrap();
        assert_eq!(value["callId"], "X");
        assert_eq!(value["toolName"], "approve");
        assert!(value.get("call_id").is_none());

        let legacy: PendingToolCall = serde_json::from_value(serde_json::json!({
            "call_id": "X",
            "tool_name": "approve",
            "requested_at": value["requestedAt"].clone(),
        }))
        .unwrap();
        assert_eq!(legacy, call);
    }

    #[test]
    fn duplicate_register_keeps_first_entry() {
        let mut registry = PendingToolRegistry::new();
        registry.register("X", "first");
        registry.register("X", "second");
        assert_eq!(registry.get("X").map(|c| c.tool_name.as_str()), Some("first"));
    }

    #[test]
    fn load_and_persist_round_trip_through_conversation() {
        let key = SessionKey::new("app", "user", "conv");
        let mut state = ConversationState::new(&key, serde_json::json!({}));
        let mut registry = PendingToolRegistry::load(&state);
        assert!(registry.is_empty());

        registry.register("call1", "search");
        registry.register("call2", "approve");
        registry.persist(&mut state);
        assert_eq!(state.pending_tools.len(), 2);

        let mut reloaded = PendingToolRegistry::load(&state);
        assert!(reloaded.resolve("call1"));
        reloaded.persist(&mut state);
        let ids: Vec<_> = state.pending_tools.iter().map(|c| c.call_id.clone()).collect();
        assert_eq!(ids, vec!["call2".to_string()]);
    }
}
