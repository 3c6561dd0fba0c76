//! Conversation storage with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for testing)
//! - `file`: JSON file-based storage
//! - `sqlite`: SQLite database with per-message history rows

mod file;
mod memory;
mod sqlite;

pub use file::FileConversationStore;
pub use memory::InMemoryConversationStore;
pub use sqlite::SqliteConversationStore;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::engine::Role;
use crate::session::{PendingToolCall, SessionKey};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation {0} not found")]
    NotFound(SessionKey),
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(String),
    #[error("store task failed: {0}")]
    Task(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

/// Everything persisted for one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub app: String,
    pub user: String,
    pub conversation_id: String,
    /// Application key-value state (always a JSON object).
    #[serde(default = "empty_object")]
    pub state: Value,
    #[serde(default)]
    pub pending_tools: Vec<PendingToolCall>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    pub created_at: String,
    pub updated_at: String,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl ConversationState {
    pub fn new(key: &SessionKey, initial_state: Value) -> Self {
        let now = now_string();
        Self {
            app: key.app.clone(),
            user: key.user.clone(),
            conversation_id: key.conversation_id.clone(),
            state: as_object(initial_state),
            pending_tools: Vec::new(),
            history: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn key(&self) -> SessionKey {
        SessionKey::new(&self.app, &self.user, &self.conversation_id)
    }

    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            conversation_id: self.conversation_id.clone(),
            app: self.app.clone(),
            user: self.user.clone(),
            message_count: self.history.len(),
            pending_tool_count: self.pending_tools.len(),
            created_at: self.created_at.clone(),
            updated_at: self.updated_at.clone(),
        }
    }
}

/// Listing entry for a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub app: String,
    pub user: String,
    pub message_count: usize,
    pub pending_tool_count: usize,
    pub created_at: String,
    pub updated_at: String,
}

/// A single entry in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    pub created_at: String,
}

impl HistoryEntry {
    fn new(role: Role, content: String) -> Self {
        Self {
            role,
            content,
            message_id: None,
            tool_call_id: None,
            tool_name: None,
            created_at: now_string(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content.into())
    }

    pub fn assistant(message_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut entry = Self::new(Role::Assistant, content.into());
        entry.message_id = Some(message_id.into());
        entry
    }

    /// The assistant asked for a tool; `content` holds the JSON arguments.
    pub fn tool_call(call_id: &str, tool_name: &str, arguments: &Value) -> Self {
        let mut entry = Self::new(Role::Assistant, arguments.to_string());
        entry.tool_call_id = Some(call_id.to_string());
        entry.tool_name = Some(tool_name.to_string());
        entry
    }

    pub fn tool_result(call_id: &str, tool_name: Option<&str>, result: &Value) -> Self {
        let content = match result {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        let mut entry = Self::new(Role::Tool, content);
        entry.tool_call_id = Some(call_id.to_string());
        entry.tool_name = tool_name.map(str::to_string);
        entry
    }
}

/// Changes written back at the end (or pause) of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    /// RFC 6902 operations, applied in order after `state_merge`.
    pub state_delta: Vec<Value>,
    /// Top-level keys replaced in the state object.
    pub state_merge: Option<Map<String, Value>>,
    /// Replaces the pending set when present.
    pub pending_tools: Option<Vec<PendingToolCall>>,
    pub append_history: Vec<HistoryEntry>,
}

impl StatePatch {
    /// Apply onto a conversation. A delta that does not apply is logged and skipped;
    /// the remaining fields are still written.
    pub fn apply_to(self, conversation: &mut ConversationState) {
        if let Some(merge) = self.state_merge {
            if !conversation.state.is_object() {
                conversation.state = empty_object();
            }
            if let Value::Object(state) = &mut conversation.state {
                state.extend(merge);
            }
        }

        if !self.state_delta.is_empty() {
            match apply_state_delta(&conversation.state, self.state_delta) {
                Ok(next) => conversation.state = next,
                Err(e) => warn!(
                    conversation = %conversation.key(),
                    error = %e,
                    "state delta rejected, keeping previous state"
                ),
            }
        }

        if let Some(pending) = self.pending_tools {
            conversation.pending_tools = pending;
        }
        conversation.history.extend(self.append_history);
        conversation.updated_at = now_string();
    }
}

/// Apply RFC 6902 operations to a copy of `state`.
pub fn apply_state_delta(state: &Value, ops: Vec<Value>) -> Result<Value, String> {
    let patch: json_patch::Patch =
        serde_json::from_value(Value::Array(ops)).map_err(|e| e.to_string())?;
    let mut next = state.clone();
    json_patch::patch(&mut next, &patch).map_err(|e| e.to_string())?;
    Ok(next)
}

fn as_object(value: Value) -> Value {
    match value {
        Value::Object(_) => value,
        Value::Null => empty_object(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            Value::Object(map)
        }
    }
}

/// Get current timestamp as RFC3339 string.
pub fn now_string() -> String {
    Utc::now().to_rfc3339()
}

/// Conversation store trait - implemented by all storage backends.
///
/// Callers hold the session lock for a key while reading and writing it.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    /// Load a conversation, creating it with `initial_state` if missing.
    async fn get_or_create(
        &self,
        key: &SessionKey,
        initial_state: Value,
    ) -> Result<ConversationState, StoreError>;

    async fn get(&self, key: &SessionKey) -> Result<Option<ConversationState>, StoreError>;

    /// Apply a patch and return the updated conversation.
    async fn save(
        &self,
        key: &SessionKey,
        patch: StatePatch,
    ) -> Result<ConversationState, StoreError>;

    /// Conversations of one user in one application, most recently updated first.
    async fn list(&self, app: &str, user: &str) -> Result<Vec<ConversationSummary>, StoreError>;

    async fn delete(&self, key: &SessionKey) -> Result<bool, StoreError>;
}

/// Conversation store type selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreType {
    #[default]
    Memory,
    File,
    Sqlite,
}

impl StoreType {
    /// Parse from environment variable value.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "memory" | "mem" => Some(Self::Memory),
            "file" | "json" => Some(Self::File),
            "sqlite" | "db" => Some(Self::Sqlite),
            _ => None,
        }
    }
}

/// Create a conversation store based on type and configuration.
pub async fn create_conversation_store(
    store_type: StoreType,
    base_dir: PathBuf,
) -> Result<Arc<dyn ConversationStore>, StoreError> {
    match store_type {
        StoreType::Memory => Ok(Arc::new(InMemoryConversationStore::new())),
        StoreType::File => Ok(Arc::new(FileConversationStore::new(base_dir).await?)),
        StoreType::Sqlite => Ok(Arc::new(SqliteConversationStore::new(base_dir).await?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conversation() -> ConversationState {
        ConversationState::new(&SessionKey::new("app", "u", "c"), json!({"count": 1}))
    }

    #[test]
    fn patch_merges_then_applies_delta() {
        let mut conv = conversation();
        let mut merge = Map::new();
        merge.insert("theme".into(), json!("dark"));
        StatePatch {
            state_delta: vec![json!({"op": "replace", "path": "/count", "value": 2})],
            state_merge: Some(merge),
            pending_tools: None,
            append_history: vec![HistoryEntry::user("hi")],
        }
        .apply_to(&mut conv);

        assert_eq!(conv.state, json!({"count": 2, "theme": "dark"}));
        assert_eq!(conv.history.len(), 1);
    }

    #[test]
    fn rejected_delta_keeps_state_but_saves_rest() {
        let mut conv = conversation();
        StatePatch {
            state_delta: vec![json!({"op": "remove", "path": "/missing"})],
            pending_tools: Some(vec![PendingToolCall::new("call1", "approve")]),
            ..Default::default()
        }
        .apply_to(&mut conv);

        assert_eq!(conv.state, json!({"count": 1}));
        assert_eq!(conv.pending_tools.len(), 1);
    }

    #[test]
    fn non_object_initial_state_is_wrapped() {
        let conv = ConversationState::new(&SessionKey::new("a", "u", "c"), json!(5));
        assert_eq!(conv.state, json!({"value": 5}));
        let conv = ConversationState::new(&SessionKey::new("a", "u", "c"), Value::Null);
        assert_eq!(conv.state, json!({}));
    }

    #[test]
    fn store_type_parses_aliases() {
        assert_eq!(StoreType::from_str("SQLite"), Some(StoreType::Sqlite));
        assert_eq!(StoreType::from_str("json"), Some(StoreType::File));
        assert_eq!(StoreType::from_str("redis"), None);
    }
}
