//! In-memory conversation store (non-persistent).

use super::{ConversationState, ConversationStore, ConversationSummary, StatePatch, StoreError};
use crate::session::SessionKey;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone, Default)]
pub struct InMemoryConversationStore {
    conversations: Arc<RwLock<HashMap<SessionKey, ConversationState>>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn get_or_create(
        &self,
        key: &SessionKey,
        initial_state: Value,
    ) -> Result<ConversationState, StoreError> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .entry(key.clone())
            .or_insert_with(|| ConversationState::new(key, initial_state));
        Ok(conversation.clone())
    }

    async fn get(&self, key: &SessionKey) -> Result<Option<ConversationState>, StoreError> {
        Ok(self.conversations.read().await.get(key).cloned())
    }

    async fn save(
        &self,
        key: &SessionKey,
        patch: StatePatch,
    ) -> Result<ConversationState, StoreError> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        patch.apply_to(conversation);
        Ok(conversation.clone())
    }

    async fn list(&self, app: &str, user: &str) -> Result<Vec<ConversationSummary>, StoreError> {
        let mut summaries: Vec<ConversationSummary> = self
            .conversations
            .read()
            .await
            .values()
            .filter(|c| c.app == app && c.user == user)
            .map(ConversationState::summary)
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    async fn delete(&self, key: &SessionKey) -> Result<bool, StoreError> {
        Ok(self.conversations.write().await.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::HistoryEntry;
    use serde_json::json;

    #[tokio::test]
    async fn get_or_create_only_uses_initial_state_once() {
        let store = InMemoryConversationStore::new();
        let key = SessionKey::new("app", "u", "c1");

        let created = store.get_or_create(&key, json!({"a": 1})).await.unwrap();
        assert_eq!(created.state, json!({"a": 1}));

        let loaded = store.get_or_create(&key, json!({"a": 2})).await.unwrap();
        assert_eq!(loaded.state, json!({"a": 1}));
    }

    #[tokio::test]
    async fn list_is_scoped_to_app_and_user() {
        let store = InMemoryConversationStore::new();
        for key in [
            SessionKey::new("app", "u", "c1"),
            SessionKey::new("app", "u", "c2"),
            SessionKey::new("app", "other", "c3"),
            SessionKey::new("other", "u", "c4"),
        ] {
            store.get_or_create(&key, json!({})).await.unwrap();
        }
        let listed = store.list("app", "u").await.unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[tokio::test]
    async fn save_requires_existing_conversation() {
        let store = InMemoryConversationStore::new();
        let key = SessionKey::new("app", "u", "missing");
        let result = store
            .save(
                &key,
                StatePatch {
                    append_history: vec![HistoryEntry::user("hi")],
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
        assert!(!store.delete(&key).await.unwrap());
    }
}
