//! JSON file-based conversation store.

use super::{ConversationState, ConversationStore, ConversationSummary, StatePatch, StoreError};
use crate::session::SessionKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

const STORE_FILENAME: &str = "conversations.json";

#[derive(Debug, Serialize, Deserialize, Default)]
struct ConversationStoreSnapshot {
    conversations: Vec<ConversationState>,
}

#[derive(Clone)]
pub struct FileConversationStore {
    path: PathBuf,
    conversations: Arc<RwLock<HashMap<SessionKey, ConversationState>>>,
    persist_lock: Arc<Mutex<()>>,
}

impl FileConversationStore {
    pub async fn new(base_dir: PathBuf) -> Result<Self, StoreError> {
        fs::create_dir_all(&base_dir).await?;
        let path = base_dir.join(STORE_FILENAME);
        let snapshot = match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<ConversationStoreSnapshot>(&bytes) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!("Failed to parse conversation store {}: {}", path.display(), e);
                    ConversationStoreSnapshot::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                ConversationStoreSnapshot::default()
            }
            Err(err) => return Err(err.into()),
        };

        let conversations = snapshot
            .conversations
            .into_iter()
            .map(|c| (c.key(), c))
            .collect();

        Ok(Self {
            path,
            conversations: Arc::new(RwLock::new(conversations)),
            persist_lock: Arc::new(Mutex::new(())),
        })
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let _guard = self.persist_lock.lock().await;
        let mut conversations: Vec<ConversationState> =
            self.conversations.read().await.values().cloned().collect();
        conversations.sort_by(|a, b| a.key().cmp(&b.key()));
        let data = serde_json::to_vec_pretty(&ConversationStoreSnapshot { conversations })?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, data).await?;
        fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for FileConversationStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn get_or_create(
        &self,
        key: &SessionKey,
        initial_state: Value,
    ) -> Result<ConversationState, StoreError> {
        let (conversation, created) = {
            let mut conversations = self.conversations.write().await;
            match conversations.get(key) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let conversation = ConversationState::new(key, initial_state);
                    conversations.insert(key.clone(), conversation.clone());
                    (conversation, true)
                }
            }
        };
        if created {
            self.persist().await?;
        }
        Ok(conversation)
    }

    async fn get(&self, key: &SessionKey) -> Result<Option<ConversationState>, StoreError> {
        Ok(self.conversations.read().await.get(key).cloned())
    }

    async fn save(
        &self,
        key: &SessionKey,
        patch: StatePatch,
    ) -> Result<ConversationState, StoreError> {
        let updated = {
            let mut conversations = self.conversations.write().await;
            let conversation = conversations
                .get_mut(key)
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;
            patch.apply_to(conversation);
            conversation.clone()
        };
        self.persist().await?;
        Ok(updated)
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
        let removed = self.conversations.write().await.remove(key).is_some();
        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::PendingToolCall;
    use crate::store::HistoryEntry;
    use serde_json::json;

    #[tokio::test]
    async fn conversations_survive_reopen() {
        let dir = tempfile::tempdir().expect("temp dir");
        let key = SessionKey::new("app", "u", "c1");

        {
            let store = FileConversationStore::new(dir.path().to_path_buf())
                .await
                .unwrap();
            store.get_or_create(&key, json!({"n": 0})).await.unwrap();
            store
                .save(
                    &key,
                    StatePatch {
                        state_delta: vec![json!({"op": "replace", "path": "/n", "value": 1})],
                        pending_tools: Some(vec![PendingToolCall::new("call1", "approve")]),
                        append_history: vec![HistoryEntry::user("hello")],
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }

        let reopened = FileConversationStore::new(dir.path().to_path_buf())
            .await
            .unwrap();
        let loaded = reopened.get(&key).await.unwrap().expect("conversation");
        assert_eq!(loaded.state, json!({"n": 1}));
        assert_eq!(loaded.pending_tools[0].call_id, "call1");
        assert_eq!(loaded.history[0].content, "hello");

        assert!(reopened.delete(&key).await.unwrap());
        assert!(reopened.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().expect("temp dir");
        std::fs::write(dir.path().join(STORE_FILENAME), b"{not json").unwrap();
        let store = FileConversationStore::new(dir.path().to_path_buf())
            .await
            .unwrap();
        assert!(store.list("app", "u").await.unwrap().is_empty());
    }
}
