//! SQLite-based conversation store with one row per history entry.

use super::{
    ConversationState, ConversationStore, ConversationSummary, HistoryEntry, StatePatch,
    StoreError,
};
use crate::engine::Role;
use crate::session::{PendingToolCall, SessionKey};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

const DB_FILENAME: &str = "conversations.db";

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS conversations (
    app TEXT NOT NULL,
    user_id TEXT NOT NULL,
    conversation_id TEXT NOT NULL,
    state_json TEXT NOT NULL,
    pending_json TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (app, user_id, conversation_id)
);

CREATE INDEX IF NOT EXISTS idx_conversations_updated
    ON conversations(app, user_id, updated_at DESC);

CREATE TABLE IF NOT EXISTS conversation_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    app TEXT NOT NULL,
    user_id TEXT NOT NULL,
    conversation_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    message_id TEXT,
    tool_call_id TEXT,
    tool_name TEXT,
    created_at TEXT NOT NULL,
    FOREIGN KEY (app, user_id, conversation_id)
        REFERENCES conversations(app, user_id, conversation_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_history_conversation
    ON conversation_history(app, user_id, conversation_id, id);
"#;

pub struct SqliteConversationStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteConversationStore {
    pub async fn new(base_dir: PathBuf) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(&base_dir).await?;
        let db_path = base_dir.join(DB_FILENAME);

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)?;
            conn.execute_batch(SCHEMA)?;
            Ok::<_, StoreError>(conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn load(conn: &Connection, key: &SessionKey) -> Result<Option<ConversationState>, StoreError> {
        let row = conn
            .query_row(
                "SELECT state_json, pending_json, created_at, updated_at
                 FROM conversations WHERE app = ?1 AND user_id = ?2 AND conversation_id = ?3",
                params![&key.app, &key.user, &key.conversation_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((state_json, pending_json, created_at, updated_at)) = row else {
            return Ok(None);
        };

        let state: Value = serde_json::from_str(&state_json)?;
        let pending_tools: Vec<PendingToolCall> = serde_json::from_str(&pending_json)?;

        let mut stmt = conn.prepare(
            "SELECT role, content, message_id, tool_call_id, tool_name, created_at
             FROM conversation_history
             WHERE app = ?1 AND user_id = ?2 AND conversation_id = ?3
             ORDER BY id ASC",
        )?;
        let history = stmt
            .query_map(params![&key.app, &key.user, &key.conversation_id], |row| {
                let role: String = row.get(0)?;
                Ok(HistoryEntry {
                    role: parse_role(&role),
                    content: row.get(1)?,
                    message_id: row.get(2)?,
                    tool_call_id: row.get(3)?,
                    tool_name: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(ConversationState {
            app: key.app.clone(),
            user: key.user.clone(),
            conversation_id: key.conversation_id.clone(),
            state,
            pending_tools,
            history,
            created_at,
            updated_at,
        }))
    }

    fn insert_history(
        conn: &Connection,
        key: &SessionKey,
        entries: &[HistoryEntry],
    ) -> Result<(), StoreError> {
        let mut stmt = conn.prepare(
            "INSERT INTO conversation_history
                (app, user_id, conversation_id, role, content, message_id, tool_call_id, tool_name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        for entry in entries {
            stmt.execute(params![
                &key.app,
                &key.user,
                &key.conversation_id,
                entry.role.as_str(),
                &entry.content,
                &entry.message_id,
                &entry.tool_call_id,
                &entry.tool_name,
                &entry.created_at,
            ])?;
        }
        Ok(())
    }
}

fn parse_role(role: &str) -> Role {
    match role {
        "user" => Role::User,
        "system" => Role::System,
        "tool" => Role::Tool,
        _ => Role::Assistant,
    }
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn get_or_create(
        &self,
        key: &SessionKey,
        initial_state: Value,
    ) -> Result<ConversationState, StoreError> {
        let conn = self.conn.clone();
        let key = key.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            if let Some(existing) = Self::load(&conn, &key)? {
                return Ok(existing);
            }
            let conversation = ConversationState::new(&key, initial_state);
            conn.execute(
                "INSERT INTO conversations
                    (app, user_id, conversation_id, state_json, pending_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, '[]', ?5, ?6)",
                params![
                    &key.app,
                    &key.user,
                    &key.conversation_id,
                    serde_json::to_string(&conversation.state)?,
                    &conversation.created_at,
                    &conversation.updated_at,
                ],
            )?;
            Ok(conversation)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    async fn get(&self, key: &SessionKey) -> Result<Option<ConversationState>, StoreError> {
        let conn = self.conn.clone();
        let key = key.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            Self::load(&conn, &key)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    async fn save(
        &self,
        key: &SessionKey,
        patch: StatePatch,
    ) -> Result<ConversationState, StoreError> {
        let conn = self.conn.clone();
        let key = key.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            let tx = conn.transaction()?;
            let mut conversation =
                Self::load(&tx, &key)?.ok_or_else(|| StoreError::NotFound(key.clone()))?;

            let previous_len = conversation.history.len();
            patch.apply_to(&mut conversation);

            tx.execute(
                "UPDATE conversations SET state_json = ?4, pending_json = ?5, updated_at = ?6
                 WHERE app = ?1 AND user_id = ?2 AND conversation_id = ?3",
                params![
                    &key.app,
                    &key.user,
                    &key.conversation_id,
                    serde_json::to_string(&conversation.state)?,
                    serde_json::to_string(&conversation.pending_tools)?,
                    &conversation.updated_at,
                ],
            )?;
            Self::insert_history(&tx, &key, &conversation.history[previous_len..])?;
            tx.commit()?;
            Ok(conversation)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    async fn list(&self, app: &str, user: &str) -> Result<Vec<ConversationSummary>, StoreError> {
        let conn = self.conn.clone();
        let app = app.to_string();
        let user = user.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(
                "SELECT c.conversation_id, c.pending_json, c.created_at, c.updated_at,
                        (SELECT COUNT(*) FROM conversation_history h
                          WHERE h.app = c.app AND h.user_id = c.user_id
                            AND h.conversation_id = c.conversation_id)
                 FROM conversations c
                 WHERE c.app = ?1 AND c.user_id = ?2
                 ORDER BY c.updated_at DESC",
            )?;
            let rows = stmt
                .query_map(params![&app, &user], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(
                    |(conversation_id, pending_json, created_at, updated_at, count)| {
                        let pending: Vec<PendingToolCall> = serde_json::from_str(&pending_json)?;
                        Ok(ConversationSummary {
                            conversation_id,
                            app: app.clone(),
                            user: user.clone(),
                            message_count: count.max(0) as usize,
                            pending_tool_count: pending.len(),
                            created_at,
                            updated_at,
                        })
                    },
                )
                .collect()
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    async fn delete(&self, key: &SessionKey) -> Result<bool, StoreError> {
        let conn = self.conn.clone();
        let key = key.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM conversation_history
                 WHERE app = ?1 AND user_id = ?2 AND conversation_id = ?3",
                params![&key.app, &key.user, &key.conversation_id],
            )?;
            let rows = tx.execute(
                "DELETE FROM conversations
                 WHERE app = ?1 AND user_id = ?2 AND conversation_id = ?3",
                params![&key.app, &key.user, &key.conversation_id],
            )?;
            tx.commit()?;
            Ok(rows > 0)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}
