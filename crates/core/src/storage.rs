//! Conversation storage contract.
//!
//! The core only needs to create a session row and append messages, never
//! full session replace, delete, or full-text search — those live outside
//! the request-serving plane.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: MessageRole,
    pub content: String,
    pub meta: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("database error: {0}")]
    Db(String),
}

/// Durable conversation storage.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// `title` is truncated to 30 chars by the caller.
    async fn create_session(
        &self,
        user_id: Option<&str>,
        title: &str,
        parent_session_id: Option<&str>,
        anon_session_id: Option<&str>,
    ) -> Result<String, StorageError>;

    async fn add_message(
        &self,
        session_id: &str,
        role: MessageRole,
        content: &str,
        meta: Option<serde_json::Value>,
    ) -> Result<(), StorageError>;

    async fn history(&self, session_id: &str) -> Result<Vec<StoredMessage>, StorageError>;
}

pub struct SqliteConversationStore {
    pool: SqlitePool,
}

impl SqliteConversationStore {
    pub async fn new(pool: SqlitePool) -> Result<Self, StorageError> {
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<(), StorageError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY NOT NULL,
                user_id TEXT,
                title TEXT NOT NULL,
                parent_session_id TEXT,
                anon_session_id TEXT,
                created_at TEXT NOT NULL
            );",
        )
        .execute(pool)
        .await
        .map_err(|e| StorageError::Db(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                meta TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            );",
        )
        .execute(pool)
        .await
        .map_err(|e| StorageError::Db(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn create_session(
        &self,
        user_id: Option<&str>,
        title: &str,
        parent_session_id: Option<&str>,
        anon_session_id: Option<&str>,
    ) -> Result<String, StorageError> {
        let id = uuid::Uuid::new_v4().to_string();
        let title: String = title.chars().take(30).collect();

        sqlx::query(
            "INSERT INTO sessions (id, user_id, title, parent_session_id, anon_session_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(&title)
        .bind(parent_session_id)
        .bind(anon_session_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Db(e.to_string()))?;

        Ok(id)
    }

    async fn add_message(
        &self,
        session_id: &str,
        role: MessageRole,
        content: &str,
        meta: Option<serde_json::Value>,
    ) -> Result<(), StorageError> {
        let role_str = serde_json::to_value(role)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let meta_str = meta.map(|m| m.to_string());

        sqlx::query(
            "INSERT INTO messages (session_id, role, content, meta, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(session_id)
        .bind(role_str)
        .bind(content)
        .bind(meta_str)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Db(e.to_string()))?;

        Ok(())
    }

    async fn history(&self, session_id: &str) -> Result<Vec<StoredMessage>, StorageError> {
        let rows = sqlx::query(
            "SELECT role, content, meta, created_at FROM messages WHERE session_id = ?1 ORDER BY id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Db(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                let role_str: String = row.try_get("role").map_err(|e| StorageError::Db(e.to_string()))?;
                let role = match role_str.as_str() {
                    "user" => MessageRole::User,
                    "assistant" => MessageRole::Assistant,
                    "system" => MessageRole::System,
                    _ => MessageRole::Tool,
                };
                let content: String = row.try_get("content").map_err(|e| StorageError::Db(e.to_string()))?;
                let meta_str: Option<String> = row.try_get("meta").map_err(|e| StorageError::Db(e.to_string()))?;
                let created_at: DateTime<Utc> =
                    row.try_get("created_at").map_err(|e| StorageError::Db(e.to_string()))?;

                Ok(StoredMessage {
                    role,
                    content,
                    meta: meta_str.and_then(|s| serde_json::from_str(&s).ok()),
                    created_at,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_session_truncates_title_to_30_chars() {
        let store = SqliteConversationStore::new(pool().await).await.unwrap();
        let long_title = "x".repeat(50);
        let id = store
            .create_session(Some("u1"), &long_title, None, None)
            .await
            .unwrap();
        assert!(!id.is_empty());
    }

    #[tokio::test]
    async fn add_message_then_history_round_trips() {
        let store = SqliteConversationStore::new(pool().await).await.unwrap();
        let id = store.create_session(Some("u1"), "hi", None, None).await.unwrap();
        store.add_message(&id, MessageRole::User, "hello", None).await.unwrap();
        store
            .add_message(&id, MessageRole::Assistant, "hi there", None)
            .await
            .unwrap();

        let history = store.history(&id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, MessageRole::User);
        assert_eq!(history[1].content, "hi there");
    }
}
