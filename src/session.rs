//! Session message persistence: the external conversation collaborator.
//!
//! The pipeline only needs two operations: append a message and fetch the
//! most recent turns of a session. [`SqliteMessageStore`] is the default
//! implementation; the trait seam exists so hosts with their own message
//! persistence can plug it in.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{ConversationTurn, Role};

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append one message to a session's history, returning its assigned
    /// id. The assistant message id doubles as the ledger turn id, so
    /// re-recording the same persisted turn is deduplicable.
    async fn append_message(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        sources: &[String],
        metadata: &serde_json::Value,
    ) -> Result<String>;

    /// The most recent `limit` turns of a session, oldest first.
    async fn get_recent_turns(&self, session_id: &str, limit: usize)
        -> Result<Vec<ConversationTurn>>;
}

/// Message store over the shared SQLite database.
pub struct SqliteMessageStore {
    pool: SqlitePool,
}

impl SqliteMessageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn append_message(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        sources: &[String],
        metadata: &serde_json::Value,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO messages (id, session_id, role, content, sources_json, metadata_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(session_id)
        .bind(role.as_str())
        .bind(content)
        .bind(serde_json::to_string(sources)?)
        .bind(metadata.to_string())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn get_recent_turns(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>> {
        let rows = sqlx::query(
            r#"
            SELECT role, content, created_at
            FROM messages
            WHERE session_id = ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut turns: Vec<ConversationTurn> = rows
            .iter()
            .map(|row| {
                let role: String = row.get("role");
                let created_at: i64 = row.get("created_at");
                let timestamp = DateTime::<Utc>::from_timestamp_millis(created_at)
                    .ok_or_else(|| Error::InvalidInput("bad message timestamp".to_string()))?;
                Ok(ConversationTurn {
                    role: match role.as_str() {
                        "assistant" => Role::Assistant,
                        _ => Role::User,
                    },
                    content: row.get("content"),
                    timestamp,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        turns.reverse(); // oldest first
        Ok(turns)
    }
}
