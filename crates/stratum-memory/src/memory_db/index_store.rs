//! Conversation-level digest storage operations

use crate::memory_db::schema::*;
use rusqlite::{params, Row};
use chrono::{DateTime, Utc};
use tracing::debug;
use std::sync::Arc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

pub struct IndexStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl IndexStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    /// Idempotent upsert keyed by conversation id; there is never more than
    /// one live digest row per conversation.
    pub fn upsert_index(&self, index: &ConversationIndex) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO conversation_indices
             (conversation_id, user_id, title, digest, topics, entities, keywords,
              message_count, chunk_count, first_activity_at, last_activity_at,
              vector_id, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                index.conversation_id,
                index.user_id,
                index.title,
                index.digest,
                serde_json::to_string(&index.topics)?,
                serde_json::to_string(&index.entities)?,
                serde_json::to_string(&index.keywords)?,
                index.message_count,
                index.chunk_count,
                index.first_activity_at.to_rfc3339(),
                index.last_activity_at.to_rfc3339(),
                index.vector_id,
                index.updated_at.to_rfc3339(),
            ],
        )?;
        debug!("Upserted index row for conversation {}", index.conversation_id);
        Ok(())
    }

    pub fn get_index(&self, conversation_id: &str) -> anyhow::Result<Option<ConversationIndex>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT conversation_id, user_id, title, digest, topics, entities, keywords,
                    message_count, chunk_count, first_activity_at, last_activity_at,
                    vector_id, updated_at
             FROM conversation_indices WHERE conversation_id = ?1",
        )?;
        let mut rows = stmt.query([conversation_id])?;

        if let Some(row) = rows.next()? {
            Ok(Some(self.row_to_index(row)?))
        } else {
            Ok(None)
        }
    }

    /// Delete the digest row. Absent rows count as success.
    pub fn delete_index(&self, conversation_id: &str) -> anyhow::Result<bool> {
        let conn = self.get_conn()?;
        let deleted = conn.execute(
            "DELETE FROM conversation_indices WHERE conversation_id = ?1",
            [conversation_id],
        )?;
        Ok(deleted > 0)
    }

    fn row_to_index(&self, row: &Row) -> anyhow::Result<ConversationIndex> {
        let topics: Vec<String> = serde_json::from_str(&row.get::<_, String>(4)?)
            .map_err(|e| anyhow::anyhow!("Index topics JSON error: {}", e))?;
        let entities: Vec<String> = serde_json::from_str(&row.get::<_, String>(5)?)
            .map_err(|e| anyhow::anyhow!("Index entities JSON error: {}", e))?;
        let keywords: Vec<String> = serde_json::from_str(&row.get::<_, String>(6)?)
            .map_err(|e| anyhow::anyhow!("Index keywords JSON error: {}", e))?;

        Ok(ConversationIndex {
            conversation_id: row.get(0)?,
            user_id: row.get(1)?,
            title: row.get(2)?,
            digest: row.get(3)?,
            topics,
            entities,
            keywords,
            message_count: row.get(7)?,
            chunk_count: row.get(8)?,
            first_activity_at: parse_rfc3339(&row.get::<_, String>(9)?)?,
            last_activity_at: parse_rfc3339(&row.get::<_, String>(10)?)?,
            vector_id: row.get(11)?,
            updated_at: parse_rfc3339(&row.get::<_, String>(12)?)?,
        })
    }
}

fn parse_rfc3339(s: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .map_err(|e| anyhow::anyhow!("Failed to parse timestamp: {}", e))?
        .with_timezone(&Utc))
}
