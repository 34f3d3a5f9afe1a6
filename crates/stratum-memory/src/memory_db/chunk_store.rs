//! Conversation chunk storage operations

use crate::memory_db::schema::*;
use rusqlite::{params, Row};
use chrono::{DateTime, Utc};
use tracing::debug;
use std::sync::Arc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

pub struct ChunkStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl ChunkStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    /// Insert a chunk. The (conversation_id, start_message_id) key is unique;
    /// a conflicting insert means another writer already chunked this window
    /// and is reported as `Ok(false)`, not an error.
    pub fn insert_chunk(&self, chunk: &ConversationChunk) -> anyhow::Result<bool> {
        let conn = self.get_conn()?;
        let inserted = conn.execute(
            "INSERT INTO conversation_chunks
             (id, conversation_id, user_id, start_message_id, end_message_id, message_count,
              summary, topics, entities, keywords, importance, coherence,
              first_message_at, last_message_at, vector_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
             ON CONFLICT(conversation_id, start_message_id) DO NOTHING",
            params![
                chunk.id,
                chunk.conversation_id,
                chunk.user_id,
                chunk.start_message_id,
                chunk.end_message_id,
                chunk.message_count,
                chunk.summary,
                serde_json::to_string(&chunk.topics)?,
                serde_json::to_string(&chunk.entities)?,
                serde_json::to_string(&chunk.keywords)?,
                chunk.importance,
                chunk.coherence,
                chunk.first_message_at.to_rfc3339(),
                chunk.last_message_at.to_rfc3339(),
                chunk.vector_id,
                chunk.created_at.to_rfc3339(),
            ],
        )?;

        if inserted == 0 {
            debug!(
                "Chunk for conversation {} starting at message {} already exists, skipping",
                chunk.conversation_id, chunk.start_message_id
            );
        }
        Ok(inserted > 0)
    }

    /// All chunks for a conversation, ordered by message range.
    pub fn get_chunks(&self, conversation_id: &str) -> anyhow::Result<Vec<ConversationChunk>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, user_id, start_message_id, end_message_id, message_count,
                    summary, topics, entities, keywords, importance, coherence,
                    first_message_at, last_message_at, vector_id, created_at
             FROM conversation_chunks
             WHERE conversation_id = ?1
             ORDER BY start_message_id ASC",
        )?;
        let mut rows = stmt.query([conversation_id])?;

        let mut chunks = Vec::new();
        while let Some(row) = rows.next()? {
            chunks.push(self.row_to_chunk(row)?);
        }
        Ok(chunks)
    }

    pub fn get_chunk(&self, chunk_id: &str) -> anyhow::Result<Option<ConversationChunk>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, user_id, start_message_id, end_message_id, message_count,
                    summary, topics, entities, keywords, importance, coherence,
                    first_message_at, last_message_at, vector_id, created_at
             FROM conversation_chunks WHERE id = ?1",
        )?;
        let mut rows = stmt.query([chunk_id])?;

        if let Some(row) = rows.next()? {
            Ok(Some(self.row_to_chunk(row)?))
        } else {
            Ok(None)
        }
    }

    /// Highest chunked message id for a conversation, if any chunk exists.
    /// Everything after this id is the unchunked tail.
    pub fn last_chunk_end(&self, conversation_id: &str) -> anyhow::Result<Option<i64>> {
        let conn = self.get_conn()?;
        let end: Option<i64> = conn.query_row(
            "SELECT MAX(end_message_id) FROM conversation_chunks WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?;
        Ok(end)
    }

    pub fn count_chunks(&self, conversation_id: &str) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM conversation_chunks WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn last_chunked_at(&self, conversation_id: &str) -> anyhow::Result<Option<DateTime<Utc>>> {
        let conn = self.get_conn()?;
        let at: Option<String> = conn.query_row(
            "SELECT MAX(created_at) FROM conversation_chunks WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?;
        Ok(at.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }))
    }

    pub fn set_vector_id(&self, chunk_id: &str, vector_id: &str) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE conversation_chunks SET vector_id = ?1 WHERE id = ?2",
            params![vector_id, chunk_id],
        )?;
        Ok(())
    }

    pub fn delete_chunks(&self, conversation_id: &str) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        let deleted = conn.execute(
            "DELETE FROM conversation_chunks WHERE conversation_id = ?1",
            [conversation_id],
        )?;
        debug!("Deleted {} chunks for conversation {}", deleted, conversation_id);
        Ok(deleted)
    }

    fn row_to_chunk(&self, row: &Row) -> anyhow::Result<ConversationChunk> {
        let topics: Vec<String> = serde_json::from_str(&row.get::<_, String>(7)?)
            .map_err(|e| anyhow::anyhow!("Chunk topics JSON error: {}", e))?;
        let entities: Vec<String> = serde_json::from_str(&row.get::<_, String>(8)?)
            .map_err(|e| anyhow::anyhow!("Chunk entities JSON error: {}", e))?;
        let keywords: Vec<String> = serde_json::from_str(&row.get::<_, String>(9)?)
            .map_err(|e| anyhow::anyhow!("Chunk keywords JSON error: {}", e))?;

        let first_message_at = parse_rfc3339(&row.get::<_, String>(12)?)?;
        let last_message_at = parse_rfc3339(&row.get::<_, String>(13)?)?;
        let created_at = parse_rfc3339(&row.get::<_, String>(15)?)?;

        Ok(ConversationChunk {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            user_id: row.get(2)?,
            start_message_id: row.get(3)?,
            end_message_id: row.get(4)?,
            message_count: row.get(5)?,
            summary: row.get(6)?,
            topics,
            entities,
            keywords,
            importance: row.get(10)?,
            coherence: row.get(11)?,
            first_message_at,
            last_message_at,
            vector_id: row.get(14)?,
            created_at,
        })
    }
}

fn parse_rfc3339(s: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .map_err(|e| anyhow::anyhow!("Failed to parse timestamp: {}", e))?
        .with_timezone(&Utc))
}
