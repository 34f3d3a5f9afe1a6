//! Context state storage operations
//!
//! Observational rows only. Losing this table costs monitoring history, not
//! correctness.

use crate::memory_db::schema::*;
use rusqlite::{params, Row};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

pub struct StateStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl StateStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    pub fn upsert_state(&self, state: &ContextState) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO context_states
             (conversation_id, recent_message_ids, chunk_ids, memory_ids,
              recent_tokens, historical_tokens, memory_tokens, total_tokens,
              content_bytes, last_query, compression_level, compression_ratio, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                state.conversation_id,
                serde_json::to_string(&state.recent_message_ids)?,
                serde_json::to_string(&state.chunk_ids)?,
                serde_json::to_string(&state.memory_ids)?,
                state.recent_tokens,
                state.historical_tokens,
                state.memory_tokens,
                state.total_tokens,
                state.content_bytes,
                state.last_query,
                state.compression_level,
                state.compression_ratio,
                state.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_state(&self, conversation_id: &str) -> anyhow::Result<Option<ContextState>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT conversation_id, recent_message_ids, chunk_ids, memory_ids,
                    recent_tokens, historical_tokens, memory_tokens, total_tokens,
                    content_bytes, last_query, compression_level, compression_ratio, updated_at
             FROM context_states WHERE conversation_id = ?1",
        )?;
        let mut rows = stmt.query([conversation_id])?;

        if let Some(row) = rows.next()? {
            Ok(Some(self.row_to_state(row)?))
        } else {
            Ok(None)
        }
    }

    /// Delete the state row. Absent rows count as success.
    pub fn delete_state(&self, conversation_id: &str) -> anyhow::Result<bool> {
        let conn = self.get_conn()?;
        let deleted = conn.execute(
            "DELETE FROM context_states WHERE conversation_id = ?1",
            [conversation_id],
        )?;
        Ok(deleted > 0)
    }

    fn row_to_state(&self, row: &Row) -> anyhow::Result<ContextState> {
        let recent_message_ids: Vec<i64> = serde_json::from_str(&row.get::<_, String>(1)?)
            .map_err(|e| anyhow::anyhow!("State message ids JSON error: {}", e))?;
        let chunk_ids: Vec<String> = serde_json::from_str(&row.get::<_, String>(2)?)
            .map_err(|e| anyhow::anyhow!("State chunk ids JSON error: {}", e))?;
        let memory_ids: Vec<i64> = serde_json::from_str(&row.get::<_, String>(3)?)
            .map_err(|e| anyhow::anyhow!("State memory ids JSON error: {}", e))?;

        let updated_at = DateTime::parse_from_rfc3339(&row.get::<_, String>(12)?)
            .map_err(|e| anyhow::anyhow!("Failed to parse timestamp: {}", e))?
            .with_timezone(&Utc);

        Ok(ContextState {
            conversation_id: row.get(0)?,
            recent_message_ids,
            chunk_ids,
            memory_ids,
            recent_tokens: row.get(4)?,
            historical_tokens: row.get(5)?,
            memory_tokens: row.get(6)?,
            total_tokens: row.get(7)?,
            content_bytes: row.get(8)?,
            last_query: row.get(9)?,
            compression_level: row.get(10)?,
            compression_ratio: row.get(11)?,
            updated_at,
        })
    }
}
