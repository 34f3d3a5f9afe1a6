//! Long-term user memory storage operations
//!
//! Rows are produced by a fact-extraction collaborator outside this crate.
//! The engine reads candidates and bumps access counters when a memory is
//! used in an assembled context.

use crate::memory_db::schema::*;
use rusqlite::{params, Row};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

pub struct MemoryStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl MemoryStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    pub fn insert_memory(
        &self,
        user_id: &str,
        section: MemorySection,
        content: &str,
        importance: i32,
    ) -> anyhow::Result<UserMemory> {
        let now = Utc::now();
        let importance = importance.clamp(1, 10);
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO user_memories (user_id, section, content, importance, access_count, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![user_id, section.as_str(), content, importance, now.to_rfc3339()],
        )?;
        let id = conn.last_insert_rowid();

        Ok(UserMemory {
            id,
            user_id: user_id.to_string(),
            section,
            content: content.to_string(),
            importance,
            access_count: 0,
            last_accessed_at: None,
            created_at: now,
        })
    }

    /// Candidate memories for retrieval, ranked by importance, then by how
    /// often and how recently they were used.
    pub fn candidates_for_user(&self, user_id: &str, limit: usize) -> anyhow::Result<Vec<UserMemory>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, section, content, importance, access_count, last_accessed_at, created_at
             FROM user_memories
             WHERE user_id = ?1
             ORDER BY importance DESC, access_count DESC, COALESCE(last_accessed_at, created_at) DESC
             LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![user_id, limit as i64])?;

        let mut memories = Vec::new();
        while let Some(row) = rows.next()? {
            memories.push(self.row_to_memory(row)?);
        }
        Ok(memories)
    }

    /// Bump access counters for every returned memory in one statement.
    pub fn touch_access(&self, memory_ids: &[i64]) -> anyhow::Result<()> {
        if memory_ids.is_empty() {
            return Ok(());
        }
        let conn = self.get_conn()?;
        let now = Utc::now().to_rfc3339();

        let placeholders = vec!["?"; memory_ids.len()].join(",");
        let query = format!(
            "UPDATE user_memories
             SET access_count = access_count + 1, last_accessed_at = ?
             WHERE id IN ({})",
            placeholders
        );

        let mut params_vec: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(memory_ids.len() + 1);
        params_vec.push(&now);
        for id in memory_ids {
            params_vec.push(id);
        }

        conn.execute(&query, rusqlite::params_from_iter(params_vec))?;
        Ok(())
    }

    pub fn get_memory(&self, memory_id: i64) -> anyhow::Result<Option<UserMemory>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, section, content, importance, access_count, last_accessed_at, created_at
             FROM user_memories WHERE id = ?1",
        )?;
        let mut rows = stmt.query([memory_id])?;

        if let Some(row) = rows.next()? {
            Ok(Some(self.row_to_memory(row)?))
        } else {
            Ok(None)
        }
    }

    fn row_to_memory(&self, row: &Row) -> anyhow::Result<UserMemory> {
        let section_str: String = row.get(2)?;
        let section = MemorySection::parse(&section_str)
            .ok_or_else(|| anyhow::anyhow!("Unknown memory section: {}", section_str))?;

        let last_accessed_at: Option<String> = row.get(6)?;
        let last_accessed_at = last_accessed_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let created_at = DateTime::parse_from_rfc3339(&row.get::<_, String>(7)?)
            .map_err(|e| anyhow::anyhow!("Failed to parse timestamp: {}", e))?
            .with_timezone(&Utc);

        Ok(UserMemory {
            id: row.get(0)?,
            user_id: row.get(1)?,
            section,
            content: row.get(3)?,
            importance: row.get(4)?,
            access_count: row.get(5)?,
            last_accessed_at,
            created_at,
        })
    }
}
