//! Conversation and message storage operations
//!
//! Messages are written by the surrounding application (or by an import job);
//! the memory engine itself only reads them.

use crate::memory_db::schema::*;
use rusqlite::{params, Row};
use chrono::{DateTime, Utc, NaiveDateTime};
use uuid::Uuid;
use tracing::{debug, info, warn};
use std::sync::Arc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

pub struct ConversationStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl ConversationStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    pub fn create_conversation(&self, user_id: &str, title: &str) -> anyhow::Result<Conversation> {
        self.create_conversation_with_id(&Uuid::new_v4().to_string(), user_id, title)
    }

    pub fn create_conversation_with_id(
        &self,
        conversation_id: &str,
        user_id: &str,
        title: &str,
    ) -> anyhow::Result<Conversation> {
        let now = Utc::now();
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO conversations (id, user_id, title, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![conversation_id, user_id, title, now.to_rfc3339(), now.to_rfc3339()],
        )?;

        info!("Created conversation {} for user {}", conversation_id, user_id);
        Ok(Conversation {
            id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_conversation(&self, conversation_id: &str) -> anyhow::Result<Option<Conversation>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, title, created_at, updated_at FROM conversations WHERE id = ?1",
        )?;
        let mut rows = stmt.query([conversation_id])?;

        if let Some(row) = rows.next()? {
            Ok(Some(self.row_to_conversation(row)?))
        } else {
            Ok(None)
        }
    }

    /// Append one message and bump the conversation's updated_at.
    pub fn append_message(
        &self,
        conversation_id: &str,
        role: &str,
        content: &str,
    ) -> anyhow::Result<StoredMessage> {
        let now = Utc::now();
        let conn = self.get_conn()?;

        conn.execute(
            "INSERT INTO messages (conversation_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![conversation_id, role, content, now.to_rfc3339()],
        )?;
        let id = conn.last_insert_rowid();

        conn.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![now.to_rfc3339(), conversation_id],
        )?;

        Ok(StoredMessage {
            id,
            conversation_id: conversation_id.to_string(),
            role: role.to_string(),
            content: content.to_string(),
            created_at: now,
        })
    }

    /// Append several messages in one transaction. All rows share one
    /// insertion timestamp.
    pub fn append_messages_batch(
        &self,
        conversation_id: &str,
        messages: &[(String, String)],
    ) -> anyhow::Result<Vec<StoredMessage>> {
        let now = Utc::now();
        let rows: Vec<(String, String, DateTime<Utc>)> = messages
            .iter()
            .map(|(role, content)| (role.clone(), content.clone(), now))
            .collect();
        self.import_messages(conversation_id, &rows)
    }

    /// Insert messages carrying their own timestamps. Used for batch appends
    /// and for importing conversations that predate this store.
    pub fn import_messages(
        &self,
        conversation_id: &str,
        messages: &[(String, String, DateTime<Utc>)],
    ) -> anyhow::Result<Vec<StoredMessage>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.get_conn()?;
        let mut stored = Vec::with_capacity(messages.len());
        let mut last_at: Option<DateTime<Utc>> = None;

        let tx = conn.transaction()?;
        {
            for (role, content, created_at) in messages.iter() {
                tx.execute(
                    "INSERT INTO messages (conversation_id, role, content, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![conversation_id, role, content, created_at.to_rfc3339()],
                )?;
                let id = tx.last_insert_rowid();
                stored.push(StoredMessage {
                    id,
                    conversation_id: conversation_id.to_string(),
                    role: role.clone(),
                    content: content.clone(),
                    created_at: *created_at,
                });
                last_at = Some(*created_at);
            }

            if let Some(at) = last_at {
                tx.execute(
                    "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                    params![at.to_rfc3339(), conversation_id],
                )?;
            }
        }
        tx.commit()?;

        debug!("Stored {} messages for conversation {}", stored.len(), conversation_id);
        Ok(stored)
    }

    /// Last `limit` messages in chronological order.
    pub fn get_recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<StoredMessage>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, created_at
             FROM messages WHERE conversation_id = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![conversation_id, limit as i64])?;

        let mut messages = Vec::new();
        while let Some(row) = rows.next()? {
            messages.push(self.row_to_stored_message(row)?);
        }
        messages.reverse();
        Ok(messages)
    }

    /// All messages with id strictly greater than `after_id`, oldest first.
    /// Pass 0 to read the whole conversation.
    pub fn get_messages_after(
        &self,
        conversation_id: &str,
        after_id: i64,
    ) -> anyhow::Result<Vec<StoredMessage>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, created_at
             FROM messages WHERE conversation_id = ?1 AND id > ?2
             ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![conversation_id, after_id])?;

        let mut messages = Vec::new();
        while let Some(row) = rows.next()? {
            messages.push(self.row_to_stored_message(row)?);
        }
        Ok(messages)
    }

    /// Messages with start_id <= id <= end_id, oldest first.
    pub fn get_messages_in_range(
        &self,
        conversation_id: &str,
        start_id: i64,
        end_id: i64,
    ) -> anyhow::Result<Vec<StoredMessage>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, created_at
             FROM messages WHERE conversation_id = ?1 AND id >= ?2 AND id <= ?3
             ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![conversation_id, start_id, end_id])?;

        let mut messages = Vec::new();
        while let Some(row) = rows.next()? {
            messages.push(self.row_to_stored_message(row)?);
        }
        Ok(messages)
    }

    pub fn count_messages(&self, conversation_id: &str) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn count_messages_after(&self, conversation_id: &str, after_id: i64) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1 AND id > ?2",
            params![conversation_id, after_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Timestamps of the first and last message, if any exist.
    pub fn activity_range(
        &self,
        conversation_id: &str,
    ) -> anyhow::Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let conn = self.get_conn()?;
        let range: Option<(String, String)> = conn
            .query_row(
                "SELECT MIN(created_at), MAX(created_at) FROM messages WHERE conversation_id = ?1",
                [conversation_id],
                |row| {
                    let first: Option<String> = row.get(0)?;
                    let last: Option<String> = row.get(1)?;
                    Ok(first.zip(last))
                },
            )?;

        Ok(range.and_then(|(first, last)| {
            Some((Self::parse_datetime_safe(&first)?, Self::parse_datetime_safe(&last)?))
        }))
    }

    /// Conversations for a user with at least `min_messages` messages, most
    /// recently updated first, capped at `limit`. Returns each conversation
    /// with its message count.
    pub fn eligible_conversations(
        &self,
        user_id: &str,
        min_messages: usize,
        limit: usize,
    ) -> anyhow::Result<Vec<(Conversation, i64)>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT c.id, c.user_id, c.title, c.created_at, c.updated_at, COUNT(m.id) AS n
             FROM conversations c
             LEFT JOIN messages m ON m.conversation_id = c.id
             WHERE c.user_id = ?1
             GROUP BY c.id
             HAVING n >= ?2
             ORDER BY c.updated_at DESC
             LIMIT ?3",
        )?;
        let mut rows = stmt.query(params![user_id, min_messages as i64, limit as i64])?;

        let mut conversations = Vec::new();
        while let Some(row) = rows.next()? {
            let conversation = self.row_to_conversation(row)?;
            let count: i64 = row.get(5)?;
            conversations.push((conversation, count));
        }
        Ok(conversations)
    }

    fn parse_datetime_safe(datetime_str: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(datetime_str) {
            return Some(dt.with_timezone(&Utc));
        }
        if let Ok(dt) = NaiveDateTime::parse_from_str(datetime_str, "%Y-%m-%d %H:%M:%S") {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
        if let Ok(dt) = NaiveDateTime::parse_from_str(datetime_str, "%Y-%m-%d %H:%M:%S%.f") {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
        None
    }

    fn row_to_conversation(&self, row: &Row) -> anyhow::Result<Conversation> {
        let created_at = Self::parse_datetime_safe(&row.get::<_, String>(3)?)
            .unwrap_or_else(|| {
                warn!("Failed to parse conversation created_at");
                Utc::now()
            });
        let updated_at = Self::parse_datetime_safe(&row.get::<_, String>(4)?)
            .unwrap_or_else(|| {
                warn!("Failed to parse conversation updated_at");
                Utc::now()
            });

        Ok(Conversation {
            id: row.get(0)?,
            user_id: row.get(1)?,
            title: row.get(2)?,
            created_at,
            updated_at,
        })
    }

    fn row_to_stored_message(&self, row: &Row) -> anyhow::Result<StoredMessage> {
        let created_at = Self::parse_datetime_safe(&row.get::<_, String>(4)?)
            .unwrap_or_else(|| {
                warn!("Failed to parse message created_at");
                Utc::now()
            });

        Ok(StoredMessage {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            role: row.get(2)?,
            content: row.get(3)?,
            created_at,
        })
    }
}
