//! Database migration system

use rusqlite::{Connection, Result};
use tracing::{info, warn, error};

use crate::memory_db::schema;

/// Manages database schema migrations
pub struct MigrationManager<'a> {
    conn: &'a mut Connection,
}

impl<'a> MigrationManager<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    /// Initialize database with current schema
    pub fn initialize_database(&mut self) -> Result<()> {
        info!("Initializing memory database schema...");

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        let current_version: i32 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        info!("Current database schema version: {}", current_version);

        self.apply_migrations(current_version)?;

        Ok(())
    }

    /// Apply all pending migrations
    fn apply_migrations(&mut self, current_version: i32) -> Result<()> {
        let migrations = get_migrations();

        for (version, migration_sql) in migrations.iter() {
            if *version > current_version {
                info!("Applying migration {}...", version);

                let tx = self.conn.transaction()?;

                if let Err(e) = tx.execute_batch(migration_sql) {
                    error!("Failed to apply migration {}: {}", version, e);
                    return Err(e);
                }

                tx.execute(
                    "INSERT INTO schema_version (version) VALUES (?)",
                    [version],
                )?;

                tx.commit()?;

                info!("Migration {} applied successfully", version);
            }
        }

        Ok(())
    }

    /// Get current schema version
    pub fn get_current_version(&self) -> Result<i32> {
        self.conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .or_else(|_| Ok(0))
    }
}

/// Get all migration SQL scripts
fn get_migrations() -> Vec<(i32, &'static str)> {
    vec![(1, schema::SCHEMA_SQL)]
}

/// Get database statistics from a connection.
/// Only performs read queries, so it is safe on a shared connection.
pub fn get_database_stats(conn: &Connection) -> Result<schema::DatabaseStats> {
    fn get_table_count(conn: &Connection, table_name: &str) -> Result<i64> {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table_name), [], |row| row.get(0))
            .or_else(|e| {
                warn!("Failed to get count from table {}: {}", table_name, e);
                Ok(0)
            })
    }

    let total_conversations = get_table_count(conn, "conversations")?;
    let total_messages = get_table_count(conn, "messages")?;
    let total_chunks = get_table_count(conn, "conversation_chunks")?;
    let total_indices = get_table_count(conn, "conversation_indices")?;
    let total_memories = get_table_count(conn, "user_memories")?;
    let total_context_states = get_table_count(conn, "context_states")?;

    let database_size_bytes: i64 = conn
        .query_row(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(schema::DatabaseStats {
        total_conversations,
        total_messages,
        total_chunks,
        total_indices,
        total_memories,
        total_context_states,
        database_size_bytes,
    })
}
