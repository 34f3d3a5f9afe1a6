//! Memory database module - SQLite-based storage for conversations, chunks,
//! digests, user memories and context states

pub mod schema;
pub mod migration;
pub mod conversation_store;
pub mod chunk_store;
pub mod index_store;
pub mod memory_store;
pub mod state_store;

pub use schema::*;
pub use migration::MigrationManager;
pub use conversation_store::ConversationStore;
pub use chunk_store::ChunkStore;
pub use index_store::IndexStore;
pub use memory_store::MemoryStore;
pub use state_store::StateStore;

use std::path::Path;
use std::sync::Arc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use tracing::info;

/// Pooled SQLite database with one store per concern.
pub struct MemoryDatabase {
    pub conversations: ConversationStore,
    pub chunks: ChunkStore,
    pub indices: IndexStore,
    pub memories: MemoryStore,
    pub states: StateStore,
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl MemoryDatabase {
    pub fn new(db_path: &Path) -> anyhow::Result<Self> {
        info!("Opening memory database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(db_path).with_flags(
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        );
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;

        {
            let mut conn = pool.get()?;
            let mut migrator = migration::MigrationManager::new(&mut conn);
            migrator.initialize_database()?;
            conn.execute_batch(
                "PRAGMA foreign_keys = ON;
                 PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )?;
        }
        let pool = Arc::new(pool);
        info!("Memory database initialized successfully");
        Ok(Self::from_pool(pool))
    }

    /// In-memory database for tests. Uses a named shared-cache database so
    /// every pooled connection sees the same tables.
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let uri = format!(
            "file:stratum_mem_{}?mode=memory&cache=shared",
            uuid::Uuid::new_v4().simple()
        );
        let manager = SqliteConnectionManager::file(uri).with_flags(
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        );
        let pool = Pool::builder().max_size(5).build(manager)?;
        {
            let conn = pool.get()?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            conn.execute_batch(schema::SCHEMA_SQL)?;
        }
        let pool = Arc::new(pool);
        Ok(Self::from_pool(pool))
    }

    fn from_pool(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self {
            conversations: ConversationStore::new(Arc::clone(&pool)),
            chunks: ChunkStore::new(Arc::clone(&pool)),
            indices: IndexStore::new(Arc::clone(&pool)),
            memories: MemoryStore::new(Arc::clone(&pool)),
            states: StateStore::new(Arc::clone(&pool)),
            pool,
        }
    }

    pub fn get_stats(&self) -> anyhow::Result<DatabaseStats> {
        let conn = self.pool.get()?;
        Ok(migration::get_database_stats(&conn)?)
    }
}

impl Drop for MemoryDatabase {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}
