//! SQLite-backed vector index for single-node deployments
//!
//! Vectors are stored as bincode blobs and scanned linearly with cosine
//! similarity at query time. Filterable metadata fields are mirrored into
//! indexed columns on upsert.

use super::{cosine_similarity, sort_matches, VectorFilter, VectorIndex, VectorMatch, VectorRecord};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::params;
use std::path::Path;
use std::sync::Arc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use tracing::{debug, info};

const VECTOR_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS vectors (
    namespace TEXT NOT NULL,
    id TEXT NOT NULL,
    conversation_id TEXT,
    user_id TEXT,
    vector BLOB NOT NULL,
    metadata TEXT NOT NULL,
    updated_at TIMESTAMP NOT NULL,
    PRIMARY KEY (namespace, id)
);
CREATE INDEX IF NOT EXISTS idx_vectors_conversation ON vectors (namespace, conversation_id);
CREATE INDEX IF NOT EXISTS idx_vectors_user ON vectors (namespace, user_id);
";

pub struct LocalVectorIndex {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl LocalVectorIndex {
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        info!("Opening vector index at: {}", db_path.display());
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
            let conn = pool.get()?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )?;
            conn.execute_batch(VECTOR_SCHEMA_SQL)?;
        }
        Ok(Self { pool: Arc::new(pool) })
    }

    /// In-memory index for tests; shared-cache so all pooled connections see
    /// the same data.
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let uri = format!(
            "file:stratum_vec_{}?mode=memory&cache=shared",
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
            conn.execute_batch(VECTOR_SCHEMA_SQL)?;
        }
        Ok(Self { pool: Arc::new(pool) })
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    pub fn count(&self, namespace: &str) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM vectors WHERE namespace = ?1",
            [namespace],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[async_trait]
impl VectorIndex for LocalVectorIndex {
    async fn upsert(&self, namespace: &str, record: VectorRecord) -> anyhow::Result<()> {
        let vector_bytes = bincode::serialize(&record.vector)?;
        let metadata_json = serde_json::to_string(&record.metadata)?;
        let conversation_id = record
            .metadata
            .get("conversation_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let user_id = record
            .metadata
            .get("user_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO vectors
             (namespace, id, conversation_id, user_id, vector, metadata, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                namespace,
                record.id,
                conversation_id,
                user_id,
                vector_bytes,
                metadata_json,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn query(
        &self,
        namespace: &str,
        vector: &[f32],
        top_k: usize,
        filter: &VectorFilter,
    ) -> anyhow::Result<Vec<VectorMatch>> {
        let conn = self.get_conn()?;

        let mut sql = String::from(
            "SELECT id, vector, metadata FROM vectors WHERE namespace = ?",
        );
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(namespace.to_string())];
        if let Some(ref conversation_id) = filter.conversation_id {
            sql.push_str(" AND conversation_id = ?");
            params_vec.push(Box::new(conversation_id.clone()));
        }
        if let Some(ref user_id) = filter.user_id {
            sql.push_str(" AND user_id = ?");
            params_vec.push(Box::new(user_id.clone()));
        }

        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
        let mut rows = stmt.query(rusqlite::params_from_iter(param_refs))?;

        let mut matches = Vec::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let vector_bytes: Vec<u8> = row.get(1)?;
            let stored: Vec<f32> = bincode::deserialize(&vector_bytes)
                .map_err(|e| anyhow::anyhow!("Vector deserialization error: {}", e))?;
            let metadata_json: String = row.get(2)?;
            let metadata: serde_json::Value = serde_json::from_str(&metadata_json)
                .map_err(|e| anyhow::anyhow!("Vector metadata JSON error: {}", e))?;

            matches.push(VectorMatch {
                id,
                score: cosine_similarity(vector, &stored),
                metadata,
            });
        }

        sort_matches(&mut matches);
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn delete(&self, namespace: &str, ids: &[String]) -> anyhow::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = self.get_conn()?;

        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!(
            "DELETE FROM vectors WHERE namespace = ? AND id IN ({})",
            placeholders
        );

        let mut params_vec: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(ids.len() + 1);
        let namespace = namespace.to_string();
        params_vec.push(&namespace);
        for id in ids {
            params_vec.push(id);
        }

        let deleted = conn.execute(&sql, rusqlite::params_from_iter(params_vec))?;
        debug!("Deleted {} vectors from namespace {}", deleted, namespace);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, vector: Vec<f32>, conversation_id: &str) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            vector,
            metadata: serde_json::json!({
                "conversation_id": conversation_id,
                "user_id": "user-1",
                "summary": format!("summary for {}", id),
            }),
        }
    }

    #[tokio::test]
    async fn test_upsert_overwrites_instead_of_duplicating() {
        let index = LocalVectorIndex::new_in_memory().unwrap();
        index.upsert("chunks", record("v1", vec![1.0, 0.0], "c1")).await.unwrap();
        index.upsert("chunks", record("v1", vec![0.0, 1.0], "c1")).await.unwrap();

        assert_eq!(index.count("chunks").unwrap(), 1);

        let matches = index
            .query("chunks", &[0.0, 1.0], 10, &VectorFilter::none())
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert!((matches[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_query_orders_and_filters() {
        let index = LocalVectorIndex::new_in_memory().unwrap();
        index.upsert("chunks", record("close", vec![1.0, 0.1], "c1")).await.unwrap();
        index.upsert("chunks", record("far", vec![0.0, 1.0], "c1")).await.unwrap();
        index.upsert("chunks", record("other-conv", vec![1.0, 0.0], "c2")).await.unwrap();

        let matches = index
            .query("chunks", &[1.0, 0.0], 10, &VectorFilter::for_conversation("c1"))
            .await
            .unwrap();
        let ids: Vec<&str> = matches.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["close", "far"]);
        assert!(matches[0].score > matches[1].score);

        let capped = index
            .query("chunks", &[1.0, 0.0], 1, &VectorFilter::none())
            .await
            .unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let index = LocalVectorIndex::new_in_memory().unwrap();
        index.upsert("chunks", record("v1", vec![1.0, 0.0], "c1")).await.unwrap();
        index.upsert("conversations", record("v2", vec![1.0, 0.0], "c1")).await.unwrap();

        let chunk_matches = index
            .query("chunks", &[1.0, 0.0], 10, &VectorFilter::none())
            .await
            .unwrap();
        assert_eq!(chunk_matches.len(), 1);
        assert_eq!(chunk_matches[0].id, "v1");
    }

    #[tokio::test]
    async fn test_delete_tolerates_absent_ids() {
        let index = LocalVectorIndex::new_in_memory().unwrap();
        index.upsert("chunks", record("v1", vec![1.0, 0.0], "c1")).await.unwrap();

        index
            .delete("chunks", &["v1".to_string(), "never-existed".to_string()])
            .await
            .unwrap();
        assert_eq!(index.count("chunks").unwrap(), 0);

        // Deleting again is still success
        index.delete("chunks", &["v1".to_string()]).await.unwrap();
    }

    #[tokio::test]
    async fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.db");

        {
            let index = LocalVectorIndex::open(&path).unwrap();
            index.upsert("chunks", record("v1", vec![1.0, 0.0], "c1")).await.unwrap();
        }

        let reopened = LocalVectorIndex::open(&path).unwrap();
        assert_eq!(reopened.count("chunks").unwrap(), 1);
    }
}
