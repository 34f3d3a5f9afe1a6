//! Embedding and vector persistence for chunks and conversation digests
//!
//! Vector ids are deterministic (`chunk_<conversation>_<start>` and
//! `index_<conversation>`), so re-embedding overwrites instead of
//! duplicating and racing writers converge on the same entries.

use crate::memory_db::{ConversationChunk, ConversationIndex, MemoryDatabase};
use crate::providers::EmbeddingProvider;
use crate::utils::TextUtils;
use crate::vector_index::{VectorFilter, VectorIndex, VectorRecord};
use chrono::{DateTime, Utc};
use moka::sync::Cache;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub chunk_namespace: String,
    pub conversation_namespace: String,
    /// Cap on raw message content appended to the embedding input, in chars.
    pub content_cap_chars: usize,
    /// Cap on the digest text embedded for a conversation, in chars.
    pub digest_cap_chars: usize,
    /// Cap on text fields mirrored into vector metadata, in chars.
    pub metadata_text_cap: usize,
    pub query_cache_capacity: u64,
    pub query_cache_ttl_seconds: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            chunk_namespace: "chunks".to_string(),
            conversation_namespace: "conversations".to_string(),
            content_cap_chars: 2000,
            digest_cap_chars: 4000,
            metadata_text_cap: 1000,
            query_cache_capacity: 256,
            query_cache_ttl_seconds: 300,
        }
    }
}

/// Aggregated list caps for the conversation digest.
const MAX_INDEX_TOPICS: usize = 10;
const MAX_INDEX_ENTITIES: usize = 10;
const MAX_INDEX_KEYWORDS: usize = 20;

#[derive(Debug, Clone, Default)]
pub struct ChunkSearchOptions {
    pub conversation_id: Option<String>,
    pub user_id: Option<String>,
    pub top_k: usize,
    pub min_score: f32,
}

#[derive(Debug, Clone)]
pub struct ChunkMatch {
    pub chunk_id: String,
    pub conversation_id: String,
    pub summary: String,
    pub score: f32,
    pub last_message_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ConversationSearchOptions {
    pub top_k: usize,
    pub min_score: f32,
}

impl Default for ConversationSearchOptions {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_score: 0.3,
        }
    }
}

/// Cross-conversation search result: "which chat was this in".
#[derive(Debug, Clone, Serialize)]
pub struct ConversationMatch {
    pub conversation_id: String,
    pub title: String,
    pub summary: String,
    pub score: f32,
    pub message_count: i64,
    pub last_message_at: DateTime<Utc>,
}

pub struct Indexer {
    database: Arc<MemoryDatabase>,
    vectors: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: IndexerConfig,
    /// Repeated retrievals with the same query text reuse the query vector
    /// within the TTL window.
    query_cache: Cache<String, Arc<Vec<f32>>>,
}

impl Indexer {
    pub fn new(
        database: Arc<MemoryDatabase>,
        vectors: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: IndexerConfig,
    ) -> Self {
        let query_cache = Cache::builder()
            .max_capacity(config.query_cache_capacity)
            .time_to_live(Duration::from_secs(config.query_cache_ttl_seconds))
            .build();
        Self {
            database,
            vectors,
            embedder,
            config,
            query_cache,
        }
    }

    pub fn chunk_vector_id(conversation_id: &str, start_message_id: i64) -> String {
        format!("chunk_{}_{}", conversation_id, start_message_id)
    }

    pub fn index_vector_id(conversation_id: &str) -> String {
        format!("index_{}", conversation_id)
    }

    /// Embed one chunk and upsert it into the chunk namespace, then attach
    /// the vector id to the chunk row. Idempotent.
    pub async fn embed_chunk(&self, chunk: &ConversationChunk) -> anyhow::Result<String> {
        let vector_id = Self::chunk_vector_id(&chunk.conversation_id, chunk.start_message_id);

        let content = self.chunk_content(chunk)?;
        let input = format!(
            "{}\n{}",
            chunk.summary,
            TextUtils::truncate_chars(&content, self.config.content_cap_chars)
        );
        let vector = self.embedder.embed(&input).await?;

        self.vectors
            .upsert(
                &self.config.chunk_namespace,
                VectorRecord {
                    id: vector_id.clone(),
                    vector,
                    metadata: self.chunk_metadata(chunk),
                },
            )
            .await?;
        self.database.chunks.set_vector_id(&chunk.id, &vector_id)?;

        debug!("Embedded chunk {} as {}", chunk.id, vector_id);
        Ok(vector_id)
    }

    /// Sequential per-chunk embedding with per-item failure isolation; one
    /// provider call at a time to respect rate limits. Returns the ids that
    /// succeeded.
    pub async fn embed_chunks_batch(
        &self,
        chunks: &[ConversationChunk],
    ) -> anyhow::Result<Vec<String>> {
        let mut vector_ids = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            match self.embed_chunk(chunk).await {
                Ok(vector_id) => vector_ids.push(vector_id),
                Err(e) => warn!(
                    "Embedding failed for chunk {} (conversation {}), skipping: {}",
                    chunk.id, chunk.conversation_id, e
                ),
            }
        }
        debug!("Embedded {} of {} chunks", vector_ids.len(), chunks.len());
        Ok(vector_ids)
    }

    /// Recompute the conversation digest from all chunks (recent raw messages
    /// when no chunks exist yet), embed it into the conversation namespace
    /// and upsert the [`ConversationIndex`] row. Idempotent.
    pub async fn embed_conversation_index(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> anyhow::Result<String> {
        let vector_id = Self::index_vector_id(conversation_id);

        let title = self
            .database
            .conversations
            .get_conversation(conversation_id)?
            .map(|c| c.title)
            .unwrap_or_else(|| "Untitled conversation".to_string());
        let chunks = self.database.chunks.get_chunks(conversation_id)?;

        let digest = if chunks.is_empty() {
            // Nothing summarized yet: digest the recent raw messages so the
            // conversation is still findable across conversations.
            let recent = self
                .database
                .conversations
                .get_recent_messages(conversation_id, 20)?;
            recent
                .iter()
                .map(|m| format!("{}: {}", m.role, m.content))
                .collect::<Vec<_>>()
                .join("\n")
        } else {
            chunks
                .iter()
                .map(|c| c.summary.as_str())
                .collect::<Vec<_>>()
                .join("\n")
        };
        let digest = TextUtils::truncate_chars(&digest, self.config.digest_cap_chars).into_owned();

        let message_count = self.database.conversations.count_messages(conversation_id)? as i64;
        let now = Utc::now();
        let (first_activity_at, last_activity_at) = self
            .database
            .conversations
            .activity_range(conversation_id)?
            .unwrap_or((now, now));

        let input = format!("{}\n{}", title, digest);
        let vector = self.embedder.embed(&input).await?;
        self.vectors
            .upsert(
                &self.config.conversation_namespace,
                VectorRecord {
                    id: vector_id.clone(),
                    vector,
                    metadata: serde_json::json!({
                        "conversation_id": conversation_id,
                        "user_id": user_id,
                        "title": title,
                        "summary": TextUtils::truncate_chars(&digest, self.config.metadata_text_cap),
                        "message_count": message_count,
                        "last_message_at": last_activity_at.to_rfc3339(),
                    }),
                },
            )
            .await?;

        let index = ConversationIndex {
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            title,
            digest,
            topics: aggregate(&chunks, |c| &c.topics, MAX_INDEX_TOPICS),
            entities: aggregate(&chunks, |c| &c.entities, MAX_INDEX_ENTITIES),
            keywords: aggregate(&chunks, |c| &c.keywords, MAX_INDEX_KEYWORDS),
            message_count,
            chunk_count: chunks.len() as i64,
            first_activity_at,
            last_activity_at,
            vector_id: Some(vector_id.clone()),
            updated_at: now,
        };
        self.database.indices.upsert_index(&index)?;

        debug!(
            "Upserted conversation index for {} ({} chunks, {} messages)",
            conversation_id,
            index.chunk_count,
            message_count
        );
        Ok(vector_id)
    }

    /// Semantic search over the chunk namespace, filtered and thresholded.
    pub async fn search_chunks(
        &self,
        query: &str,
        options: &ChunkSearchOptions,
    ) -> anyhow::Result<Vec<ChunkMatch>> {
        let vector = self.query_embedding(query).await?;
        let filter = VectorFilter {
            conversation_id: options.conversation_id.clone(),
            user_id: options.user_id.clone(),
        };

        let matches = self
            .vectors
            .query(&self.config.chunk_namespace, &vector, options.top_k, &filter)
            .await?;

        Ok(matches
            .into_iter()
            .filter(|m| m.score >= options.min_score)
            .map(|m| {
                let last_message_at = m
                    .metadata
                    .get("last_message_at")
                    .and_then(|v| v.as_str())
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(Utc::now);
                ChunkMatch {
                    chunk_id: metadata_str(&m.metadata, "chunk_id"),
                    conversation_id: metadata_str(&m.metadata, "conversation_id"),
                    summary: metadata_str(&m.metadata, "summary"),
                    score: m.score,
                    last_message_at,
                    metadata: m.metadata,
                }
            })
            .collect())
    }

    /// Semantic search over the conversation namespace for one user.
    pub async fn search_conversations(
        &self,
        query: &str,
        user_id: &str,
        options: &ConversationSearchOptions,
    ) -> anyhow::Result<Vec<ConversationMatch>> {
        let vector = self.query_embedding(query).await?;
        let filter = VectorFilter::for_user(user_id);

        let matches = self
            .vectors
            .query(
                &self.config.conversation_namespace,
                &vector,
                options.top_k,
                &filter,
            )
            .await?;

        Ok(matches
            .into_iter()
            .filter(|m| m.score >= options.min_score)
            .map(|m| ConversationMatch {
                conversation_id: metadata_str(&m.metadata, "conversation_id"),
                title: metadata_str(&m.metadata, "title"),
                summary: metadata_str(&m.metadata, "summary"),
                score: m.score,
                message_count: m
                    .metadata
                    .get("message_count")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0),
                last_message_at: m
                    .metadata
                    .get("last_message_at")
                    .and_then(|v| v.as_str())
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(Utc::now),
            })
            .collect())
    }

    /// Remove all chunk vectors and the digest vector for a conversation.
    /// Absent vectors count as success.
    pub async fn delete_conversation(&self, conversation_id: &str) -> anyhow::Result<()> {
        let chunks = self.database.chunks.get_chunks(conversation_id)?;
        let mut chunk_vector_ids: Vec<String> = chunks
            .iter()
            .map(|c| Self::chunk_vector_id(conversation_id, c.start_message_id))
            .collect();
        chunk_vector_ids.extend(chunks.iter().filter_map(|c| c.vector_id.clone()));
        chunk_vector_ids.sort();
        chunk_vector_ids.dedup();

        self.vectors
            .delete(&self.config.chunk_namespace, &chunk_vector_ids)
            .await?;
        self.vectors
            .delete(
                &self.config.conversation_namespace,
                &[Self::index_vector_id(conversation_id)],
            )
            .await?;
        debug!(
            "Deleted {} chunk vectors and the index vector for conversation {}",
            chunk_vector_ids.len(),
            conversation_id
        );
        Ok(())
    }

    async fn query_embedding(&self, query: &str) -> anyhow::Result<Arc<Vec<f32>>> {
        if let Some(cached) = self.query_cache.get(query) {
            return Ok(cached);
        }
        let vector = Arc::new(self.embedder.embed(query).await?);
        self.query_cache.insert(query.to_string(), Arc::clone(&vector));
        Ok(vector)
    }

    /// Raw message content of the chunk's range, for the embedding input.
    fn chunk_content(&self, chunk: &ConversationChunk) -> anyhow::Result<String> {
        let messages = self.database.conversations.get_messages_in_range(
            &chunk.conversation_id,
            chunk.start_message_id,
            chunk.end_message_id,
        )?;
        Ok(messages
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    fn chunk_metadata(&self, chunk: &ConversationChunk) -> serde_json::Value {
        serde_json::json!({
            "chunk_id": chunk.id,
            "conversation_id": chunk.conversation_id,
            "user_id": chunk.user_id,
            "start_message_id": chunk.start_message_id,
            "end_message_id": chunk.end_message_id,
            "message_count": chunk.message_count,
            "summary": TextUtils::truncate_chars(&chunk.summary, self.config.metadata_text_cap),
            "topics": chunk.topics,
            "entities": chunk.entities,
            "keywords": chunk.keywords,
            "importance": chunk.importance,
            "coherence": chunk.coherence,
            "first_message_at": chunk.first_message_at.to_rfc3339(),
            "last_message_at": chunk.last_message_at.to_rfc3339(),
        })
    }
}

/// Union of a list field across chunks, deduplicated in order of first
/// appearance and capped.
fn aggregate<F>(chunks: &[ConversationChunk], field: F, cap: usize) -> Vec<String>
where
    F: Fn(&ConversationChunk) -> &Vec<String>,
{
    let mut seen = std::collections::HashSet::new();
    let mut values = Vec::new();
    for chunk in chunks {
        for value in field(chunk) {
            let normalized = value.to_lowercase();
            if seen.insert(normalized) {
                values.push(value.clone());
                if values.len() == cap {
                    return values;
                }
            }
        }
    }
    values
}

fn metadata_str(metadata: &serde_json::Value, key: &str) -> String {
    metadata
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::StoredMessage;
    use crate::vector_index::InMemoryVectorIndex;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    /// Deterministic bag-of-words embedder over a tiny vocabulary. Texts
    /// sharing vocabulary words land close in cosine space.
    struct VocabEmbedder;

    const VOCAB: [&str; 6] = ["planning", "roadmap", "travel", "budget", "hiring", "infra"];

    #[async_trait]
    impl EmbeddingProvider for VocabEmbedder {
        async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            if text.contains("poison") {
                return Err(anyhow::anyhow!("embedder unavailable"));
            }
            let lower = text.to_lowercase();
            let mut vector: Vec<f32> = VOCAB
                .iter()
                .map(|word| lower.matches(word).count() as f32)
                .collect();
            // Bias dimension keeps unrelated texts at a low positive score
            vector.push(0.1);
            Ok(vector)
        }

        fn dimension(&self) -> usize {
            VOCAB.len() + 1
        }
    }

    struct Fixture {
        database: Arc<MemoryDatabase>,
        vectors: Arc<InMemoryVectorIndex>,
        indexer: Indexer,
    }

    fn fixture() -> Fixture {
        let database = Arc::new(MemoryDatabase::new_in_memory().unwrap());
        let vectors = Arc::new(InMemoryVectorIndex::new());
        let indexer = Indexer::new(
            Arc::clone(&database),
            Arc::clone(&vectors) as Arc<dyn VectorIndex>,
            Arc::new(VocabEmbedder),
            IndexerConfig::default(),
        );
        Fixture {
            database,
            vectors,
            indexer,
        }
    }

    fn seed(db: &MemoryDatabase, conversation_id: &str, title: &str, n: usize) -> Vec<StoredMessage> {
        db.conversations
            .create_conversation_with_id(conversation_id, "user-1", title)
            .unwrap();
        let base = Utc::now() - ChronoDuration::minutes(n as i64);
        let rows: Vec<(String, String, DateTime<Utc>)> = (0..n)
            .map(|i| {
                ("user".to_string(), format!("msg {}", i + 1), base + ChronoDuration::minutes(i as i64))
            })
            .collect();
        db.conversations.import_messages(conversation_id, &rows).unwrap()
    }

    fn chunk(conversation_id: &str, start: i64, end: i64, summary: &str) -> ConversationChunk {
        let now = Utc::now();
        ConversationChunk {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            user_id: "user-1".to_string(),
            start_message_id: start,
            end_message_id: end,
            message_count: (end - start + 1) as i32,
            summary: summary.to_string(),
            topics: vec!["planning".to_string()],
            entities: vec!["Q3".to_string()],
            keywords: vec!["roadmap".to_string()],
            importance: 0.6,
            coherence: 0.8,
            first_message_at: now - ChronoDuration::hours(3),
            last_message_at: now - ChronoDuration::hours(2),
            vector_id: None,
            created_at: now,
        }
    }

    #[tokio::test]
    async fn test_embed_chunk_is_idempotent() {
        let f = fixture();
        seed(&f.database, "conv-1", "Planning", 10);
        let c = chunk("conv-1", 1, 10, "planning roadmap discussion");
        f.database.chunks.insert_chunk(&c).unwrap();

        let first = f.indexer.embed_chunk(&c).await.unwrap();
        let second = f.indexer.embed_chunk(&c).await.unwrap();

        assert_eq!(first, "chunk_conv-1_1");
        assert_eq!(first, second);
        assert_eq!(f.vectors.count("chunks"), 1);

        let stored = f.database.chunks.get_chunk(&c.id).unwrap().unwrap();
        assert_eq!(stored.vector_id.as_deref(), Some("chunk_conv-1_1"));
    }

    #[tokio::test]
    async fn test_batch_isolates_failures() {
        let f = fixture();
        seed(&f.database, "conv-1", "Planning", 20);
        let good = chunk("conv-1", 1, 10, "planning roadmap");
        let bad = chunk("conv-1", 11, 20, "poison summary");
        f.database.chunks.insert_chunk(&good).unwrap();
        f.database.chunks.insert_chunk(&bad).unwrap();

        let vector_ids = f
            .indexer
            .embed_chunks_batch(&[good.clone(), bad.clone()])
            .await
            .unwrap();

        assert_eq!(vector_ids, vec!["chunk_conv-1_1".to_string()]);
        assert_eq!(f.vectors.count("chunks"), 1);
        // Failed chunk keeps no vector id and can be retried later
        let stored = f.database.chunks.get_chunk(&bad.id).unwrap().unwrap();
        assert!(stored.vector_id.is_none());
    }

    #[tokio::test]
    async fn test_conversation_index_upsert_and_aggregation() {
        let f = fixture();
        seed(&f.database, "conv-1", "Q3 planning", 20);
        let mut a = chunk("conv-1", 1, 10, "planning roadmap part one");
        a.topics = vec!["planning".to_string(), "budget".to_string()];
        let mut b = chunk("conv-1", 11, 20, "planning roadmap part two");
        b.topics = vec!["Planning".to_string(), "hiring".to_string()];
        f.database.chunks.insert_chunk(&a).unwrap();
        f.database.chunks.insert_chunk(&b).unwrap();

        let vector_id = f.indexer.embed_conversation_index("conv-1", "user-1").await.unwrap();
        assert_eq!(vector_id, "index_conv-1");

        // Second run overwrites, never duplicates
        f.indexer.embed_conversation_index("conv-1", "user-1").await.unwrap();
        assert_eq!(f.vectors.count("conversations"), 1);

        let index = f.database.indices.get_index("conv-1").unwrap().unwrap();
        assert_eq!(index.chunk_count, 2);
        assert_eq!(index.message_count, 20);
        // Case-insensitive dedup preserving first appearance
        assert_eq!(index.topics, vec!["planning", "budget", "hiring"]);
        assert!(index.digest.contains("part one"));
        assert_eq!(index.vector_id.as_deref(), Some("index_conv-1"));
    }

    #[tokio::test]
    async fn test_conversation_index_falls_back_to_raw_messages() {
        let f = fixture();
        seed(&f.database, "conv-1", "Travel chat", 5);

        f.indexer.embed_conversation_index("conv-1", "user-1").await.unwrap();

        let index = f.database.indices.get_index("conv-1").unwrap().unwrap();
        assert_eq!(index.chunk_count, 0);
        assert!(index.digest.contains("msg 1"));
    }

    #[tokio::test]
    async fn test_search_chunks_filters_and_thresholds() {
        let f = fixture();
        seed(&f.database, "conv-1", "Planning", 20);
        seed(&f.database, "conv-2", "Other", 10);
        let relevant = chunk("conv-1", 1, 10, "planning roadmap planning roadmap");
        let unrelated = chunk("conv-1", 11, 20, "nothing in common at all");
        let other_conv = chunk("conv-2", 1, 10, "planning roadmap elsewhere");
        for c in [&relevant, &unrelated, &other_conv] {
            f.database.chunks.insert_chunk(c).unwrap();
            f.indexer.embed_chunk(c).await.unwrap();
        }

        let matches = f
            .indexer
            .search_chunks(
                "planning roadmap",
                &ChunkSearchOptions {
                    conversation_id: Some("conv-1".to_string()),
                    top_k: 5,
                    min_score: 0.7,
                    ..ChunkSearchOptions::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].chunk_id, relevant.id);
        assert_eq!(matches[0].conversation_id, "conv-1");
        assert!(matches[0].score >= 0.7);
        assert!(!matches[0].summary.is_empty());
    }

    #[tokio::test]
    async fn test_search_conversations_scopes_to_user() {
        let f = fixture();
        seed(&f.database, "conv-1", "Travel budget planning", 5);
        f.database
            .conversations
            .create_conversation_with_id("conv-2", "user-2", "Travel too")
            .unwrap();
        f.database
            .conversations
            .append_message("conv-2", "user", "travel budget")
            .unwrap();
        f.indexer.embed_conversation_index("conv-1", "user-1").await.unwrap();
        f.indexer.embed_conversation_index("conv-2", "user-2").await.unwrap();

        let matches = f
            .indexer
            .search_conversations("travel budget", "user-1", &ConversationSearchOptions::default())
            .await
            .unwrap();

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].conversation_id, "conv-1");
        assert_eq!(matches[0].title, "Travel budget planning");
        assert_eq!(matches[0].message_count, 5);
    }

    #[tokio::test]
    async fn test_delete_conversation_clears_both_namespaces() {
        let f = fixture();
        seed(&f.database, "conv-1", "Planning", 10);
        let c = chunk("conv-1", 1, 10, "planning roadmap");
        f.database.chunks.insert_chunk(&c).unwrap();
        f.indexer.embed_chunk(&c).await.unwrap();
        f.indexer.embed_conversation_index("conv-1", "user-1").await.unwrap();

        f.indexer.delete_conversation("conv-1").await.unwrap();
        assert_eq!(f.vectors.count("chunks"), 0);
        assert_eq!(f.vectors.count("conversations"), 0);

        // Deleting again is still success
        f.indexer.delete_conversation("conv-1").await.unwrap();
    }
}
