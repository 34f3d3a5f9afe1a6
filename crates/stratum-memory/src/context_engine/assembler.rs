//! Three-layer context assembly
//!
//! Recent raw messages, semantically relevant historical chunks and relevant
//! long-term user facts, gathered under per-layer token budgets. The recent
//! layer is a required read; the other two degrade to empty on failure.

use crate::context_engine::indexer::{ChunkMatch, ChunkSearchOptions, Indexer};
use crate::memory_db::{MemoryDatabase, StoredMessage, UserMemory};
use crate::utils::{extract_query_keywords, TextUtils};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    /// Recent-layer size; always included, never relevance-filtered.
    pub recent_limit: usize,
    pub max_historical_chunks: usize,
    pub historical_min_score: f32,
    /// Memories kept after keyword re-ranking.
    pub memory_limit: usize,
    /// Candidate pool read from storage before re-ranking.
    pub memory_candidate_limit: usize,
    /// Sub-budgets in token-equivalent units.
    pub historical_token_budget: usize,
    pub memory_token_budget: usize,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            recent_limit: 20,
            max_historical_chunks: 5,
            historical_min_score: 0.7,
            memory_limit: 10,
            memory_candidate_limit: 50,
            historical_token_budget: 30_000,
            memory_token_budget: 5_000,
        }
    }
}

/// Per-call retrieval flags.
#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub include_historical: bool,
    pub include_memories: bool,
    /// Overrides the configured historical cap when set.
    pub max_historical_chunks: Option<usize>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            include_historical: true,
            include_memories: true,
            max_historical_chunks: None,
        }
    }
}

/// A memory with its query-keyword relevance score.
#[derive(Debug, Clone)]
pub struct ScoredMemory {
    pub memory: UserMemory,
    pub relevance: usize,
}

#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub recent: usize,
    pub historical: usize,
    pub memories: usize,
    pub total: usize,
}

/// What the assembler hands to formatting and compression.
#[derive(Debug, Clone)]
pub struct ConversationContext {
    pub recent: Vec<StoredMessage>,
    pub historical: Vec<ChunkMatch>,
    pub memories: Vec<ScoredMemory>,
    pub token_usage: TokenUsage,
    /// Layers that came back empty or truncated because of a non-fatal
    /// failure, for the stats annotation.
    pub degraded_layers: Vec<&'static str>,
}

pub struct ContextAssembler {
    database: Arc<MemoryDatabase>,
    indexer: Arc<Indexer>,
    config: AssemblerConfig,
}

impl ContextAssembler {
    pub fn new(
        database: Arc<MemoryDatabase>,
        indexer: Arc<Indexer>,
        config: AssemblerConfig,
    ) -> Self {
        Self {
            database,
            indexer,
            config,
        }
    }

    pub async fn assemble(
        &self,
        conversation_id: &str,
        user_id: &str,
        query: &str,
        options: &ContextOptions,
    ) -> anyhow::Result<ConversationContext> {
        let mut degraded_layers = Vec::new();

        // Recent layer is the one required read; its failure fails the call
        let recent = self
            .database
            .conversations
            .get_recent_messages(conversation_id, self.config.recent_limit)?;

        let historical = if options.include_historical && !recent.is_empty() {
            match self.historical_layer(conversation_id, query, &recent, options).await {
                Ok(chunks) => chunks,
                Err(e) => {
                    warn!(
                        "Historical layer failed for conversation {}, continuing without it: {}",
                        conversation_id, e
                    );
                    degraded_layers.push("historical");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let memories = if options.include_memories {
            match self.memory_layer(user_id, query) {
                Ok(memories) => memories,
                Err(e) => {
                    warn!("Memory layer failed for user {}, continuing without it: {}", user_id, e);
                    degraded_layers.push("memories");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let (historical, memories, token_usage) = self.apply_budgets(&recent, historical, memories);

        debug!(
            "Assembled context for conversation {}: {} recent, {} historical, {} memories, {} tokens",
            conversation_id,
            recent.len(),
            historical.len(),
            memories.len(),
            token_usage.total
        );

        Ok(ConversationContext {
            recent,
            historical,
            memories,
            token_usage,
            degraded_layers,
        })
    }

    /// Semantic chunk search scoped to this conversation, with the
    /// overlap-avoidance rule: a chunk whose range touches the recent layer
    /// would show the same content twice at two granularities.
    async fn historical_layer(
        &self,
        conversation_id: &str,
        query: &str,
        recent: &[StoredMessage],
        options: &ContextOptions,
    ) -> anyhow::Result<Vec<ChunkMatch>> {
        let matches = self
            .indexer
            .search_chunks(
                query,
                &ChunkSearchOptions {
                    conversation_id: Some(conversation_id.to_string()),
                    user_id: None,
                    top_k: options
                        .max_historical_chunks
                        .unwrap_or(self.config.max_historical_chunks),
                    min_score: self.config.historical_min_score,
                },
            )
            .await?;

        // Recent messages are chronological; index 0 is the oldest
        let oldest_recent_at = recent[0].created_at;
        Ok(matches
            .into_iter()
            .filter(|m| m.last_message_at < oldest_recent_at)
            .collect())
    }

    /// Candidates ranked by storage (importance, access count, recency),
    /// re-ranked by query-keyword hits. Returned memories get their access
    /// counters bumped.
    fn memory_layer(&self, user_id: &str, query: &str) -> anyhow::Result<Vec<ScoredMemory>> {
        let keywords = extract_query_keywords(query);
        if keywords.is_empty() {
            return Ok(Vec::new());
        }

        let candidates = self
            .database
            .memories
            .candidates_for_user(user_id, self.config.memory_candidate_limit)?;

        let mut scored: Vec<ScoredMemory> = candidates
            .into_iter()
            .filter_map(|memory| {
                let content_lower = memory.content.to_lowercase();
                let relevance = keywords
                    .iter()
                    .filter(|k| content_lower.contains(k.as_str()))
                    .count();
                (relevance > 0).then(|| ScoredMemory { memory, relevance })
            })
            .collect();
        scored.sort_by(|a, b| {
            b.relevance
                .cmp(&a.relevance)
                .then_with(|| b.memory.importance.cmp(&a.memory.importance))
        });
        scored.truncate(self.config.memory_limit);

        let used_ids: Vec<i64> = scored.iter().map(|s| s.memory.id).collect();
        if let Err(e) = self.database.memories.touch_access(&used_ids) {
            warn!("Failed to bump memory access counters: {}", e);
        }
        Ok(scored)
    }

    /// Trim the historical and memory layers independently to their
    /// sub-budgets, dropping lowest-scoring items first. The recent layer is
    /// never trimmed here; that is the compressor's call.
    fn apply_budgets(
        &self,
        recent: &[StoredMessage],
        mut historical: Vec<ChunkMatch>,
        mut memories: Vec<ScoredMemory>,
    ) -> (Vec<ChunkMatch>, Vec<ScoredMemory>, TokenUsage) {
        let historical_tokens =
            |chunks: &[ChunkMatch]| chunks.iter().map(|c| TextUtils::estimate_tokens(&c.summary)).sum::<usize>();
        // search_chunks returns score-descending order; pop trims the tail
        while historical_tokens(&historical) > self.config.historical_token_budget {
            historical.pop();
        }

        let memory_tokens = |memories: &[ScoredMemory]| {
            memories
                .iter()
                .map(|m| TextUtils::estimate_tokens(&m.memory.content))
                .sum::<usize>()
        };
        while memory_tokens(&memories) > self.config.memory_token_budget {
            memories.pop();
        }

        let usage = TokenUsage {
            recent: recent
                .iter()
                .map(|m| TextUtils::estimate_tokens(&m.content))
                .sum(),
            historical: historical_tokens(&historical),
            memories: memory_tokens(&memories),
            ..TokenUsage::default()
        };
        let usage = TokenUsage {
            total: usage.recent + usage.historical + usage.memories,
            ..usage
        };
        (historical, memories, usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context_engine::indexer::IndexerConfig;
    use crate::memory_db::{ConversationChunk, MemorySection};
    use crate::providers::EmbeddingProvider;
    use crate::vector_index::{InMemoryVectorIndex, VectorIndex};
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};

    struct VocabEmbedder;

    const VOCAB: [&str; 4] = ["planning", "roadmap", "travel", "budget"];

    #[async_trait]
    impl EmbeddingProvider for VocabEmbedder {
        async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            let lower = text.to_lowercase();
            let mut vector: Vec<f32> = VOCAB
                .iter()
                .map(|word| lower.matches(word).count() as f32)
                .collect();
            vector.push(0.1);
            Ok(vector)
        }

        fn dimension(&self) -> usize {
            VOCAB.len() + 1
        }
    }

    /// Embedder used to force the historical sub-fetch to fail.
    struct BrokenEmbedder;

    #[async_trait]
    impl EmbeddingProvider for BrokenEmbedder {
        async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
            Err(anyhow::anyhow!("embedder offline"))
        }

        fn dimension(&self) -> usize {
            5
        }
    }

    struct Fixture {
        database: Arc<MemoryDatabase>,
        indexer: Arc<Indexer>,
    }

    fn fixture_with(embedder: Arc<dyn EmbeddingProvider>) -> Fixture {
        let database = Arc::new(MemoryDatabase::new_in_memory().unwrap());
        let vectors: Arc<dyn VectorIndex> = Arc::new(InMemoryVectorIndex::new());
        let indexer = Arc::new(Indexer::new(
            Arc::clone(&database),
            vectors,
            embedder,
            IndexerConfig::default(),
        ));
        Fixture { database, indexer }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(VocabEmbedder))
    }

    fn assembler(f: &Fixture, config: AssemblerConfig) -> ContextAssembler {
        ContextAssembler::new(Arc::clone(&f.database), Arc::clone(&f.indexer), config)
    }

    fn seed(db: &MemoryDatabase, conversation_id: &str, n: usize) -> Vec<StoredMessage> {
        db.conversations
            .create_conversation_with_id(conversation_id, "user-1", "Planning chat")
            .unwrap();
        let base = Utc::now() - ChronoDuration::minutes(n as i64);
        let rows: Vec<(String, String, DateTime<Utc>)> = (0..n)
            .map(|i| {
                ("user".to_string(), format!("msg {}", i + 1), base + ChronoDuration::minutes(i as i64))
            })
            .collect();
        db.conversations.import_messages(conversation_id, &rows).unwrap()
    }

    async fn embed_chunk_for(
        f: &Fixture,
        messages: &[StoredMessage],
        start_idx: usize,
        end_idx: usize,
        summary: &str,
    ) -> ConversationChunk {
        let chunk = ConversationChunk {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: messages[0].conversation_id.clone(),
            user_id: "user-1".to_string(),
            start_message_id: messages[start_idx].id,
            end_message_id: messages[end_idx].id,
            message_count: (end_idx - start_idx + 1) as i32,
            summary: summary.to_string(),
            topics: vec![],
            entities: vec![],
            keywords: vec![],
            importance: 0.5,
            coherence: 0.5,
            first_message_at: messages[start_idx].created_at,
            last_message_at: messages[end_idx].created_at,
            vector_id: None,
            created_at: Utc::now(),
        };
        f.database.chunks.insert_chunk(&chunk).unwrap();
        f.indexer.embed_chunk(&chunk).await.unwrap();
        chunk
    }

    #[tokio::test]
    async fn test_recent_layer_always_included() {
        let f = fixture();
        seed(&f.database, "conv-1", 30);
        let assembler = assembler(&f, AssemblerConfig::default());

        let context = assembler
            .assemble("conv-1", "user-1", "anything at all", &ContextOptions::default())
            .await
            .unwrap();

        assert_eq!(context.recent.len(), 20);
        assert_eq!(context.recent.first().unwrap().content, "msg 11");
        assert!(context.token_usage.recent > 0);
        assert!(context.degraded_layers.is_empty());
    }

    #[tokio::test]
    async fn test_overlap_rule_discards_chunks_touching_recent_layer() {
        let f = fixture();
        let messages = seed(&f.database, "conv-1", 45);
        // Old chunk is entirely before the recent window (messages 26..45)
        let old = embed_chunk_for(&f, &messages, 0, 19, "planning roadmap planning roadmap").await;
        // This one overlaps the recent window and must be discarded
        embed_chunk_for(&f, &messages, 20, 39, "planning roadmap planning roadmap").await;
        let assembler = assembler(&f, AssemblerConfig::default());

        let context = assembler
            .assemble("conv-1", "user-1", "planning roadmap", &ContextOptions::default())
            .await
            .unwrap();

        assert_eq!(context.historical.len(), 1);
        assert_eq!(context.historical[0].chunk_id, old.id);
        let oldest_recent = context.recent.first().unwrap().created_at;
        assert!(context.historical.iter().all(|c| c.last_message_at < oldest_recent));
    }

    #[tokio::test]
    async fn test_historical_disabled_or_empty_conversation() {
        let f = fixture();
        let messages = seed(&f.database, "conv-1", 45);
        embed_chunk_for(&f, &messages, 0, 19, "planning roadmap").await;
        let assembler = assembler(&f, AssemblerConfig::default());

        let context = assembler
            .assemble(
                "conv-1",
                "user-1",
                "planning roadmap",
                &ContextOptions {
                    include_historical: false,
                    ..ContextOptions::default()
                },
            )
            .await
            .unwrap();
        assert!(context.historical.is_empty());
        assert!(context.degraded_layers.is_empty());

        // No messages at all: historical search is skipped entirely
        f.database
            .conversations
            .create_conversation_with_id("empty", "user-1", "Empty")
            .unwrap();
        let context = assembler
            .assemble("empty", "user-1", "planning", &ContextOptions::default())
            .await
            .unwrap();
        assert!(context.recent.is_empty());
        assert!(context.historical.is_empty());
    }

    #[tokio::test]
    async fn test_memory_layer_reranked_and_touched() {
        let f = fixture();
        seed(&f.database, "conv-1", 5);
        let matching = f
            .database
            .memories
            .insert_memory(
                "user-1",
                MemorySection::WorkContext,
                "Works on the deployment pipeline for the storage team",
                5,
            )
            .unwrap();
        let double = f
            .database
            .memories
            .insert_memory(
                "user-1",
                MemorySection::Goal,
                "Wants the deployment rollout finished; rollout is the priority",
                3,
            )
            .unwrap();
        let unrelated = f
            .database
            .memories
            .insert_memory("user-1", MemorySection::Preference, "Prefers tea over coffee", 9)
            .unwrap();

        let assembler = assembler(&f, AssemblerConfig::default());
        let context = assembler
            .assemble(
                "conv-1",
                "user-1",
                "what is the plan for the deployment rollout?",
                &ContextOptions::default(),
            )
            .await
            .unwrap();

        // Two keyword hits beat one, regardless of stored importance
        let ids: Vec<i64> = context.memories.iter().map(|m| m.memory.id).collect();
        assert_eq!(ids, vec![double.id, matching.id]);
        assert_eq!(context.memories[0].relevance, 2);

        let touched = f.database.memories.get_memory(matching.id).unwrap().unwrap();
        assert_eq!(touched.access_count, 1);
        let untouched = f.database.memories.get_memory(unrelated.id).unwrap().unwrap();
        assert_eq!(untouched.access_count, 0);
    }

    #[tokio::test]
    async fn test_no_keyword_overlap_yields_empty_memory_layer() {
        let f = fixture();
        seed(&f.database, "conv-1", 5);
        f.database
            .memories
            .insert_memory("user-1", MemorySection::PersonalFact, "Based in Lisbon", 8)
            .unwrap();

        let assembler = assembler(&f, AssemblerConfig::default());
        let context = assembler
            .assemble("conv-1", "user-1", "summarize the spreadsheet", &ContextOptions::default())
            .await
            .unwrap();

        assert!(context.memories.is_empty());
        assert_eq!(context.token_usage.memories, 0);
        assert!(context.degraded_layers.is_empty());
    }

    #[tokio::test]
    async fn test_layer_budgets_drop_lowest_scoring_first() {
        let f = fixture();
        let messages = seed(&f.database, "conv-1", 45);
        // First chunk matches the query direction exactly; the second is
        // skewed toward one term and scores lower
        let strong = embed_chunk_for(
            &f,
            &messages,
            0,
            9,
            &format!("planning roadmap planning roadmap {}", "x".repeat(400)),
        )
        .await;
        embed_chunk_for(
            &f,
            &messages,
            10,
            19,
            &format!("planning planning roadmap {}", "y".repeat(400)),
        )
        .await;
        for i in 0..3 {
            f.database
                .memories
                .insert_memory(
                    "user-1",
                    MemorySection::Goal,
                    &format!("deployment note {} {}", i, "z".repeat(200)),
                    5,
                )
                .unwrap();
        }

        let config = AssemblerConfig {
            historical_token_budget: 150,
            memory_token_budget: 60,
            ..AssemblerConfig::default()
        };
        let assembler = assembler(&f, config);
        let context = assembler
            .assemble("conv-1", "user-1", "planning roadmap deployment", &ContextOptions::default())
            .await
            .unwrap();

        assert_eq!(context.historical.len(), 1);
        assert_eq!(context.historical[0].chunk_id, strong.id);
        assert!(context.token_usage.historical <= 150);
        assert_eq!(context.memories.len(), 1);
        assert!(context.token_usage.memories <= 60);
        assert_eq!(
            context.token_usage.total,
            context.token_usage.recent + context.token_usage.historical + context.token_usage.memories
        );
    }

    #[tokio::test]
    async fn test_historical_failure_degrades_instead_of_erroring() {
        let f = fixture_with(Arc::new(BrokenEmbedder));
        seed(&f.database, "conv-1", 10);
        f.database
            .memories
            .insert_memory("user-1", MemorySection::Goal, "Finish the planning deck", 5)
            .unwrap();

        let assembler = assembler(&f, AssemblerConfig::default());
        let context = assembler
            .assemble("conv-1", "user-1", "planning deck", &ContextOptions::default())
            .await
            .unwrap();

        assert_eq!(context.recent.len(), 10);
        assert!(context.historical.is_empty());
        assert_eq!(context.degraded_layers, vec!["historical"]);
        // Memory layer does not need the embedder and still works
        assert_eq!(context.memories.len(), 1);
    }
}
