//! Lifecycle coordination
//!
//! The single entry point the answering pipeline calls. Owns sequencing:
//! inline chunking on the read path, retrieval, formatting, compression,
//! state bookkeeping and deletion. Degradable failures never propagate past
//! this boundary; the stats annotation is how callers see them.

use crate::context_engine::assembler::{ContextAssembler, ContextOptions, ConversationContext};
use crate::context_engine::chunker::Chunker;
use crate::context_engine::compressor::BudgetCompressor;
use crate::context_engine::indexer::{ConversationMatch, ConversationSearchOptions, Indexer};
use crate::context_engine::intent::{GatedIntentClassifier, QueryIntent};
use crate::memory_db::{ContextState, MemoryDatabase};
use crate::utils::TextUtils;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Run the chunk+embed pipeline inline when the tail crosses the
    /// threshold. Off means chunking only happens through explicit backfill.
    pub auto_chunking: bool,
    /// Minimum classification confidence before a cross-conversation label
    /// turns into a search hint.
    pub cross_search_confidence_floor: f32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            auto_chunking: true,
            cross_search_confidence_floor: 0.7,
        }
    }
}

/// Per-call observability; how callers detect degraded quality without the
/// end user ever seeing an error.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ContextStats {
    pub recent_count: usize,
    pub historical_count: usize,
    pub memory_count: usize,
    pub total_tokens: usize,
    pub chunks_created: usize,
    pub intent: &'static str,
    pub intent_confidence: f32,
    /// Set when the query confidently asks about a different conversation;
    /// the caller should run `search_across_conversations`.
    pub suggest_cross_search: bool,
    pub compression_level: Option<u8>,
    pub compression_ratio: Option<f32>,
    pub degraded_layers: Vec<&'static str>,
}

#[derive(Debug, Clone)]
pub struct ContextResponse {
    pub formatted_context: String,
    pub stats: ContextStats,
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub min_messages: usize,
    pub max_conversations: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            min_messages: 20,
            max_conversations: 10,
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BatchReport {
    pub conversations_processed: usize,
    pub conversations_failed: usize,
    pub chunks_created: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CompressionStats {
    pub level: i32,
    pub ratio: f32,
}

#[derive(Debug, Clone)]
pub struct ConversationStats {
    pub message_count: i64,
    pub chunk_count: i64,
    pub last_chunked_at: Option<DateTime<Utc>>,
    pub needs_chunking: bool,
    pub context_state: Option<ContextState>,
    pub compression_stats: Option<CompressionStats>,
}

pub struct MemoryCoordinator {
    database: Arc<MemoryDatabase>,
    chunker: Chunker,
    indexer: Arc<Indexer>,
    assembler: ContextAssembler,
    compressor: BudgetCompressor,
    intent: GatedIntentClassifier,
    config: CoordinatorConfig,
}

impl MemoryCoordinator {
    pub fn new(
        database: Arc<MemoryDatabase>,
        chunker: Chunker,
        indexer: Arc<Indexer>,
        assembler: ContextAssembler,
        compressor: BudgetCompressor,
        intent: GatedIntentClassifier,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            database,
            chunker,
            indexer,
            assembler,
            compressor,
            intent,
            config,
        }
    }

    pub async fn get_conversation_context(
        &self,
        conversation_id: &str,
        user_id: &str,
        query: &str,
        options: &ContextOptions,
    ) -> anyhow::Result<ContextResponse> {
        let mut degraded_layers: Vec<&'static str> = Vec::new();

        let chunks_created = if self.config.auto_chunking {
            self.maybe_chunk(conversation_id, user_id, &mut degraded_layers)
                .await
        } else {
            0
        };

        let classification = self.intent.classify(query).await;
        debug!(
            "Query intent for conversation {}: {} ({:.2}, {})",
            conversation_id,
            classification.intent.as_str(),
            classification.confidence,
            classification.source
        );

        let context = self
            .assembler
            .assemble(conversation_id, user_id, query, options)
            .await?;
        degraded_layers.extend(context.degraded_layers.iter());

        let formatted = self.format_context(&context);
        let total_tokens = TextUtils::estimate_tokens(&formatted);

        let (formatted_context, total_tokens, compression_level, compression_ratio) =
            if self.compressor.needs_compression(total_tokens) {
                let start = self.compressor.determine_compression_level(total_tokens);
                // The memory layer is omitted from compressed output
                let result =
                    self.compressor
                        .compress_to_fit(&context.recent, &context.historical, start);
                info!(
                    "Compressed context for conversation {}: level {}, {} -> {} tokens",
                    conversation_id, result.level, total_tokens, result.compressed_tokens
                );
                (
                    result.compressed_content,
                    result.compressed_tokens,
                    Some(result.level),
                    Some(result.compression_ratio),
                )
            } else {
                (formatted, total_tokens, None, None)
            };

        if let Err(e) = self.persist_state(
            conversation_id,
            query,
            &context,
            &formatted_context,
            compression_level,
            compression_ratio,
        ) {
            warn!(
                "Failed to persist context state for conversation {}: {}",
                conversation_id, e
            );
            degraded_layers.push("state");
        }

        let suggest_cross_search = classification.intent == QueryIntent::CrossConversation
            && classification.confidence >= self.config.cross_search_confidence_floor;

        Ok(ContextResponse {
            formatted_context,
            stats: ContextStats {
                recent_count: context.recent.len(),
                historical_count: context.historical.len(),
                memory_count: context.memories.len(),
                total_tokens,
                chunks_created,
                intent: classification.intent.as_str(),
                intent_confidence: classification.confidence,
                suggest_cross_search,
                compression_level,
                compression_ratio,
                degraded_layers,
            },
        })
    }

    /// Inline chunk+embed pipeline. Embedding runs synchronously before the
    /// retrieval step so a caller never sees a chunk row that is not yet
    /// searchable. Every failure here is degradable; a stale index only
    /// weakens the historical layer.
    async fn maybe_chunk(
        &self,
        conversation_id: &str,
        user_id: &str,
        degraded_layers: &mut Vec<&'static str>,
    ) -> usize {
        match self.chunker.needs_chunking(conversation_id) {
            Ok(false) => return 0,
            Ok(true) => {}
            Err(e) => {
                warn!(
                    "Chunking check failed for conversation {}: {}",
                    conversation_id, e
                );
                degraded_layers.push("chunking");
                return 0;
            }
        }

        let chunks = match self.chunker.chunk_new_messages(conversation_id, user_id).await {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!("Chunking failed for conversation {}: {}", conversation_id, e);
                degraded_layers.push("chunking");
                return 0;
            }
        };
        if chunks.is_empty() {
            return 0;
        }

        // Persist before embedding; an insert conflict means a concurrent
        // turn already chunked this window, and that writer embeds it.
        let mut persisted = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            match self.database.chunks.insert_chunk(&chunk) {
                Ok(true) => persisted.push(chunk),
                Ok(false) => debug!(
                    "Chunk for conversation {} starting at {} already exists, skipping",
                    conversation_id, chunk.start_message_id
                ),
                Err(e) => {
                    warn!(
                        "Failed to persist chunk for conversation {}: {}",
                        conversation_id, e
                    );
                    if !degraded_layers.contains(&"chunking") {
                        degraded_layers.push("chunking");
                    }
                }
            }
        }
        if persisted.is_empty() {
            return 0;
        }
        info!(
            "Chunked {} new window(s) for conversation {}",
            persisted.len(),
            conversation_id
        );

        match self.indexer.embed_chunks_batch(&persisted).await {
            Ok(vector_ids) => {
                if vector_ids.len() < persisted.len() {
                    degraded_layers.push("index");
                }
            }
            Err(e) => {
                warn!(
                    "Chunk embedding failed for conversation {}: {}",
                    conversation_id, e
                );
                degraded_layers.push("index");
            }
        }

        if let Err(e) = self
            .indexer
            .embed_conversation_index(conversation_id, user_id)
            .await
        {
            warn!(
                "Conversation index refresh failed for {}: {}",
                conversation_id, e
            );
            if !degraded_layers.contains(&"index") {
                degraded_layers.push("index");
            }
        }

        persisted.len()
    }

    /// Uncompressed formatting: recent, then historical, then memories.
    fn format_context(&self, context: &ConversationContext) -> String {
        let mut out = self
            .compressor
            .compress_context(&context.recent, &context.historical, 0)
            .compressed_content;

        if !context.memories.is_empty() {
            if !out.is_empty() && !out.ends_with("\n\n") {
                out.push('\n');
            }
            out.push_str("## About this user\n");
            for scored in &context.memories {
                out.push_str(&format!(
                    "- [{}] {}\n",
                    scored.memory.section.as_str(),
                    scored.memory.content
                ));
            }
        }
        out
    }

    fn persist_state(
        &self,
        conversation_id: &str,
        query: &str,
        context: &ConversationContext,
        formatted: &str,
        compression_level: Option<u8>,
        compression_ratio: Option<f32>,
    ) -> anyhow::Result<()> {
        let state = ContextState {
            conversation_id: conversation_id.to_string(),
            recent_message_ids: context.recent.iter().map(|m| m.id).collect(),
            chunk_ids: context.historical.iter().map(|c| c.chunk_id.clone()).collect(),
            memory_ids: context.memories.iter().map(|m| m.memory.id).collect(),
            recent_tokens: context.token_usage.recent as i64,
            historical_tokens: context.token_usage.historical as i64,
            memory_tokens: context.token_usage.memories as i64,
            total_tokens: context.token_usage.total as i64,
            content_bytes: formatted.len() as i64,
            last_query: query.to_string(),
            compression_level: compression_level.map(|l| l as i32),
            compression_ratio,
            updated_at: Utc::now(),
        };
        self.database.states.upsert_state(&state)
    }

    /// Remove every trace of a conversation from the memory subsystem. The
    /// four deletions are independent; absent rows count as success, and one
    /// failure does not stop the others.
    pub async fn delete_conversation_memory(&self, conversation_id: &str) -> anyhow::Result<()> {
        let mut failures: Vec<String> = Vec::new();

        if let Err(e) = self.indexer.delete_conversation(conversation_id).await {
            warn!("Vector deletion failed for {}: {}", conversation_id, e);
            failures.push(format!("vectors: {}", e));
        }
        match self.database.chunks.delete_chunks(conversation_id) {
            Ok(n) => debug!("Deleted {} chunk row(s) for {}", n, conversation_id),
            Err(e) => {
                warn!("Chunk deletion failed for {}: {}", conversation_id, e);
                failures.push(format!("chunks: {}", e));
            }
        }
        if let Err(e) = self.database.indices.delete_index(conversation_id) {
            warn!("Index deletion failed for {}: {}", conversation_id, e);
            failures.push(format!("index: {}", e));
        }
        if let Err(e) = self.database.states.delete_state(conversation_id) {
            warn!("State deletion failed for {}: {}", conversation_id, e);
            failures.push(format!("state: {}", e));
        }

        if failures.is_empty() {
            info!("Deleted memory for conversation {}", conversation_id);
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "Memory deletion incomplete for {}: {}",
                conversation_id,
                failures.join("; ")
            ))
        }
    }

    /// Operational backfill: run the full chunk+embed pipeline over a user's
    /// eligible conversations, most recently updated first. Failures are
    /// isolated per conversation.
    pub async fn batch_process_user_conversations(
        &self,
        user_id: &str,
        options: &BatchOptions,
    ) -> anyhow::Result<BatchReport> {
        let eligible = self.database.conversations.eligible_conversations(
            user_id,
            options.min_messages,
            options.max_conversations,
        )?;
        info!(
            "Backfill for user {}: {} eligible conversation(s)",
            user_id,
            eligible.len()
        );

        let mut report = BatchReport::default();
        for (conversation, message_count) in eligible {
            match self.process_conversation(&conversation.id, user_id).await {
                Ok(created) => {
                    debug!(
                        "Backfilled conversation {} ({} messages): {} chunk(s)",
                        conversation.id, message_count, created
                    );
                    report.conversations_processed += 1;
                    report.chunks_created += created;
                }
                Err(e) => {
                    warn!("Backfill failed for conversation {}: {}", conversation.id, e);
                    report.conversations_failed += 1;
                }
            }
        }
        Ok(report)
    }

    async fn process_conversation(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> anyhow::Result<usize> {
        let chunks = self.chunker.chunk_conversation(conversation_id, user_id).await?;
        if chunks.is_empty() {
            return Ok(0);
        }
        let mut persisted = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            if self.database.chunks.insert_chunk(&chunk)? {
                persisted.push(chunk);
            }
        }
        self.indexer.embed_chunks_batch(&persisted).await?;
        self.indexer
            .embed_conversation_index(conversation_id, user_id)
            .await?;
        Ok(persisted.len())
    }

    pub async fn search_across_conversations(
        &self,
        query: &str,
        user_id: &str,
        options: &ConversationSearchOptions,
    ) -> anyhow::Result<Vec<ConversationMatch>> {
        self.indexer.search_conversations(query, user_id, options).await
    }

    pub fn get_conversation_stats(&self, conversation_id: &str) -> anyhow::Result<ConversationStats> {
        let message_count = self.database.conversations.count_messages(conversation_id)?;
        let chunk_count = self.database.chunks.count_chunks(conversation_id)?;
        let last_chunked_at = self.database.chunks.last_chunked_at(conversation_id)?;
        let needs_chunking = self.chunker.needs_chunking(conversation_id)?;
        let context_state = self.database.states.get_state(conversation_id)?;

        let compression_stats = context_state.as_ref().and_then(|s| {
            match (s.compression_level, s.compression_ratio) {
                (Some(level), Some(ratio)) => Some(CompressionStats { level, ratio }),
                _ => None,
            }
        });

        Ok(ConversationStats {
            message_count: message_count as i64,
            chunk_count: chunk_count as i64,
            last_chunked_at,
            needs_chunking,
            context_state,
            compression_stats,
        })
    }
}
