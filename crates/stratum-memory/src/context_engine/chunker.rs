//! Chunk boundary policy and window summarization
//!
//! Splits the unchunked tail of a conversation into bounded windows and asks
//! the summarization collaborator for a summary per window. Persisting the
//! resulting chunks is the coordinator's job; the chunker itself only reads.

use crate::memory_db::{ConversationChunk, MemoryDatabase, StoredMessage};
use crate::providers::SummaryProvider;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Tail size at which chunking triggers.
    pub chunk_threshold: usize,
    /// Target messages per window. Actual windows are sized in
    /// [target, 2 * target].
    pub target_window: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_threshold: 10,
            target_window: 10,
        }
    }
}

pub struct Chunker {
    database: Arc<MemoryDatabase>,
    summarizer: Arc<dyn SummaryProvider>,
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(
        database: Arc<MemoryDatabase>,
        summarizer: Arc<dyn SummaryProvider>,
        config: ChunkerConfig,
    ) -> Self {
        Self {
            database,
            summarizer,
            config,
        }
    }

    /// True when the unchunked tail has reached the threshold. No side
    /// effects.
    pub fn needs_chunking(&self, conversation_id: &str) -> anyhow::Result<bool> {
        let last_end = self
            .database
            .chunks
            .last_chunk_end(conversation_id)?
            .unwrap_or(0);
        let tail_len = self
            .database
            .conversations
            .count_messages_after(conversation_id, last_end)?;
        Ok(tail_len >= self.config.chunk_threshold)
    }

    /// Chunk the unchunked tail, leaving a remainder of fewer than
    /// `target_window` messages live. Returns chunks without vector ids.
    pub async fn chunk_new_messages(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> anyhow::Result<Vec<ConversationChunk>> {
        let tail = self.unchunked_tail(conversation_id)?;
        let windows = plan_windows(tail.len(), self.config.target_window);
        self.summarize_windows(conversation_id, user_id, &tail, &windows)
            .await
    }

    /// Chunk everything not yet chunked, remainder included. Used for
    /// backfill and migration; a conversation already fully chunked yields
    /// nothing.
    pub async fn chunk_conversation(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> anyhow::Result<Vec<ConversationChunk>> {
        let tail = self.unchunked_tail(conversation_id)?;
        let windows = plan_windows_exhaustive(tail.len(), self.config.target_window);
        self.summarize_windows(conversation_id, user_id, &tail, &windows)
            .await
    }

    fn unchunked_tail(&self, conversation_id: &str) -> anyhow::Result<Vec<StoredMessage>> {
        let last_end = self
            .database
            .chunks
            .last_chunk_end(conversation_id)?
            .unwrap_or(0);
        self.database
            .conversations
            .get_messages_after(conversation_id, last_end)
    }

    /// Summarize windows oldest-first, stopping at the first failed window so
    /// the unchunked remainder stays a contiguous suffix. Partial success is
    /// fine: skipped messages are retried on the next trigger.
    async fn summarize_windows(
        &self,
        conversation_id: &str,
        user_id: &str,
        tail: &[StoredMessage],
        windows: &[usize],
    ) -> anyhow::Result<Vec<ConversationChunk>> {
        let mut chunks = Vec::with_capacity(windows.len());
        let mut offset = 0;

        for &size in windows {
            let window = &tail[offset..offset + size];
            offset += size;

            match self.summarizer.summarize(window).await {
                Ok(summary) => {
                    let summary = summary.clamped();
                    // Windows are non-empty by construction
                    let first = &window[0];
                    let last = &window[window.len() - 1];
                    chunks.push(ConversationChunk {
                        id: Uuid::new_v4().to_string(),
                        conversation_id: conversation_id.to_string(),
                        user_id: user_id.to_string(),
                        start_message_id: first.id,
                        end_message_id: last.id,
                        message_count: window.len() as i32,
                        summary: summary.summary,
                        topics: summary.topics,
                        entities: summary.entities,
                        keywords: summary.keywords,
                        importance: summary.importance,
                        coherence: summary.coherence,
                        first_message_at: first.created_at,
                        last_message_at: last.created_at,
                        vector_id: None,
                        created_at: Utc::now(),
                    });
                }
                Err(e) => {
                    warn!(
                        "Summarization failed for conversation {} messages {}..{}, \
                         leaving this window and everything after it unchunked: {}",
                        conversation_id,
                        window[0].id,
                        window[window.len() - 1].id,
                        e
                    );
                    break;
                }
            }
        }

        debug!(
            "Chunked {} of {} windows for conversation {}",
            chunks.len(),
            windows.len(),
            conversation_id
        );
        Ok(chunks)
    }
}

/// Window sizes for a tail of `tail_len` messages with target size `target`.
///
/// The chunkable span is the largest multiple of `target` that fits; the
/// remainder stays live. The span is split into `ceil(span / (2 * target))`
/// equal-as-possible windows, so every window size lands in
/// [target, 2 * target].
fn plan_windows(tail_len: usize, target: usize) -> Vec<usize> {
    let span = (tail_len / target) * target;
    split_span(span, target)
}

/// Like [`plan_windows`] but covers the whole tail, including the remainder
/// that would normally stay live. The last window may be smaller than
/// `target`.
fn plan_windows_exhaustive(tail_len: usize, target: usize) -> Vec<usize> {
    split_span(tail_len, target)
}

fn split_span(span: usize, target: usize) -> Vec<usize> {
    if span == 0 || target == 0 {
        return Vec::new();
    }
    let window_cap = 2 * target;
    let count = span.div_ceil(window_cap);
    let base = span / count;
    let remainder = span % count;

    (0..count)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ChunkSummary;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deterministic summarizer: counts calls, fails from `fail_after` on.
    struct StubSummarizer {
        calls: AtomicUsize,
        fail_after: usize,
    }

    impl StubSummarizer {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_after: usize::MAX,
            }
        }

        fn failing_after(fail_after: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_after,
            }
        }
    }

    #[async_trait]
    impl SummaryProvider for StubSummarizer {
        async fn summarize(&self, messages: &[StoredMessage]) -> anyhow::Result<ChunkSummary> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call >= self.fail_after {
                return Err(anyhow::anyhow!("summarizer unavailable"));
            }
            Ok(ChunkSummary {
                summary: format!(
                    "Messages {} through {}",
                    messages[0].id,
                    messages[messages.len() - 1].id
                ),
                topics: vec!["testing".to_string()],
                entities: vec![],
                keywords: vec!["window".to_string()],
                importance: 0.5,
                coherence: 0.9,
            })
        }
    }

    fn seed(db: &MemoryDatabase, conversation_id: &str, n: usize) -> Vec<StoredMessage> {
        db.conversations
            .create_conversation_with_id(conversation_id, "user-1", "Test")
            .unwrap();
        let base = Utc::now() - Duration::minutes(n as i64);
        let rows: Vec<(String, String, chrono::DateTime<Utc>)> = (0..n)
            .map(|i| {
                let role = if i % 2 == 0 { "user" } else { "assistant" };
                (role.to_string(), format!("msg {}", i + 1), base + Duration::minutes(i as i64))
            })
            .collect();
        db.conversations.import_messages(conversation_id, &rows).unwrap()
    }

    fn chunker_with(db: Arc<MemoryDatabase>, summarizer: StubSummarizer) -> Chunker {
        Chunker::new(db, Arc::new(summarizer), ChunkerConfig::default())
    }

    // ===== Window arithmetic =====

    #[test]
    fn test_plan_windows_sizes() {
        assert!(plan_windows(0, 10).is_empty());
        assert!(plan_windows(9, 10).is_empty());
        assert_eq!(plan_windows(10, 10), vec![10]);
        // Tail-doubling rule: 20 <= 2 * 10, one window of 20
        assert_eq!(plan_windows(25, 10), vec![20]);
        assert_eq!(plan_windows(30, 10), vec![15, 15]);
        assert_eq!(plan_windows(45, 10), vec![20, 20]);
        assert_eq!(plan_windows(50, 10), vec![17, 17, 16]);
    }

    #[test]
    fn test_plan_windows_bounds_hold() {
        for tail_len in 0..300 {
            let windows = plan_windows(tail_len, 10);
            let span: usize = windows.iter().sum();
            assert_eq!(span, (tail_len / 10) * 10);
            for size in windows {
                assert!((10..=20).contains(&size), "window of {} for tail {}", size, tail_len);
            }
        }
    }

    #[test]
    fn test_plan_windows_exhaustive_covers_everything() {
        assert_eq!(plan_windows_exhaustive(25, 10), vec![13, 12]);
        for tail_len in 1..300 {
            let windows = plan_windows_exhaustive(tail_len, 10);
            assert_eq!(windows.iter().sum::<usize>(), tail_len);
        }
    }

    // ===== Chunking behavior =====

    #[tokio::test]
    async fn test_scenario_25_messages_threshold_10() {
        let db = Arc::new(MemoryDatabase::new_in_memory().unwrap());
        let stored = seed(&db, "conv-1", 25);
        let chunker = chunker_with(Arc::clone(&db), StubSummarizer::new());

        assert!(chunker.needs_chunking("conv-1").unwrap());

        let chunks = chunker.chunk_new_messages("conv-1", "user-1").await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_message_id, stored[0].id);
        assert_eq!(chunks[0].end_message_id, stored[19].id);
        assert_eq!(chunks[0].message_count, 20);
        assert!(chunks[0].vector_id.is_none());

        // Tail of 5 remains; threshold not reached anymore
        db.chunks.insert_chunk(&chunks[0]).unwrap();
        assert!(!chunker.needs_chunking("conv-1").unwrap());
    }

    #[tokio::test]
    async fn test_chunking_is_idempotent_without_new_messages() {
        let db = Arc::new(MemoryDatabase::new_in_memory().unwrap());
        seed(&db, "conv-1", 25);
        let chunker = chunker_with(Arc::clone(&db), StubSummarizer::new());

        let first = chunker.chunk_new_messages("conv-1", "user-1").await.unwrap();
        for chunk in &first {
            db.chunks.insert_chunk(chunk).unwrap();
        }

        let second = chunker.chunk_new_messages("conv-1", "user-1").await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_failed_window_stops_chunking_at_contiguous_suffix() {
        let db = Arc::new(MemoryDatabase::new_in_memory().unwrap());
        let stored = seed(&db, "conv-1", 45);
        // 45 messages -> windows [20, 20]; second summarization fails
        let chunker = chunker_with(Arc::clone(&db), StubSummarizer::failing_after(1));

        let chunks = chunker.chunk_new_messages("conv-1", "user-1").await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].end_message_id, stored[19].id);

        // The skipped window is still the head of the tail on retry
        db.chunks.insert_chunk(&chunks[0]).unwrap();
        let retry_chunker = chunker_with(Arc::clone(&db), StubSummarizer::new());
        let retried = retry_chunker.chunk_new_messages("conv-1", "user-1").await.unwrap();
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].start_message_id, stored[20].id);
        assert_eq!(retried[0].end_message_id, stored[39].id);
    }

    #[tokio::test]
    async fn test_chunk_conversation_backfills_entire_history() {
        let db = Arc::new(MemoryDatabase::new_in_memory().unwrap());
        let stored = seed(&db, "conv-1", 47);
        let chunker = chunker_with(Arc::clone(&db), StubSummarizer::new());

        let chunks = chunker.chunk_conversation("conv-1", "user-1").await.unwrap();
        let covered: i32 = chunks.iter().map(|c| c.message_count).sum();
        assert_eq!(covered as usize, 47);
        assert_eq!(chunks.last().unwrap().end_message_id, stored[46].id);

        for chunk in &chunks {
            db.chunks.insert_chunk(chunk).unwrap();
        }
        assert!(chunker.chunk_conversation("conv-1", "user-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_chunk_metadata_from_summary() {
        let db = Arc::new(MemoryDatabase::new_in_memory().unwrap());
        let stored = seed(&db, "conv-1", 10);
        let chunker = chunker_with(Arc::clone(&db), StubSummarizer::new());

        let chunks = chunker.chunk_new_messages("conv-1", "user-1").await.unwrap();
        assert_eq!(chunks[0].topics, vec!["testing"]);
        assert_eq!(chunks[0].first_message_at, stored[0].created_at);
        assert_eq!(chunks[0].last_message_at, stored[9].created_at);
        assert_eq!(chunks[0].user_id, "user-1");
    }

    // ===== Partition invariant =====

    proptest::proptest! {
        /// Chunk ranges plus the live tail always reconstruct the full
        /// message id sequence with no gaps and no repeats, across repeated
        /// chunking rounds.
        #[test]
        fn prop_chunks_and_tail_partition_conversation(
            first_batch in 0usize..60,
            second_batch in 0usize..60,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let db = Arc::new(MemoryDatabase::new_in_memory().unwrap());
                seed(&db, "conv-1", first_batch);
                let chunker = chunker_with(Arc::clone(&db), StubSummarizer::new());

                for chunk in chunker.chunk_new_messages("conv-1", "user-1").await.unwrap() {
                    db.chunks.insert_chunk(&chunk).unwrap();
                }

                let extra: Vec<(String, String)> = (0..second_batch)
                    .map(|i| ("user".to_string(), format!("extra {}", i)))
                    .collect();
                db.conversations.append_messages_batch("conv-1", &extra).unwrap();
                for chunk in chunker.chunk_new_messages("conv-1", "user-1").await.unwrap() {
                    db.chunks.insert_chunk(&chunk).unwrap();
                }

                let chunks = db.chunks.get_chunks("conv-1").unwrap();
                let mut covered: Vec<i64> = Vec::new();
                let mut previous_end = 0i64;
                for chunk in &chunks {
                    // Non-overlapping and ordered
                    assert!(chunk.start_message_id > previous_end);
                    covered.extend(chunk.start_message_id..=chunk.end_message_id);
                    previous_end = chunk.end_message_id;
                }
                let tail = db
                    .conversations
                    .get_messages_after("conv-1", previous_end)
                    .unwrap();
                covered.extend(tail.iter().map(|m| m.id));

                let all: Vec<i64> = db
                    .conversations
                    .get_messages_after("conv-1", 0)
                    .unwrap()
                    .iter()
                    .map(|m| m.id)
                    .collect();
                assert_eq!(covered, all);
            });
        }
    }
}
