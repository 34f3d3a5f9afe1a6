//! Context engine module - chunking, indexing, retrieval assembly, budget
//! compression and lifecycle coordination

pub mod assembler;
pub mod chunker;
pub mod compressor;
pub mod coordinator;
pub mod indexer;
pub mod intent;

pub use assembler::{
    AssemblerConfig, ContextAssembler, ContextOptions, ConversationContext, ScoredMemory,
    TokenUsage,
};
pub use chunker::{Chunker, ChunkerConfig};
pub use compressor::{BudgetCompressor, CompressionResult, CompressorConfig};
pub use coordinator::{
    BatchOptions, BatchReport, CompressionStats, ContextResponse, ContextStats,
    ConversationStats, CoordinatorConfig, MemoryCoordinator,
};
pub use indexer::{
    ChunkMatch, ChunkSearchOptions, ConversationMatch, ConversationSearchOptions, Indexer,
    IndexerConfig,
};
pub use intent::{
    GatedIntentClassifier, IntentClassification, IntentStrategy, ModelIntentStrategy,
    QueryIntent, RuleIntentStrategy,
};

use crate::memory_db::MemoryDatabase;
use crate::providers::{EmbeddingProvider, IntentProvider, SummaryProvider};
use crate::vector_index::VectorIndex;
use std::sync::Arc;

/// Default coordinator wired from a database, a vector store and providers,
/// with every component on its default config.
pub fn create_default_coordinator(
    database: Arc<MemoryDatabase>,
    vectors: Arc<dyn VectorIndex>,
    summarizer: Arc<dyn SummaryProvider>,
    embedder: Arc<dyn EmbeddingProvider>,
    intent_provider: Option<Arc<dyn IntentProvider>>,
) -> MemoryCoordinator {
    let indexer = Arc::new(Indexer::new(
        Arc::clone(&database),
        vectors,
        embedder,
        IndexerConfig::default(),
    ));
    let chunker = Chunker::new(Arc::clone(&database), summarizer, ChunkerConfig::default());
    let assembler = ContextAssembler::new(
        Arc::clone(&database),
        Arc::clone(&indexer),
        AssemblerConfig::default(),
    );
    let intent = match intent_provider {
        Some(provider) => {
            GatedIntentClassifier::new(Some(ModelIntentStrategy::new(provider)), 0.75)
        }
        None => GatedIntentClassifier::rules_only(),
    };

    MemoryCoordinator::new(
        database,
        chunker,
        indexer,
        assembler,
        BudgetCompressor::new(CompressorConfig::default()),
        intent,
        CoordinatorConfig::default(),
    )
}
