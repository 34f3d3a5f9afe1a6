//! Layered conversation-memory engine for chat backends.
//!
//! Conversations accumulate unbounded message history; answering models take
//! bounded context. This crate closes the gap with three layers: recent raw
//! messages, summarized-and-embedded historical chunks, and long-term user
//! memories, assembled per query and compressed to a token budget when
//! needed. [`context_engine::MemoryCoordinator`] is the entry point.

pub mod config;
pub mod context_engine;
pub mod memory_db;
pub mod providers;
pub mod telemetry;
pub mod utils;
pub mod vector_index;

// Public API exports
pub use config::Config;
pub use context_engine::{
    create_default_coordinator, ContextOptions, ContextResponse, ContextStats,
    MemoryCoordinator,
};
pub use memory_db::MemoryDatabase;
pub use providers::{
    EmbeddingProvider, GatewayConfig, HttpEmbeddingProvider, HttpIntentProvider,
    HttpSummaryProvider, IntentProvider, ModelGateway, SummaryProvider,
};
pub use vector_index::{InMemoryVectorIndex, LocalVectorIndex, VectorIndex};
