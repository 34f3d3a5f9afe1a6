//! Model provider contracts and the HTTP gateway implementations
//!
//! The engine never talks to a model API directly; it goes through these
//! narrow traits so tests can substitute deterministic stubs and deployments
//! can swap gateways. Clients are built once at process start and passed in
//! explicitly.

pub mod gateway;

pub use gateway::{
    GatewayConfig, HttpEmbeddingProvider, HttpIntentProvider, HttpSummaryProvider, ModelGateway,
};

use crate::memory_db::StoredMessage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What the summarization collaborator returns for one message window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSummary {
    pub summary: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// 0.0 - 1.0
    #[serde(default = "default_score")]
    pub importance: f32,
    /// 0.0 - 1.0
    #[serde(default = "default_score")]
    pub coherence: f32,
}

fn default_score() -> f32 {
    0.5
}

impl ChunkSummary {
    /// Clamp provider-assigned scores into their documented ranges.
    pub fn clamped(mut self) -> Self {
        self.importance = self.importance.clamp(0.0, 1.0);
        self.coherence = self.coherence.clamp(0.0, 1.0);
        self
    }
}

/// Summarization collaborator. A failure here is non-fatal: the window is
/// skipped and retried on the next chunking trigger.
#[async_trait]
pub trait SummaryProvider: Send + Sync {
    async fn summarize(&self, messages: &[StoredMessage]) -> anyhow::Result<ChunkSummary>;
}

/// Embedding collaborator. Returns a fixed-dimension vector; the dimension is
/// a deployment constant.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;

    fn dimension(&self) -> usize;
}

/// Model-side query classification, used only when rule classification is
/// below its confidence floor.
#[async_trait]
pub trait IntentProvider: Send + Sync {
    /// Returns a label from the caller-supplied set, or an error if the model
    /// call fails or the answer is not one of the labels.
    async fn classify(&self, query: &str, labels: &[&str]) -> anyhow::Result<String>;
}
