//! Vector store contract and bundled implementations
//!
//! The engine talks to a vector store through [`VectorIndex`] only. A
//! deployment provides two namespaces: one holding per-chunk vectors, one
//! holding per-conversation digest vectors. Hosted stores implement the same
//! trait behind their own client; the bundled implementations cover
//! single-node deployments ([`LocalVectorIndex`]) and tests
//! ([`InMemoryVectorIndex`]).

pub mod local;
pub mod memory;

pub use local::LocalVectorIndex;
pub use memory::InMemoryVectorIndex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A vector plus its JSON metadata, addressed by a caller-chosen id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: serde_json::Value,
}

/// One query result, scored by cosine similarity.
#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub id: String,
    pub score: f32,
    pub metadata: serde_json::Value,
}

/// Metadata filter applied at query time. Records are matched against the
/// `conversation_id` / `user_id` string fields of their metadata.
#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    pub conversation_id: Option<String>,
    pub user_id: Option<String>,
}

impl VectorFilter {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn for_conversation(conversation_id: &str) -> Self {
        Self {
            conversation_id: Some(conversation_id.to_string()),
            ..Self::default()
        }
    }

    pub fn for_user(user_id: &str) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            ..Self::default()
        }
    }

    pub fn matches(&self, metadata: &serde_json::Value) -> bool {
        if let Some(ref conversation_id) = self.conversation_id {
            if metadata.get("conversation_id").and_then(|v| v.as_str()) != Some(conversation_id) {
                return false;
            }
        }
        if let Some(ref user_id) = self.user_id {
            if metadata.get("user_id").and_then(|v| v.as_str()) != Some(user_id) {
                return false;
            }
        }
        true
    }
}

/// Narrow vector-store contract: idempotent upsert, filtered similarity
/// query, batch delete. Deleting absent ids is success.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, namespace: &str, record: VectorRecord) -> anyhow::Result<()>;

    async fn query(
        &self,
        namespace: &str,
        vector: &[f32],
        top_k: usize,
        filter: &VectorFilter,
    ) -> anyhow::Result<Vec<VectorMatch>>;

    async fn delete(&self, namespace: &str, ids: &[String]) -> anyhow::Result<()>;
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Sort matches by score descending with a stable tie-break on id.
pub(crate) fn sort_matches(matches: &mut Vec<VectorMatch>) {
    matches.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
}
