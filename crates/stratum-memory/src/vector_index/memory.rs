//! In-process vector index for tests and embedded use
//!
//! Same contract as [`LocalVectorIndex`](super::LocalVectorIndex) without any
//! storage. Everything lives in a DashMap keyed by (namespace, id).

use super::{cosine_similarity, sort_matches, VectorFilter, VectorIndex, VectorMatch, VectorRecord};
use async_trait::async_trait;
use dashmap::DashMap;

#[derive(Default)]
pub struct InMemoryVectorIndex {
    records: DashMap<(String, String), VectorRecord>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, namespace: &str) -> usize {
        self.records
            .iter()
            .filter(|entry| entry.key().0 == namespace)
            .count()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, namespace: &str, record: VectorRecord) -> anyhow::Result<()> {
        self.records
            .insert((namespace.to_string(), record.id.clone()), record);
        Ok(())
    }

    async fn query(
        &self,
        namespace: &str,
        vector: &[f32],
        top_k: usize,
        filter: &VectorFilter,
    ) -> anyhow::Result<Vec<VectorMatch>> {
        let mut matches: Vec<VectorMatch> = self
            .records
            .iter()
            .filter(|entry| entry.key().0 == namespace && filter.matches(&entry.value().metadata))
            .map(|entry| VectorMatch {
                id: entry.value().id.clone(),
                score: cosine_similarity(vector, &entry.value().vector),
                metadata: entry.value().metadata.clone(),
            })
            .collect();

        sort_matches(&mut matches);
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn delete(&self, namespace: &str, ids: &[String]) -> anyhow::Result<()> {
        for id in ids {
            self.records.remove(&(namespace.to_string(), id.clone()));
        }
        Ok(())
    }
}
