//! In-process vector index.
//!
//! Brute-force cosine scan over normalized vectors. Fine for single-node
//! deployments and tests; production points `vector.endpoint` at a real
//! server and gets [`super::HttpVectorIndex`] instead.

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::{Error, Result};

use super::{cosine, l2_normalize, Collection, Filter, SearchHit, VectorIndex, VectorRecord};

#[derive(Default)]
pub struct MemoryVectorIndex {
    documents: DashMap<Uuid, VectorRecord>,
    patterns: DashMap<Uuid, VectorRecord>,
    clauses: DashMap<Uuid, VectorRecord>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, collection: Collection) -> &DashMap<Uuid, VectorRecord> {
        match collection {
            Collection::Documents => &self.documents,
            Collection::Patterns => &self.patterns,
            Collection::Clauses => &self.clauses,
        }
    }

    pub fn len(&self, collection: Collection) -> usize {
        self.table(collection).len()
    }

    pub fn is_empty(&self, collection: Collection) -> bool {
        self.table(collection).is_empty()
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn upsert(&self, collection: Collection, mut record: VectorRecord) -> Result<()> {
        if record.vector.len() != collection.dimensions() {
            return Err(Error::Internal(format!(
                "collection '{}' expects {} dims, got {}",
                collection.name(),
                collection.dimensions(),
                record.vector.len()
            )));
        }
        l2_normalize(&mut record.vector);
        self.table(collection).insert(record.id, record);
        Ok(())
    }

    async fn search(
        &self,
        collection: Collection,
        query: &[f32],
        filter: &Filter,
        top_k: usize,
        score_threshold: f32,
    ) -> Result<Vec<SearchHit>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        if query.len() != collection.dimensions() {
            return Err(Error::Internal(format!(
                "query has {} dims, collection '{}' expects {}",
                query.len(),
                collection.name(),
                collection.dimensions()
            )));
        }

        let mut hits: Vec<SearchHit> = self
            .table(collection)
            .iter()
            .filter(|entry| filter.matches(&entry.value().payload))
            .map(|entry| SearchHit {
                id: entry.value().id,
                score: cosine(query, &entry.value().vector),
                payload: entry.value().payload.clone(),
            })
            .filter(|hit| hit.score >= score_threshold)
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn delete_by_filter(&self, collection: Collection, filter: &Filter) -> Result<u64> {
        let table = self.table(collection);
        let before = table.len();
        table.retain(|_, record| !filter.matches(&record.payload));
        Ok((before - table.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pattern_vec(seed: f32) -> Vec<f32> {
        let mut v: Vec<f32> = (0..768).map(|i| ((i as f32) * seed).sin()).collect();
        l2_normalize(&mut v);
        v
    }

    #[tokio::test]
    async fn search_filters_threshold_and_ranks() {
        let index = MemoryVectorIndex::new();
        let target = pattern_vec(0.37);

        index
            .upsert(
                Collection::Patterns,
                VectorRecord {
                    id: Uuid::new_v4(),
                    vector: target.clone(),
                    payload: json!({"active": true, "category": "data_collection"}),
                },
            )
            .await
            .unwrap();
        index
            .upsert(
                Collection::Patterns,
                VectorRecord {
                    id: Uuid::new_v4(),
                    vector: target.clone(),
                    payload: json!({"active": false, "category": "data_collection"}),
                },
            )
            .await
            .unwrap();
        index
            .upsert(
                Collection::Patterns,
                VectorRecord {
                    id: Uuid::new_v4(),
                    vector: pattern_vec(0.91),
                    payload: json!({"active": true, "category": "liability"}),
                },
            )
            .await
            .unwrap();

        let filter = Filter::new().must_eq("active", true);
        let hits = index
            .search(Collection::Patterns, &target, &filter, 10, 0.8)
            .await
            .unwrap();

        assert_eq!(hits.len(), 1);
        assert!(hits[0].score > 0.99);
        assert_eq!(hits[0].payload["category"], "data_collection");
    }

    #[tokio::test]
    async fn zero_top_k_short_circuits() {
        let index = MemoryVectorIndex::new();
        // A query with the wrong dimension count would error if it reached
        // the backend; top_k == 0 must return before that.
        let hits = index
            .search(Collection::Patterns, &[1.0, 2.0], &Filter::new(), 0, 0.0)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn delete_by_filter_counts_removals() {
        let index = MemoryVectorIndex::new();
        let owner = Uuid::new_v4();
        for i in 0..3 {
            index
                .upsert(
                    Collection::Clauses,
                    VectorRecord {
                        id: Uuid::new_v4(),
                        vector: pattern_vec(i as f32 + 0.1),
                        payload: json!({"owner_id": owner.to_string(), "n": i}),
                    },
                )
                .await
                .unwrap();
        }

        let removed = index
            .delete_by_filter(
                Collection::Clauses,
                &Filter::new().must_eq("owner_id", owner.to_string()),
            )
            .await
            .unwrap();
        assert_eq!(removed, 3);
        assert!(index.is_empty(Collection::Clauses));
    }

    #[tokio::test]
    async fn dimension_mismatch_is_rejected() {
        let index = MemoryVectorIndex::new();
        let err = index
            .upsert(
                Collection::Documents,
                VectorRecord {
                    id: Uuid::new_v4(),
                    vector: vec![1.0; 768],
                    payload: json!({}),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
