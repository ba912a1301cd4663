//! Vector index adapter.
//!
//! Wraps an external vector database behind a typed, collection-scoped
//! trait. Two backends implement it: [`MemoryVectorIndex`] (brute-force
//! cosine over in-process data, the test and single-node default) and
//! [`HttpVectorIndex`] (REST client for a Qdrant-compatible server).
//!
//! | Collection  | Dim  | Distance | Payload                                        |
//! |-------------|------|----------|------------------------------------------------|
//! | `documents` | 1536 | cosine   | document_id, fingerprint, type, language, owner |
//! | `patterns`  | 768  | cosine   | pattern_id, category, severity, active, version |
//! | `clauses`   | 768  | cosine   | clause_id, document_id, analysis_id, positions  |

pub mod embed;
pub mod http;
pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

pub use embed::{Embedder, HashingEmbedder};
pub use http::HttpVectorIndex;
pub use memory::MemoryVectorIndex;

/// The fixed collections of the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Documents,
    Patterns,
    Clauses,
}

impl Collection {
    pub fn name(&self) -> &'static str {
        match self {
            Collection::Documents => "documents",
            Collection::Patterns => "patterns",
            Collection::Clauses => "clauses",
        }
    }

    /// Expected vector dimensionality.
    pub fn dimensions(&self) -> usize {
        match self {
            Collection::Documents => 1536,
            Collection::Patterns => 768,
            Collection::Clauses => 768,
        }
    }
}

/// One constraint in an ANDed filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constraint {
    /// Field equals the given JSON value.
    Eq(serde_json::Value),
    /// Field is one of the given JSON values.
    In(Vec<serde_json::Value>),
}

/// ANDed key/value constraints over payload fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub constraints: HashMap<String, Constraint>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn must_eq(mut self, field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.constraints.insert(field.into(), Constraint::Eq(value.into()));
        self
    }

    pub fn must_in<V: Into<serde_json::Value>>(
        mut self,
        field: impl Into<String>,
        values: Vec<V>,
    ) -> Self {
        self.constraints.insert(
            field.into(),
            Constraint::In(values.into_iter().map(Into::into).collect()),
        );
        self
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    /// Whether a payload satisfies every constraint.
    pub fn matches(&self, payload: &serde_json::Value) -> bool {
        self.constraints.iter().all(|(field, c)| {
            let Some(actual) = payload.get(field) else {
                return false;
            };
            match c {
                Constraint::Eq(expected) => actual == expected,
                Constraint::In(allowed) => allowed.iter().any(|v| v == actual),
            }
        })
    }
}

/// A stored point: id, vector, payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: serde_json::Value,
}

/// One search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: Uuid,
    pub score: f32,
    pub payload: serde_json::Value,
}

/// Collection-scoped vector index operations.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace a point. The adapter L2-normalizes the vector.
    async fn upsert(&self, collection: Collection, record: VectorRecord) -> Result<()>;

    /// Cosine similarity search. `score_threshold` is a hard minimum;
    /// `top_k == 0` returns empty without touching the backend.
    async fn search(
        &self,
        collection: Collection,
        query: &[f32],
        filter: &Filter,
        top_k: usize,
        score_threshold: f32,
    ) -> Result<Vec<SearchHit>>;

    /// Delete every point whose payload matches the filter.
    async fn delete_by_filter(&self, collection: Collection, filter: &Filter) -> Result<u64>;
}

/// L2-normalize a vector in place. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine similarity of two vectors of equal length.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na <= f32::EPSILON || nb <= f32::EPSILON {
        return 0.0;
    }
    dot / (na * nb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filters_and_all_constraints() {
        let filter = Filter::new()
            .must_eq("active", true)
            .must_in("severity", vec!["high", "critical"]);

        assert!(filter.matches(&json!({"active": true, "severity": "high"})));
        assert!(!filter.matches(&json!({"active": false, "severity": "high"})));
        assert!(!filter.matches(&json!({"active": true, "severity": "low"})));
        assert!(!filter.matches(&json!({"severity": "high"})));
    }

    #[test]
    fn cosine_of_identical_directions_is_one() {
        let a = [1.0, 2.0, 3.0];
        let b = [2.0, 4.0, 6.0];
        assert!((cosine(&a, &b) - 1.0).abs() < 1e-6);
        assert!(cosine(&a, &[0.0, 0.0, 0.0]).abs() < 1e-6);
    }

    #[test]
    fn normalization_yields_unit_length() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }
}
