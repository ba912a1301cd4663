//! REST-backed vector index.
//!
//! Speaks the Qdrant HTTP wire shape: collection-scoped point upserts,
//! filtered similarity search, and filtered deletes. Any transport or
//! server failure surfaces as `VectorUnavailable`, which the pipeline
//! treats as transient.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::{Error, Result};

use super::{l2_normalize, Collection, Constraint, Filter, SearchHit, VectorIndex, VectorRecord};

pub struct HttpVectorIndex {
    client: reqwest::Client,
    base_url: String,
}

impl HttpVectorIndex {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { client, base_url }
    }

    fn collection_url(&self, collection: Collection, suffix: &str) -> String {
        format!("{}/collections/{}{}", self.base_url, collection.name(), suffix)
    }

    /// Create the three collections if the server does not have them yet.
    pub async fn ensure_collections(&self) -> Result<()> {
        for collection in [Collection::Documents, Collection::Patterns, Collection::Clauses] {
            let body = json!({
                "vectors": {
                    "size": collection.dimensions(),
                    "distance": "Cosine",
                }
            });
            let resp = self
                .client
                .put(self.collection_url(collection, ""))
                .json(&body)
                .send()
                .await
                .map_err(transport_err)?;
            // 409 means the collection already exists.
            if !resp.status().is_success() && resp.status().as_u16() != 409 {
                return Err(Error::VectorUnavailable(format!(
                    "create collection '{}' returned {}",
                    collection.name(),
                    resp.status()
                )));
            }
        }
        Ok(())
    }

    fn filter_to_wire(filter: &Filter) -> serde_json::Value {
        if filter.is_empty() {
            return serde_json::Value::Null;
        }
        let must: Vec<serde_json::Value> = filter
            .constraints
            .iter()
            .map(|(field, c)| match c {
                Constraint::Eq(v) => json!({"key": field, "match": {"value": v}}),
                Constraint::In(vs) => json!({"key": field, "match": {"any": vs}}),
            })
            .collect();
        json!({ "must": must })
    }
}

fn transport_err(e: reqwest::Error) -> Error {
    Error::VectorUnavailable(e.to_string())
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    result: Vec<ScoredPoint>,
}

#[derive(Debug, Deserialize)]
struct ScoredPoint {
    id: Uuid,
    score: f32,
    #[serde(default)]
    payload: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    result: CountResult,
}

#[derive(Debug, Deserialize)]
struct CountResult {
    count: u64,
}

#[async_trait]
impl VectorIndex for HttpVectorIndex {
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

        let body = json!({
            "points": [{
                "id": record.id,
                "vector": record.vector,
                "payload": record.payload,
            }]
        });
        let resp = self
            .client
            .put(self.collection_url(collection, "/points"))
            .query(&[("wait", "true")])
            .json(&body)
            .send()
            .await
            .map_err(transport_err)?;
        if !resp.status().is_success() {
            return Err(Error::VectorUnavailable(format!(
                "upsert into '{}' returned {}",
                collection.name(),
                resp.status()
            )));
        }
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

        let mut normalized = query.to_vec();
        l2_normalize(&mut normalized);
        let body = json!({
            "vector": normalized,
            "filter": Self::filter_to_wire(filter),
            "limit": top_k,
            "score_threshold": score_threshold,
            "with_payload": true,
        });
        let resp = self
            .client
            .post(self.collection_url(collection, "/points/search"))
            .json(&body)
            .send()
            .await
            .map_err(transport_err)?;
        if !resp.status().is_success() {
            return Err(Error::VectorUnavailable(format!(
                "search in '{}' returned {}",
                collection.name(),
                resp.status()
            )));
        }

        let parsed: SearchResponse = resp.json().await.map_err(transport_err)?;
        Ok(parsed
            .result
            .into_iter()
            // The server already applies the threshold; keep the guarantee
            // even if a backend rounds differently.
            .filter(|p| p.score >= score_threshold)
            .map(|p| SearchHit {
                id: p.id,
                score: p.score,
                payload: serde_json::Value::Object(p.payload.into_iter().collect()),
            })
            .collect())
    }

    async fn delete_by_filter(&self, collection: Collection, filter: &Filter) -> Result<u64> {
        // Count first so callers can log how much was removed.
        let count_body = json!({ "filter": Self::filter_to_wire(filter), "exact": true });
        let count_resp = self
            .client
            .post(self.collection_url(collection, "/points/count"))
            .json(&count_body)
            .send()
            .await
            .map_err(transport_err)?;
        let count = if count_resp.status().is_success() {
            count_resp
                .json::<CountResponse>()
                .await
                .map(|c| c.result.count)
                .unwrap_or(0)
        } else {
            0
        };

        let body = json!({ "filter": Self::filter_to_wire(filter) });
        let resp = self
            .client
            .post(self.collection_url(collection, "/points/delete"))
            .query(&[("wait", "true")])
            .json(&body)
            .send()
            .await
            .map_err(transport_err)?;
        if !resp.status().is_success() {
            return Err(Error::VectorUnavailable(format!(
                "delete in '{}' returned {}",
                collection.name(),
                resp.status()
            )));
        }
        Ok(count)
    }
}
