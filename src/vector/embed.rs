//! Embedding generation seam.
//!
//! The index only stores vectors; something has to produce them. Real
//! deployments plug an embedding service in behind [`Embedder`]. The
//! built-in [`HashingEmbedder`] is a deterministic feature-hashing
//! bag-of-words embedding: no network, stable across processes, good enough
//! for offline runs and for exercising the semantic-merge path in tests.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::Result;

use super::l2_normalize;

/// Produces fixed-dimension embeddings for text.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn dimensions(&self) -> usize;
}

/// Deterministic feature-hashing embedder.
///
/// Each lowercase word is hashed into a bucket; the resulting term-frequency
/// vector is L2-normalized. Identical text always embeds identically.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn bucket(&self, word: &str) -> usize {
        let mut hasher = Sha256::new();
        hasher.update(word.as_bytes());
        let digest = hasher.finalize();
        let n = u64::from_le_bytes(digest[..8].try_into().expect("8 bytes"));
        (n % self.dims as u64) as usize
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; self.dims];
        for word in text.split(|c: char| !c.is_alphanumeric()) {
            if word.is_empty() {
                continue;
            }
            let word = word.to_lowercase();
            v[self.bucket(&word)] += 1.0;
        }
        l2_normalize(&mut v);
        Ok(v)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}
