// Vector Index Implementation
// Flat cosine-similarity store over fixed-dimension embeddings, used for the
// optional semantic rerank. Exact KNN is fast enough at document-archive
// scale; nothing approximate is needed here.

use anyhow::{ensure, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::types::ValidatedDocumentId;

pub struct VectorIndex {
    dimension: usize,
    state: RwLock<HashMap<ValidatedDocumentId, Vec<f32>>>,
}

impl VectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            state: RwLock::new(HashMap::new()),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Insert or overwrite a document's embedding (idempotent)
    pub async fn insert_vector(
        &self,
        id: ValidatedDocumentId,
        embedding: Vec<f32>,
    ) -> Result<()> {
        ensure!(
            embedding.len() == self.dimension,
            "Embedding dimension mismatch: expected {}, got {}",
            self.dimension,
            embedding.len()
        );
        self.state.write().await.insert(id, embedding);
        Ok(())
    }

    pub async fn remove_vector(&self, id: &ValidatedDocumentId) -> Result<bool> {
        Ok(self.state.write().await.remove(id).is_some())
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.is_empty()
    }

    /// K nearest documents by cosine similarity, sorted descending
    pub async fn search_knn(
        &self,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<(ValidatedDocumentId, f64)>> {
        ensure!(
            query.len() == self.dimension,
            "Query dimension mismatch: expected {}, got {}",
            self.dimension,
            query.len()
        );

        let state = self.state.read().await;
        let mut scored: Vec<(ValidatedDocumentId, f64)> = state
            .iter()
            .map(|(id, embedding)| (*id, cosine_similarity(query, embedding)))
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        Ok(scored)
    }
}

/// Cosine similarity in [-1, 1]; zero vectors score 0
fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
