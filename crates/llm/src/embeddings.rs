//! Embedding provider trait and vector helpers for the semantic tiers.

use std::collections::HashMap;

use parking_lot::RwLock;

use sf_domain::Result;

/// Text-embedding source used by the semantic tone and intent tiers.
#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text into a dense vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Whether the backing model is usable right now.
    fn is_available(&self) -> bool {
        true
    }
}

/// Cosine similarity between two vectors.
///
/// Returns `0.0` on length mismatch or zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        tracing::warn!(
            len_a = a.len(),
            len_b = b.len(),
            "cosine_similarity: mismatched vector lengths"
        );
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}

/// Average of the `k` largest similarities.
pub fn top_k_mean(mut scores: Vec<f32>, k: usize) -> f32 {
    if scores.is_empty() || k == 0 {
        return 0.0;
    }
    scores.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let take = k.min(scores.len());
    scores[..take].iter().sum::<f32>() / take as f32
}

/// Table-driven embedder for tests and offline evaluation.
///
/// Texts map to fixed vectors; unknown texts get the zero vector of the
/// configured dimension (cosine 0 against everything).
pub struct StaticEmbedder {
    dim: usize,
    table: RwLock<HashMap<String, Vec<f32>>>,
}

impl StaticEmbedder {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            table: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, text: &str, vector: Vec<f32>) {
        debug_assert_eq!(vector.len(), self.dim);
        self.table.write().insert(text.to_owned(), vector);
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for StaticEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self
            .table
            .read()
            .get(text)
            .cloned()
            .unwrap_or_else(|| vec![0.0; self.dim]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_vectors_score_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn orthogonal_vectors_score_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn zero_vector_scores_zero() {
        let a = vec![0.0, 0.0];
        let b = vec![1.0, 1.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn top_k_mean_takes_largest() {
        let mean = top_k_mean(vec![0.1, 0.9, 0.5, 0.7], 3);
        assert!((mean - 0.7).abs() < 1e-6);
    }

    #[tokio::test]
    async fn static_embedder_returns_zero_for_unknown() {
        let embedder = StaticEmbedder::new(3);
        embedder.insert("дорого", vec![1.0, 0.0, 0.0]);
        assert_eq!(embedder.embed("дорого").await.unwrap(), vec![1.0, 0.0, 0.0]);
        assert_eq!(embedder.embed("???").await.unwrap(), vec![0.0, 0.0, 0.0]);
    }
}
