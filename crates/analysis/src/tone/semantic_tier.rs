//! Tier 2: embedding-based tone analysis.
//!
//! Compares the message embedding against a bank of labeled example
//! sentences per tone; per tone the top-3 similarities are averaged.

use std::collections::HashMap;
use std::sync::Arc;

use sf_domain::tone::Tone;
use sf_llm::{cosine_similarity, top_k_mean, EmbeddingProvider};

const ACCEPT_THRESHOLD: f32 = 0.70;
const AMBIGUITY_GAP: f32 = 0.15;
const AMBIGUITY_DAMPEN: f32 = 0.85;
const TOP_K: usize = 3;

/// Labeled example sentences per tone, embedded once at startup.
pub fn default_examples() -> Vec<(Tone, Vec<&'static str>)> {
    vec![
        (
            Tone::Frustrated,
            vec![
                "меня это уже достало",
                "сколько можно повторять одно и то же",
                "вы вообще слушаете что я говорю",
                "это невыносимо, ничего не работает",
            ],
        ),
        (
            Tone::Rushed,
            vec![
                "давайте быстрее, у меня мало времени",
                "короче, к делу",
                "я очень тороплюсь, говорите по сути",
            ],
        ),
        (
            Tone::Skeptical,
            vec![
                "что-то не верится в такие обещания",
                "все так говорят, а на деле иначе",
                "чем докажете что это работает",
            ],
        ),
        (
            Tone::Confused,
            vec![
                "я не понял, объясните проще",
                "запутался в ваших тарифах",
                "что вы имеете в виду",
            ],
        ),
        (
            Tone::Positive,
            vec![
                "отлично, это то что нужно",
                "спасибо, очень помогли",
                "звучит здорово",
            ],
        ),
        (
            Tone::Interested,
            vec![
                "расскажите подробнее про возможности",
                "интересно, а как это устроено",
                "хочу узнать больше",
            ],
        ),
    ]
}

/// The tier-2 analyzer: message embedding vs tone example bank.
pub struct SemanticToneAnalyzer {
    embedder: Arc<dyn EmbeddingProvider>,
    bank: Vec<(Tone, Vec<Vec<f32>>)>,
}

/// Outcome of a semantic pass: tone, confidence, per-tone scores.
pub type SemanticResult = (Tone, f32, HashMap<String, f64>);

impl SemanticToneAnalyzer {
    /// Build the analyzer by embedding the example bank.
    pub async fn initialize(embedder: Arc<dyn EmbeddingProvider>) -> sf_domain::Result<Self> {
        let mut bank = Vec::new();
        for (tone, examples) in default_examples() {
            let mut vectors = Vec::with_capacity(examples.len());
            for text in examples {
                vectors.push(embedder.embed(text).await?);
            }
            bank.push((tone, vectors));
        }
        tracing::info!(tones = bank.len(), "semantic tone analyzer initialized");
        Ok(Self { embedder, bank })
    }

    pub fn is_available(&self) -> bool {
        self.embedder.is_available() && !self.bank.is_empty()
    }

    /// Score the message against the bank.
    ///
    /// A clear leader (score ≥ 0.70 and gap ≥ 0.15 over the runner-up)
    /// is returned as-is; an ambiguous leader is dampened by 0.85.
    pub async fn analyze(&self, message: &str) -> Option<SemanticResult> {
        let embedding = match self.embedder.embed(message).await {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(error = %err, "semantic tone embedding failed");
                return None;
            }
        };

        let mut scored: Vec<(Tone, f32)> = self
            .bank
            .iter()
            .map(|(tone, vectors)| {
                let sims: Vec<f32> = vectors
                    .iter()
                    .map(|v| cosine_similarity(&embedding, v))
                    .collect();
                (*tone, top_k_mean(sims, TOP_K))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let (best_tone, best_score) = *scored.first()?;
        if best_score < ACCEPT_THRESHOLD {
            return None;
        }

        let scores: HashMap<String, f64> = scored
            .iter()
            .map(|(t, s)| (t.as_str().to_owned(), *s as f64))
            .collect();

        let second = scored.get(1).map(|(_, s)| *s).unwrap_or(0.0);
        let confidence = if best_score - second >= AMBIGUITY_GAP {
            best_score
        } else {
            tracing::debug!(
                best = best_tone.as_str(),
                best_score,
                second,
                "ambiguous semantic tone, dampening"
            );
            best_score * AMBIGUITY_DAMPEN
        };

        Some((best_tone, confidence, scores))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sf_llm::StaticEmbedder;

    async fn analyzer_with(message: &str, vector: Vec<f32>) -> SemanticToneAnalyzer {
        let embedder = Arc::new(StaticEmbedder::new(3));
        // Give each tone's examples an axis-aligned embedding.
        for (i, (_tone, examples)) in default_examples().iter().enumerate() {
            let mut v = vec![0.0; 3];
            v[i % 3] = if i < 3 { 1.0 } else { -1.0 };
            for text in examples {
                embedder.insert(text, v.clone());
            }
        }
        embedder.insert(message, vector);
        SemanticToneAnalyzer::initialize(embedder).await.unwrap()
    }

    #[tokio::test]
    async fn clear_leader_passes_through() {
        let analyzer = analyzer_with("msg", vec![1.0, 0.0, 0.0]).await;
        let (tone, confidence, scores) = analyzer.analyze("msg").await.unwrap();
        assert_eq!(tone, Tone::Frustrated);
        assert!(confidence >= 0.99);
        assert_eq!(scores.len(), 6);
    }

    #[tokio::test]
    async fn weak_scores_abstain() {
        let analyzer = analyzer_with("msg", vec![0.3, 0.3, 0.3]).await;
        // Cosine against any axis ≈ 0.577 < 0.70.
        assert!(analyzer.analyze("msg").await.is_none());
    }

    #[tokio::test]
    async fn ambiguous_leader_is_dampened() {
        // Equidistant from the frustrated and rushed axes.
        let analyzer = analyzer_with("msg", vec![0.72, 0.70, 0.0]).await;
        let (_tone, confidence, _scores) = analyzer.analyze("msg").await.unwrap();
        let direct = analyzer.analyze("msg").await.unwrap().1;
        assert!((confidence - direct).abs() < 1e-6);
        // gap < 0.15 → dampened below the raw best score
        assert!(confidence < 0.80);
    }
}
