//! Tier 3: semantic nearest-neighbor intent classification.

use std::collections::HashMap;
use std::sync::Arc;

use sf_domain::intents;
use sf_llm::{cosine_similarity, top_k_mean, EmbeddingProvider};

const TOP_K: usize = 3;

/// Labeled example utterances per intent, embedded once at startup.
pub fn default_examples() -> Vec<(&'static str, Vec<&'static str>)> {
    vec![
        (
            intents::PRICE_QUESTION,
            vec![
                "сколько это стоит",
                "какая цена у системы",
                "какие у вас тарифы",
            ],
        ),
        (
            intents::DEMO_REQUEST,
            vec![
                "покажите как работает система",
                "можно посмотреть демо",
                "хочу увидеть продукт в деле",
            ],
        ),
        (
            intents::OBJECTION_PRICE,
            vec![
                "для нас это дорого",
                "не потянем такой бюджет",
                "у конкурентов дешевле",
            ],
        ),
        (
            intents::OBJECTION_COMPETITOR,
            vec![
                "мы уже пользуемся другой системой",
                "у нас внедрён битрикс",
                "работаем в своей программе",
            ],
        ),
        (
            intents::OBJECTION_NO_TIME,
            vec!["сейчас совсем нет времени", "я очень занят", "не до этого"],
        ),
        (
            intents::OBJECTION_THINK,
            vec![
                "мне нужно подумать",
                "надо посоветоваться с партнёром",
                "обсудим внутри команды",
            ],
        ),
        (
            intents::OBJECTION_NO_NEED,
            vec![
                "нам это не нужно",
                "мы и так справляемся",
                "нас всё устраивает",
            ],
        ),
        (
            intents::OBJECTION_TRUST,
            vec![
                "не верю таким обещаниям",
                "какие у вас гарантии",
                "кто вообще вами пользуется",
            ],
        ),
        (
            intents::SITUATION_PROVIDED,
            vec![
                "у нас сеть магазинов",
                "работаем в рознице, двадцать сотрудников",
                "небольшая компания в алматы",
            ],
        ),
        (
            intents::PROBLEM_REVEALED,
            vec![
                "ведём учёт вручную и теряем заявки",
                "постоянная путаница с остатками",
                "менеджеры забывают перезванивать",
            ],
        ),
        (
            intents::AGREEMENT,
            vec!["да, давайте", "хорошо, согласен", "продолжаем"],
        ),
        (
            intents::REJECTION,
            vec![
                "мне это не интересно",
                "больше не звоните",
                "прекратите писать",
            ],
        ),
    ]
}

/// Embedding-bank classifier shared by the intent cascade and the
/// semantic objection fallback.
pub struct SemanticIntentClassifier {
    embedder: Arc<dyn EmbeddingProvider>,
    bank: Vec<(String, Vec<Vec<f32>>)>,
}

impl SemanticIntentClassifier {
    pub async fn initialize(embedder: Arc<dyn EmbeddingProvider>) -> sf_domain::Result<Self> {
        let mut bank = Vec::new();
        for (intent, examples) in default_examples() {
            let mut vectors = Vec::with_capacity(examples.len());
            for text in examples {
                vectors.push(embedder.embed(text).await?);
            }
            bank.push((intent.to_owned(), vectors));
        }
        tracing::info!(intents = bank.len(), "semantic intent classifier initialized");
        Ok(Self { embedder, bank })
    }

    pub fn is_available(&self) -> bool {
        self.embedder.is_available() && !self.bank.is_empty()
    }

    /// Score the message against every intent's example bank.
    ///
    /// Returns `(best_intent, best_score, all_scores)` or `None` when
    /// embedding fails.
    pub async fn classify(&self, message: &str) -> Option<(String, f64, HashMap<String, f64>)> {
        let embedding = match self.embedder.embed(message).await {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(error = %err, "semantic intent embedding failed");
                return None;
            }
        };

        let mut all_scores: HashMap<String, f64> = HashMap::new();
        let mut best: Option<(String, f64)> = None;
        for (intent, vectors) in &self.bank {
            let sims: Vec<f32> = vectors
                .iter()
                .map(|v| cosine_similarity(&embedding, v))
                .collect();
            let score = top_k_mean(sims, TOP_K) as f64;
            all_scores.insert(intent.clone(), score);
            if best.as_ref().map(|(_, s)| score > *s).unwrap_or(true) {
                best = Some((intent.clone(), score));
            }
        }

        best.map(|(intent, score)| (intent, score, all_scores))
    }
}
