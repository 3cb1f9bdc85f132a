//! Tier 3: single-word LLM tone classification.

use std::sync::Arc;

use sf_domain::tone::Tone;
use sf_llm::{GenerateOptions, LlmClient};

/// Fixed confidence reported by the LLM tier.
const LLM_TONE_CONFIDENCE: f64 = 0.75;

pub struct LlmToneAnalyzer {
    llm: Arc<LlmClient>,
}

impl LlmToneAnalyzer {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }

    /// Ask the model for a single-word tone label.
    ///
    /// The stripped reply is mapped onto the tone vocabulary, falling
    /// back to a substring match for chatty models.
    pub async fn analyze(&self, message: &str) -> Option<(Tone, f64)> {
        let prompt = format!(
            "Определи эмоциональный тон сообщения клиента.\n\
             Ответь ОДНИМ словом из списка: neutral, positive, frustrated, \
             skeptical, rushed, confused, interested.\n\n\
             Сообщение: \"{message}\"\n\nТон:"
        );

        let reply = self
            .llm
            .generate(
                &prompt,
                GenerateOptions {
                    state: "",
                    allow_fallback: false,
                },
            )
            .await;
        if reply.is_empty() {
            return None;
        }

        let normalized = reply.trim().to_lowercase();
        let tone = Tone::from_str(normalized.as_str()).or_else(|| {
            // Partial match: first tone name contained in the reply.
            [
                Tone::Frustrated,
                Tone::Rushed,
                Tone::Skeptical,
                Tone::Confused,
                Tone::Positive,
                Tone::Interested,
                Tone::Neutral,
            ]
            .into_iter()
            .find(|t| normalized.contains(t.as_str()))
        })?;

        Some((tone, LLM_TONE_CONFIDENCE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sf_llm::MockLlm;

    fn analyzer(reply: &str) -> LlmToneAnalyzer {
        let mock = Arc::new(MockLlm::default());
        mock.push_reply(reply);
        LlmToneAnalyzer::new(Arc::new(LlmClient::new(mock)))
    }

    #[tokio::test]
    async fn exact_word_maps() {
        let (tone, confidence) = analyzer("frustrated").analyze("надоело").await.unwrap();
        assert_eq!(tone, Tone::Frustrated);
        assert_eq!(confidence, 0.75);
    }

    #[tokio::test]
    async fn partial_match_falls_back() {
        let (tone, _) = analyzer("Тон: skeptical, клиент сомневается")
            .analyze("да ну")
            .await
            .unwrap();
        assert_eq!(tone, Tone::Skeptical);
    }

    #[tokio::test]
    async fn garbage_reply_abstains() {
        assert!(analyzer("сложно сказать").analyze("хм").await.is_none());
    }
}
