//! Knowledge-base retriever seam.
//!
//! The real retriever (embeddings + reranker) lives outside this
//! workspace; the engine only needs facts text plus source URLs.

use sf_domain::Result;

#[async_trait::async_trait]
pub trait KnowledgeRetriever: Send + Sync {
    /// Retrieve facts relevant to the message, with source URLs.
    async fn retrieve_with_urls(
        &self,
        message: &str,
        intent: &str,
        state: &str,
        categories: &[String],
        top_k: usize,
    ) -> Result<(String, Vec<String>)>;

    /// Short company description for grounding.
    fn company_info(&self) -> String;
}

/// Fixed-content retriever used in tests and offline runs.
pub struct StaticRetriever {
    facts: String,
    company: String,
}

impl Default for StaticRetriever {
    fn default() -> Self {
        Self {
            facts: "Тариф Старт — 15 000 ₸ в месяц. Тариф Бизнес — 45 000 ₸ в месяц. \
                    Внедрение занимает 1-2 дня, обучение включено."
                .into(),
            company: "Wipon — система учёта и автоматизации продаж для бизнеса в Казахстане."
                .into(),
        }
    }
}

impl StaticRetriever {
    pub fn new(facts: &str, company: &str) -> Self {
        Self {
            facts: facts.into(),
            company: company.into(),
        }
    }
}

#[async_trait::async_trait]
impl KnowledgeRetriever for StaticRetriever {
    async fn retrieve_with_urls(
        &self,
        _message: &str,
        _intent: &str,
        _state: &str,
        _categories: &[String],
        _top_k: usize,
    ) -> Result<(String, Vec<String>)> {
        Ok((self.facts.clone(), vec!["https://wipon.kz/pricing".into()]))
    }

    fn company_info(&self) -> String {
        self.company.clone()
    }
}
