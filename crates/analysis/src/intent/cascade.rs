//! Cascade orchestration for intent classification.

use std::sync::Arc;

use sf_domain::flags::Flags;

use super::llm_tier::LlmIntentClassifier;
use super::refinement;
use super::semantic_tier::SemanticIntentClassifier;
use super::{keyword, Classification, ClassifyContext};

/// Floors each tier must clear to win the cascade.
const KEYWORD_FLOOR: f64 = 0.70;
const LLM_FLOOR: f64 = 0.55;
const SEMANTIC_FLOOR: f64 = 0.60;

/// Cascaded intent classifier: keyword → LLM (structured) → semantic.
pub struct IntentClassifier {
    llm: Option<LlmIntentClassifier>,
    semantic: Option<Arc<SemanticIntentClassifier>>,
}

impl IntentClassifier {
    pub fn new() -> Self {
        Self {
            llm: None,
            semantic: None,
        }
    }

    pub fn with_llm(mut self, llm: LlmIntentClassifier) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_semantic(mut self, semantic: Arc<SemanticIntentClassifier>) -> Self {
        self.semantic = Some(semantic);
        self
    }

    /// Classify one message; the first tier clearing its floor wins,
    /// then the refinement pipeline may rewrite the result.
    pub async fn classify(
        &self,
        message: &str,
        ctx: &ClassifyContext,
        flags: &Flags,
    ) -> Classification {
        let mut result = self.cascade(message, ctx, flags).await;
        refinement::run_pipeline(message, &mut result, ctx, flags);
        result
    }

    async fn cascade(
        &self,
        message: &str,
        ctx: &ClassifyContext,
        flags: &Flags,
    ) -> Classification {
        // Tier 1: keyword/regex. Extraction happens here regardless of
        // which tier ends up winning.
        let keyword_result = keyword::classify(message, ctx);
        if let Some(result) = &keyword_result {
            if result.confidence >= KEYWORD_FLOOR || result.intent == sf_domain::intents::UNCLEAR {
                return result.clone();
            }
        }

        // Tier 2: structured LLM.
        if flags.is_enabled("llm_classifier") {
            if let Some(llm) = &self.llm {
                if let Some(mut result) = llm.classify(message, ctx).await {
                    if result.confidence >= LLM_FLOOR {
                        // Keep tier-1 extraction; the LLM may miss fields.
                        if let Some(kw) = &keyword_result {
                            for (k, v) in &kw.extracted_data {
                                result.extracted_data.entry(k.clone()).or_insert(v.clone());
                            }
                        }
                        return result;
                    }
                }
            }
        }

        // Tier 3: semantic nearest neighbor.
        if flags.is_enabled("cascade_classifier") {
            if let Some(semantic) = self.semantic.as_ref().filter(|s| s.is_available()) {
                if let Some((intent, score, all_scores)) = semantic.classify(message).await {
                    if score >= SEMANTIC_FLOOR {
                        let mut alternatives: Vec<super::Alternative> = all_scores
                            .iter()
                            .filter(|(i, _)| **i != intent)
                            .map(|(i, s)| super::Alternative {
                                intent: i.clone(),
                                confidence: *s,
                            })
                            .collect();
                        alternatives.sort_by(|a, b| {
                            b.confidence
                                .partial_cmp(&a.confidence)
                                .unwrap_or(std::cmp::Ordering::Equal)
                        });
                        alternatives.truncate(3);
                        let extracted = keyword_result
                            .as_ref()
                            .map(|k| k.extracted_data.clone())
                            .unwrap_or_default();
                        return Classification {
                            intent,
                            confidence: score,
                            extracted_data: extracted,
                            alternatives,
                            method_used: "semantic".into(),
                            reasoning: String::new(),
                            all_scores,
                            refinements: Vec::new(),
                        };
                    }
                }
            }
        }

        // Nothing cleared its floor: weak keyword result beats nothing.
        if let Some(result) = keyword_result {
            return result;
        }
        let mut unclear = Classification::unclear();
        unclear.extracted_data = keyword::extract_data(message);
        unclear
    }
}

impl Default for IntentClassifier {
    fn default() -> Self {
        Self::new()
    }
}
