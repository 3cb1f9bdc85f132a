//! Tier 2: structured LLM intent classification.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};

use sf_domain::intents;
use sf_llm::LlmClient;

use super::{Alternative, Classification, ClassifyContext};

/// The JSON shape requested from the model.
#[derive(Debug, Deserialize)]
struct LlmIntentReply {
    intent: String,
    confidence: f64,
    #[serde(default)]
    extracted_data: Map<String, Value>,
    #[serde(default)]
    alternatives: Vec<LlmAlternative>,
    #[serde(default)]
    reasoning: String,
}

#[derive(Debug, Deserialize)]
struct LlmAlternative {
    intent: String,
    #[serde(default)]
    confidence: f64,
}

const INTENT_LIST: &[&str] = &[
    intents::GREETING,
    intents::SITUATION_PROVIDED,
    intents::PROBLEM_REVEALED,
    intents::IMPLICATION_ACKNOWLEDGED,
    intents::NEED_EXPRESSED,
    intents::INFO_PROVIDED,
    intents::AGREEMENT,
    intents::REJECTION,
    intents::DEMO_REQUEST,
    intents::CALLBACK_REQUEST,
    intents::CONSULTATION_REQUEST,
    intents::CONTACT_PROVIDED,
    intents::PRICE_QUESTION,
    intents::PRICING_DETAILS,
    intents::QUESTION_FEATURES,
    intents::QUESTION_INTEGRATIONS,
    intents::COMPARISON,
    intents::REQUEST_BREVITY,
    intents::GRATITUDE,
    intents::SMALL_TALK,
    intents::FAREWELL,
    intents::OBJECTION_PRICE,
    intents::OBJECTION_COMPETITOR,
    intents::OBJECTION_NO_TIME,
    intents::OBJECTION_THINK,
    intents::OBJECTION_NO_NEED,
    intents::OBJECTION_TRUST,
    intents::OBJECTION_TIMING,
    intents::OBJECTION_COMPLEXITY,
    intents::UNCLEAR,
];

pub struct LlmIntentClassifier {
    llm: Arc<LlmClient>,
}

impl LlmIntentClassifier {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }

    /// Classify via a structured LLM call. Returns `None` on transport
    /// or parse failure; the cascade falls through.
    pub async fn classify(
        &self,
        message: &str,
        ctx: &ClassifyContext,
    ) -> Option<Classification> {
        let prompt = build_prompt(message, ctx);
        let reply: LlmIntentReply = match self.llm.generate_structured(&prompt).await {
            Ok(reply) => reply,
            Err(err) => {
                tracing::warn!(error = %err, "llm intent classification failed");
                return None;
            }
        };

        // Unknown intents degrade to unclear instead of polluting the
        // state machine's transition lookup.
        let intent = if INTENT_LIST.contains(&reply.intent.as_str()) {
            reply.intent
        } else {
            tracing::warn!(intent = %reply.intent, "llm returned unknown intent");
            intents::UNCLEAR.to_owned()
        };

        let alternatives: Vec<Alternative> = reply
            .alternatives
            .into_iter()
            .filter(|a| INTENT_LIST.contains(&a.intent.as_str()) && a.intent != intent)
            .take(3)
            .map(|a| Alternative {
                intent: a.intent,
                confidence: a.confidence,
            })
            .collect();

        let mut all_scores: HashMap<String, f64> =
            alternatives.iter().map(|a| (a.intent.clone(), a.confidence)).collect();
        all_scores.insert(intent.clone(), reply.confidence);

        Some(Classification {
            intent,
            confidence: reply.confidence.clamp(0.0, 1.0),
            extracted_data: reply.extracted_data,
            alternatives,
            method_used: "llm".into(),
            reasoning: reply.reasoning,
            all_scores,
            refinements: Vec::new(),
        })
    }
}

fn build_prompt(message: &str, ctx: &ClassifyContext) -> String {
    format!(
        "Ты классификатор намерений для B2B-диалога о CRM-системе.\n\
         Текущий этап: {state} (фаза {phase}). Предыдущий intent: {last}.\n\
         Верни JSON: {{\"intent\": \"...\", \"confidence\": 0.0-1.0, \
         \"extracted_data\": {{}}, \"alternatives\": [{{\"intent\": \"...\", \"confidence\": 0.0}}], \
         \"reasoning\": \"...\"}}.\n\
         Допустимые intent: {intents}.\n\n\
         Сообщение клиента: \"{message}\"",
        state = ctx.current_state,
        phase = ctx.current_phase,
        last = if ctx.last_intent.is_empty() { "нет" } else { &ctx.last_intent },
        intents = INTENT_LIST.join(", "),
    )
}
