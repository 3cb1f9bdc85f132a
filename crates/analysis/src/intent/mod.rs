//! Cascaded intent classification.
//!
//! Keyword/regex tier → structured LLM tier → semantic tier, followed
//! by the refinement pipeline and the disambiguation decision engine.

pub mod cascade;
pub mod disambiguation;
pub mod keyword;
pub mod llm_tier;
pub mod refinement;
pub mod semantic_tier;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use cascade::IntentClassifier;
pub use disambiguation::{
    DisambiguationContext, DisambiguationDecision, DisambiguationEngine, DisambiguationOption,
    DisambiguationOutcome, OptionMatch,
};

/// Aggregate view of the context window handed to the classifier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowSummary {
    #[serde(default)]
    pub intent_history: Vec<String>,
    #[serde(default)]
    pub objection_count: usize,
    #[serde(default)]
    pub positive_count: usize,
    #[serde(default)]
    pub question_count: usize,
    #[serde(default)]
    pub unclear_count: usize,
    #[serde(default)]
    pub oscillation: bool,
    #[serde(default)]
    pub stuck: bool,
    #[serde(default)]
    pub repeated_question: bool,
    #[serde(default)]
    pub confidence_trend: f64,
}

/// Everything the classifier may look at besides the message itself.
#[derive(Debug, Clone, Default)]
pub struct ClassifyContext {
    pub current_state: String,
    pub current_phase: String,
    pub collected_data: Map<String, Value>,
    pub missing_data: Vec<String>,
    pub last_action: String,
    pub last_intent: String,
    pub turn: u32,
    pub in_disambiguation: bool,
    pub window: WindowSummary,
}

/// A runner-up intent candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alternative {
    pub intent: String,
    pub confidence: f64,
}

/// One refinement layer's decision, kept for the trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinementDecision {
    pub layer: String,
    pub from_intent: String,
    pub to_intent: String,
    pub reason: String,
}

/// Final classifier output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub intent: String,
    pub confidence: f64,
    #[serde(default)]
    pub extracted_data: Map<String, Value>,
    #[serde(default)]
    pub alternatives: Vec<Alternative>,
    pub method_used: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub all_scores: HashMap<String, f64>,
    #[serde(default)]
    pub refinements: Vec<RefinementDecision>,
}

impl Classification {
    /// The degenerate result used for empty input or analysis failure.
    pub fn unclear() -> Self {
        Self {
            intent: sf_domain::intents::UNCLEAR.into(),
            confidence: 0.3,
            extracted_data: Map::new(),
            alternatives: Vec::new(),
            method_used: "fallback".into(),
            reasoning: String::new(),
            all_scores: HashMap::new(),
            refinements: Vec::new(),
        }
    }

    /// Gap between the top intent and the best alternative.
    /// No alternatives means an undisputed leader.
    pub fn gap(&self) -> f64 {
        match self.alternatives.first() {
            Some(alt) => self.confidence - alt.confidence,
            None => 1.0,
        }
    }
}
