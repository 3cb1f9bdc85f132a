//! Context envelope: the read-only per-turn view consumed by the
//! policy overlay and the response generator.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use sf_domain::tone::ToneAnalysis;

use crate::context_window::ContextWindow;
use crate::lead::LeadTemperature;
use crate::state_machine::StateMachine;

/// Aggregates from the context window, precomputed for policy rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowView {
    pub intent_history: Vec<String>,
    pub objection_count: usize,
    pub positive_count: usize,
    pub question_count: usize,
    pub unclear_count: usize,
    pub oscillation: bool,
    pub stuck: bool,
    pub repeated_question: bool,
    pub confidence_trend: f64,
}

/// Read-only snapshot of everything decision layers may look at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEnvelope {
    pub state: String,
    pub phase: String,
    pub collected_data: Map<String, Value>,
    pub turn: u32,
    pub tone: ToneAnalysis,
    pub guard_intervention: Option<String>,
    pub last_action: String,
    pub last_intent: String,
    pub window: WindowView,
    pub lead_score: i32,
    pub lead_temperature: LeadTemperature,
}

/// Assemble the envelope for this turn.
#[allow(clippy::too_many_arguments)]
pub fn build_context_envelope(
    state_machine: &StateMachine,
    context_window: &ContextWindow,
    tone: &ToneAnalysis,
    guard_intervention: Option<&str>,
    last_action: &str,
    last_intent: &str,
    turn: u32,
    lead_score: i32,
    lead_temperature: LeadTemperature,
) -> ContextEnvelope {
    ContextEnvelope {
        state: state_machine.state().to_owned(),
        phase: state_machine.phase().to_owned(),
        collected_data: state_machine.collected_data().clone(),
        turn,
        tone: tone.clone(),
        guard_intervention: guard_intervention.map(str::to_owned),
        last_action: last_action.to_owned(),
        last_intent: last_intent.to_owned(),
        window: WindowView {
            intent_history: context_window.intent_history(),
            objection_count: context_window.objection_count(),
            positive_count: context_window.positive_count(),
            question_count: context_window.question_count(),
            unclear_count: context_window.unclear_count(),
            oscillation: context_window.oscillation_detected(),
            stuck: context_window.stuck_detected(3),
            repeated_question: context_window.repeated_question_detected(),
            confidence_trend: context_window.confidence_trend(),
        },
        lead_score,
        lead_temperature,
    }
}
