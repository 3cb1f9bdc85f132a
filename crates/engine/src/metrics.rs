//! Per-conversation metrics.

use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// How a conversation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationOutcome {
    InProgress,
    Success,
    DemoScheduled,
    SoftClose,
    Rejected,
    Abandoned,
}

/// One turn's metric record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnMetric {
    pub turn: u32,
    pub state: String,
    pub intent: String,
    pub tone: Option<String>,
    pub fallback_used: bool,
    pub fallback_tier: Option<String>,
    pub response_time_ms: f64,
}

/// Serialized metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsState {
    pub conversation_id: String,
    #[serde(default)]
    pub turns: Vec<TurnMetric>,
    #[serde(default)]
    pub intents_sequence: Vec<String>,
    #[serde(default)]
    pub states_sequence: Vec<String>,
    #[serde(default)]
    pub objections: Vec<HashMap<String, String>>,
    #[serde(default)]
    pub fallback_count: u64,
    #[serde(default)]
    pub fallback_tiers: HashMap<String, u64>,
    #[serde(default)]
    pub lead_scores: Vec<i32>,
    #[serde(default)]
    pub collected_data_keys: Vec<String>,
    pub outcome: ConversationOutcome,
}

impl MetricsState {
    fn new(conversation_id: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_owned(),
            turns: Vec::new(),
            intents_sequence: Vec::new(),
            states_sequence: Vec::new(),
            objections: Vec::new(),
            fallback_count: 0,
            fallback_tiers: HashMap::new(),
            lead_scores: Vec::new(),
            collected_data_keys: Vec::new(),
            outcome: ConversationOutcome::InProgress,
        }
    }
}

pub struct ConversationMetrics {
    state: MetricsState,
    turn_started: Option<Instant>,
}

impl ConversationMetrics {
    pub fn new(conversation_id: &str) -> Self {
        Self {
            state: MetricsState::new(conversation_id),
            turn_started: None,
        }
    }

    pub fn start_turn_timer(&mut self) {
        self.turn_started = Some(Instant::now());
    }

    pub fn record_turn(
        &mut self,
        turn: u32,
        state: &str,
        intent: &str,
        tone: Option<&str>,
        fallback_used: bool,
        fallback_tier: Option<&str>,
    ) {
        let response_time_ms = self
            .turn_started
            .take()
            .map(|t| t.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        self.state.turns.push(TurnMetric {
            turn,
            state: state.to_owned(),
            intent: intent.to_owned(),
            tone: tone.map(str::to_owned),
            fallback_used,
            fallback_tier: fallback_tier.map(str::to_owned),
            response_time_ms,
        });
        self.state.intents_sequence.push(intent.to_owned());
        self.state.states_sequence.push(state.to_owned());
        if fallback_used {
            self.state.fallback_count += 1;
            if let Some(tier) = fallback_tier {
                *self
                    .state
                    .fallback_tiers
                    .entry(tier.to_owned())
                    .or_insert(0) += 1;
            }
        }
    }

    pub fn record_objection(&mut self, objection_type: &str, attempt: u32) {
        self.state.objections.push(HashMap::from([
            ("type".to_string(), objection_type.to_owned()),
            ("attempt".to_string(), attempt.to_string()),
        ]));
    }

    pub fn record_lead_score(&mut self, score: i32) {
        self.state.lead_scores.push(score);
    }

    pub fn record_collected_data(&mut self, key: &str) {
        if !self.state.collected_data_keys.iter().any(|k| k == key) {
            self.state.collected_data_keys.push(key.to_owned());
        }
    }

    pub fn set_outcome(&mut self, outcome: ConversationOutcome) {
        self.state.outcome = outcome;
        tracing::info!(
            conversation_id = %self.state.conversation_id,
            outcome = ?outcome,
            turns = self.state.turns.len(),
            "conversation finalized"
        );
    }

    pub fn outcome(&self) -> ConversationOutcome {
        self.state.outcome
    }

    pub fn intents_sequence(&self) -> &[String] {
        &self.state.intents_sequence
    }

    pub fn average_response_time_ms(&self) -> Option<f64> {
        if self.state.turns.is_empty() {
            return None;
        }
        Some(
            self.state
                .turns
                .iter()
                .map(|t| t.response_time_ms)
                .sum::<f64>()
                / self.state.turns.len() as f64,
        )
    }

    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "conversation_id": self.state.conversation_id,
            "turns": self.state.turns.len(),
            "outcome": self.state.outcome,
            "fallback_count": self.state.fallback_count,
            "objections": self.state.objections.len(),
            "final_lead_score": self.state.lead_scores.last(),
            "avg_response_time_ms": self.average_response_time_ms(),
            "collected_data_keys": self.state.collected_data_keys,
        })
    }

    pub fn reset(&mut self, conversation_id: &str) {
        self.state = MetricsState::new(conversation_id);
        self.turn_started = None;
    }

    pub fn to_state(&self) -> MetricsState {
        self.state.clone()
    }

    pub fn load_state(&mut self, state: MetricsState) {
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turns_and_fallbacks_accumulate() {
        let mut m = ConversationMetrics::new("c-1");
        m.start_turn_timer();
        m.record_turn(1, "greeting", "greeting", Some("neutral"), false, None);
        m.start_turn_timer();
        m.record_turn(2, "spin_problem", "unclear", None, true, Some("fallback_tier_2"));

        assert_eq!(m.to_state().turns.len(), 2);
        assert_eq!(m.to_state().fallback_count, 1);
        assert_eq!(m.to_state().fallback_tiers["fallback_tier_2"], 1);
        assert!(m.average_response_time_ms().is_some());
    }

    #[test]
    fn outcome_transitions() {
        let mut m = ConversationMetrics::new("c-2");
        assert_eq!(m.outcome(), ConversationOutcome::InProgress);
        m.set_outcome(ConversationOutcome::DemoScheduled);
        assert_eq!(m.outcome(), ConversationOutcome::DemoScheduled);
    }

    #[test]
    fn state_round_trip() {
        let mut m = ConversationMetrics::new("c-3");
        m.record_turn(1, "greeting", "greeting", None, false, None);
        m.record_objection("price", 1);
        let state = m.to_state();

        let mut restored = ConversationMetrics::new("other");
        restored.load_state(state);
        assert_eq!(restored.to_state().conversation_id, "c-3");
        assert_eq!(restored.to_state().objections.len(), 1);
    }
}
