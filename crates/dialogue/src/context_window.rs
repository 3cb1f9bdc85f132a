//! Sliding context window with derived turn structure.
//!
//! Holds the last N turns with full classification/transition info and
//! answers aggregate queries (loops, oscillation, confidence trend).
//! Owns the episodic memory by value; window rotation never touches it.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use sf_domain::intents;

use crate::episodic::EpisodicMemory;
use crate::flow::FlowConfig;

pub const DEFAULT_WINDOW_SIZE: usize = 5;

/// How a turn moved the funnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnType {
    Progress,
    Regress,
    Lateral,
    Stuck,
    Neutral,
}

/// One turn's full record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnContext {
    pub user_message: String,
    pub bot_response: String,
    pub intent: String,
    pub confidence: f64,
    pub method: String,
    pub action: String,
    pub state: String,
    pub next_state: String,
    #[serde(default)]
    pub extracted_data: Map<String, Value>,
    #[serde(default)]
    pub is_disambiguation: bool,
    #[serde(default)]
    pub is_fallback: bool,
    #[serde(default)]
    pub fallback_tier: Option<String>,
    pub turn_type: TurnType,
    pub funnel_delta: i32,
}

impl TurnContext {
    /// Derive `funnel_delta` and `turn_type` from the transition.
    ///
    /// Intent category takes priority over the delta sign: an objection
    /// is a regress even when the machine moved to handle_objection.
    /// Unknown states yield a neutral delta of 0.
    fn derive(&mut self, flow: &FlowConfig) {
        let from = flow.order_of(&self.state);
        let to = flow.order_of(&self.next_state);
        self.funnel_delta = match (from, to) {
            (Some(from), Some(to)) => to - from,
            _ => 0,
        };
        self.turn_type = self.compute_turn_type();
    }

    fn compute_turn_type(&self) -> TurnType {
        if intents::is_regress(&self.intent) {
            return TurnType::Regress;
        }
        if intents::is_question(&self.intent) {
            return TurnType::Lateral;
        }
        if self.intent == intents::UNCLEAR || self.intent == intents::NEEDS_CLARIFICATION {
            return TurnType::Stuck;
        }
        if self.intent == intents::GREETING || self.intent == intents::GRATITUDE {
            return TurnType::Neutral;
        }
        if intents::is_progress(&self.intent) || self.funnel_delta > 0 {
            return TurnType::Progress;
        }
        if self.funnel_delta < 0 {
            return TurnType::Regress;
        }
        TurnType::Neutral
    }
}

/// Serialized window (turns + episodic memory).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextWindowState {
    #[serde(default)]
    pub turns: Vec<TurnContext>,
    #[serde(default)]
    pub episodic: EpisodicMemory,
}

pub struct ContextWindow {
    max_size: usize,
    turns: VecDeque<TurnContext>,
    episodic: EpisodicMemory,
}

impl Default for ContextWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

/// Arguments for recording one finished turn.
pub struct TurnRecord<'a> {
    pub user_message: &'a str,
    pub bot_response: &'a str,
    pub intent: &'a str,
    pub confidence: f64,
    pub method: &'a str,
    pub action: &'a str,
    pub state: &'a str,
    pub next_state: &'a str,
    pub extracted_data: &'a Map<String, Value>,
    pub is_disambiguation: bool,
    pub is_fallback: bool,
    pub fallback_tier: Option<&'a str>,
}

impl ContextWindow {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            turns: VecDeque::new(),
            episodic: EpisodicMemory::default(),
        }
    }

    pub fn episodic(&self) -> &EpisodicMemory {
        &self.episodic
    }

    pub fn episodic_mut(&mut self) -> &mut EpisodicMemory {
        &mut self.episodic
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Record a finished turn; drops the oldest past capacity and feeds
    /// the episodic memory as a side effect.
    pub fn add_turn(&mut self, record: TurnRecord<'_>, flow: &FlowConfig, turn_number: u32) {
        let mut turn = TurnContext {
            user_message: record.user_message.to_owned(),
            bot_response: record.bot_response.to_owned(),
            intent: record.intent.to_owned(),
            confidence: record.confidence,
            method: record.method.to_owned(),
            action: record.action.to_owned(),
            state: record.state.to_owned(),
            next_state: record.next_state.to_owned(),
            extracted_data: record.extracted_data.clone(),
            is_disambiguation: record.is_disambiguation,
            is_fallback: record.is_fallback,
            fallback_tier: record.fallback_tier.map(str::to_owned),
            turn_type: TurnType::Neutral,
            funnel_delta: 0,
        };
        turn.derive(flow);

        // Episodic side effects: profile, objections, breakthrough.
        self.episodic.absorb_extracted(record.extracted_data);
        if intents::is_objection(record.intent) {
            self.episodic.record_objection(record.intent, turn_number);
        }
        if turn.turn_type == TurnType::Progress
            && self
                .turns
                .back()
                .map(|prev| prev.turn_type == TurnType::Regress)
                .unwrap_or(false)
        {
            self.episodic.record_breakthrough(turn_number);
        }

        self.turns.push_back(turn);
        while self.turns.len() > self.max_size {
            self.turns.pop_front();
        }
    }

    // ── Aggregate queries ──────────────────────────────────────────

    pub fn intent_history(&self) -> Vec<String> {
        self.turns.iter().map(|t| t.intent.clone()).collect()
    }

    pub fn action_history(&self) -> Vec<String> {
        self.turns.iter().map(|t| t.action.clone()).collect()
    }

    pub fn objection_count(&self) -> usize {
        self.turns
            .iter()
            .filter(|t| intents::is_objection(&t.intent))
            .count()
    }

    pub fn positive_count(&self) -> usize {
        self.turns
            .iter()
            .filter(|t| intents::POSITIVE_INTENTS.contains(&t.intent.as_str()))
            .count()
    }

    pub fn question_count(&self) -> usize {
        self.turns
            .iter()
            .filter(|t| intents::is_question(&t.intent))
            .count()
    }

    pub fn unclear_count(&self) -> usize {
        self.turns
            .iter()
            .filter(|t| t.intent == intents::UNCLEAR)
            .count()
    }

    /// Alternating progress/regress over the last four turns.
    pub fn oscillation_detected(&self) -> bool {
        if self.turns.len() < 4 {
            return false;
        }
        let types: Vec<TurnType> = self
            .turns
            .iter()
            .rev()
            .take(4)
            .map(|t| t.turn_type)
            .collect();
        types
            .windows(2)
            .all(|w| matches!(
                (w[0], w[1]),
                (TurnType::Progress, TurnType::Regress) | (TurnType::Regress, TurnType::Progress)
            ))
    }

    /// `k` identical trailing intents.
    pub fn stuck_detected(&self, k: usize) -> bool {
        if self.turns.len() < k || k == 0 {
            return false;
        }
        let mut trailing = self.turns.iter().rev().take(k).map(|t| &t.intent);
        let first = match trailing.next() {
            Some(intent) => intent,
            None => return false,
        };
        trailing.all(|intent| intent == first)
    }

    /// The user repeated a question the bot already answered.
    pub fn repeated_question_detected(&self) -> bool {
        let questions: Vec<&str> = self
            .turns
            .iter()
            .filter(|t| intents::is_question(&t.intent))
            .map(|t| t.user_message.as_str())
            .collect();
        if questions.len() < 2 {
            return false;
        }
        let last = normalize(questions[questions.len() - 1]);
        questions[..questions.len() - 1]
            .iter()
            .any(|q| normalize(q) == last)
    }

    /// Least-squares slope of confidence over the window.
    pub fn confidence_trend(&self) -> f64 {
        let n = self.turns.len();
        if n < 2 {
            return 0.0;
        }
        let xs: Vec<f64> = (0..n).map(|i| i as f64).collect();
        let ys: Vec<f64> = self.turns.iter().map(|t| t.confidence).collect();
        let mean_x = xs.iter().sum::<f64>() / n as f64;
        let mean_y = ys.iter().sum::<f64>() / n as f64;
        let cov: f64 = xs
            .iter()
            .zip(&ys)
            .map(|(x, y)| (x - mean_x) * (y - mean_y))
            .sum();
        let var: f64 = xs.iter().map(|x| (x - mean_x).powi(2)).sum();
        if var == 0.0 {
            0.0
        } else {
            cov / var
        }
    }

    pub fn last_turn_type(&self) -> Option<TurnType> {
        self.turns.back().map(|t| t.turn_type)
    }

    pub fn reset(&mut self) {
        self.turns.clear();
        self.episodic = EpisodicMemory::default();
    }

    pub fn to_state(&self) -> ContextWindowState {
        ContextWindowState {
            turns: self.turns.iter().cloned().collect(),
            episodic: self.episodic.clone(),
        }
    }

    pub fn load_state(&mut self, state: ContextWindowState) {
        self.turns = state.turns.into_iter().collect();
        while self.turns.len() > self.max_size {
            self.turns.pop_front();
        }
        self.episodic = state.episodic;
    }
}

fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::spin_selling;

    fn record<'a>(
        intent: &'a str,
        state: &'a str,
        next_state: &'a str,
        extracted: &'a Map<String, Value>,
    ) -> TurnRecord<'a> {
        TurnRecord {
            user_message: "сообщение",
            bot_response: "ответ",
            intent,
            confidence: 0.8,
            method: "keyword",
            action: "continue_current_goal",
            state,
            next_state,
            extracted_data: extracted,
            is_disambiguation: false,
            is_fallback: false,
            fallback_tier: None,
        }
    }

    #[test]
    fn window_rotates_at_capacity() {
        let flow = spin_selling();
        let empty = Map::new();
        let mut window = ContextWindow::new(3);
        for _ in 0..5 {
            window.add_turn(record("info_provided", "spin_situation", "spin_problem", &empty), &flow, 1);
        }
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn objection_is_regress_even_moving_forward() {
        let flow = spin_selling();
        let empty = Map::new();
        let mut window = ContextWindow::default();
        // spin_situation (1) → handle_objection (5): positive delta,
        // still a regress by intent category.
        window.add_turn(
            record("objection_price", "spin_situation", "handle_objection", &empty),
            &flow,
            2,
        );
        let state = window.to_state();
        assert_eq!(state.turns[0].turn_type, TurnType::Regress);
        assert!(state.turns[0].funnel_delta > 0);
        assert!(window.episodic().first_objection_recorded);
    }

    #[test]
    fn unknown_state_yields_neutral_delta() {
        let flow = spin_selling();
        let empty = Map::new();
        let mut window = ContextWindow::default();
        window.add_turn(record("small_talk", "weird_state", "spin_problem", &empty), &flow, 1);
        assert_eq!(window.to_state().turns[0].funnel_delta, 0);
    }

    #[test]
    fn breakthrough_recorded_after_regress_then_progress() {
        let flow = spin_selling();
        let empty = Map::new();
        let mut window = ContextWindow::default();
        window.add_turn(
            record("objection_price", "presentation", "handle_objection", &empty),
            &flow,
            3,
        );
        window.add_turn(
            record("agreement", "handle_objection", "presentation", &empty),
            &flow,
            4,
        );
        assert!(window.episodic().breakthrough_recorded);
    }

    #[test]
    fn stuck_detection() {
        let flow = spin_selling();
        let empty = Map::new();
        let mut window = ContextWindow::default();
        for _ in 0..3 {
            window.add_turn(record("unclear", "spin_problem", "spin_problem", &empty), &flow, 1);
        }
        assert!(window.stuck_detected(3));
        assert!(!window.stuck_detected(4));
        assert_eq!(window.unclear_count(), 3);
    }

    #[test]
    fn confidence_trend_slope_sign() {
        let flow = spin_selling();
        let empty = Map::new();
        let mut window = ContextWindow::default();
        for (i, confidence) in [0.9, 0.7, 0.5].iter().enumerate() {
            let mut r = record("info_provided", "spin_situation", "spin_situation", &empty);
            r.confidence = *confidence;
            window.add_turn(r, &flow, i as u32);
        }
        assert!(window.confidence_trend() < 0.0);
    }

    #[test]
    fn repeated_question_detected() {
        let flow = spin_selling();
        let empty = Map::new();
        let mut window = ContextWindow::default();
        let mut first = record("price_question", "presentation", "presentation", &empty);
        first.user_message = "сколько стоит?";
        window.add_turn(first, &flow, 1);
        let mut second = record("price_question", "presentation", "presentation", &empty);
        second.user_message = "Сколько стоит?";
        window.add_turn(second, &flow, 2);
        assert!(window.repeated_question_detected());
    }

    #[test]
    fn state_round_trip_preserves_episodic() {
        let flow = spin_selling();
        let mut extracted = Map::new();
        extracted.insert("company_name".into(), Value::String("Ромашка".into()));
        let mut window = ContextWindow::default();
        window.add_turn(
            record("situation_provided", "spin_situation", "spin_problem", &extracted),
            &flow,
            1,
        );

        let state = window.to_state();
        let mut restored = ContextWindow::default();
        restored.load_state(state);
        assert_eq!(restored.len(), 1);
        assert_eq!(
            restored.episodic().client_profile.company_name.as_deref(),
            Some("Ромашка")
        );
    }
}
