//! Lead scoring with per-turn decay and temperature-based phase skips.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Lead temperature bands over the 0-100 score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadTemperature {
    Cold,
    Warm,
    Hot,
    VeryHot,
}

impl LeadTemperature {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadTemperature::Cold => "cold",
            LeadTemperature::Warm => "warm",
            LeadTemperature::Hot => "hot",
            LeadTemperature::VeryHot => "very_hot",
        }
    }

    fn from_score(score: i32) -> LeadTemperature {
        match score {
            i32::MIN..=29 => LeadTemperature::Cold,
            30..=49 => LeadTemperature::Warm,
            50..=69 => LeadTemperature::Hot,
            _ => LeadTemperature::VeryHot,
        }
    }

    /// Recommended path through the funnel.
    pub fn recommended_path(&self) -> &'static str {
        match self {
            LeadTemperature::Cold => "full_spin",
            LeadTemperature::Warm => "short_spin",
            LeadTemperature::Hot => "direct_present",
            LeadTemperature::VeryHot => "direct_close",
        }
    }
}

/// Signal weights. Closed sets; unknown signals are ignored.
fn positive_weight(signal: &str) -> i32 {
    match signal {
        "demo_request" => 30,
        "price_with_size" => 25,
        "callback_request" => 25,
        "consultation_request" => 20,
        "contact_provided" => 35,
        "explicit_problem" => 15,
        "competitor_comparison" => 12,
        "budget_mentioned" => 10,
        "timeline_mentioned" => 10,
        "multiple_questions" => 8,
        "features_question" => 5,
        "integrations_question" => 5,
        "general_interest" => 3,
        "price_question" => 5,
        _ => 0,
    }
}

fn negative_weight(signal: &str) -> i32 {
    match signal {
        "objection_price" => -15,
        "objection_competitor" => -10,
        "objection_no_time" => -20,
        "objection_think" => -10,
        "objection_no_need" => -25,
        "unclear_repeated" => -5,
        "rejection_soft" => -25,
        "frustration" => -15,
        _ => 0,
    }
}

const MAX_HISTORY_LENGTH: usize = 20;
const DEFAULT_DECAY_FACTOR: f64 = 0.95;

const DEFAULT_PHASE_ORDER: &[&str] = &[
    "spin_situation",
    "spin_problem",
    "spin_implication",
    "spin_need_payoff",
    "presentation",
    "close",
];

fn default_skip_phases(temperature: LeadTemperature) -> HashSet<String> {
    let phases: &[&str] = match temperature {
        LeadTemperature::Cold => &[],
        LeadTemperature::Warm => &["spin_implication", "spin_need_payoff"],
        LeadTemperature::Hot => &["spin_problem", "spin_implication", "spin_need_payoff"],
        LeadTemperature::VeryHot => &[
            "spin_situation",
            "spin_problem",
            "spin_implication",
            "spin_need_payoff",
        ],
    };
    phases.iter().map(|s| s.to_string()).collect()
}

/// Serialized scorer state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeadScorerState {
    pub current_score: i32,
    pub raw_score: f64,
    #[serde(default)]
    pub signals_history: Vec<String>,
    #[serde(default)]
    pub turn_count: u32,
    #[serde(default)]
    pub decay_applied_this_turn: bool,
}

/// Snapshot of the current scoring decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadScore {
    pub score: i32,
    pub temperature: LeadTemperature,
    pub signals: Vec<String>,
    pub recommended_path: String,
    pub skip_phases: HashSet<String>,
}

pub struct LeadScorer {
    decay_factor: f64,
    skip_phases: HashMap<LeadTemperature, HashSet<String>>,
    phase_order: Vec<String>,
    state: LeadScorerState,
}

impl Default for LeadScorer {
    fn default() -> Self {
        Self::new(DEFAULT_DECAY_FACTOR, None, None)
    }
}

impl LeadScorer {
    pub fn new(
        decay_factor: f64,
        skip_phases: Option<HashMap<LeadTemperature, HashSet<String>>>,
        phase_order: Option<Vec<String>>,
    ) -> Self {
        let skip_phases = skip_phases.unwrap_or_else(|| {
            [
                LeadTemperature::Cold,
                LeadTemperature::Warm,
                LeadTemperature::Hot,
                LeadTemperature::VeryHot,
            ]
            .into_iter()
            .map(|t| (t, default_skip_phases(t)))
            .collect()
        });
        Self {
            decay_factor,
            skip_phases,
            phase_order: phase_order
                .unwrap_or_else(|| DEFAULT_PHASE_ORDER.iter().map(|s| s.to_string()).collect()),
            state: LeadScorerState::default(),
        }
    }

    pub fn current_score(&self) -> i32 {
        self.state.current_score
    }

    /// Apply the per-turn decay. Idempotent within a turn: the flag is
    /// cleared only by `end_turn`.
    pub fn apply_turn_decay(&mut self) {
        if self.state.decay_applied_this_turn {
            return;
        }
        self.state.turn_count += 1;
        let old = self.state.raw_score;
        self.state.raw_score = (self.state.raw_score * self.decay_factor).clamp(0.0, 100.0);
        self.state.current_score = self.state.raw_score as i32;
        self.state.decay_applied_this_turn = true;
        if (old - self.state.raw_score).abs() > f64::EPSILON {
            tracing::debug!(
                turn = self.state.turn_count,
                old_score = old,
                new_score = self.state.current_score,
                "lead score decay applied"
            );
        }
    }

    /// Clear the decay flag at the end of a turn.
    pub fn end_turn(&mut self) {
        self.state.decay_applied_this_turn = false;
    }

    /// Add one signal and recompute the score.
    pub fn add_signal(&mut self, signal: &str) -> LeadScore {
        if !self.state.decay_applied_this_turn {
            self.apply_turn_decay();
        }

        let mut weight = positive_weight(signal);
        if weight == 0 {
            weight = negative_weight(signal);
        }

        if weight != 0 {
            self.state.raw_score = (self.state.raw_score + weight as f64).clamp(0.0, 100.0);
            self.state.current_score = self.state.raw_score as i32;
            self.state.signals_history.push(signal.to_owned());
            if self.state.signals_history.len() > MAX_HISTORY_LENGTH {
                let excess = self.state.signals_history.len() - MAX_HISTORY_LENGTH;
                self.state.signals_history.drain(..excess);
            }
            tracing::info!(signal, weight, new_score = self.state.current_score, "lead score updated");
        }

        self.score()
    }

    pub fn score(&self) -> LeadScore {
        let temperature = LeadTemperature::from_score(self.state.current_score);
        LeadScore {
            score: self.state.current_score,
            temperature,
            signals: self
                .state
                .signals_history
                .iter()
                .rev()
                .take(5)
                .rev()
                .cloned()
                .collect(),
            recommended_path: temperature.recommended_path().to_owned(),
            skip_phases: self
                .skip_phases
                .get(&temperature)
                .cloned()
                .unwrap_or_default(),
        }
    }

    pub fn temperature(&self) -> LeadTemperature {
        LeadTemperature::from_score(self.state.current_score)
    }

    pub fn should_skip_phase(&self, phase: &str) -> bool {
        self.score().skip_phases.contains(phase)
    }

    /// Next phase after `current`, skipping banned phases for the
    /// present temperature. `None` when nothing remains.
    pub fn next_phase(&self, current: &str) -> Option<String> {
        let idx = self.phase_order.iter().position(|p| p == current)?;
        let skips = self.score().skip_phases;
        self.phase_order[idx + 1..]
            .iter()
            .find(|p| !skips.contains(*p))
            .cloned()
    }

    pub fn is_ready_for_close(&self) -> bool {
        self.state.current_score >= 70
    }

    pub fn reset(&mut self) {
        self.state = LeadScorerState::default();
    }

    pub fn to_state(&self) -> LeadScorerState {
        self.state.clone()
    }

    pub fn load_state(&mut self, state: LeadScorerState) {
        self.state = state;
    }
}
