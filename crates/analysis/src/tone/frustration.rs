//! Intensity-aware frustration accumulator.
//!
//! One message with three rushed markers frustrates more than one with
//! a single marker, so the per-turn delta scales with the signal count
//! and with a run of consecutive negative turns.

use serde::{Deserialize, Serialize};

use sf_domain::frustration::{clamp_level, FrustrationThresholds, MAX_FRUSTRATION};
use sf_domain::tone::{InterventionUrgency, Tone};

use super::markers::{frustration_decay, frustration_weight};

/// Consecutive negative turns at which the escalation multiplier kicks in.
const CONSECUTIVE_THRESHOLD: u32 = 3;
const CONSECUTIVE_MULTIPLIER: f64 = 1.5;

/// Signal-count multiplier: 1 signal → ×1.0, 2 → ×1.5, 3+ → ×2.0.
fn intensity_multiplier(signal_count: usize) -> f64 {
    match signal_count {
        0 | 1 => 1.0,
        2 => 1.5,
        _ => 2.0,
    }
}

/// One entry in the change history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrustrationChange {
    pub tone: String,
    pub old_level: i32,
    pub new_level: i32,
    pub delta: i32,
}

/// Serialized tracker state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrustrationState {
    pub level: i32,
    #[serde(default)]
    pub history: Vec<FrustrationChange>,
    #[serde(default)]
    pub consecutive_negative_turns: u32,
    #[serde(default)]
    pub pre_intervention_triggered: bool,
}

/// Cumulative frustration tracker shared by all cascade tiers.
pub struct FrustrationTracker {
    thresholds: FrustrationThresholds,
    state: FrustrationState,
    last_tone: Tone,
    last_signal_count: usize,
}

impl FrustrationTracker {
    pub fn new(thresholds: FrustrationThresholds) -> Self {
        Self {
            thresholds,
            state: FrustrationState::default(),
            last_tone: Tone::Neutral,
            last_signal_count: 0,
        }
    }

    pub fn level(&self) -> i32 {
        self.state.level
    }

    pub fn thresholds(&self) -> &FrustrationThresholds {
        &self.thresholds
    }

    pub fn consecutive_negative_turns(&self) -> u32 {
        self.state.consecutive_negative_turns
    }

    pub fn history(&self) -> &[FrustrationChange] {
        &self.state.history
    }

    /// Apply one turn's tone observation.
    ///
    /// Negative tones add `weight × intensity × consecutive`, rounded;
    /// positive tones subtract their decay weight. The level is clamped
    /// to `[0, MAX_FRUSTRATION]`.
    pub fn update(&mut self, tone: Tone, signal_count: usize) -> i32 {
        let old_level = self.state.level;

        if tone.is_negative() {
            self.state.consecutive_negative_turns += 1;
            let mut delta = frustration_weight(tone) as f64 * intensity_multiplier(signal_count);
            if self.state.consecutive_negative_turns >= CONSECUTIVE_THRESHOLD {
                delta *= CONSECUTIVE_MULTIPLIER;
            }
            self.state.level = clamp_level(self.state.level + delta.round() as i32);
        } else {
            self.state.consecutive_negative_turns = 0;
            let decay = frustration_decay(tone);
            if decay > 0 {
                self.state.level = clamp_level(self.state.level - decay);
            }
        }

        self.last_tone = tone;
        self.last_signal_count = signal_count;
        self.state.pre_intervention_triggered = self.compute_pre_intervention();

        self.state.history.push(FrustrationChange {
            tone: tone.as_str().to_owned(),
            old_level,
            new_level: self.state.level,
            delta: self.state.level - old_level,
        });
        if self.state.history.len() > MAX_FRUSTRATION as usize * 10 {
            let excess = self.state.history.len() - MAX_FRUSTRATION as usize * 10;
            self.state.history.drain(..excess);
        }

        self.state.level
    }

    /// Sync the level from an external source (snapshot restore).
    pub fn set_level(&mut self, level: i32) {
        self.state.level = clamp_level(level);
    }

    fn compute_pre_intervention(&self) -> bool {
        if self.last_tone == Tone::Rushed && self.last_signal_count >= 2 {
            return true;
        }
        self.last_tone.is_negative() && self.thresholds.is_warning(self.state.level)
    }

    pub fn pre_intervention_triggered(&self) -> bool {
        self.state.pre_intervention_triggered
    }

    /// Map the current level (and rushed intensity) onto an urgency.
    pub fn intervention_urgency(&self) -> InterventionUrgency {
        let level = self.state.level;
        if self.thresholds.is_critical(level) {
            InterventionUrgency::Critical
        } else if self.thresholds.is_high(level)
            || (self.last_tone == Tone::Rushed && self.last_signal_count >= 3)
        {
            InterventionUrgency::High
        } else if self.thresholds.is_warning(level) {
            InterventionUrgency::Medium
        } else if level >= self.thresholds.elevated {
            InterventionUrgency::Low
        } else {
            InterventionUrgency::None
        }
    }

    pub fn should_offer_exit(&self) -> bool {
        self.intervention_urgency() >= InterventionUrgency::High
            || (self.last_tone == Tone::Rushed && self.last_signal_count >= 2)
    }

    pub fn is_warning(&self) -> bool {
        self.thresholds.is_warning(self.state.level)
    }

    pub fn is_critical(&self) -> bool {
        self.thresholds.is_critical(self.state.level)
    }

    pub fn reset(&mut self) {
        self.state = FrustrationState::default();
        self.last_tone = Tone::Neutral;
        self.last_signal_count = 0;
    }

    pub fn to_state(&self) -> FrustrationState {
        self.state.clone()
    }

    pub fn load_state(&mut self, state: FrustrationState) {
        self.state = state;
        self.state.level = clamp_level(self.state.level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> FrustrationTracker {
        FrustrationTracker::new(FrustrationThresholds::default())
    }

    #[test]
    fn three_rushed_signals_double_the_base_weight() {
        let mut t = tracker();
        // base 2 × intensity 2.0 = 4
        assert_eq!(t.update(Tone::Rushed, 3), 4);
    }

    #[test]
    fn second_rushed_turn_reaches_high() {
        let mut t = tracker();
        t.update(Tone::Rushed, 3);
        let level = t.update(Tone::Rushed, 3);
        assert!(level >= t.thresholds().high, "level {level} should be high");
        assert!(t.should_offer_exit());
    }

    #[test]
    fn positive_tone_decays() {
        let mut t = tracker();
        t.update(Tone::Frustrated, 2); // 3 × 1.5 = 4.5 → 5 (rounded)
        let after = t.update(Tone::Positive, 1);
        assert!(after < 5);
        assert_eq!(t.consecutive_negative_turns(), 0);
    }

    #[test]
    fn level_clamped_to_max() {
        let mut t = tracker();
        for _ in 0..10 {
            t.update(Tone::Frustrated, 3);
        }
        assert_eq!(t.level(), MAX_FRUSTRATION);
    }

    #[test]
    fn consecutive_run_escalates() {
        let mut t = tracker();
        t.update(Tone::Skeptical, 1); // +1 → 1
        t.update(Tone::Skeptical, 1); // +1 → 2
        // Third consecutive negative turn: 1 × 1.5 = 1.5 → 2
        let level = t.update(Tone::Skeptical, 1);
        assert_eq!(level, 4);
    }

    #[test]
    fn pre_intervention_on_double_rushed() {
        let mut t = tracker();
        t.update(Tone::Rushed, 2);
        assert!(t.pre_intervention_triggered());
    }

    #[test]
    fn urgency_mapping_follows_thresholds() {
        let mut t = tracker();
        assert_eq!(t.intervention_urgency(), InterventionUrgency::None);
        t.set_level(t.thresholds().warning);
        // last tone neutral; urgency keys off level alone here
        assert_eq!(t.intervention_urgency(), InterventionUrgency::Medium);
        t.set_level(t.thresholds().critical);
        assert_eq!(t.intervention_urgency(), InterventionUrgency::Critical);
    }

    #[test]
    fn state_round_trip() {
        let mut t = tracker();
        t.update(Tone::Rushed, 3);
        t.update(Tone::Rushed, 1);
        let state = t.to_state();

        let mut restored = tracker();
        restored.load_state(state);
        assert_eq!(restored.level(), t.level());
        assert_eq!(
            restored.consecutive_negative_turns(),
            t.consecutive_negative_turns()
        );
    }
}
