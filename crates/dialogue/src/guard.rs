//! Conversation guard: loop, stall, budget, and frustration protection.
//!
//! Checks run in order of severity: wall-clock timeout → turn budget →
//! frustration/pre-intervention → message loop → state loop → progress
//! watchdog. A tier-2 self-loop escalator promotes repeated tier-2
//! interventions in the same state to tier-3.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use sf_domain::frustration::FrustrationThresholds;
use sf_domain::intents;

/// Intervention escalation ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionTier {
    Tier1,
    Tier2,
    Tier3,
    SoftClose,
}

impl InterventionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterventionTier::Tier1 => "fallback_tier_1",
            InterventionTier::Tier2 => "fallback_tier_2",
            InterventionTier::Tier3 => "fallback_tier_3",
            InterventionTier::SoftClose => "soft_close",
        }
    }
}

/// Guard limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    pub max_turns: u32,
    pub max_phase_attempts: u32,
    pub max_same_state: usize,
    pub max_same_message: usize,
    pub timeout_seconds: u64,
    pub progress_check_interval: u32,
    pub min_unique_states_for_progress: usize,
    pub max_consecutive_tier_2: u32,
    pub high_frustration_threshold: i32,
}

impl GuardConfig {
    pub fn default_with(thresholds: &FrustrationThresholds) -> Self {
        Self {
            max_turns: 25,
            max_phase_attempts: 3,
            max_same_state: 4,
            max_same_message: 3,
            timeout_seconds: 1800,
            progress_check_interval: 5,
            min_unique_states_for_progress: 2,
            max_consecutive_tier_2: 3,
            high_frustration_threshold: thresholds.high,
        }
    }

    /// For short, transactional dialogues.
    pub fn strict(thresholds: &FrustrationThresholds) -> Self {
        Self {
            max_turns: 15,
            max_phase_attempts: 2,
            max_same_state: 3,
            timeout_seconds: 900,
            ..Self::default_with(thresholds)
        }
    }

    /// For long consultative dialogues.
    pub fn relaxed(thresholds: &FrustrationThresholds) -> Self {
        Self {
            max_turns: 40,
            max_phase_attempts: 5,
            max_same_state: 6,
            timeout_seconds: 3600,
            ..Self::default_with(thresholds)
        }
    }
}

/// Serialized guard state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardState {
    pub turn_count: u32,
    #[serde(default)]
    pub state_history: Vec<String>,
    #[serde(default)]
    pub message_history: Vec<String>,
    #[serde(default)]
    pub phase_attempts: HashMap<String, u32>,
    #[serde(default)]
    pub start_time: Option<f64>,
    #[serde(default)]
    pub last_progress_turn: u32,
    #[serde(default)]
    pub frustration_level: i32,
    #[serde(default)]
    pub intent_history: Vec<String>,
    #[serde(default)]
    pub last_intent: String,
    #[serde(default)]
    pub consecutive_tier_2_count: u32,
    #[serde(default)]
    pub consecutive_tier_2_state: Option<String>,
}

pub struct ConversationGuard {
    config: GuardConfig,
    state: GuardState,
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl ConversationGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            config,
            state: GuardState::default(),
        }
    }

    pub fn turn_count(&self) -> u32 {
        self.state.turn_count
    }

    pub fn phase_attempts(&self) -> &HashMap<String, u32> {
        &self.state.phase_attempts
    }

    /// Check the dialogue and decide whether an intervention is due.
    ///
    /// Returns `(can_continue, intervention)`. `can_continue == false`
    /// always carries `SoftClose`.
    pub fn check(
        &mut self,
        state: &str,
        message: &str,
        collected_count: usize,
        frustration_level: i32,
        last_intent: &str,
        pre_intervention_triggered: bool,
    ) -> (bool, Option<InterventionTier>) {
        if self.state.start_time.is_none() {
            self.state.start_time = Some(now_epoch());
        }

        self.state.turn_count += 1;
        self.state.state_history.push(state.to_owned());
        self.state
            .message_history
            .push(message.trim().to_lowercase());
        *self
            .state
            .phase_attempts
            .entry(state.to_owned())
            .or_insert(0) += 1;
        self.state.frustration_level = frustration_level;
        if !last_intent.is_empty() {
            self.state.intent_history.push(last_intent.to_owned());
            self.state.last_intent = last_intent.to_owned();
        }
        let _ = collected_count;

        // 1. Wall-clock timeout.
        let elapsed = now_epoch() - self.state.start_time.unwrap_or_else(now_epoch);
        if elapsed > self.config.timeout_seconds as f64 {
            tracing::warn!(
                turns = self.state.turn_count,
                elapsed_seconds = elapsed as u64,
                "conversation timeout"
            );
            return (false, Some(InterventionTier::SoftClose));
        }

        // 2. Turn budget.
        if self.state.turn_count > self.config.max_turns {
            tracing::warn!(
                turns = self.state.turn_count,
                limit = self.config.max_turns,
                "max turns exceeded"
            );
            return (false, Some(InterventionTier::SoftClose));
        }

        // 3. High frustration or pre-intervention. An engaged client
        // (any classifiable intent except unclear) gets structured
        // options instead of a phase skip: they may be frustrated
        // BECAUSE their question went unanswered.
        if self.state.frustration_level >= self.config.high_frustration_threshold
            || pre_intervention_triggered
        {
            if self.is_engagement_intent() {
                tracing::info!(
                    frustration_level = self.state.frustration_level,
                    last_intent = %self.state.last_intent,
                    "high frustration but client engaged, tier_2 instead of tier_3"
                );
                return (true, Some(InterventionTier::Tier2));
            }
            tracing::warn!(
                frustration_level = self.state.frustration_level,
                pre_intervention = pre_intervention_triggered,
                "high frustration intervention"
            );
            return (true, Some(InterventionTier::Tier3));
        }

        // 4. Identical-message loop.
        if self.message_loop_detected() {
            tracing::warn!(turns = self.state.turn_count, "message loop detected");
            return (true, Some(InterventionTier::Tier2));
        }

        // 5. State loop, unless the client keeps providing information.
        let same_state = self.count_recent_same_state(state);
        if same_state >= self.config.max_same_state {
            if self.is_engagement_intent() {
                tracing::debug!(
                    state,
                    count = same_state,
                    "state loop threshold reached but client providing info"
                );
            } else {
                tracing::warn!(state, count = same_state, "state loop detected");
                return (true, Some(InterventionTier::Tier3));
            }
        }

        // 6. Progress watchdog.
        let turns_since_progress = self.state.turn_count - self.state.last_progress_turn;
        if turns_since_progress >= self.config.progress_check_interval && !self.has_progress() {
            tracing::warn!(turns_since_progress, "no progress detected");
            return (true, Some(InterventionTier::Tier1));
        }

        (true, None)
    }

    /// Promote repeated tier-2 in the same state to tier-3.
    pub fn apply_tier_2_escalation(
        &mut self,
        state: &str,
        tier: InterventionTier,
    ) -> InterventionTier {
        if tier == InterventionTier::Tier2 {
            if self.state.consecutive_tier_2_state.as_deref() == Some(state) {
                self.state.consecutive_tier_2_count += 1;
            } else {
                self.state.consecutive_tier_2_count = 1;
                self.state.consecutive_tier_2_state = Some(state.to_owned());
            }
            if self.state.consecutive_tier_2_count >= self.config.max_consecutive_tier_2 {
                self.state.consecutive_tier_2_count = 0;
                tracing::info!(
                    state,
                    threshold = self.config.max_consecutive_tier_2,
                    "tier_2 self-loop escalated to tier_3"
                );
                return InterventionTier::Tier3;
            }
        } else {
            self.state.consecutive_tier_2_count = 0;
            self.state.consecutive_tier_2_state = None;
        }
        tier
    }

    /// Mark progress: state change or new data collected.
    pub fn record_progress(&mut self) {
        self.state.last_progress_turn = self.state.turn_count;
    }

    fn message_loop_detected(&self) -> bool {
        let history = &self.state.message_history;
        let n = self.config.max_same_message;
        if history.len() < n {
            return false;
        }
        let recent = &history[history.len() - n..];
        recent.iter().all(|m| m == &recent[0])
    }

    fn count_recent_same_state(&self, state: &str) -> usize {
        self.state
            .state_history
            .iter()
            .rev()
            .take_while(|s| s.as_str() == state)
            .count()
    }

    fn has_progress(&self) -> bool {
        if self.state.state_history.len() < 2 {
            return true;
        }
        let interval = self.config.progress_check_interval as usize;
        let start = self.state.state_history.len().saturating_sub(interval);
        let unique: std::collections::HashSet<&String> =
            self.state.state_history[start..].iter().collect();
        unique.len() >= self.config.min_unique_states_for_progress
    }

    /// Any classifiable intent except `unclear` counts as engagement.
    fn is_engagement_intent(&self) -> bool {
        !self.state.last_intent.is_empty() && self.state.last_intent != intents::UNCLEAR
    }

    pub fn reset(&mut self) {
        self.state = GuardState::default();
    }

    pub fn to_state(&self) -> GuardState {
        self.state.clone()
    }

    pub fn load_state(&mut self, state: GuardState) {
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> ConversationGuard {
        ConversationGuard::new(GuardConfig::default_with(&FrustrationThresholds::default()))
    }

    #[test]
    fn quiet_dialogue_passes() {
        let mut g = guard();
        let (ok, tier) = g.check("greeting", "здравствуйте", 0, 0, "", false);
        assert!(ok);
        assert!(tier.is_none());
    }

    #[test]
    fn counters_are_monotone() {
        let mut g = guard();
        for i in 0..5 {
            g.check("spin_situation", &format!("msg {i}"), 0, 0, "info_provided", false);
        }
        assert_eq!(g.turn_count(), 5);
        assert_eq!(g.phase_attempts()["spin_situation"], 5);
    }

    #[test]
    fn identical_messages_trigger_tier_2() {
        let mut g = guard();
        g.check("spin_problem", "не знаю", 0, 0, "", false);
        g.check("spin_problem", "не знаю", 0, 0, "unclear", false);
        let (ok, tier) = g.check("spin_problem", "не знаю", 0, 0, "unclear", false);
        assert!(ok);
        assert_eq!(tier, Some(InterventionTier::Tier2));
    }

    #[test]
    fn state_loop_triggers_tier_3_when_stuck() {
        let mut g = guard();
        for i in 0..3 {
            g.check("spin_problem", &format!("хм {i}"), 0, 0, "unclear", false);
        }
        let (ok, tier) = g.check("spin_problem", "ещё одно", 0, 0, "unclear", false);
        assert!(ok);
        assert_eq!(tier, Some(InterventionTier::Tier3));
    }

    #[test]
    fn state_loop_suppressed_for_engaged_client() {
        let mut g = guard();
        for i in 0..5 {
            g.check(
                "spin_problem",
                &format!("а ещё вопрос {i}"),
                0,
                0,
                "question_features",
                false,
            );
        }
        let (ok, tier) = g.check(
            "spin_problem",
            "и последний вопрос",
            0,
            0,
            "question_features",
            false,
        );
        assert!(ok);
        // Progress watchdog may still fire tier_1; never tier_3.
        assert_ne!(tier, Some(InterventionTier::Tier3));
    }

    #[test]
    fn high_frustration_tier_3_or_tier_2_when_engaged() {
        let mut g = guard();
        let (_, tier) = g.check("presentation", "ну сколько можно", 0, 8, "", false);
        assert_eq!(tier, Some(InterventionTier::Tier3));

        let mut g2 = guard();
        let (_, tier2) = g2.check("presentation", "и всё же про цену", 0, 8, "price_question", false);
        assert_eq!(tier2, Some(InterventionTier::Tier2));
    }

    #[test]
    fn pre_intervention_triggers_without_high_level() {
        let mut g = guard();
        let (ok, tier) = g.check("spin_situation", "быстрее", 0, 4, "", true);
        assert!(ok);
        assert_eq!(tier, Some(InterventionTier::Tier3));
    }

    #[test]
    fn turn_budget_soft_closes() {
        let mut g = ConversationGuard::new(GuardConfig {
            max_turns: 2,
            ..GuardConfig::default_with(&FrustrationThresholds::default())
        });
        g.check("a", "1", 0, 0, "", false);
        g.check("b", "2", 0, 0, "", false);
        let (ok, tier) = g.check("c", "3", 0, 0, "", false);
        assert!(!ok);
        assert_eq!(tier, Some(InterventionTier::SoftClose));
    }

    #[test]
    fn timeout_soft_closes() {
        let mut g = guard();
        g.check("a", "1", 0, 0, "", false);
        let mut state = g.to_state();
        state.start_time = Some(now_epoch() - 3600.0);
        g.load_state(state);
        let (ok, tier) = g.check("a", "2", 0, 0, "", false);
        assert!(!ok);
        assert_eq!(tier, Some(InterventionTier::SoftClose));
    }

    #[test]
    fn tier_2_escalates_after_three_in_same_state() {
        let mut g = guard();
        assert_eq!(
            g.apply_tier_2_escalation("spin_problem", InterventionTier::Tier2),
            InterventionTier::Tier2
        );
        assert_eq!(
            g.apply_tier_2_escalation("spin_problem", InterventionTier::Tier2),
            InterventionTier::Tier2
        );
        assert_eq!(
            g.apply_tier_2_escalation("spin_problem", InterventionTier::Tier2),
            InterventionTier::Tier3
        );
        // Counter reset after escalation.
        assert_eq!(
            g.apply_tier_2_escalation("spin_problem", InterventionTier::Tier2),
            InterventionTier::Tier2
        );
    }

    #[test]
    fn tier_2_counter_resets_on_state_change() {
        let mut g = guard();
        g.apply_tier_2_escalation("a", InterventionTier::Tier2);
        g.apply_tier_2_escalation("a", InterventionTier::Tier2);
        assert_eq!(
            g.apply_tier_2_escalation("b", InterventionTier::Tier2),
            InterventionTier::Tier2
        );
        assert_eq!(
            g.apply_tier_2_escalation("b", InterventionTier::Tier2),
            InterventionTier::Tier2
        );
    }

    #[test]
    fn progress_watchdog_fires_tier_1() {
        let mut g = guard();
        for i in 0..4 {
            g.check("spin_situation", &format!("m{i}"), 0, 0, "info_provided", false);
        }
        let (ok, tier) = g.check("spin_situation", "m4", 0, 0, "info_provided", false);
        assert!(ok);
        assert_eq!(tier, Some(InterventionTier::Tier1));
    }

    #[test]
    fn record_progress_postpones_watchdog() {
        let mut g = guard();
        for i in 0..4 {
            g.check("spin_situation", &format!("m{i}"), 0, 0, "info_provided", false);
            g.record_progress();
        }
        let (_, tier) = g.check("spin_situation", "m4", 0, 0, "info_provided", false);
        assert!(tier.is_none());
    }

    #[test]
    fn state_round_trip() {
        let mut g = guard();
        g.check("spin_problem", "не знаю", 0, 3, "unclear", false);
        g.record_progress();
        let state = g.to_state();

        let mut restored = guard();
        restored.load_state(state);
        assert_eq!(restored.turn_count(), 1);
        assert_eq!(restored.to_state().last_progress_turn, 1);
    }
}
