//! Dialogue policy overlay and response directives.
//!
//! Declarative rules read the context envelope and may substitute the
//! state machine's action (and, together with an action, the next
//! state). A `next_state` with no `action` is invalid and is ignored
//! with a warning. Shadow mode evaluates rules and logs the decision
//! without applying it.

use serde::{Deserialize, Serialize};

use sf_domain::flags::Flags;
use sf_domain::frustration::FrustrationThresholds;
use sf_domain::intents;
use sf_domain::tone::{Style, Tone};

use crate::envelope::ContextEnvelope;
use crate::state_machine::StateMachineResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDecision {
    Noop,
    Override,
    Shadow,
}

/// An atomic substitution emitted by the policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyOverride {
    pub action: Option<String>,
    pub next_state: Option<String>,
    pub reason_codes: Vec<String>,
    pub decision: PolicyDecision,
}

impl PolicyOverride {
    pub fn has_override(&self) -> bool {
        self.decision == PolicyDecision::Override
            && (self.action.is_some() || self.next_state.is_some())
    }
}

/// The rule set. Stateless; all inputs come from the envelope.
pub struct DialoguePolicy {
    thresholds: FrustrationThresholds,
}

impl DialoguePolicy {
    pub fn new(thresholds: FrustrationThresholds) -> Self {
        Self { thresholds }
    }

    /// Evaluate the rules against this turn.
    pub fn maybe_override(
        &self,
        result: &StateMachineResult,
        envelope: &ContextEnvelope,
        flags: &Flags,
    ) -> Option<PolicyOverride> {
        let mut action: Option<String> = None;
        let mut next_state: Option<String> = None;
        let mut reason_codes: Vec<String> = Vec::new();

        // Frustrated client asking about pricing gets the direct answer,
        // not another funnel question.
        if self.thresholds.is_high(envelope.tone.frustration_level)
            && result.action == "answer_with_pricing"
        {
            action = Some("answer_with_pricing_direct".into());
            reason_codes.push("frustrated_pricing_direct".into());
        }

        // Competitor comparison gets pricing head-on while the machine
        // would have kept probing.
        if envelope.last_intent == intents::COMPARISON
            && result.action == "continue_current_goal"
        {
            action = Some("answer_with_pricing_direct".into());
            reason_codes.push("competitor_comparison_direct".into());
        }

        // A repeated question means the previous answer missed; answer
        // again instead of advancing.
        if envelope.window.repeated_question
            && result.action == "continue_current_goal"
            && intents::is_question(&envelope.last_intent)
        {
            action = Some("answer_question".into());
            next_state = Some(result.prev_state.clone());
            reason_codes.push("repeated_question_reanswer".into());
        }

        if reason_codes.is_empty() {
            return None;
        }

        // A next_state without an action is declared invalid; drop it.
        if next_state.is_some() && action.is_none() {
            tracing::warn!(
                next_state = next_state.as_deref(),
                "policy override has next_state without action, ignoring next_state"
            );
            next_state = None;
        }

        let decision = if flags.context_shadow_mode() {
            PolicyDecision::Shadow
        } else {
            PolicyDecision::Override
        };

        let override_ = PolicyOverride {
            action,
            next_state,
            reason_codes,
            decision,
        };

        if decision == PolicyDecision::Shadow {
            tracing::info!(
                reason_codes = ?override_.reason_codes,
                action = override_.action.as_deref(),
                "policy override evaluated in shadow mode, not applied"
            );
        }

        Some(override_)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response directives
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Compact instruction derived from the envelope for the generator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseDirectives {
    pub tone_instruction: String,
    pub style_instruction: String,
    pub max_words: usize,
    pub should_apologize: bool,
    pub should_offer_exit: bool,
}

impl ResponseDirectives {
    /// Render the directives as one instruction string for the prompt.
    pub fn instruction(&self) -> String {
        let mut parts = Vec::new();
        if !self.tone_instruction.is_empty() {
            parts.push(self.tone_instruction.clone());
        }
        if !self.style_instruction.is_empty() {
            parts.push(self.style_instruction.clone());
        }
        if self.max_words > 0 {
            parts.push(format!("Не больше {} слов.", self.max_words));
        }
        if self.should_offer_exit {
            parts.push("Предложи вариант завершить диалог.".into());
        }
        parts.join(" ")
    }
}

/// Derive directives from the envelope (tone guidance distilled to the
/// fields the generator actually uses).
pub fn build_response_directives(
    envelope: &ContextEnvelope,
    thresholds: &FrustrationThresholds,
) -> ResponseDirectives {
    let tone = &envelope.tone;
    let mut directives = ResponseDirectives {
        max_words: 50,
        should_offer_exit: tone.should_offer_exit,
        ..Default::default()
    };

    directives.style_instruction = match tone.style {
        Style::Informal => "Пиши дружелюбно, без канцелярита.".into(),
        Style::Formal => "Пиши вежливо и по-деловому.".into(),
    };

    if thresholds.is_critical(tone.frustration_level) {
        directives.max_words = 20;
        directives.tone_instruction =
            "Максимально коротко, одно предложение, извинись.".into();
        directives.should_apologize = true;
    } else if thresholds.is_high(tone.frustration_level) {
        directives.max_words = 25;
        directives.tone_instruction = "Коротко и по делу, без лишних вопросов.".into();
        directives.should_apologize = tone.tone == Tone::Frustrated;
    } else if thresholds.is_warning(tone.frustration_level) {
        directives.max_words = 35;
        directives.tone_instruction = "Кратко и по-деловому.".into();
        directives.should_apologize = tone.tone == Tone::Frustrated;
    } else if tone.tone == Tone::Rushed {
        directives.max_words = 30;
        directives.tone_instruction = "Клиент торопится: коротко, без вступлений.".into();
    }

    directives
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context_window::ContextWindow;
    use crate::envelope::build_context_envelope;
    use crate::flow::spin_selling;
    use crate::lead::LeadTemperature;
    use crate::state_machine::StateMachine;
    use sf_domain::tone::ToneAnalysis;

    fn envelope_with(frustration: i32, last_intent: &str) -> ContextEnvelope {
        let sm = StateMachine::new(spin_selling(), None);
        let window = ContextWindow::default();
        let mut tone = ToneAnalysis::neutral(frustration);
        tone.frustration_level = frustration;
        build_context_envelope(
            &sm,
            &window,
            &tone,
            None,
            "continue_current_goal",
            last_intent,
            2,
            10,
            LeadTemperature::Cold,
        )
    }

    fn sm_result(action: &str) -> StateMachineResult {
        StateMachineResult {
            prev_state: "presentation".into(),
            next_state: "presentation".into(),
            action: action.into(),
            goal: String::new(),
            collected_data: serde_json::Map::new(),
            missing_data: vec![],
            optional_data: vec![],
            is_final: false,
            spin_phase: "presentation".into(),
        }
    }

    #[test]
    fn frustrated_pricing_goes_direct() {
        let policy = DialoguePolicy::new(FrustrationThresholds::default());
        let envelope = envelope_with(8, intents::PRICE_QUESTION);
        let override_ = policy
            .maybe_override(&sm_result("answer_with_pricing"), &envelope, &Flags::new())
            .unwrap();
        assert!(override_.has_override());
        assert_eq!(override_.action.as_deref(), Some("answer_with_pricing_direct"));
        assert!(override_
            .reason_codes
            .contains(&"frustrated_pricing_direct".to_string()));
    }

    #[test]
    fn calm_dialogue_yields_no_override() {
        let policy = DialoguePolicy::new(FrustrationThresholds::default());
        let envelope = envelope_with(0, intents::INFO_PROVIDED);
        assert!(policy
            .maybe_override(&sm_result("continue_current_goal"), &envelope, &Flags::new())
            .is_none());
    }

    #[test]
    fn shadow_mode_marks_decision() {
        let policy = DialoguePolicy::new(FrustrationThresholds::default());
        let envelope = envelope_with(8, intents::PRICE_QUESTION);
        let flags = Flags::new();
        flags.set_override("context_shadow_mode", true);
        let override_ = policy
            .maybe_override(&sm_result("answer_with_pricing"), &envelope, &flags)
            .unwrap();
        assert_eq!(override_.decision, PolicyDecision::Shadow);
        assert!(!override_.has_override());
    }

    #[test]
    fn competitor_comparison_goes_direct() {
        let policy = DialoguePolicy::new(FrustrationThresholds::default());
        let envelope = envelope_with(0, intents::COMPARISON);
        let override_ = policy
            .maybe_override(&sm_result("continue_current_goal"), &envelope, &Flags::new())
            .unwrap();
        assert_eq!(override_.action.as_deref(), Some("answer_with_pricing_direct"));
    }

    #[test]
    fn directives_shorten_for_high_frustration() {
        let thresholds = FrustrationThresholds::default();
        let envelope = envelope_with(thresholds.high, intents::PRICE_QUESTION);
        let directives = build_response_directives(&envelope, &thresholds);
        assert_eq!(directives.max_words, 25);
        let instruction = directives.instruction();
        assert!(instruction.contains("25 слов"));
    }
}
