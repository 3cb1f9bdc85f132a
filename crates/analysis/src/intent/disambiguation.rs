//! Disambiguation decision engine and option resolver.
//!
//! The engine maps a classification's confidence × gap onto one of
//! `{execute, confirm, disambiguate, fallback}`. The resolver matches a
//! user's reply against the presented options by index, exact label, or
//! free text.

use serde::{Deserialize, Serialize};

use sf_domain::intents;

use super::Classification;

/// Decision thresholds. The bands overlap deliberately and are kept
/// exactly as published; the matrix is not retuned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisambiguationThresholds {
    pub high_confidence: f64,
    pub medium_confidence: f64,
    pub low_confidence: f64,
    pub min_confidence: f64,
    pub gap_threshold: f64,
}

impl Default for DisambiguationThresholds {
    fn default() -> Self {
        Self {
            high_confidence: 0.85,
            medium_confidence: 0.65,
            low_confidence: 0.45,
            min_confidence: 0.30,
            gap_threshold: 0.20,
        }
    }
}

/// What to do with a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisambiguationDecision {
    Execute,
    Confirm,
    Disambiguate,
    Fallback,
}

/// One option shown to the user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DisambiguationOption {
    pub intent: String,
    pub label: String,
    pub confidence: f64,
}

/// Engine output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisambiguationOutcome {
    pub decision: DisambiguationDecision,
    pub intent: String,
    pub confidence: f64,
    pub gap: f64,
    pub reasoning: String,
    #[serde(default)]
    pub options: Vec<DisambiguationOption>,
    #[serde(default)]
    pub confirm_question: String,
}

impl DisambiguationOutcome {
    pub fn needs_disambiguation(&self) -> bool {
        matches!(
            self.decision,
            DisambiguationDecision::Confirm | DisambiguationDecision::Disambiguate
        )
    }

    /// The question presented to the user for this outcome.
    pub fn question(&self) -> String {
        match self.decision {
            DisambiguationDecision::Confirm => self.confirm_question.clone(),
            DisambiguationDecision::Disambiguate => {
                let mut lines = vec!["Уточните, пожалуйста, что вас интересует:".to_owned()];
                for (i, option) in self.options.iter().enumerate() {
                    lines.push(format!("{}. {}", i + 1, option.label));
                }
                lines.join("\n")
            }
            _ => String::new(),
        }
    }
}

/// Serialized state carried by the state machine while a disambiguation
/// sub-dialogue is active.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisambiguationContext {
    pub options: Vec<DisambiguationOption>,
    pub question: String,
    pub original_intent: String,
    pub attempts: u32,
    pub max_attempts: u32,
}

/// The confidence × gap decision engine.
pub struct DisambiguationEngine {
    thresholds: DisambiguationThresholds,
}

impl Default for DisambiguationEngine {
    fn default() -> Self {
        Self::new(DisambiguationThresholds::default())
    }
}

impl DisambiguationEngine {
    pub fn new(thresholds: DisambiguationThresholds) -> Self {
        Self { thresholds }
    }

    pub fn decide(&self, classification: &Classification) -> DisambiguationOutcome {
        let t = &self.thresholds;
        let confidence = classification.confidence;
        let gap = classification.gap();

        let (decision, reasoning) = if confidence >= t.high_confidence && gap >= t.gap_threshold {
            (
                DisambiguationDecision::Execute,
                format!("high confidence ({confidence:.2}) with a clear leader (gap={gap:.2})"),
            )
        } else if confidence >= t.high_confidence {
            (
                DisambiguationDecision::Confirm,
                format!("high confidence ({confidence:.2}) but close alternatives (gap={gap:.2})"),
            )
        } else if confidence >= t.medium_confidence && gap >= t.gap_threshold {
            (
                DisambiguationDecision::Execute,
                format!("medium confidence ({confidence:.2}) with a clear leader (gap={gap:.2})"),
            )
        } else if confidence >= t.medium_confidence {
            (
                DisambiguationDecision::Confirm,
                format!("medium confidence ({confidence:.2}) with close alternatives (gap={gap:.2})"),
            )
        } else if confidence >= t.low_confidence {
            (
                DisambiguationDecision::Disambiguate,
                format!("low confidence ({confidence:.2}), asking the user"),
            )
        } else if confidence >= t.min_confidence {
            (
                DisambiguationDecision::Disambiguate,
                format!("very low confidence ({confidence:.2}), showing options"),
            )
        } else {
            (
                DisambiguationDecision::Fallback,
                format!("unclassifiable ({confidence:.2} < {:.2})", t.min_confidence),
            )
        };

        let mut outcome = DisambiguationOutcome {
            decision,
            intent: classification.intent.clone(),
            confidence,
            gap,
            reasoning,
            options: Vec::new(),
            confirm_question: String::new(),
        };

        match decision {
            DisambiguationDecision::Confirm => {
                outcome.confirm_question = confirm_question(&classification.intent);
            }
            DisambiguationDecision::Disambiguate => {
                outcome.options = build_options(classification);
            }
            _ => {}
        }

        outcome
    }
}

fn confirm_question(intent: &str) -> String {
    match intent {
        intents::DEMO_REQUEST => "Вы хотите записаться на демо?".into(),
        intents::CALLBACK_REQUEST => "Перезвонить вам?".into(),
        intents::PRICE_QUESTION => "Вас интересует стоимость?".into(),
        intents::AGREEMENT => "Продолжаем?".into(),
        intents::REJECTION => "Вы хотите завершить разговор?".into(),
        intents::REQUEST_BREVITY => "Хотите короткий ответ по сути?".into(),
        intents::OBJECTION_COMPETITOR => "Хотите сравнить с вашим текущим решением?".into(),
        other => format!(
            "Правильно ли я понял — {}?",
            intents::label(other).to_lowercase()
        ),
    }
}

/// Top intent, up to two distinct alternatives, and a trailing "other".
fn build_options(classification: &Classification) -> Vec<DisambiguationOption> {
    let mut options = vec![DisambiguationOption {
        intent: classification.intent.clone(),
        label: intents::label(&classification.intent).to_owned(),
        confidence: classification.confidence,
    }];

    for alt in classification.alternatives.iter().take(2) {
        if alt.intent != classification.intent {
            options.push(DisambiguationOption {
                intent: alt.intent.clone(),
                label: intents::label(&alt.intent).to_owned(),
                confidence: alt.confidence,
            });
        }
    }

    options.push(DisambiguationOption {
        intent: "other".into(),
        label: "Другое".into(),
        confidence: 0.0,
    });

    options
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Option resolver
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How a reply matched the option set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionMatch {
    /// Matched option with this intent (by index or label).
    Selected(String),
    /// "Другое" was chosen; reclassify the follow-up freely.
    Other,
    /// No match; caller reclassifies the reply as free text.
    Unmatched,
}

/// Ordinal words accepted as option indexes.
const ORDINALS: &[(&str, usize)] = &[
    ("первое", 0),
    ("первый", 0),
    ("первая", 0),
    ("второе", 1),
    ("второй", 1),
    ("вторая", 1),
    ("третье", 2),
    ("третий", 2),
    ("третья", 2),
];

/// Match a user reply against the presented options.
pub fn resolve_option(reply: &str, options: &[DisambiguationOption]) -> OptionMatch {
    let normalized = reply.trim().to_lowercase();
    if normalized.is_empty() {
        return OptionMatch::Unmatched;
    }

    // Index: "1", "2.", "вариант 3"
    let digits: String = normalized.chars().filter(|c| c.is_ascii_digit()).collect();
    if !digits.is_empty() && digits.len() <= 2 && normalized.chars().count() <= 12 {
        if let Ok(idx) = digits.parse::<usize>() {
            if idx >= 1 && idx <= options.len() {
                return selected(&options[idx - 1]);
            }
        }
    }

    // Ordinal words.
    for (word, idx) in ORDINALS {
        if normalized.contains(word) {
            if let Some(option) = options.get(*idx) {
                return selected(option);
            }
        }
    }

    // Exact label match.
    for option in options {
        if normalized == option.label.to_lowercase() {
            return selected(option);
        }
    }

    OptionMatch::Unmatched
}

fn selected(option: &DisambiguationOption) -> OptionMatch {
    if option.intent == "other" {
        OptionMatch::Other
    } else {
        OptionMatch::Selected(option.intent.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::Alternative;

    fn classification(confidence: f64, alt_confidence: Option<f64>) -> Classification {
        let mut c = Classification::unclear();
        c.intent = intents::PRICE_QUESTION.into();
        c.confidence = confidence;
        if let Some(ac) = alt_confidence {
            c.alternatives = vec![Alternative {
                intent: intents::DEMO_REQUEST.into(),
                confidence: ac,
            }];
        }
        c
    }

    #[test]
    fn high_confidence_clear_gap_executes() {
        let engine = DisambiguationEngine::default();
        let outcome = engine.decide(&classification(0.9, Some(0.3)));
        assert_eq!(outcome.decision, DisambiguationDecision::Execute);
    }

    #[test]
    fn high_confidence_small_gap_confirms() {
        let engine = DisambiguationEngine::default();
        let outcome = engine.decide(&classification(0.9, Some(0.8)));
        assert_eq!(outcome.decision, DisambiguationDecision::Confirm);
        assert!(outcome.confirm_question.contains("стоимость"));
    }

    #[test]
    fn medium_confidence_clear_gap_executes() {
        let engine = DisambiguationEngine::default();
        let outcome = engine.decide(&classification(0.7, Some(0.4)));
        assert_eq!(outcome.decision, DisambiguationDecision::Execute);
    }

    #[test]
    fn medium_confidence_small_gap_confirms() {
        let engine = DisambiguationEngine::default();
        let outcome = engine.decide(&classification(0.7, Some(0.6)));
        assert_eq!(outcome.decision, DisambiguationDecision::Confirm);
    }

    #[test]
    fn low_confidence_disambiguates_with_other_option() {
        let engine = DisambiguationEngine::default();
        let outcome = engine.decide(&classification(0.5, Some(0.45)));
        assert_eq!(outcome.decision, DisambiguationDecision::Disambiguate);
        assert_eq!(outcome.options.last().unwrap().label, "Другое");
        assert!(outcome.question().contains("1."));
    }

    #[test]
    fn below_min_falls_back() {
        let engine = DisambiguationEngine::default();
        let outcome = engine.decide(&classification(0.2, None));
        assert_eq!(outcome.decision, DisambiguationDecision::Fallback);
    }

    #[test]
    fn no_alternatives_counts_as_clear_leader() {
        let engine = DisambiguationEngine::default();
        let outcome = engine.decide(&classification(0.7, None));
        assert_eq!(outcome.decision, DisambiguationDecision::Execute);
    }

    fn options() -> Vec<DisambiguationOption> {
        vec![
            DisambiguationOption {
                intent: intents::PRICE_QUESTION.into(),
                label: "Узнать цену".into(),
                confidence: 0.5,
            },
            DisambiguationOption {
                intent: intents::DEMO_REQUEST.into(),
                label: "Записаться на демо".into(),
                confidence: 0.4,
            },
            DisambiguationOption {
                intent: "other".into(),
                label: "Другое".into(),
                confidence: 0.0,
            },
        ]
    }

    #[test]
    fn numeric_index_resolves() {
        assert_eq!(
            resolve_option("1", &options()),
            OptionMatch::Selected(intents::PRICE_QUESTION.into())
        );
        assert_eq!(
            resolve_option("2.", &options()),
            OptionMatch::Selected(intents::DEMO_REQUEST.into())
        );
    }

    #[test]
    fn ordinal_word_resolves() {
        assert_eq!(
            resolve_option("первое", &options()),
            OptionMatch::Selected(intents::PRICE_QUESTION.into())
        );
    }

    #[test]
    fn exact_label_resolves() {
        assert_eq!(
            resolve_option("записаться на демо", &options()),
            OptionMatch::Selected(intents::DEMO_REQUEST.into())
        );
    }

    #[test]
    fn other_option_detected() {
        assert_eq!(resolve_option("3", &options()), OptionMatch::Other);
    }

    #[test]
    fn free_text_is_unmatched() {
        assert_eq!(
            resolve_option("а расскажите про интеграции", &options()),
            OptionMatch::Unmatched
        );
    }
}
