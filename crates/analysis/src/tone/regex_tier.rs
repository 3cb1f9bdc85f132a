//! Tier 1: marker-based tone analysis.
//!
//! Counts every matching marker (no early break — the count drives the
//! intensity multiplier), picks the primary tone by fixed priority, and
//! derives communication style and confidence.

use std::collections::HashMap;
use std::time::Instant;

use sf_domain::tone::{Style, Tone, ToneAnalysis};

use super::frustration::FrustrationTracker;
use super::markers::{INFORMAL_MARKERS, TONE_MARKERS};

/// Priority used to pick the primary tone when several are detected.
/// Frustration always wins; it is the one we must react to.
const TONE_PRIORITY: [Tone; 6] = [
    Tone::Frustrated,
    Tone::Rushed,
    Tone::Skeptical,
    Tone::Confused,
    Tone::Positive,
    Tone::Interested,
];

const BASE_CONFIDENCE: f64 = 0.80;
const SIGNAL_BOOST: f64 = 0.05;
const MAX_CONFIDENCE: f64 = 0.95;
const NO_SIGNAL_CONFIDENCE: f64 = 0.30;

pub struct RegexToneAnalyzer;

impl RegexToneAnalyzer {
    /// Analyze one message, updating the shared frustration tracker.
    pub fn analyze(message: &str, frustration: &mut FrustrationTracker) -> ToneAnalysis {
        let start = Instant::now();
        let lower = message.to_lowercase();

        let mut signals: Vec<String> = Vec::new();
        let mut tone_scores: HashMap<Tone, usize> = HashMap::new();

        for (tone, patterns) in TONE_MARKERS.iter() {
            for pattern in patterns {
                if pattern.is_match(&lower) {
                    *tone_scores.entry(*tone).or_insert(0) += 1;
                    signals.push(format!("{}:{}", tone.as_str(), pattern.as_str()));
                }
            }
        }

        let primary = TONE_PRIORITY
            .iter()
            .copied()
            .find(|t| tone_scores.contains_key(t))
            .unwrap_or(Tone::Neutral);

        let style = detect_style(&lower);
        let primary_signal_count = tone_scores.get(&primary).copied().unwrap_or(1);

        frustration.update(primary, primary_signal_count);

        let confidence = if signals.is_empty() {
            NO_SIGNAL_CONFIDENCE
        } else {
            (BASE_CONFIDENCE + signals.len() as f64 * SIGNAL_BOOST).min(MAX_CONFIDENCE)
        };

        if frustration.is_warning() {
            tracing::warn!(
                frustration_level = frustration.level(),
                tone = primary.as_str(),
                signals = signals.len(),
                "elevated frustration detected"
            );
        }

        ToneAnalysis {
            tone: primary,
            style,
            confidence,
            frustration_level: frustration.level(),
            tier_scores: tone_scores
                .iter()
                .map(|(t, s)| (t.as_str().to_owned(), *s as f64))
                .collect(),
            signals,
            tier_used: "regex".into(),
            latency_ms: start.elapsed().as_secs_f64() * 1000.0,
            signal_count: primary_signal_count,
            pre_intervention_triggered: frustration.pre_intervention_triggered(),
            intervention_urgency: frustration.intervention_urgency(),
            should_offer_exit: frustration.should_offer_exit(),
            consecutive_negative_turns: frustration.consecutive_negative_turns(),
        }
    }
}

/// Informal when two markers match, or one marker in a short message.
fn detect_style(lower: &str) -> Style {
    let informal_count = INFORMAL_MARKERS.iter().filter(|p| p.is_match(lower)).count();
    if informal_count >= 2 || (informal_count >= 1 && lower.chars().count() < 50) {
        Style::Informal
    } else {
        Style::Formal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sf_domain::frustration::FrustrationThresholds;
    use sf_domain::tone::InterventionUrgency;

    fn tracker() -> FrustrationTracker {
        FrustrationTracker::new(FrustrationThresholds::default())
    }

    #[test]
    fn frustrated_beats_positive_in_priority() {
        let mut f = tracker();
        let result = RegexToneAnalyzer::analyze("отлично, но меня это уже бесит", &mut f);
        assert_eq!(result.tone, Tone::Frustrated);
    }

    #[test]
    fn no_signals_gives_low_confidence_neutral() {
        let mut f = tracker();
        let result = RegexToneAnalyzer::analyze("у нас 120 сотрудников", &mut f);
        assert_eq!(result.tone, Tone::Neutral);
        assert!((result.confidence - 0.30).abs() < 1e-9);
        assert!(result.signals.is_empty());
    }

    #[test]
    fn confidence_grows_with_signals_and_caps() {
        let mut f = tracker();
        let result = RegexToneAnalyzer::analyze("быстрее, не тяни, некогда, срочно", &mut f);
        assert!(result.confidence <= 0.95);
        assert!(result.confidence >= 0.80 + 0.05 * 3.0 - 1e-9);
    }

    #[test]
    fn triple_rushed_message_counts_all_signals() {
        let mut f = tracker();
        let result = RegexToneAnalyzer::analyze("быстрее, не тяни, некогда", &mut f);
        assert_eq!(result.tone, Tone::Rushed);
        assert_eq!(result.signal_count, 3);
        assert_eq!(result.frustration_level, 4);
        assert!(result.pre_intervention_triggered);
        assert_eq!(result.intervention_urgency, InterventionUrgency::High);
        assert!(result.should_offer_exit);
    }

    #[test]
    fn short_informal_message_detected() {
        let mut f = tracker();
        let result = RegexToneAnalyzer::analyze("окей, давай", &mut f);
        assert_eq!(result.style, Style::Informal);
    }

    #[test]
    fn long_formal_message_stays_formal() {
        let mut f = tracker();
        let result = RegexToneAnalyzer::analyze(
            "Добрый день. Мы рассматриваем систему автоматизации для нашего отдела продаж.",
            &mut f,
        );
        assert_eq!(result.style, Style::Formal);
    }
}
