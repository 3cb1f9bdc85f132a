//! Tone analysis vocabulary and result types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Emotional tone of a user message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Neutral,
    Positive,
    Frustrated,
    Skeptical,
    Rushed,
    Confused,
    Interested,
}

impl Tone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tone::Neutral => "neutral",
            Tone::Positive => "positive",
            Tone::Frustrated => "frustrated",
            Tone::Skeptical => "skeptical",
            Tone::Rushed => "rushed",
            Tone::Confused => "confused",
            Tone::Interested => "interested",
        }
    }

    pub fn from_str(s: &str) -> Option<Tone> {
        match s {
            "neutral" => Some(Tone::Neutral),
            "positive" => Some(Tone::Positive),
            "frustrated" => Some(Tone::Frustrated),
            "skeptical" => Some(Tone::Skeptical),
            "rushed" => Some(Tone::Rushed),
            "confused" => Some(Tone::Confused),
            "interested" => Some(Tone::Interested),
            _ => None,
        }
    }

    /// Tones that accumulate frustration.
    pub fn is_negative(&self) -> bool {
        matches!(
            self,
            Tone::Frustrated | Tone::Rushed | Tone::Skeptical | Tone::Confused
        )
    }
}

/// Communication style of a user message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Style {
    Formal,
    Informal,
}

/// How urgently the dialogue needs steering toward de-escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionUrgency {
    None,
    Low,
    Medium,
    High,
    Critical,
}

/// Result of one tone analysis pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToneAnalysis {
    pub tone: Tone,
    pub style: Style,
    pub confidence: f64,
    /// Accumulated frustration level, `[0, MAX_FRUSTRATION]`.
    pub frustration_level: i32,
    /// Raw matched signals, as `"tone:pattern"` strings.
    #[serde(default)]
    pub signals: Vec<String>,
    /// Which cascade tier produced the final tone.
    pub tier_used: String,
    #[serde(default)]
    pub tier_scores: HashMap<String, f64>,
    #[serde(default)]
    pub latency_ms: f64,
    /// Signals matched for the primary tone (drives intensity).
    #[serde(default)]
    pub signal_count: usize,
    #[serde(default)]
    pub pre_intervention_triggered: bool,
    pub intervention_urgency: InterventionUrgency,
    #[serde(default)]
    pub should_offer_exit: bool,
    #[serde(default)]
    pub consecutive_negative_turns: u32,
}

impl ToneAnalysis {
    /// A neutral analysis with no signals, used when tone analysis is
    /// disabled or fails.
    pub fn neutral(frustration_level: i32) -> Self {
        Self {
            tone: Tone::Neutral,
            style: Style::Formal,
            confidence: 0.3,
            frustration_level,
            signals: Vec::new(),
            tier_used: "fallback".into(),
            tier_scores: HashMap::new(),
            latency_ms: 0.0,
            signal_count: 0,
            pre_intervention_triggered: false,
            intervention_urgency: InterventionUrgency::None,
            should_offer_exit: false,
            consecutive_negative_turns: 0,
        }
    }
}

/// Guidance for the response generator derived from a tone analysis.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseGuidance {
    pub max_words: usize,
    pub tone_instruction: String,
    pub style_instruction: String,
    pub should_apologize: bool,
    pub should_offer_exit: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tone_round_trips_through_str() {
        for tone in [
            Tone::Neutral,
            Tone::Positive,
            Tone::Frustrated,
            Tone::Skeptical,
            Tone::Rushed,
            Tone::Confused,
            Tone::Interested,
        ] {
            assert_eq!(Tone::from_str(tone.as_str()), Some(tone));
        }
        assert_eq!(Tone::from_str("sarcastic"), None);
    }

    #[test]
    fn urgency_is_ordered() {
        assert!(InterventionUrgency::Critical > InterventionUrgency::High);
        assert!(InterventionUrgency::Low > InterventionUrgency::None);
    }
}
