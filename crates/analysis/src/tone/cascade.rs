//! Cascade orchestration across the three tone tiers.

use std::sync::Arc;
use std::time::Instant;

use sf_domain::flags::Flags;
use sf_domain::frustration::FrustrationThresholds;
use sf_domain::tone::{InterventionUrgency, ResponseGuidance, Tone, ToneAnalysis};

use super::frustration::{FrustrationState, FrustrationTracker};
use super::llm_tier::LlmToneAnalyzer;
use super::regex_tier::RegexToneAnalyzer;
use super::semantic_tier::SemanticToneAnalyzer;

/// Tier-1 confidence at which the cascade short-circuits.
const TIER1_HIGH_CONFIDENCE: f64 = 0.85;
/// Minimum tier-2 confidence to return.
const TIER2_THRESHOLD: f64 = 0.70;
/// Minimum tier-3 confidence to return.
const TIER3_THRESHOLD: f64 = 0.65;
/// Below this, the result is forced to neutral.
const MIN_CONFIDENCE: f64 = 0.30;

/// Cascaded tone analyzer with a shared frustration tracker.
pub struct CascadeToneAnalyzer {
    frustration: FrustrationTracker,
    semantic: Option<Arc<SemanticToneAnalyzer>>,
    llm: Option<LlmToneAnalyzer>,
}

impl CascadeToneAnalyzer {
    pub fn new(thresholds: FrustrationThresholds) -> Self {
        Self {
            frustration: FrustrationTracker::new(thresholds),
            semantic: None,
            llm: None,
        }
    }

    /// Attach the semantic tier (gated by `tone_semantic_tier2`).
    pub fn with_semantic(mut self, semantic: Arc<SemanticToneAnalyzer>) -> Self {
        self.semantic = Some(semantic);
        self
    }

    /// Attach the LLM tier (gated by `tone_llm_tier3`).
    pub fn with_llm(mut self, llm: LlmToneAnalyzer) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn frustration_level(&self) -> i32 {
        self.frustration.level()
    }

    pub fn thresholds(&self) -> &FrustrationThresholds {
        self.frustration.thresholds()
    }

    /// Analyze one message through the cascade.
    pub async fn analyze(&mut self, message: &str, flags: &Flags) -> ToneAnalysis {
        let start = Instant::now();

        // Tier 1 always runs and updates the shared tracker.
        let tier1 = RegexToneAnalyzer::analyze(message, &mut self.frustration);
        if !tier1.signals.is_empty() && tier1.confidence >= TIER1_HIGH_CONFIDENCE {
            tracing::debug!(
                tone = tier1.tone.as_str(),
                confidence = tier1.confidence,
                "tier 1 fast path"
            );
            return tier1;
        }

        // Tier 2: semantic.
        let mut tier2 = None;
        if flags.tone_semantic_tier2() {
            if let Some(semantic) = self.semantic.as_ref().filter(|s| s.is_available()) {
                tier2 = semantic.analyze(message).await;
                if let Some((tone, confidence, scores)) = tier2.clone() {
                    if confidence as f64 >= TIER2_THRESHOLD {
                        self.frustration.update(tone, 1);
                        return self.assemble(
                            tone,
                            confidence as f64,
                            "semantic",
                            scores,
                            &tier1,
                            start,
                        );
                    }
                }
            }
        }

        // Tier 3: LLM.
        let mut tier3 = None;
        if flags.tone_llm_tier3() {
            if let Some(llm) = &self.llm {
                tier3 = llm.analyze(message).await;
                if let Some((tone, confidence)) = tier3 {
                    if confidence >= TIER3_THRESHOLD {
                        self.frustration.update(tone, 1);
                        let scores =
                            std::collections::HashMap::from([(tone.as_str().to_owned(), confidence)]);
                        return self.assemble(tone, confidence, "llm", scores, &tier1, start);
                    }
                }
            }
        }

        // Nothing cleared its threshold: best candidate wins, below the
        // minimum it degrades to neutral.
        let mut candidates = vec![(tier1.tone, tier1.confidence, "regex")];
        if let Some((tone, confidence, _)) = tier2 {
            candidates.push((tone, confidence as f64, "semantic"));
        }
        if let Some((tone, confidence)) = tier3 {
            candidates.push((tone, confidence, "llm"));
        }
        let (mut best_tone, best_confidence, mut best_tier) = candidates
            .into_iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .unwrap_or((Tone::Neutral, 0.0, "fallback"));

        if best_confidence < MIN_CONFIDENCE {
            best_tone = Tone::Neutral;
            best_tier = "fallback";
        }

        // Tier 1 already fed the tracker with its own tone; only a
        // different final tone changes the accumulator.
        if best_tone != tier1.tone {
            self.frustration.update(best_tone, 1);
        }

        self.assemble(
            best_tone,
            best_confidence,
            best_tier,
            tier1.tier_scores.clone(),
            &tier1,
            start,
        )
    }

    fn assemble(
        &self,
        tone: Tone,
        confidence: f64,
        tier_used: &str,
        tier_scores: std::collections::HashMap<String, f64>,
        tier1: &ToneAnalysis,
        start: Instant,
    ) -> ToneAnalysis {
        ToneAnalysis {
            tone,
            style: tier1.style,
            confidence,
            frustration_level: self.frustration.level(),
            signals: tier1.signals.clone(),
            tier_used: tier_used.into(),
            tier_scores,
            latency_ms: start.elapsed().as_secs_f64() * 1000.0,
            signal_count: tier1.signal_count,
            pre_intervention_triggered: self.frustration.pre_intervention_triggered(),
            intervention_urgency: self.frustration.intervention_urgency(),
            should_offer_exit: self.frustration.should_offer_exit(),
            consecutive_negative_turns: self.frustration.consecutive_negative_turns(),
        }
    }

    /// Derive generation guidance from an analysis.
    ///
    /// Urgency drives brevity; apology only for frustration actually
    /// directed at the bot (skeptics get facts, not apologies).
    pub fn response_guidance(&self, analysis: &ToneAnalysis) -> ResponseGuidance {
        let mut guidance = ResponseGuidance {
            max_words: 50,
            ..Default::default()
        };
        guidance.style_instruction = match analysis.style {
            sf_domain::tone::Style::Informal => {
                "Пиши дружелюбно и неформально, без канцелярита.".into()
            }
            sf_domain::tone::Style::Formal => "Пиши вежливо и по-деловому.".into(),
        };

        match analysis.intervention_urgency {
            InterventionUrgency::Critical => {
                guidance.max_words = 20;
                guidance.tone_instruction =
                    "Будь максимально кратким. Одно предложение. Извинись и предложи завершить разговор."
                        .into();
                guidance.should_apologize = true;
                guidance.should_offer_exit = true;
            }
            InterventionUrgency::High => {
                guidance.max_words = 25;
                guidance.tone_instruction =
                    "Будь максимально кратким и по делу. Не задавай лишних вопросов. Извинись за неудобства."
                        .into();
                guidance.should_apologize = true;
                guidance.should_offer_exit = true;
            }
            InterventionUrgency::Medium => {
                guidance.max_words = 35;
                if analysis.tone == Tone::Skeptical {
                    guidance.tone_instruction =
                        "Будь кратким и деловым. Приведи конкретные факты и цифры. Не извиняйся."
                            .into();
                } else {
                    guidance.tone_instruction =
                        "Будь кратким и деловым. Признай возможные неудобства.".into();
                    guidance.should_apologize = analysis.tone == Tone::Frustrated;
                    guidance.should_offer_exit = analysis.tone == Tone::Rushed;
                }
            }
            InterventionUrgency::Low => {
                guidance.max_words = 45;
                guidance.tone_instruction =
                    "Будь немного более кратким. Клиент может быть слегка раздражён.".into();
            }
            InterventionUrgency::None => {
                if analysis.pre_intervention_triggered {
                    guidance.max_words = 30;
                    guidance.tone_instruction =
                        "Клиент торопится. Отвечай коротко, без воды и вступлений.".into();
                    guidance.should_offer_exit = true;
                } else {
                    match analysis.tone {
                        Tone::Rushed => {
                            guidance.max_words = 30;
                            guidance.tone_instruction =
                                "Коротко и по делу, без вступлений и воды.".into();
                            guidance.should_offer_exit = analysis.signal_count >= 2;
                        }
                        Tone::Skeptical => {
                            guidance.tone_instruction =
                                "Приведи конкретные факты и цифры. Не используй общие фразы."
                                    .into();
                        }
                        Tone::Confused => {
                            guidance.tone_instruction =
                                "Объясни просто и понятно. Используй короткие предложения и примеры."
                                    .into();
                        }
                        Tone::Positive | Tone::Interested => {
                            guidance.max_words = 60;
                            guidance.tone_instruction =
                                "Клиент настроен позитивно. Поддержи настрой, дай полезную информацию."
                                    .into();
                        }
                        _ => {}
                    }
                }
            }
        }

        guidance
    }

    pub fn reset(&mut self) {
        self.frustration.reset();
    }

    pub fn to_state(&self) -> FrustrationState {
        self.frustration.to_state()
    }

    pub fn load_state(&mut self, state: FrustrationState) {
        self.frustration.load_state(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer() -> CascadeToneAnalyzer {
        CascadeToneAnalyzer::new(FrustrationThresholds::default())
    }

    #[tokio::test]
    async fn strong_regex_signal_short_circuits() {
        let mut a = analyzer();
        let flags = Flags::new();
        let result = a.analyze("меня это бесит, сколько можно", &flags).await;
        assert_eq!(result.tier_used, "regex");
        assert_eq!(result.tone, Tone::Frustrated);
    }

    #[tokio::test]
    async fn neutral_message_falls_through_to_neutral() {
        let mut a = analyzer();
        let flags = Flags::new();
        let result = a.analyze("у нас ресторан на 40 посадочных мест", &flags).await;
        assert_eq!(result.tone, Tone::Neutral);
        // 0.30 meets MIN_CONFIDENCE exactly; tier stays regex.
        assert_eq!(result.tier_used, "regex");
    }

    #[tokio::test]
    async fn frustration_accumulates_across_turns() {
        let mut a = analyzer();
        let flags = Flags::new();
        a.analyze("быстрее, не тяни, некогда", &flags).await;
        let second = a.analyze("ну сколько можно, надоело ждать", &flags).await;
        assert!(second.frustration_level >= 7);
    }

    #[tokio::test]
    async fn guidance_shortens_under_high_urgency() {
        let mut a = analyzer();
        let flags = Flags::new();
        a.analyze("быстрее, не тяни, некогда", &flags).await;
        let result = a.analyze("ну быстрее же, не тяни", &flags).await;
        let guidance = a.response_guidance(&result);
        assert!(guidance.max_words <= 25);
        assert!(guidance.should_offer_exit);
    }
}
