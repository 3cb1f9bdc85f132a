//! Refinement pipeline: ordered rewriters applied to a classification
//! before the state machine consumes it.
//!
//! Layer order is load-bearing and must not be reshuffled:
//! classification → composite → objection → confidence calibration →
//! first contact → data aware. Each layer is individually flag-gated
//! and records its decision for the trace.

use once_cell::sync::Lazy;
use regex::Regex;

use sf_domain::flags::Flags;
use sf_domain::intents;

use super::{Classification, ClassifyContext, RefinementDecision};

/// Hard ceiling: objections above this confidence are never rewritten.
const OBJECTION_REWRITE_CEILING: f64 = 0.90;

static INTERROGATIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?iu)\?|^(?:как|что|почему|какие|сколько)\b").unwrap());
static SHORT_AFFIRMATIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?iu)^(?:да|ага|угу|конечно|давайте|ок|окей)\W*$").unwrap());
static SHORT_NEGATIVE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?iu)^(?:нет|неа|не)\W*$").unwrap());
static GREETING_ONLY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?iu)^(?:привет|здравствуйте|добрый\s+(?:день|вечер|утро))[!.\s]*$").unwrap()
});
static DEMO_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?iu)демо|покажите").unwrap());

type Layer = fn(&str, &mut Classification, &ClassifyContext) -> Option<RefinementDecision>;

/// The published layer order with their gating flags.
const LAYERS: &[(&str, Layer)] = &[
    ("classification_refinement", classification_refinement),
    ("composite_refinement", composite_refinement),
    ("objection_refinement", objection_refinement),
    ("confidence_calibration", confidence_calibration),
    ("first_contact_refinement", first_contact_refinement),
    ("data_aware_refinement", data_aware_refinement),
];

/// Run every enabled layer in order, collecting decisions into the
/// classification itself.
pub fn run_pipeline(
    message: &str,
    classification: &mut Classification,
    ctx: &ClassifyContext,
    flags: &Flags,
) {
    for (flag, layer) in LAYERS {
        if !flags.is_enabled(flag) {
            continue;
        }
        if let Some(decision) = layer(message, classification, ctx) {
            tracing::debug!(
                layer = decision.layer,
                from = decision.from_intent,
                to = decision.to_intent,
                reason = decision.reason,
                "refinement applied"
            );
            classification.refinements.push(decision);
        }
    }
}

fn decision(layer: &str, from: &str, to: &str, reason: &str) -> RefinementDecision {
    RefinementDecision {
        layer: layer.into(),
        from_intent: from.into(),
        to_intent: to.into(),
        reason: reason.into(),
    }
}

/// Short replies carry little surface signal; context fills the gap.
/// "да" after a close question is agreement, not noise.
fn classification_refinement(
    message: &str,
    c: &mut Classification,
    ctx: &ClassifyContext,
) -> Option<RefinementDecision> {
    let trimmed = message.trim();
    if SHORT_AFFIRMATIVE.is_match(trimmed) && c.confidence < 0.85 {
        let from = c.intent.clone();
        c.intent = intents::AGREEMENT.into();
        c.confidence = 0.85;
        c.method_used = "context".into();
        return Some(decision(
            "classification_refinement",
            &from,
            intents::AGREEMENT,
            "short affirmative elevated by context",
        ));
    }
    if SHORT_NEGATIVE.is_match(trimmed) && c.intent == intents::UNCLEAR {
        let from = c.intent.clone();
        // A bare "нет" while data is being asked is refusal of the ask,
        // not a conversation-level rejection.
        let to = if ctx.missing_data.is_empty() {
            intents::REJECTION
        } else {
            intents::OBJECTION_NO_NEED
        };
        c.intent = to.into();
        c.confidence = c.confidence.max(0.7);
        return Some(decision(
            "classification_refinement",
            &from,
            to,
            "short negative resolved by context",
        ));
    }
    None
}

/// Composite messages: a secondary intent buried after the primary one
/// can dominate ("расскажите про цену, а лучше сразу покажите демо").
fn composite_refinement(
    message: &str,
    c: &mut Classification,
    _ctx: &ClassifyContext,
) -> Option<RefinementDecision> {
    if c.intent == intents::PRICE_QUESTION && DEMO_MARKER.is_match(message) {
        let from = c.intent.clone();
        c.intent = intents::DEMO_REQUEST.into();
        return Some(decision(
            "composite_refinement",
            &from,
            intents::DEMO_REQUEST,
            "demo request detected inside composite message",
        ));
    }
    None
}

/// Borderline objections phrased as questions are questions. A client
/// asking "почему так дорого?" wants the pricing rationale, not the
/// objection playbook.
fn objection_refinement(
    message: &str,
    c: &mut Classification,
    _ctx: &ClassifyContext,
) -> Option<RefinementDecision> {
    if !intents::is_objection(&c.intent) || c.confidence >= OBJECTION_REWRITE_CEILING {
        return None;
    }
    if !INTERROGATIVE.is_match(message.trim()) {
        return None;
    }
    let to = match c.intent.as_str() {
        intents::OBJECTION_PRICE => intents::PRICE_QUESTION,
        intents::OBJECTION_COMPETITOR => intents::COMPARISON,
        _ => return None,
    };
    let from = c.intent.clone();
    c.intent = to.into();
    Some(decision(
        "objection_refinement",
        &from,
        to,
        "interrogative objection rewritten to question",
    ))
}

/// Monotone squeeze of LLM self-reported confidence toward 0.5 to
/// compensate for systematic overconfidence.
fn confidence_calibration(
    _message: &str,
    c: &mut Classification,
    _ctx: &ClassifyContext,
) -> Option<RefinementDecision> {
    if c.method_used != "llm" {
        return None;
    }
    let calibrated = 0.5 + (c.confidence - 0.5) * 0.8;
    if (calibrated - c.confidence).abs() < f64::EPSILON {
        return None;
    }
    let reason = format!("calibrated {:.2} -> {:.2}", c.confidence, calibrated);
    c.confidence = calibrated;
    Some(decision(
        "confidence_calibration",
        &c.intent.clone(),
        &c.intent.clone(),
        &reason,
    ))
}

/// A bare greeting on the very first turn is a greeting even when the
/// surface classifier hedged.
fn first_contact_refinement(
    message: &str,
    c: &mut Classification,
    ctx: &ClassifyContext,
) -> Option<RefinementDecision> {
    if ctx.turn > 1 || c.intent != intents::UNCLEAR {
        return None;
    }
    if !GREETING_ONLY.is_match(message.trim()) {
        return None;
    }
    let from = c.intent.clone();
    c.intent = intents::GREETING.into();
    c.confidence = 0.8;
    Some(decision(
        "first_contact_refinement",
        &from,
        intents::GREETING,
        "bare greeting on first turn",
    ))
}

/// Unclear with non-empty extracted data means the message *was* the
/// answer; promote to info_provided.
fn data_aware_refinement(
    _message: &str,
    c: &mut Classification,
    _ctx: &ClassifyContext,
) -> Option<RefinementDecision> {
    if c.intent != intents::UNCLEAR || c.extracted_data.is_empty() {
        return None;
    }
    let from = c.intent.clone();
    c.intent = intents::INFO_PROVIDED.into();
    c.confidence = c.confidence.max(0.6);
    Some(decision(
        "data_aware_refinement",
        &from,
        intents::INFO_PROVIDED,
        "extracted data present, unclear promoted",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn unclear() -> Classification {
        Classification::unclear()
    }

    fn ctx() -> ClassifyContext {
        ClassifyContext {
            turn: 3,
            ..Default::default()
        }
    }

    #[test]
    fn short_affirmative_becomes_agreement() {
        let mut c = unclear();
        run_pipeline("да", &mut c, &ctx(), &Flags::new());
        assert_eq!(c.intent, intents::AGREEMENT);
        assert!(c.confidence >= 0.85);
        assert_eq!(c.refinements[0].layer, "classification_refinement");
    }

    #[test]
    fn interrogative_price_objection_rewritten() {
        let mut c = unclear();
        c.intent = intents::OBJECTION_PRICE.into();
        c.confidence = 0.8;
        run_pipeline("почему так дорого?", &mut c, &ctx(), &Flags::new());
        assert_eq!(c.intent, intents::PRICE_QUESTION);
    }

    #[test]
    fn confident_objection_not_rewritten() {
        let mut c = unclear();
        c.intent = intents::OBJECTION_PRICE.into();
        c.confidence = 0.95;
        run_pipeline("дорого как?!", &mut c, &ctx(), &Flags::new());
        assert_eq!(c.intent, intents::OBJECTION_PRICE);
    }

    #[test]
    fn data_promotes_unclear() {
        let mut c = unclear();
        c.extracted_data
            .insert("company_name".into(), Value::String("Ромашка".into()));
        run_pipeline("ну Ромашка мы", &mut c, &ctx(), &Flags::new());
        assert_eq!(c.intent, intents::INFO_PROVIDED);
    }

    #[test]
    fn llm_confidence_calibrated_monotone() {
        let mut high = unclear();
        high.method_used = "llm".into();
        high.confidence = 0.9;
        let mut low = unclear();
        low.method_used = "llm".into();
        low.confidence = 0.6;
        run_pipeline("любое", &mut high, &ctx(), &Flags::new());
        run_pipeline("любое", &mut low, &ctx(), &Flags::new());
        assert!(high.confidence > low.confidence);
        assert!(high.confidence < 0.9);
    }

    #[test]
    fn first_turn_greeting_promoted() {
        let mut c = unclear();
        let ctx = ClassifyContext {
            turn: 1,
            ..Default::default()
        };
        run_pipeline("Здравствуйте!", &mut c, &ctx, &Flags::new());
        assert_eq!(c.intent, intents::GREETING);
    }

    #[test]
    fn disabled_pipeline_is_inert() {
        let flags = Flags::new();
        flags.set_refinement_pipeline(false);
        let mut c = unclear();
        run_pipeline("да", &mut c, &ctx(), &flags);
        assert_eq!(c.intent, intents::UNCLEAR);
        assert!(c.refinements.is_empty());
    }

    #[test]
    fn composite_price_then_demo_swaps() {
        let mut c = unclear();
        c.intent = intents::PRICE_QUESTION.into();
        c.confidence = 0.9;
        run_pipeline(
            "сколько стоит? и покажите демо заодно",
            &mut c,
            &ctx(),
            &Flags::new(),
        );
        assert_eq!(c.intent, intents::DEMO_REQUEST);
    }
}
