//! Per-violation sanitizers.
//!
//! Sentence-level where possible: a violating sentence is dropped, the
//! rest of the response survives.

use super::patterns::*;
use super::ValidationContext;

/// Apply the sanitizer for every detected violation, in order.
pub fn sanitize(response: &str, violations: &[String], ctx: &ValidationContext) -> String {
    let mut text = response.to_owned();
    for violation in violations {
        text = match violation.as_str() {
            "currency_locale" => sanitize_currency(&text),
            "opening_punctuation" => sanitize_opening(&text),
            "known_typos" => sanitize_typos(&text),
            "hallucinated_send_promise" => {
                drop_matching_sentences(&text, &[&SEND_PROMISE, &SEND_CAPABILITY])
            }
            "hallucinated_iin_status" => drop_matching_sentences(&text, &[&IIN_CONFIRMED]),
            "hallucinated_invoice_status" => drop_matching_sentences(&text, &[&INVOICE_READY]),
            "invoice_without_iin" => drop_matching_sentences(&text, &[&INVOICE_PROMISE]),
            "demo_without_contact" => drop_matching_sentences(&text, &[&DEMO_BOOKED]),
            "mid_conversation_greeting" => strip_greeting(&text),
            "meta_instruction_leak" => drop_matching_sentences(&text, &[&META_INSTRUCTION]),
            "iin_refusal_reask" => drop_matching_sentences(&text, &[&IIN_REASK]),
            "ungrounded_quant_claim" => drop_quant_sentences(&text, ctx),
            "ungrounded_guarantee" => drop_matching_sentences(&text, &[&UNGROUNDED_GUARANTEE]),
            "ungrounded_social_proof" => {
                drop_matching_sentences(&text, &[&UNGROUNDED_SOCIAL_PROOF])
            }
            _ => text,
        };
    }
    let trimmed = text.trim();
    if trimmed.is_empty() {
        // Everything got scrubbed; hand back a minimal safe line.
        "Давайте уточню детали, чтобы ничего не напутать.".to_owned()
    } else {
        trimmed.to_owned()
    }
}

fn sanitize_currency(text: &str) -> String {
    RUB_PATTERN.replace_all(text, "₸").into_owned()
}

fn sanitize_opening(text: &str) -> String {
    let without_leading = LEADING_ARTIFACT.replace(text, "").into_owned();
    without_leading.replace(". —", ".")
}

fn sanitize_typos(text: &str) -> String {
    let mut result = text.to_owned();
    for (typo, fixed) in KNOWN_TYPOS {
        result = result.replace(typo, fixed);
        // Preserve a capitalized first letter.
        let typo_capitalized = capitalize(typo);
        result = result.replace(&typo_capitalized, &capitalize(fixed));
    }
    result
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn strip_greeting(text: &str) -> String {
    let stripped = MID_CONV_GREETING.replace(text, "").into_owned();
    let stripped = stripped.trim_start_matches(['!', ',', '.', ' ']).to_owned();
    capitalize(&stripped)
}

/// Split into sentences and drop any that a pattern matches.
fn drop_matching_sentences(text: &str, patterns: &[&regex::Regex]) -> String {
    split_sentences(text)
        .into_iter()
        .filter(|sentence| !patterns.iter().any(|p| p.is_match(sentence)))
        .collect::<Vec<_>>()
        .join(" ")
}

fn drop_quant_sentences(text: &str, ctx: &ValidationContext) -> String {
    let blob = format!("{} {}", ctx.retrieved_facts, ctx.user_message).to_lowercase();
    split_sentences(text)
        .into_iter()
        .filter(|sentence| {
            !QUANT_CLAIM
                .find_iter(sentence)
                .any(|m| !blob.contains(&m.as_str().to_lowercase()))
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split on sentence-terminal punctuation, keeping the terminator.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                sentences.push(trimmed.to_owned());
            }
            current.clear();
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_owned());
    }
    sentences
}
