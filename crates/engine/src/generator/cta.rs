//! Call-to-action suffixes appended in late-funnel states.

use serde_json::{Map, Value};

/// States where a CTA suffix is appropriate.
const CTA_STATES: &[&str] = &["presentation", "spin_need_payoff", "close"];

/// Actions that already carry their own ask; no CTA on top.
const CTA_EXEMPT_ACTIONS: &[&str] = &["soft_close", "book_demo", "confirm_success", "ask_missing_data"];

/// Pick a single CTA for the state, or `None`.
///
/// Suppressed when the response already asks a question, when the
/// previous action was the same CTA-ish ask, or when the client is
/// visibly frustrated.
pub fn build_cta(
    state: &str,
    action: &str,
    response: &str,
    collected_data: &Map<String, Value>,
    frustration_level: i32,
    last_action: &str,
) -> Option<String> {
    if !CTA_STATES.contains(&state) || CTA_EXEMPT_ACTIONS.contains(&action) {
        return None;
    }
    if frustration_level >= 5 {
        return None;
    }
    if response.trim_end().ends_with('?') {
        return None;
    }
    if last_action == "book_demo" {
        return None;
    }

    let has_contact = collected_data
        .get("contact_info")
        .map(|v| !v.is_null())
        .unwrap_or(false);

    let cta = if state == "close" && !has_contact {
        "Оставите номер для связи — договоримся о времени?"
    } else if !has_contact {
        "Кстати, могу показать всё на коротком демо — интересно?"
    } else {
        "Удобно будет созвониться завтра, чтобы обсудить детали?"
    };

    Some(cta.to_owned())
}

/// Append the CTA as a separate sentence.
pub fn apply_cta(response: &str, cta: Option<String>) -> String {
    match cta {
        Some(cta) => format!("{} {cta}", response.trim_end()),
        None => response.to_owned(),
    }
}
