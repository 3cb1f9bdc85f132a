//! Tier 1: keyword/regex intent classification with data extraction.
//!
//! Rules are checked in priority order; every matching rule contributes
//! a candidate so the disambiguation engine can reason about the gap.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use sf_domain::intents;

use crate::objection::ObjectionHandler;

use super::{Alternative, Classification, ClassifyContext};

fn re(pattern: &str) -> Regex {
    Regex::new(&format!("(?iu){pattern}")).expect("static intent pattern")
}

// ── Extraction patterns ────────────────────────────────────────────

static PHONE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:\+?[78])[\s\-\(]?\d{3}[\s\-\)]?\d{3}[\s\-]?\d{2}[\s\-]?\d{2}").unwrap());
static CONTACT_NAME: Lazy<Regex> = Lazy::new(|| {
    re(r"(?:меня зовут|это)\s+([А-ЯЁ][а-яё]+(?:\s+[А-ЯЁ][а-яё]+(?:вич|вна|ич))?)|([А-ЯЁ][а-яё]+\s+[А-ЯЁ][а-яё]+(?:вич|вна))")
});
static COMPANY: Lazy<Regex> = Lazy::new(|| {
    re(r#"(?:компания|ооо|тоо|ип|фирма)\s*[«"]?([A-Za-zА-ЯЁа-яё][\w\-]+(?:\s+[A-Za-zА-ЯЁа-яё][\w\-]+)?)[»"]?"#)
});
static COMPANY_SIZE: Lazy<Regex> =
    Lazy::new(|| re(r"(\d{1,6})\s*(?:сотрудник|человек|работник|чел\b)"));
static BUDGET: Lazy<Regex> =
    Lazy::new(|| re(r"(\d[\d\s]*)\s*(млн|миллион\w*|тыс\w*|тенге|тг)"));
static TIMELINE: Lazy<Regex> =
    Lazy::new(|| re(r"(?:в течение|через|до конца)\s+(\w+\s*(?:недел|месяц|квартал|год)\w*)"));
static PAIN: Lazy<Regex> = Lazy::new(|| {
    re(r"(вручную|в\s+excel|в\s+экселе|теряем\s+\w+|путаница|не\s+успеваем|ручной\s+уч[её]т|хаос)")
});
static INDUSTRY: Lazy<Regex> = Lazy::new(|| {
    re(r"(ресторан|кафе|магазин|розниц\w*|опт\w*|производств\w*|салон|аптек\w*|склад)")
});

// ── Intent rules (priority order) ──────────────────────────────────

static RULES: Lazy<Vec<(&'static str, f64, Vec<Regex>)>> = Lazy::new(|| {
    vec![
        (
            intents::DEMO_REQUEST,
            0.9,
            vec![re(r"демо"), re(r"покажите\s+(?:систему|как)"), re(r"презентаци")],
        ),
        (
            intents::CALLBACK_REQUEST,
            0.9,
            vec![re(r"перезвон"), re(r"наберите\s+меня"), re(r"позвоните\s+мне")],
        ),
        (
            intents::REJECTION,
            0.9,
            vec![
                re(r"не\s+интересно"),
                re(r"не\s+пишите"),
                re(r"не\s+звоните"),
                re(r"отстаньте"),
                re(r"прекратите"),
                re(r"удалите\s+мой"),
            ],
        ),
        (
            intents::FAREWELL,
            0.85,
            vec![re(r"до\s+свидания"), re(r"всего\s+доброго"), re(r"^пока\W*$")],
        ),
        (
            intents::PRICE_QUESTION,
            0.9,
            vec![
                re(r"сколько\s+стоит"),
                re(r"\bцена\b"),
                re(r"стоимост"),
                re(r"тариф"),
                re(r"прайс"),
                re(r"почем"),
            ],
        ),
        (
            intents::QUESTION_INTEGRATIONS,
            0.85,
            vec![re(r"интеграц"), re(r"\b1с\b"), re(r"\bapi\b"), re(r"каспи")],
        ),
        (
            intents::QUESTION_FEATURES,
            0.8,
            vec![
                re(r"какие\s+функции"),
                re(r"что\s+умеет"),
                re(r"возможност"),
                re(r"что\s+входит"),
            ],
        ),
        (
            intents::COMPARISON,
            0.8,
            vec![re(r"чем\s+лучше"), re(r"чем\s+отличает"), re(r"сравни")],
        ),
        (
            intents::REQUEST_BREVITY,
            0.8,
            vec![re(r"^короче\b"), re(r"покороче"), re(r"в\s+двух\s+словах")],
        ),
        (
            intents::GRATITUDE,
            0.8,
            vec![re(r"спасибо"), re(r"благодарю")],
        ),
        (
            intents::GREETING,
            0.85,
            vec![
                re(r"^здравствуйте"),
                re(r"^добрый\s+(?:день|вечер|утро)"),
                re(r"^привет"),
            ],
        ),
        (
            intents::AGREEMENT,
            0.8,
            vec![
                re(r"^да\b"),
                re(r"^давайте\b"),
                re(r"^хорошо\b"),
                re(r"^ок(?:ей)?\b"),
                re(r"^согласен"),
                re(r"^согласна"),
                re(r"^продолжа"),
                re(r"^поехали"),
            ],
        ),
    ]
});

/// Extract structured data from a message.
pub fn extract_data(message: &str) -> Map<String, Value> {
    let mut data = Map::new();

    if let Some(m) = PHONE.find(message) {
        data.insert("contact_info".into(), Value::String(m.as_str().trim().to_owned()));
    }
    if let Some(caps) = CONTACT_NAME.captures(message) {
        if let Some(name) = caps.get(1).or_else(|| caps.get(2)) {
            data.insert("contact_name".into(), Value::String(name.as_str().to_owned()));
        }
    }
    if let Some(caps) = COMPANY.captures(message) {
        data.insert(
            "company_name".into(),
            Value::String(caps[1].trim().to_owned()),
        );
    }
    if let Some(caps) = COMPANY_SIZE.captures(message) {
        if let Ok(size) = caps[1].parse::<i64>() {
            data.insert("company_size".into(), Value::from(size));
        }
    }
    if let Some(caps) = BUDGET.captures(message) {
        data.insert(
            "budget_range".into(),
            Value::String(format!("{} {}", caps[1].trim(), &caps[2])),
        );
    }
    if let Some(caps) = TIMELINE.captures(message) {
        data.insert("timeline".into(), Value::String(caps[1].trim().to_owned()));
    }
    if let Some(caps) = PAIN.captures(message) {
        data.insert(
            "pain_points".into(),
            Value::Array(vec![Value::String(caps[1].to_lowercase())]),
        );
    }
    if let Some(caps) = INDUSTRY.captures(message) {
        data.insert("industry".into(), Value::String(caps[1].to_lowercase()));
    }

    data
}

/// Classify a message with the keyword tier.
///
/// Returns `None` when nothing matched strongly enough for this tier
/// (the cascade then falls through to LLM/semantic).
pub fn classify(message: &str, ctx: &ClassifyContext) -> Option<Classification> {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return Some(Classification::unclear());
    }

    let extracted = extract_data(trimmed);
    let mut candidates: Vec<(String, f64)> = Vec::new();

    // Contact data is the strongest signal of all.
    if extracted.contains_key("contact_info")
        || (extracted.contains_key("contact_name") && ctx.current_state != "greeting")
    {
        candidates.push((intents::CONTACT_PROVIDED.into(), 0.95));
    }

    // Objections share their pattern tables with the objection handler.
    if let Some(objection) = ObjectionHandler::detect_type_static(trimmed) {
        candidates.push((objection.intent().into(), 0.85));
    }

    for (intent, confidence, patterns) in RULES.iter() {
        if patterns.iter().any(|p| p.is_match(trimmed)) {
            candidates.push(((*intent).into(), *confidence));
        }
    }

    // Data-driven intents: the message *is* the answer to a SPIN probe.
    if candidates.is_empty() && !extracted.is_empty() {
        let intent = if extracted.contains_key("pain_points") {
            intents::PROBLEM_REVEALED
        } else if extracted.contains_key("company_name")
            || extracted.contains_key("company_size")
            || extracted.contains_key("industry")
        {
            intents::SITUATION_PROVIDED
        } else {
            intents::INFO_PROVIDED
        };
        candidates.push((intent.into(), 0.75));
    }

    if candidates.is_empty() {
        return None;
    }

    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let mut seen = std::collections::HashSet::new();
    candidates.retain(|(intent, _)| seen.insert(intent.clone()));
    let (intent, confidence) = candidates[0].clone();
    let alternatives: Vec<Alternative> = candidates[1..]
        .iter()
        .take(3)
        .map(|(i, c)| Alternative {
            intent: i.clone(),
            confidence: *c,
        })
        .collect();

    let all_scores = candidates.iter().cloned().collect();

    Some(Classification {
        intent,
        confidence,
        extracted_data: extracted,
        alternatives,
        method_used: "keyword".into(),
        reasoning: String::new(),
        all_scores,
        refinements: Vec::new(),
    })
}
