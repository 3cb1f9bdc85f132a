//! Closed intent vocabulary and the derived intent sets.
//!
//! Intents are plain strings on the wire (snapshots, traces, flow
//! configs key transitions by them), so the vocabulary lives here as
//! `&'static str` constants plus membership helpers instead of an enum.

pub const GREETING: &str = "greeting";
pub const SITUATION_PROVIDED: &str = "situation_provided";
pub const PROBLEM_REVEALED: &str = "problem_revealed";
pub const IMPLICATION_ACKNOWLEDGED: &str = "implication_acknowledged";
pub const NEED_EXPRESSED: &str = "need_expressed";
pub const INFO_PROVIDED: &str = "info_provided";
pub const AGREEMENT: &str = "agreement";
pub const REJECTION: &str = "rejection";
pub const DEMO_REQUEST: &str = "demo_request";
pub const CALLBACK_REQUEST: &str = "callback_request";
pub const CONSULTATION_REQUEST: &str = "consultation_request";
pub const CONTACT_PROVIDED: &str = "contact_provided";
pub const PRICE_QUESTION: &str = "price_question";
pub const PRICING_DETAILS: &str = "pricing_details";
pub const QUESTION_FEATURES: &str = "question_features";
pub const QUESTION_INTEGRATIONS: &str = "question_integrations";
pub const COMPARISON: &str = "comparison";
pub const REQUEST_BREVITY: &str = "request_brevity";
pub const GRATITUDE: &str = "gratitude";
pub const SMALL_TALK: &str = "small_talk";
pub const FAREWELL: &str = "farewell";
pub const UNCLEAR: &str = "unclear";
pub const NEEDS_CLARIFICATION: &str = "needs_clarification";
pub const DISAMBIGUATION_NEEDED: &str = "disambiguation_needed";

pub const OBJECTION_PRICE: &str = "objection_price";
pub const OBJECTION_COMPETITOR: &str = "objection_competitor";
pub const OBJECTION_NO_TIME: &str = "objection_no_time";
pub const OBJECTION_THINK: &str = "objection_think";
pub const OBJECTION_NO_NEED: &str = "objection_no_need";
pub const OBJECTION_TRUST: &str = "objection_trust";
pub const OBJECTION_TIMING: &str = "objection_timing";
pub const OBJECTION_COMPLEXITY: &str = "objection_complexity";

/// All objection intents plus the hard rejections; these turns always
/// classify as funnel regress.
pub const REGRESS_INTENTS: &[&str] = &[
    OBJECTION_PRICE,
    OBJECTION_COMPETITOR,
    OBJECTION_NO_TIME,
    OBJECTION_THINK,
    OBJECTION_TIMING,
    OBJECTION_COMPLEXITY,
    OBJECTION_NO_NEED,
    OBJECTION_TRUST,
    REJECTION,
    FAREWELL,
];

pub const OBJECTION_INTENTS: &[&str] = &[
    OBJECTION_PRICE,
    OBJECTION_COMPETITOR,
    OBJECTION_NO_TIME,
    OBJECTION_THINK,
    OBJECTION_NO_NEED,
    OBJECTION_TRUST,
    OBJECTION_TIMING,
    OBJECTION_COMPLEXITY,
];

pub const POSITIVE_INTENTS: &[&str] = &[
    AGREEMENT,
    DEMO_REQUEST,
    CALLBACK_REQUEST,
    CONSULTATION_REQUEST,
    CONTACT_PROVIDED,
    NEED_EXPRESSED,
    GRATITUDE,
];

pub const QUESTION_INTENTS: &[&str] = &[
    QUESTION_FEATURES,
    QUESTION_INTEGRATIONS,
    PRICE_QUESTION,
    PRICING_DETAILS,
    COMPARISON,
    CONSULTATION_REQUEST,
];

/// Intents indicating forward movement through the funnel.
pub const PROGRESS_INTENTS: &[&str] = &[
    AGREEMENT,
    DEMO_REQUEST,
    CALLBACK_REQUEST,
    CONTACT_PROVIDED,
    SITUATION_PROVIDED,
    PROBLEM_REVEALED,
    IMPLICATION_ACKNOWLEDGED,
    NEED_EXPRESSED,
    INFO_PROVIDED,
];

/// Intents that interrupt an active disambiguation sub-dialogue.
pub const CRITICAL_INTENTS: &[&str] = &[CONTACT_PROVIDED, REJECTION, DEMO_REQUEST];

pub fn is_objection(intent: &str) -> bool {
    OBJECTION_INTENTS.contains(&intent)
}

pub fn is_regress(intent: &str) -> bool {
    REGRESS_INTENTS.contains(&intent)
}

pub fn is_progress(intent: &str) -> bool {
    PROGRESS_INTENTS.contains(&intent)
}

pub fn is_question(intent: &str) -> bool {
    QUESTION_INTENTS.contains(&intent)
}

pub fn is_critical(intent: &str) -> bool {
    CRITICAL_INTENTS.contains(&intent)
}

/// User-facing labels for disambiguation options.
pub fn label(intent: &str) -> &str {
    match intent {
        PRICE_QUESTION => "Узнать цену",
        PRICING_DETAILS => "Детали тарифов",
        OBJECTION_PRICE => "Обсудить стоимость",
        QUESTION_FEATURES => "Узнать о функциях",
        QUESTION_INTEGRATIONS => "Об интеграциях",
        COMPARISON => "Сравнить с другими",
        DEMO_REQUEST => "Записаться на демо",
        CALLBACK_REQUEST => "Заказать звонок",
        CONSULTATION_REQUEST => "Получить консультацию",
        CONTACT_PROVIDED => "Оставить контакт",
        OBJECTION_NO_TIME => "Нет времени сейчас",
        OBJECTION_TIMING => "Обсудить сроки",
        OBJECTION_THINK => "Нужно подумать",
        OBJECTION_COMPETITOR => "Сравнить с конкурентом",
        OBJECTION_COMPLEXITY => "Обсудить сложность",
        OBJECTION_TRUST => "Узнать о надёжности",
        OBJECTION_NO_NEED => "Объяснить зачем нужно",
        SITUATION_PROVIDED => "Рассказать о компании",
        PROBLEM_REVEALED => "Обсудить проблемы",
        NEED_EXPRESSED => "Обсудить потребности",
        REQUEST_BREVITY => "Короткий ответ",
        AGREEMENT => "Продолжить",
        REJECTION => "Завершить разговор",
        UNCLEAR => "Уточнить вопрос",
        GREETING => "Поздороваться",
        SMALL_TALK => "Поболтать",
        GRATITUDE => "Поблагодарить",
        FAREWELL => "Попрощаться",
        other => other,
    }
}
