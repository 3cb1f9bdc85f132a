//! Objection detection and handling.
//!
//! Tier 1 matches ordered regex pattern tables with a fixed priority
//! across types; tier 2 (flag-gated) falls back to the semantic intent
//! classifier filtered to objection intents. Strategies follow the 4Ps
//! framework for rational objections and 3Fs for emotional ones, with
//! per-type attempt budgets and soft-close exhaustion.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use sf_domain::intents;

use crate::intent::semantic_tier::SemanticIntentClassifier;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Objection categories, each with its own handling strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectionType {
    Price,
    Competitor,
    NoTime,
    Think,
    NoNeed,
    Trust,
    Timing,
    Complexity,
}

impl ObjectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectionType::Price => "price",
            ObjectionType::Competitor => "competitor",
            ObjectionType::NoTime => "no_time",
            ObjectionType::Think => "think",
            ObjectionType::NoNeed => "no_need",
            ObjectionType::Trust => "trust",
            ObjectionType::Timing => "timing",
            ObjectionType::Complexity => "complexity",
        }
    }

    /// The intent name carried by this objection type.
    pub fn intent(&self) -> &'static str {
        match self {
            ObjectionType::Price => intents::OBJECTION_PRICE,
            ObjectionType::Competitor => intents::OBJECTION_COMPETITOR,
            ObjectionType::NoTime => intents::OBJECTION_NO_TIME,
            ObjectionType::Think => intents::OBJECTION_THINK,
            ObjectionType::NoNeed => intents::OBJECTION_NO_NEED,
            ObjectionType::Trust => intents::OBJECTION_TRUST,
            ObjectionType::Timing => intents::OBJECTION_TIMING,
            ObjectionType::Complexity => intents::OBJECTION_COMPLEXITY,
        }
    }

    pub fn from_intent(intent: &str) -> Option<ObjectionType> {
        match intent {
            intents::OBJECTION_PRICE => Some(ObjectionType::Price),
            intents::OBJECTION_COMPETITOR => Some(ObjectionType::Competitor),
            intents::OBJECTION_NO_TIME => Some(ObjectionType::NoTime),
            intents::OBJECTION_THINK => Some(ObjectionType::Think),
            intents::OBJECTION_NO_NEED => Some(ObjectionType::NoNeed),
            intents::OBJECTION_TRUST => Some(ObjectionType::Trust),
            intents::OBJECTION_TIMING => Some(ObjectionType::Timing),
            intents::OBJECTION_COMPLEXITY => Some(ObjectionType::Complexity),
        _ => None,
        }
    }
}

/// Multi-match resolution order. THINK before NO_NEED so "нужно
/// подумать" lands on THINK.
const PRIORITY_ORDER: [ObjectionType; 8] = [
    ObjectionType::Price,
    ObjectionType::Think,
    ObjectionType::NoNeed,
    ObjectionType::Competitor,
    ObjectionType::NoTime,
    ObjectionType::Trust,
    ObjectionType::Timing,
    ObjectionType::Complexity,
];

/// Handling frameworks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectionFramework {
    /// Pause → Probe → Present → Proceed, for rational objections.
    FourPs,
    /// Feel → Felt → Found, for emotional objections.
    ThreeFs,
}

/// A handling strategy for one objection type.
#[derive(Debug, Clone)]
pub struct ObjectionStrategy {
    pub framework: ObjectionFramework,
    pub response_template: &'static str,
    pub follow_up_question: &'static str,
    pub max_attempts: u32,
    pub can_soft_close: bool,
}

/// Outcome of handling one message's objection.
#[derive(Debug, Clone)]
pub struct ObjectionResult {
    pub objection_type: ObjectionType,
    pub strategy: Option<ObjectionStrategy>,
    pub attempt_number: u32,
    pub should_soft_close: bool,
    pub response_parts: HashMap<String, String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pattern tables
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(&format!("(?iu){p}")).expect("static objection pattern"))
        .collect()
}

static PATTERNS: Lazy<Vec<(ObjectionType, Vec<Regex>)>> = Lazy::new(|| {
    vec![
        (
            ObjectionType::Price,
            compile(&[
                r"дорог",
                r"дешевл",
                r"скидк",
                r"бюджет\s+не",
                r"денег\s+нет",
                r"не\s+потянем",
                r"накладн",
                r"неподъ[её]м",
                r"не\s+по\s+карман",
                r"завышен",
                r"переплат",
                r"не\s+окуп",
                r"не\s+тянем",
            ]),
        ),
        (
            ObjectionType::Think,
            compile(&[
                r"подума",
                r"посоветова",
                r"обсуди",
                r"согласова",
                r"посовещ",
                r"взвес",
                r"прикин",
            ]),
        ),
        (
            ObjectionType::NoNeed,
            compile(&[
                r"не\s+нужн",
                r"не\s+надо",
                r"обойд[её]мся",
                r"справляемся",
                r"справимся",
                r"хватает",
                r"устраивает",
                r"и\s+так\s+норм",
                r"вс[её]\s+работает",
                r"и\s+так\s+работает",
                r"нет\s+проблем",
            ]),
        ),
        (
            ObjectionType::Competitor,
            compile(&[
                r"уже\s+есть",
                r"уже\s+пользу",
                r"используем",
                r"работаем\s+в",
                r"внедрили",
                r"перешли\s+на",
                r"подключили",
                r"битрикс",
                r"\bамо\b",
                r"amocrm",
                r"мегаплан",
                r"salesforce",
                r"1с.*crm",
                r"iiko",
                r"poster",
                r"r[\.\-]?keeper",
                r"своя\s+система",
                r"самописн",
            ]),
        ),
        (
            ObjectionType::NoTime,
            compile(&[
                r"нет\s+времен",
                r"времени\s+нет",
                r"некогда",
                r"занят",
                r"не\s+до\s+этого",
                r"завал",
                r"запар",
                r"аврал",
                r"дедлайн",
                r"не\s+успева",
                r"загружен",
            ]),
        ),
        (
            ObjectionType::Trust,
            compile(&[
                r"не\s+верю",
                r"не\s+верит",
                r"сомнева",
                r"правда\s*\?",
                r"серь[её]зно\s*\?",
                r"гарантии",
                r"докаж",
                r"подтверд",
                r"кто\s+пользуется",
                r"отзыв",
                r"референс",
            ]),
        ),
        (
            ObjectionType::Timing,
            compile(&[
                r"не\s+сейчас",
                r"не\s+время",
                r"позже",
                r"потом",
                r"через\s+недел",
                r"через\s+месяц",
                r"в\s+следующ",
                r"после\s+нового",
                r"после\s+праздник",
                r"после\s+отпуск",
            ]),
        ),
        (
            ObjectionType::Complexity,
            compile(&[
                r"сложно",
                r"долго\s+внедр",
                r"долго\s+настраив",
                r"долго\s+обуч",
                r"переучива",
                r"перестраива",
                r"много\s+работы",
                r"геморро",
                r"заморочк",
            ]),
        ),
    ]
});

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Strategies
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn strategy_for(objection_type: ObjectionType) -> ObjectionStrategy {
    match objection_type {
        ObjectionType::Price => ObjectionStrategy {
            framework: ObjectionFramework::FourPs,
            response_template: "Понимаю, вопрос бюджета важен. \
                 Скажите, вы сравниваете с чем-то конкретным или просто кажется дорого в абсолюте?",
            follow_up_question:
                "Кстати, посчитаем: сколько примерно теряете сейчас на {pain_point}?",
            max_attempts: 2,
            can_soft_close: false,
        },
        ObjectionType::Competitor => ObjectionStrategy {
            framework: ObjectionFramework::FourPs,
            response_template: "Хорошо что уже пользуетесь системой. \
                 Что именно не устраивает или чего не хватает?",
            follow_up_question: "Если бы можно было что-то улучшить — что бы это было?",
            max_attempts: 2,
            can_soft_close: false,
        },
        ObjectionType::NoTime => ObjectionStrategy {
            framework: ObjectionFramework::FourPs,
            response_template: "Понимаю, времени всегда не хватает. \
                 Когда было бы удобнее вернуться к разговору?",
            follow_up_question:
                "Могу просто прислать информацию на почту — посмотрите когда будет время?",
            max_attempts: 1,
            can_soft_close: true,
        },
        ObjectionType::Timing => ObjectionStrategy {
            framework: ObjectionFramework::FourPs,
            response_template: "Понимаю, сейчас не лучший момент. \
                 Когда планируете вернуться к этому вопросу?",
            follow_up_question: "Могу напомнить ближе к этому времени?",
            max_attempts: 1,
            can_soft_close: true,
        },
        ObjectionType::Complexity => ObjectionStrategy {
            framework: ObjectionFramework::FourPs,
            response_template: "Понимаю опасения. На самом деле внедрение занимает 1-2 дня. \
                 Данные переносим мы, обучение включено.",
            follow_up_question: "Что именно вызывает больше всего опасений?",
            max_attempts: 2,
            can_soft_close: false,
        },
        ObjectionType::Think => ObjectionStrategy {
            framework: ObjectionFramework::ThreeFs,
            response_template: "Понимаю, решение важное — нужно обдумать. \
                 Многие клиенты говорили то же самое. \
                 Они потом отмечали, что демо помогло определиться.",
            follow_up_question: "Может запланируем демо? Это ни к чему не обязывает.",
            max_attempts: 1,
            can_soft_close: true,
        },
        ObjectionType::NoNeed => ObjectionStrategy {
            framework: ObjectionFramework::ThreeFs,
            response_template: "Понимаю, если всё работает — зачем менять. \
                 Другие клиенты тоже так думали, а потом считали сколько времени уходит на рутину.",
            follow_up_question: "Кстати, сколько времени у вас уходит на {routine_task}?",
            max_attempts: 1,
            can_soft_close: true,
        },
        ObjectionType::Trust => ObjectionStrategy {
            framework: ObjectionFramework::ThreeFs,
            response_template: "Понимаю сомнения — это нормально перед покупкой. \
                 Многие клиенты сначала сомневались, сейчас говорят что зря не попробовали раньше.",
            follow_up_question: "Могу показать кейсы компаний из вашей сферы — интересно?",
            max_attempts: 2,
            can_soft_close: false,
        },
    }
}

const SOFT_CLOSE_TEMPLATES: &[&str] = &[
    "Хорошо, не буду настаивать. Оставлю контакты — свяжетесь когда будет удобно?",
    "Понимаю. Могу прислать информацию на почту — посмотрите когда будет время?",
    "Окей, давайте так: я оставлю контакты, и вы свяжетесь когда созреет решение.",
];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Serialized handler state: attempt counters per type.
pub type ObjectionState = HashMap<String, u32>;

/// Regex-tier objection handler with per-type attempt budgets.
#[derive(Default)]
pub struct ObjectionHandler {
    attempts: HashMap<ObjectionType, u32>,
}

impl ObjectionHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Detect the objection type in a message, if any.
    ///
    /// Types are checked in the fixed priority order; the first type
    /// with any matching pattern wins.
    pub fn detect_type_static(message: &str) -> Option<ObjectionType> {
        let lower = message.to_lowercase();
        for objection_type in PRIORITY_ORDER {
            let patterns = PATTERNS
                .iter()
                .find(|(t, _)| *t == objection_type)
                .map(|(_, p)| p)?;
            if patterns.iter().any(|p| p.is_match(&lower)) {
                return Some(objection_type);
            }
        }
        None
    }

    pub fn detect_objection(&self, message: &str) -> Option<ObjectionType> {
        Self::detect_type_static(message)
    }

    pub fn attempts_for(&self, objection_type: ObjectionType) -> u32 {
        self.attempts.get(&objection_type).copied().unwrap_or(0)
    }

    /// Strategy for an objection, or `None` when its budget is spent.
    /// Increments the attempt counter on success.
    pub fn get_strategy(&mut self, objection_type: ObjectionType) -> Option<ObjectionStrategy> {
        let strategy = strategy_for(objection_type);
        let attempts = self.attempts_for(objection_type);
        if attempts >= strategy.max_attempts {
            tracing::info!(
                objection = objection_type.as_str(),
                attempts,
                "objection attempts exhausted"
            );
            return None;
        }
        *self.attempts.entry(objection_type).or_insert(0) += 1;
        Some(strategy)
    }

    /// Full handling pass for a message.
    pub fn handle_objection(
        &mut self,
        message: &str,
        collected_data: &Map<String, Value>,
    ) -> Option<ObjectionResult> {
        let objection_type = self.detect_objection(message)?;
        let attempt = self.attempts_for(objection_type) + 1;
        let strategy = self.get_strategy(objection_type);

        let result = match strategy {
            Some(strategy) => {
                let follow_up = personalize(strategy.follow_up_question, collected_data);
                let mut response_parts = HashMap::new();
                response_parts.insert("template".into(), strategy.response_template.to_owned());
                response_parts.insert("follow_up".into(), follow_up);
                let should_soft_close =
                    strategy.can_soft_close && attempt >= strategy.max_attempts;
                ObjectionResult {
                    objection_type,
                    strategy: Some(strategy),
                    attempt_number: attempt,
                    should_soft_close,
                    response_parts,
                }
            }
            None => {
                let mut response_parts = HashMap::new();
                response_parts.insert("message".into(), soft_close_message());
                ObjectionResult {
                    objection_type,
                    strategy: None,
                    attempt_number: attempt,
                    should_soft_close: true,
                    response_parts,
                }
            }
        };

        tracing::info!(
            objection = objection_type.as_str(),
            attempt = result.attempt_number,
            soft_close = result.should_soft_close,
            "objection handled"
        );
        Some(result)
    }

    pub fn reset(&mut self) {
        self.attempts.clear();
    }

    pub fn to_state(&self) -> ObjectionState {
        self.attempts
            .iter()
            .map(|(t, n)| (t.as_str().to_owned(), *n))
            .collect()
    }

    pub fn load_state(&mut self, state: ObjectionState) {
        self.attempts = state
            .into_iter()
            .filter_map(|(name, n)| {
                ObjectionType::from_intent(&format!("objection_{name}")).map(|t| (t, n))
            })
            .collect();
    }
}

fn personalize(template: &str, collected: &Map<String, Value>) -> String {
    let pain = collected
        .get("pain_points")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .and_then(|v| v.as_str())
        .unwrap_or("текущую проблему");
    let routine = collected
        .get("routine_task")
        .and_then(|v| v.as_str())
        .unwrap_or("ручную работу");
    template
        .replace("{pain_point}", pain)
        .replace("{routine_task}", routine)
}

fn soft_close_message() -> String {
    SOFT_CLOSE_TEMPLATES
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(SOFT_CLOSE_TEMPLATES[0])
        .to_owned()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cascade detector
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const SEMANTIC_THRESHOLD: f64 = 0.75;
const SEMANTIC_AMBIGUITY_DELTA: f64 = 0.10;
const AMBIGUITY_DAMPEN: f64 = 0.85;

/// Detection result with tier provenance.
#[derive(Debug, Clone)]
pub struct ObjectionDetection {
    pub objection_type: ObjectionType,
    pub confidence: f64,
    pub tier_used: &'static str,
}

/// Regex tier with a flag-gated semantic fallback.
pub struct CascadeObjectionDetector {
    semantic: Option<Arc<SemanticIntentClassifier>>,
}

impl CascadeObjectionDetector {
    pub fn new(semantic: Option<Arc<SemanticIntentClassifier>>) -> Self {
        Self { semantic }
    }

    pub async fn detect(&self, message: &str, semantic_enabled: bool) -> Option<ObjectionDetection> {
        if let Some(objection_type) = ObjectionHandler::detect_type_static(message) {
            return Some(ObjectionDetection {
                objection_type,
                confidence: 0.95,
                tier_used: "regex",
            });
        }

        if !semantic_enabled {
            return None;
        }
        let semantic = self.semantic.as_ref().filter(|s| s.is_available())?;
        let (_intent, _score, all_scores) = semantic.classify(message).await?;

        let mut objection_scores: Vec<(String, f64)> = all_scores
            .into_iter()
            .filter(|(intent, _)| intent.starts_with("objection_"))
            .collect();
        if objection_scores.is_empty() {
            return None;
        }
        objection_scores
            .sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let (top_intent, mut top_score) = objection_scores[0].clone();
        if top_score < SEMANTIC_THRESHOLD {
            return None;
        }
        if let Some((second_intent, second_score)) = objection_scores.get(1) {
            if top_score - second_score < SEMANTIC_AMBIGUITY_DELTA {
                tracing::info!(
                    top = %top_intent,
                    second = %second_intent,
                    "ambiguous semantic objection, dampening"
                );
                top_score *= AMBIGUITY_DAMPEN;
            }
        }

        ObjectionType::from_intent(&top_intent).map(|objection_type| ObjectionDetection {
            objection_type,
            confidence: top_score,
            tier_used: "semantic",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_detected() {
        assert_eq!(
            ObjectionHandler::detect_type_static("слишком дорого для нас"),
            Some(ObjectionType::Price)
        );
    }

    #[test]
    fn think_beats_no_need_on_composite() {
        // "нужно подумать" matches both THINK and NO_NEED patterns;
        // priority resolves it to THINK.
        assert_eq!(
            ObjectionHandler::detect_type_static("нужно подумать"),
            Some(ObjectionType::Think)
        );
    }

    #[test]
    fn price_beats_competitor() {
        assert_eq!(
            ObjectionHandler::detect_type_static("у вас дороже чем битрикс"),
            Some(ObjectionType::Price)
        );
    }

    #[test]
    fn plain_message_is_not_objection() {
        assert_eq!(
            ObjectionHandler::detect_type_static("у нас 50 сотрудников"),
            None
        );
    }

    #[test]
    fn attempt_budget_exhausts_to_soft_close() {
        let mut handler = ObjectionHandler::new();
        let collected = Map::new();

        let first = handler.handle_objection("нам это не нужно", &collected).unwrap();
        assert_eq!(first.objection_type, ObjectionType::NoNeed);
        assert!(first.strategy.is_some());
        // NO_NEED allows one attempt and can soft close right away.
        assert!(first.should_soft_close);

        let second = handler.handle_objection("не нужно, сказал же", &collected).unwrap();
        assert!(second.strategy.is_none());
        assert!(second.should_soft_close);
        assert!(second.response_parts.contains_key("message"));
    }

    #[test]
    fn price_strategy_allows_two_attempts() {
        let mut handler = ObjectionHandler::new();
        let collected = Map::new();

        let first = handler.handle_objection("дорого", &collected).unwrap();
        assert!(!first.should_soft_close);
        let second = handler.handle_objection("всё равно дорого", &collected).unwrap();
        assert!(second.strategy.is_some());
        let third = handler.handle_objection("ну дорого же", &collected).unwrap();
        assert!(third.strategy.is_none());
        assert!(third.should_soft_close);
    }

    #[test]
    fn follow_up_personalized_with_pain() {
        let mut handler = ObjectionHandler::new();
        let mut collected = Map::new();
        collected.insert(
            "pain_points".into(),
            Value::Array(vec![Value::String("ручной учёт".into())]),
        );
        let result = handler.handle_objection("дорого", &collected).unwrap();
        assert!(result.response_parts["follow_up"].contains("ручной учёт"));
    }

    #[test]
    fn state_round_trip() {
        let mut handler = ObjectionHandler::new();
        let collected = Map::new();
        handler.handle_objection("дорого", &collected);
        handler.handle_objection("подумаю", &collected);

        let state = handler.to_state();
        let mut restored = ObjectionHandler::new();
        restored.load_state(state);
        assert_eq!(restored.attempts_for(ObjectionType::Price), 1);
        assert_eq!(restored.attempts_for(ObjectionType::Think), 1);
    }

    #[tokio::test]
    async fn cascade_regex_tier_wins() {
        let detector = CascadeObjectionDetector::new(None);
        let detection = detector.detect("это дорого", true).await.unwrap();
        assert_eq!(detection.tier_used, "regex");
        assert!((detection.confidence - 0.95).abs() < 1e-9);
    }

    #[tokio::test]
    async fn cascade_abstains_without_semantic() {
        let detector = CascadeObjectionDetector::new(None);
        assert!(detector.detect("ну такое себе", true).await.is_none());
    }
}
