//! Response generation: template selection, retrieval injection, LLM
//! drafting with deterministic templates as the no-LLM path, and the
//! post-processing chain (diversity → dedup → question dedup → apology
//! → CTA), finished by the boundary validator.

pub mod cta;
pub mod diversity;

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use sf_analysis::objection::ObjectionResult;
use sf_domain::flags::Flags;
use sf_domain::snapshot::{HistoryCompact, HistoryTurn};
use sf_llm::{GenerateOptions, LlmClient};

use crate::boundary::{BoundaryValidator, ValidationContext, ValidationResult};
use crate::retriever::KnowledgeRetriever;

use diversity::DiversityEngine;

/// Retrieved facts sometimes open with a greeting; mid-conversation
/// re-greetings must never leak into responses.
static FACTS_GREETING_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?iu)^\s*здравствуйте[!,.]?\s*").unwrap());

/// Template keys that trigger knowledge retrieval.
const RETRIEVING_TEMPLATES: &[&str] = &["pricing", "pricing_direct", "faq"];

/// Everything the generator needs to draft one response.
#[derive(Default)]
pub struct GenerationContext<'a> {
    pub user_message: &'a str,
    pub intent: &'a str,
    pub state: &'a str,
    pub goal: &'a str,
    pub history: &'a [HistoryTurn],
    pub history_compact: Option<&'a HistoryCompact>,
    pub collected_data: Map<String, Value>,
    pub missing_data: &'a [String],
    pub profile_summary: String,
    pub directive_instruction: String,
    pub frustration_level: i32,
    pub should_apologize: bool,
    pub should_offer_exit: bool,
    pub objection: Option<&'a ObjectionResult>,
    pub policy_reason_codes: &'a [String],
    pub last_action: &'a str,
    pub history_user_text: String,
}

/// A drafted and validated response.
#[derive(Debug, Clone)]
pub struct GeneratedResponse {
    pub text: String,
    pub template_key: String,
    pub validation: ValidationResult,
}

pub struct ResponseGenerator {
    diversity: DiversityEngine,
}

impl Default for ResponseGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseGenerator {
    pub fn new() -> Self {
        Self {
            diversity: DiversityEngine::new(),
        }
    }

    pub fn diversity_state(&self) -> diversity::DiversityState {
        self.diversity.to_state()
    }

    pub fn load_diversity_state(&mut self, state: diversity::DiversityState) {
        self.diversity.load_state(state);
    }

    pub fn reset(&mut self) {
        self.diversity.reset();
    }

    /// Draft, post-process, and validate a response for the action.
    pub async fn generate(
        &mut self,
        action: &str,
        ctx: &GenerationContext<'_>,
        llm: Option<&Arc<LlmClient>>,
        retriever: &Arc<dyn KnowledgeRetriever>,
        validator: &mut BoundaryValidator,
        flags: &Flags,
    ) -> GeneratedResponse {
        let template_key = select_template(action, ctx.state, ctx.policy_reason_codes);

        // Fact retrieval for information-seeking templates.
        let mut facts = String::new();
        if RETRIEVING_TEMPLATES.contains(&template_key.as_str()) {
            match retriever
                .retrieve_with_urls(ctx.user_message, ctx.intent, ctx.state, &[], 3)
                .await
            {
                Ok((retrieved, _urls)) => {
                    facts = FACTS_GREETING_PREFIX.replace(&retrieved, "").into_owned();
                }
                Err(err) => {
                    tracing::warn!(error = %err, "knowledge retrieval failed");
                }
            }
        }

        // Draft.
        let mut text = match llm {
            Some(llm) => {
                let prompt = build_prompt(&template_key, ctx, &facts, retriever);
                llm.generate(
                    &prompt,
                    GenerateOptions {
                        state: ctx.state,
                        allow_fallback: true,
                    },
                )
                .await
            }
            None => deterministic_template(&template_key, ctx, &facts),
        };

        // Post-processing chain.
        text = self.diversity.apply(&text);
        text = dedup_questions(&text, &ctx.collected_data);
        if ctx.should_apologize && !text.to_lowercase().contains("извин") {
            text = format!("Извините за неудобства. {text}");
        }
        let cta = cta::build_cta(
            ctx.state,
            action,
            &text,
            &ctx.collected_data,
            ctx.frustration_level,
            ctx.last_action,
        );
        text = cta::apply_cta(&text, cta);

        // Final guardrail.
        let validation_ctx = ValidationContext {
            intent: ctx.intent.to_owned(),
            state: ctx.state.to_owned(),
            selected_template: template_key.clone(),
            user_message: ctx.user_message.to_owned(),
            retrieved_facts: facts,
            collected_data: ctx.collected_data.clone(),
            history_user_text: ctx.history_user_text.clone(),
        };
        let validation = validator.validate(&text, &validation_ctx, llm, flags).await;

        GeneratedResponse {
            text: validation.response.clone(),
            template_key,
            validation,
        }
    }
}

/// Map an abstract action to a template key; policy reason codes can
/// swap the selection.
fn select_template(action: &str, state: &str, reason_codes: &[String]) -> String {
    if reason_codes
        .iter()
        .any(|r| r == "frustrated_pricing_direct" || r == "competitor_comparison_direct")
    {
        return "pricing_direct".into();
    }
    match action {
        "answer_with_pricing" => "pricing".into(),
        "answer_with_pricing_direct" => "pricing_direct".into(),
        "answer_question" => "faq".into(),
        "handle_objection" => "objection".into(),
        "ask_missing_data" => "collect_data".into(),
        "book_demo" => "demo".into(),
        "confirm_success" => "success".into(),
        "soft_close" => "soft_close".into(),
        _ if state == "greeting" => "greeting".into(),
        _ => "continue".into(),
    }
}

fn build_prompt(
    template_key: &str,
    ctx: &GenerationContext<'_>,
    facts: &str,
    retriever: &Arc<dyn KnowledgeRetriever>,
) -> String {
    let mut sections = vec![format!(
        "Ты менеджер по продажам. {company}\nЦель сейчас: {goal}.",
        company = retriever.company_info(),
        goal = ctx.goal,
    )];

    if !ctx.directive_instruction.is_empty() {
        sections.push(format!("Инструкции по тону: {}", ctx.directive_instruction));
    }
    if !facts.is_empty() {
        sections.push(format!("Факты (используй только их):\n{facts}"));
    }
    if let Some(compact) = ctx.history_compact {
        if !compact.summary.is_empty() {
            sections.push(format!("Сжатая история: {}", compact.summary.join("; ")));
        }
    }
    if !ctx.profile_summary.is_empty() {
        sections.push(format!("Что известно о клиенте: {}", ctx.profile_summary));
    }
    if !ctx.missing_data.is_empty() {
        sections.push(format!(
            "Ещё нужно узнать: {}",
            ctx.missing_data.join(", ")
        ));
    }
    if let Some(objection) = ctx.objection {
        if let (Some(template), Some(follow_up)) = (
            objection.response_parts.get("template"),
            objection.response_parts.get("follow_up"),
        ) {
            sections.push(format!(
                "Клиент возражает ({}). Каркас ответа: {template} {follow_up}",
                objection.objection_type.as_str()
            ));
        }
    }

    let tail: Vec<String> = ctx
        .history
        .iter()
        .rev()
        .take(4)
        .rev()
        .map(|t| format!("Клиент: {}\nМенеджер: {}", t.user, t.bot))
        .collect();
    if !tail.is_empty() {
        sections.push(format!("Последние реплики:\n{}", tail.join("\n")));
    }

    sections.push(format!(
        "Шаблон ответа: {template_key}.\nСообщение клиента: \"{}\"\nОтвет менеджера:",
        ctx.user_message
    ));

    sections.join("\n\n")
}

/// The no-LLM path: deterministic templates grounded in collected data
/// and the episodic profile.
fn deterministic_template(template_key: &str, ctx: &GenerationContext<'_>, facts: &str) -> String {
    match template_key {
        "greeting" => "Здравствуйте! Я помогу подобрать решение для вашего бизнеса. \
                       Расскажите немного о вашей компании?"
            .into(),
        "collect_data" => ask_for_field(ctx.missing_data.first().map(String::as_str)),
        "pricing" => format!(
            "{} Могу рассчитать стоимость под вашу компанию — что важно учесть?",
            facts
        ),
        "pricing_direct" => {
            let first_sentence = facts.split('.').next().unwrap_or(facts).trim();
            if first_sentence.is_empty() {
                "Стоимость — от 15 000 ₸ в месяц.".into()
            } else {
                format!("{first_sentence}.")
            }
        }
        "faq" => {
            let mut answer = facts.trim().to_owned();
            if !ctx.profile_summary.is_empty() {
                answer = format!("{answer} По вашей ситуации: {}.", ctx.profile_summary);
            }
            answer
        }
        "objection" => ctx
            .objection
            .map(|o| {
                let template = o.response_parts.get("template").cloned().unwrap_or_default();
                let follow_up = o.response_parts.get("follow_up").cloned().unwrap_or_default();
                format!("{template} {follow_up}").trim().to_owned()
            })
            .unwrap_or_else(|| "Понимаю вас. Что именно вызывает сомнения?".into()),
        "demo" => "Отлично! Давайте запланируем демо. Оставьте, пожалуйста, номер телефона — \
                   менеджер подберёт удобное время."
            .into(),
        "success" => "Спасибо! Записал. Менеджер свяжется с вами в ближайшее время, \
                      чтобы подтвердить детали."
            .into(),
        "soft_close" => sf_llm::fallback_for_state("soft_close").into(),
        _ => {
            // continue_current_goal: remind the resumed context, then
            // the state's own probing question.
            let question = sf_llm::fallback_for_state(ctx.state);
            if !ctx.profile_summary.is_empty()
                && (ctx.intent == sf_domain::intents::UNCLEAR || ctx.history_compact.is_some())
            {
                format!("Напомню, где мы остановились: {}. {question}", ctx.profile_summary)
            } else {
                question.into()
            }
        }
    }
}

fn ask_for_field(field: Option<&str>) -> String {
    match field {
        Some("company_name") => "Подскажите, как называется ваша компания?".into(),
        Some("company_size") => "Сколько примерно сотрудников работает у вас?".into(),
        Some("pain_points") => {
            "С какими сложностями в учёте или продажах сталкиваетесь чаще всего?".into()
        }
        Some("contact_info") => {
            "Оставьте, пожалуйста, номер телефона — менеджер свяжется в удобное время.".into()
        }
        Some(other) => format!("Уточните, пожалуйста: {other}?"),
        None => "Расскажите подробнее?".into(),
    }
}

/// Strip question sentences that ask for data we already hold.
fn dedup_questions(text: &str, collected: &Map<String, Value>) -> String {
    static FIELD_QUESTIONS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
        vec![
            (
                "company_name",
                Regex::new(r"(?iu)как\s+называется|какая\s+.{0,20}компани").unwrap(),
            ),
            (
                "company_size",
                Regex::new(r"(?iu)сколько\s+.{0,20}сотрудник").unwrap(),
            ),
            (
                "contact_info",
                Regex::new(r"(?iu)оставьте\s+.{0,30}(?:номер|телефон)|ваш\s+номер\s+телефона").unwrap(),
            ),
            (
                "pain_points",
                Regex::new(r"(?iu)какими\s+сложностями|какие\s+.{0,20}проблем").unwrap(),
            ),
        ]
    });

    let sentences: Vec<&str> = split_keep(text);
    let kept: Vec<&str> = sentences
        .into_iter()
        .filter(|sentence| {
            if !sentence.contains('?') {
                return true;
            }
            !FIELD_QUESTIONS.iter().any(|(field, pattern)| {
                collected.contains_key(*field) && pattern.is_match(sentence)
            })
        })
        .collect();
    if kept.is_empty() {
        text.to_owned()
    } else {
        kept.join(" ")
    }
}

fn split_keep(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    for (i, ch) in text.char_indices() {
        if matches!(ch, '.' | '!' | '?') {
            let end = i + ch.len_utf8();
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = end;
        }
    }
    let rest = text[start..].trim();
    if !rest.is_empty() {
        sentences.push(rest);
    }
    sentences
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retriever::StaticRetriever;

    fn retriever() -> Arc<dyn KnowledgeRetriever> {
        Arc::new(StaticRetriever::default())
    }

    #[tokio::test]
    async fn collect_data_asks_for_first_missing_field() {
        let mut generator = ResponseGenerator::new();
        let mut validator = BoundaryValidator::new();
        let missing = vec!["company_name".to_string()];
        let ctx = GenerationContext {
            user_message: "ну такие дела",
            intent: "unclear",
            state: "spin_situation",
            goal: "узнать о компании",
            missing_data: &missing,
            ..Default::default()
        };
        let out = generator
            .generate(
                "ask_missing_data",
                &ctx,
                None,
                &retriever(),
                &mut validator,
                &Flags::new(),
            )
            .await;
        assert_eq!(out.template_key, "collect_data");
        assert!(out.text.contains("как называется"));
    }

    #[tokio::test]
    async fn pricing_template_injects_facts_in_tenge() {
        let mut generator = ResponseGenerator::new();
        let mut validator = BoundaryValidator::new();
        let ctx = GenerationContext {
            user_message: "сколько стоит?",
            intent: "price_question",
            state: "presentation",
            goal: "ответить на вопрос о цене",
            ..Default::default()
        };
        let out = generator
            .generate(
                "answer_with_pricing",
                &ctx,
                None,
                &retriever(),
                &mut validator,
                &Flags::new(),
            )
            .await;
        assert!(out.text.contains('₸'));
        assert!(out.validation.violations.is_empty());
    }

    #[tokio::test]
    async fn question_dedup_strips_answered_asks() {
        let mut generator = ResponseGenerator::new();
        let mut validator = BoundaryValidator::new();
        let mut collected = Map::new();
        collected.insert("company_name".into(), Value::String("Ромашка".into()));

        // LLM drafts a response that re-asks for the company name.
        let mock = Arc::new(sf_llm::MockLlm::default());
        mock.push_reply("Принял. Как называется ваша компания? Что болит сильнее всего?");
        let llm = Arc::new(LlmClient::new(mock));

        let ctx = GenerationContext {
            user_message: "мы Ромашка",
            intent: "situation_provided",
            state: "spin_problem",
            goal: "выявить проблемы",
            collected_data: collected,
            ..Default::default()
        };
        let out = generator
            .generate(
                "continue_current_goal",
                &ctx,
                Some(&llm),
                &retriever(),
                &mut validator,
                &Flags::new(),
            )
            .await;
        assert!(!out.text.contains("как называется"));
        assert!(out.text.contains("болит"));
    }

    #[tokio::test]
    async fn apology_prefixed_when_required() {
        let mut generator = ResponseGenerator::new();
        let mut validator = BoundaryValidator::new();
        let ctx = GenerationContext {
            user_message: "вы меня бесите",
            intent: "unclear",
            state: "spin_problem",
            goal: "выявить проблемы",
            should_apologize: true,
            frustration_level: 7,
            ..Default::default()
        };
        let out = generator
            .generate(
                "continue_current_goal",
                &ctx,
                None,
                &retriever(),
                &mut validator,
                &Flags::new(),
            )
            .await;
        assert!(out.text.starts_with("Извините"));
    }

    #[tokio::test]
    async fn policy_reason_code_swaps_to_direct_pricing() {
        let mut generator = ResponseGenerator::new();
        let mut validator = BoundaryValidator::new();
        let codes = vec!["frustrated_pricing_direct".to_string()];
        let ctx = GenerationContext {
            user_message: "сколько уже можно, цену скажите",
            intent: "price_question",
            state: "presentation",
            goal: "ответить прямо",
            policy_reason_codes: &codes,
            frustration_level: 8,
            ..Default::default()
        };
        let out = generator
            .generate(
                "answer_with_pricing",
                &ctx,
                None,
                &retriever(),
                &mut validator,
                &Flags::new(),
            )
            .await;
        assert_eq!(out.template_key, "pricing_direct");
        // Direct template is one sentence.
        assert!(out.text.matches('.').count() <= 2);
    }

    #[tokio::test]
    async fn continue_template_recalls_profile_after_restore() {
        let mut generator = ResponseGenerator::new();
        let mut validator = BoundaryValidator::new();
        let ctx = GenerationContext {
            user_message: "так, на чём мы остановились?",
            intent: "unclear",
            state: "spin_problem",
            goal: "выявить проблемы",
            profile_summary: "компания ТехноМаркет; боли: потеря лидов".into(),
            ..Default::default()
        };
        let out = generator
            .generate(
                "continue_current_goal",
                &ctx,
                None,
                &retriever(),
                &mut validator,
                &Flags::new(),
            )
            .await;
        assert!(out.text.contains("ТехноМаркет"));
        assert!(out.text.contains("потеря лидов"));
    }
}
