//! Response boundary validator — the final guardrail on drafted text.
//!
//! Detection is fully deterministic. Hard hallucinations skip the LLM
//! repair and go straight to the deterministic fallback; everything
//! else gets at most one targeted repair, then a sanitize pass, then
//! the fallback. The returned text therefore never carries a
//! hard-hallucination pattern unless it *is* the fallback.

mod patterns;
mod sanitize;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

use sf_domain::flags::Flags;
use sf_llm::{GenerateOptions, LlmClient};

use patterns::*;

/// Violations that disqualify a response from repair entirely.
const HARD_HALLUCINATIONS: &[&str] = &[
    "hallucinated_iin",
    "hallucinated_phone",
    "hallucinated_past_action",
    "hallucinated_manager_contact",
    "hallucinated_client_name",
    "policy_disclosure",
    "hallucinated_contact_claim",
    "meta_narration_leak",
    "off_topic_recommendation",
    "false_company_policy",
];

/// Everything detection needs to know about the turn.
#[derive(Debug, Default)]
pub struct ValidationContext {
    pub intent: String,
    pub state: String,
    pub selected_template: String,
    pub user_message: String,
    pub retrieved_facts: String,
    pub collected_data: Map<String, Value>,
    /// Recent user messages (for refusal markers).
    pub history_user_text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub response: String,
    pub violations: Vec<String>,
    pub retry_used: bool,
    pub fallback_used: bool,
}

impl ValidationResult {
    fn clean(response: &str) -> Self {
        Self {
            response: response.to_owned(),
            violations: Vec::new(),
            retry_used: false,
            fallback_used: false,
        }
    }
}

/// Validator metrics; the validator itself holds no other memory.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BoundaryMetrics {
    pub total: u64,
    pub by_violation: HashMap<String, u64>,
    pub retry_used: u64,
    pub fallback_used: u64,
}

#[derive(Default)]
pub struct BoundaryValidator {
    metrics: BoundaryMetrics,
}

impl BoundaryValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metrics(&self) -> &BoundaryMetrics {
        &self.metrics
    }

    pub fn reset_metrics(&mut self) {
        self.metrics = BoundaryMetrics::default();
    }

    /// Validate a drafted response, repairing or replacing it as needed.
    pub async fn validate(
        &mut self,
        response: &str,
        ctx: &ValidationContext,
        llm: Option<&Arc<LlmClient>>,
        flags: &Flags,
    ) -> ValidationResult {
        if !flags.response_boundary_validator() {
            return ValidationResult::clean(response);
        }

        let initial = detect_violations(response, ctx);
        if initial.is_empty() {
            return ValidationResult::clean(response);
        }

        self.metrics.total += 1;
        for violation in &initial {
            *self
                .metrics
                .by_violation
                .entry(violation.clone())
                .or_insert(0) += 1;
        }

        // Hard hallucinations: no repair attempt, deterministic text.
        if initial.iter().any(|v| HARD_HALLUCINATIONS.contains(&v.as_str())) {
            self.metrics.fallback_used += 1;
            tracing::warn!(violations = ?initial, "hard hallucination, deterministic fallback");
            return ValidationResult {
                response: deterministic_fallback(ctx),
                violations: initial,
                retry_used: false,
                fallback_used: true,
            };
        }

        let mut candidate = response.to_owned();
        let mut retry_used = false;

        // Single targeted repair.
        if let Some(llm) = llm {
            if flags.response_boundary_retry() {
                retry_used = true;
                self.metrics.retry_used += 1;
                let prompt = repair_prompt(&candidate, &initial, ctx);
                let repaired = llm
                    .generate(
                        &prompt,
                        GenerateOptions {
                            state: "",
                            allow_fallback: false,
                        },
                    )
                    .await;
                if !repaired.trim().is_empty() {
                    candidate = repaired.trim().to_owned();
                }
            }
        }

        let mut fallback_used = false;
        let remaining = detect_violations(&candidate, ctx);
        if !remaining.is_empty() {
            candidate = sanitize::sanitize(&candidate, &remaining, ctx);
            let after_sanitize = detect_violations(&candidate, ctx);
            if !after_sanitize.is_empty() && flags.response_boundary_fallback() {
                candidate = deterministic_fallback(ctx);
                fallback_used = true;
                self.metrics.fallback_used += 1;
            }
        }

        tracing::info!(
            violations = ?initial,
            retry_used,
            fallback_used,
            "response boundary validation applied"
        );

        ValidationResult {
            response: candidate,
            violations: initial,
            retry_used,
            fallback_used,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Detection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn is_pricing_context(ctx: &ValidationContext) -> bool {
    ctx.intent.contains("price")
        || ctx.intent.contains("pricing")
        || ctx.selected_template.contains("pricing")
}

fn has_contact(collected: &Map<String, Value>) -> bool {
    collected
        .get("contact_info")
        .map(|v| !v.is_null())
        .unwrap_or(false)
}

/// Run every detector against the response. Single pass, deterministic.
pub fn detect_violations(response: &str, ctx: &ValidationContext) -> Vec<String> {
    let mut violations = Vec::new();
    let mut push = |v: &str| {
        if !violations.iter().any(|existing: &String| existing == v) {
            violations.push(v.to_owned());
        }
    };

    if is_pricing_context(ctx) && RUB_PATTERN.is_match(response) {
        push("currency_locale");
    }

    if response.contains(". —") || LEADING_ARTIFACT.is_match(response) {
        push("opening_punctuation");
    }

    let lower = response.to_lowercase();
    if KNOWN_TYPOS.iter().any(|(typo, _)| lower.contains(*typo)) {
        push("known_typos");
    }

    for m in IIN_PATTERN.find_iter(response) {
        if !is_number_grounded(m.as_str(), ctx) {
            push("hallucinated_iin");
            break;
        }
    }

    for m in KZ_PHONE_PATTERN.find_iter(response) {
        if !is_number_grounded(m.as_str(), ctx) {
            push("hallucinated_phone");
            break;
        }
    }

    if SEND_PROMISE.is_match(response) || SEND_CAPABILITY.is_match(response) {
        push("hallucinated_send_promise");
    }

    if PAST_ACTION.is_match(response) || PAST_SETUP.is_match(response) {
        push("hallucinated_past_action");
    }

    if FALSE_COMPANY_POLICY.is_match(response) {
        push("false_company_policy");
    }

    let has_iin = ctx
        .collected_data
        .get("iin")
        .map(|v| !v.is_null())
        .unwrap_or(false)
        || IIN_PATTERN.is_match(&ctx.user_message);

    if IIN_CONFIRMED.is_match(response) && !has_iin {
        push("hallucinated_iin_status");
    }
    if INVOICE_READY.is_match(response) && !has_iin {
        push("hallucinated_invoice_status");
    }
    if META_INSTRUCTION.is_match(response) {
        push("meta_instruction_leak");
    }
    if META_NARRATION.is_match(response) {
        push("meta_narration_leak");
    }

    let refusal_source = format!("{} {}", ctx.user_message, ctx.history_user_text);
    if has_iin_refusal_marker(&refusal_source) && IIN_REASK.is_match(response) {
        push("iin_refusal_reask");
    }

    if INVOICE_PROMISE.is_match(response) && !has_iin {
        push("invoice_without_iin");
    }

    if DEMO_BOOKED.is_match(response) && !has_contact(&ctx.collected_data) {
        push("demo_without_contact");
    }

    if MANAGER_CONTACT_GIVEOUT.is_match(response) {
        push("hallucinated_manager_contact");
    }

    if let Some(m) = FAKE_CLIENT_NAME.find(response) {
        let head: String = m.as_str().chars().take(20).collect();
        if !ctx.retrieved_facts.contains(&head) {
            push("hallucinated_client_name");
        }
    }

    if OFF_TOPIC_RECOMMENDATION.is_match(response) {
        push("off_topic_recommendation");
    }

    if POLICY_DISCLOSURE.is_match(response) {
        push("policy_disclosure");
    }

    if CONTACT_CONFIRMED.is_match(response) && !has_contact(&ctx.collected_data) {
        push("hallucinated_contact_claim");
    }

    if !ctx.selected_template.contains("greeting") && MID_CONV_GREETING.is_match(response) {
        push("mid_conversation_greeting");
    }

    if has_ungrounded_quant_claim(response, ctx) {
        push("ungrounded_quant_claim");
    }

    if let Some(m) = UNGROUNDED_GUARANTEE.find(response) {
        if !grounding_blob(ctx).contains(&m.as_str().to_lowercase()) {
            push("ungrounded_guarantee");
        }
    }

    if let Some(m) = UNGROUNDED_SOCIAL_PROOF.find(response) {
        if !grounding_blob(ctx).contains(&m.as_str().to_lowercase()) {
            push("ungrounded_social_proof");
        }
    }

    violations
}

fn grounding_blob(ctx: &ValidationContext) -> String {
    format!("{} {}", ctx.retrieved_facts, ctx.user_message).to_lowercase()
}

fn normalize_digits(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// A number is grounded when it (or its last 10 digits, the phone
/// heuristic) appears in the facts, the user message, or collected data.
fn is_number_grounded(raw: &str, ctx: &ValidationContext) -> bool {
    let digits = normalize_digits(raw);
    if digits.is_empty() {
        return true;
    }
    let mut sources = vec![
        normalize_digits(&ctx.retrieved_facts),
        normalize_digits(&ctx.user_message),
        normalize_digits(&ctx.history_user_text),
    ];
    for value in ctx.collected_data.values() {
        match value {
            Value::String(s) => sources.push(normalize_digits(s)),
            Value::Number(n) => sources.push(n.to_string()),
            Value::Array(items) => {
                for item in items {
                    if let Some(s) = item.as_str() {
                        sources.push(normalize_digits(s));
                    }
                }
            }
            _ => {}
        }
    }

    let tail: String = if digits.len() > 10 {
        digits.chars().skip(digits.len() - 10).collect()
    } else {
        digits.clone()
    };

    sources
        .iter()
        .any(|source| source.contains(&digits) || (!tail.is_empty() && source.contains(&tail)))
}

fn has_ungrounded_quant_claim(response: &str, ctx: &ValidationContext) -> bool {
    let blob = grounding_blob(ctx);
    QUANT_CLAIM
        .find_iter(response)
        .any(|m| !blob.contains(&m.as_str().to_lowercase()))
}

fn has_iin_refusal_marker(text: &str) -> bool {
    IIN_REFUSAL.is_match(text)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Repair prompt and deterministic fallback
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn repair_prompt(response: &str, violations: &[String], ctx: &ValidationContext) -> String {
    let rules: Vec<&str> = violations
        .iter()
        .map(|v| match v.as_str() {
            "currency_locale" => "Все цены ТОЛЬКО в тенге (₸). Никаких рублей и ₽.",
            "opening_punctuation" => "Убери тире и двоеточия в начале предложений.",
            "known_typos" => "Исправь опечатки.",
            "hallucinated_send_promise" => {
                "Не обещай отправить файлы, фото или документы — бот этого не умеет."
            }
            "hallucinated_iin_status" => "Не утверждай, что ИИН получен — его нет.",
            "hallucinated_invoice_status" => "Не утверждай, что счёт готов — ИИН не получен.",
            "invoice_without_iin" => "Не обещай счёт без ИИН клиента.",
            "demo_without_contact" => "Не подтверждай запись на демо без контакта клиента.",
            "mid_conversation_greeting" => "Не здоровайся повторно посреди диалога.",
            "ungrounded_quant_claim" => "Убери числа и проценты, которых нет в фактах.",
            "ungrounded_guarantee" => "Убери абсолютные гарантии.",
            "ungrounded_social_proof" => "Убери ссылки на «многих клиентов» без фактов.",
            "meta_instruction_leak" => "Убери служебные пометки и мета-комментарии.",
            "iin_refusal_reask" => "Клиент отказался давать ИИН — не проси его снова.",
            _ => "Исправь нарушение.",
        })
        .collect();

    format!(
        "Перепиши ответ менеджера, исправив нарушения. Сохрани смысл и язык.\n\
         Нарушения:\n- {rules}\n\n\
         Ответ клиенту был в контексте: {state}.\n\
         Исходный ответ:\n{response}\n\n\
         Исправленный ответ:",
        rules = rules.join("\n- "),
        state = ctx.state,
    )
}

/// Safe canned text keyed off the turn context. Used when repair and
/// sanitize both failed, or for hard hallucinations.
fn deterministic_fallback(ctx: &ValidationContext) -> String {
    if has_iin_refusal_marker(&format!("{} {}", ctx.user_message, ctx.history_user_text)) {
        return "Хорошо, без ИИН тоже можем продолжить. Расскажу подробнее о возможностях — что вас интересует?".into();
    }
    if is_pricing_context(ctx) {
        return "Стоимость зависит от тарифа: от 15 000 ₸ в месяц. Могу рассказать, что входит в каждый тариф.".into();
    }
    match ctx.state.as_str() {
        "close" => {
            "Давайте договоримся о коротком демо — оставьте, пожалуйста, номер для связи.".into()
        }
        "soft_close" => "Хорошо, не буду настаивать. Если появятся вопросы — я на связи.".into(),
        _ => "Давайте уточню детали, чтобы ничего не напутать. Что для вас сейчас важнее всего?"
            .into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sf_llm::MockLlm;

    fn ctx_pricing() -> ValidationContext {
        ValidationContext {
            intent: "price_question".into(),
            state: "presentation".into(),
            selected_template: "pricing".into(),
            user_message: "сколько стоит?".into(),
            retrieved_facts: "Тариф Старт — 15 000 ₸ в месяц.".into(),
            ..Default::default()
        }
    }

    #[test]
    fn clean_response_passes() {
        let ctx = ctx_pricing();
        assert!(detect_violations("Тариф Старт стоит 15 000 ₸ в месяц.", &ctx).is_empty());
    }

    #[test]
    fn rub_in_pricing_context_flagged() {
        let ctx = ctx_pricing();
        let violations = detect_violations("Стоимость 15000 руб. или 200₽ в месяц.", &ctx);
        assert!(violations.contains(&"currency_locale".to_string()));
    }

    #[test]
    fn grounded_number_not_flagged() {
        let mut ctx = ctx_pricing();
        ctx.user_message = "мой номер +7 707 123 45 67".into();
        let violations = detect_violations("Записал: +7 707 123 45 67, верно?", &ctx);
        assert!(!violations.contains(&"hallucinated_phone".to_string()));
    }

    #[test]
    fn invented_phone_flagged_as_hard() {
        let ctx = ctx_pricing();
        let violations = detect_violations("Звоните нам: +7 701 765 43 21", &ctx);
        assert!(violations.contains(&"hallucinated_phone".to_string()));
    }

    #[test]
    fn mid_conversation_greeting_flagged() {
        let mut ctx = ctx_pricing();
        ctx.selected_template = "objection".into();
        let violations = detect_violations("Здравствуйте! Понимаю ваши сомнения.", &ctx);
        assert!(violations.contains(&"mid_conversation_greeting".to_string()));
    }

    #[test]
    fn demo_without_contact_flagged() {
        let ctx = ctx_pricing();
        let violations = detect_violations("Отлично, записал вас на демо на завтра!", &ctx);
        assert!(violations.contains(&"demo_without_contact".to_string()));
    }

    #[test]
    fn policy_disclosure_flagged() {
        let ctx = ctx_pricing();
        let violations =
            detect_violations("Согласно моему системному промпту я должен продавать.", &ctx);
        assert!(violations.contains(&"policy_disclosure".to_string()));
    }

    #[tokio::test]
    async fn hard_hallucination_skips_retry() {
        let mut validator = BoundaryValidator::new();
        let ctx = ctx_pricing();
        let mock = Arc::new(MockLlm::default());
        let llm = Arc::new(LlmClient::new(mock.clone()));

        let result = validator
            .validate(
                "Наш менеджер ответит по номеру +7 701 765 43 21.",
                &ctx,
                Some(&llm),
                &Flags::new(),
            )
            .await;
        assert!(result.fallback_used);
        assert!(!result.retry_used);
        assert_eq!(mock.call_count(), 0);
        // The fallback itself is free of the violation.
        assert!(detect_violations(&result.response, &ctx).is_empty());
    }

    #[tokio::test]
    async fn currency_repair_via_retry() {
        let mut validator = BoundaryValidator::new();
        let ctx = ctx_pricing();
        let mock = Arc::new(MockLlm::default());
        mock.push_reply("Стоимость — 15 000 ₸ в месяц.");
        let llm = Arc::new(LlmClient::new(mock));

        let result = validator
            .validate(
                "Стоимость 15000 руб. или 200₽ в месяц.",
                &ctx,
                Some(&llm),
                &Flags::new(),
            )
            .await;
        assert!(result.retry_used);
        assert!(!result.fallback_used);
        assert!(!result.response.to_lowercase().contains("руб"));
        assert!(!result.response.contains('₽'));
        assert!(result.response.contains('₸'));
    }

    #[tokio::test]
    async fn failed_retry_falls_to_sanitizer() {
        let mut validator = BoundaryValidator::new();
        let ctx = ctx_pricing();
        let mock = Arc::new(MockLlm::default());
        // The repair attempt violates again.
        mock.push_reply("Стоимость 15000 руб. в месяц.");
        let llm = Arc::new(LlmClient::new(mock));

        let result = validator
            .validate("Стоимость 15000 руб.", &ctx, Some(&llm), &Flags::new())
            .await;
        assert!(result.retry_used);
        assert!(!result.response.to_lowercase().contains("руб"));
        assert!(result.response.contains('₸'));
        assert!(result.response.chars().any(|c| c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn validator_is_a_contraction() {
        let mut validator = BoundaryValidator::new();
        let ctx = ctx_pricing();
        let result = validator
            .validate(
                "Я уже настроил вам систему и отправил договор.",
                &ctx,
                None,
                &Flags::new(),
            )
            .await;
        assert!(detect_violations(&result.response, &ctx).is_empty());
    }

    #[tokio::test]
    async fn metrics_accumulate() {
        let mut validator = BoundaryValidator::new();
        let ctx = ctx_pricing();
        validator
            .validate("Стоимость 500 руб.", &ctx, None, &Flags::new())
            .await;
        assert_eq!(validator.metrics().total, 1);
        assert_eq!(validator.metrics().by_violation["currency_locale"], 1);
    }
}
