//! Canned fallback texts keyed by dialogue state.
//!
//! Served when the LLM transport is exhausted or the circuit is open,
//! so a turn always produces a usable reply.

/// Fallback text for a given state; unknown states get the default.
pub fn fallback_for_state(state: &str) -> &'static str {
    match state {
        "greeting" => {
            "Здравствуйте! Я помогу подобрать решение для вашего бизнеса. \
             Расскажите немного о вашей компании?"
        }
        "spin_situation" => "Расскажите, пожалуйста, немного о вашей компании и как сейчас устроена работа с клиентами?",
        "spin_problem" => "С какими сложностями в учёте или продажах вы сталкиваетесь чаще всего?",
        "spin_implication" => "Как эти сложности влияют на выручку и время команды?",
        "spin_need_payoff" => "Если бы эту задачу удалось решить, что бы это дало вашему бизнесу?",
        "presentation" => {
            "Наша система автоматизирует учёт и продажи: все заявки, товары и отчёты в одном месте. \
             Рассказать подробнее или сразу показать на демо?"
        }
        "handle_objection" => "Понимаю вас. Давайте разберём, что именно вызывает сомнения?",
        "close" => "Давайте запланируем короткое демо — удобно завтра или послезавтра?",
        "soft_close" => "Хорошо, не буду настаивать. Если появятся вопросы — я на связи.",
        _ => "Извините, я вас не совсем понял. Могли бы вы переформулировать?",
    }
}
