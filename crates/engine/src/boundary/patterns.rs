//! Compiled detection patterns for the boundary validator.

use once_cell::sync::Lazy;
use regex::Regex;

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static boundary pattern")
}

pub static RUB_PATTERN: Lazy<Regex> =
    Lazy::new(|| re(r"(?iu)\bруб(?:\.|ля|лей|ль)?\b|₽"));

pub static LEADING_ARTIFACT: Lazy<Regex> =
    Lazy::new(|| re(r"^\s*[\.,!\?]?\s*[—\-:]+\s*"));

pub static MID_CONV_GREETING: Lazy<Regex> =
    Lazy::new(|| re(r"(?iu)^\s*(?:здравствуйте|добрый\s+(?:день|вечер|утро)|привет)"));

/// Known typo → canonical replacement.
pub const KNOWN_TYPOS: &[(&str, &str)] = &[
    ("колличество", "количество"),
    ("агенство", "агентство"),
    ("в течении месяца", "в течение месяца"),
];

pub static KZ_PHONE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    re(r"(?:\+?[78])[\s\-\(]?\d{3}[\s\-\)]?\d{3}[\s\-]?\d{2}[\s\-]?\d{2}")
});

pub static IIN_PATTERN: Lazy<Regex> = Lazy::new(|| re(r"\b\d{12}\b"));

pub static SEND_PROMISE: Lazy<Regex> = Lazy::new(|| {
    re(r"(?iu)(?:отправлю|пришлю|скину|вышлю)\s+(?:вам\s+)?(?:файл|фото|документ|каталог|прайс|презентаци|ссылк)")
});

pub static SEND_CAPABILITY: Lazy<Regex> = Lazy::new(|| {
    re(r"(?iu)могу\s+(?:отправить|прислать|скинуть)\s+(?:файл|фото|документ|каталог|прайс)")
});

pub static PAST_ACTION: Lazy<Regex> = Lazy::new(|| {
    re(r"(?iu)я\s+(?:уже\s+)?(?:настроил|создал|отправил|оформил|подключил|зарегистрировал)")
});

pub static PAST_SETUP: Lazy<Regex> = Lazy::new(|| {
    re(r"(?iu)(?:всё|все)\s+(?:уже\s+)?(?:настроено|готово|подключено)\s+(?:для\s+вас|у\s+вас)")
});

pub static FALSE_COMPANY_POLICY: Lazy<Regex> = Lazy::new(|| {
    re(r"(?iu)(?:наша\s+компания|мы)\s+(?:никогда\s+)?не\s+(?:работаем\s+с|предоставляем\s+скидк|делаем\s+демо|звоним\s+клиентам)")
});

pub static INVOICE_PROMISE: Lazy<Regex> = Lazy::new(|| {
    re(r"(?iu)(?:выставлю|сформирую|подготовлю)\s+(?:вам\s+)?сч[её]т")
});

pub static DEMO_BOOKED: Lazy<Regex> = Lazy::new(|| {
    re(r"(?iu)(?:записал|записываю|забронировал)\s+(?:вас\s+)?на\s+демо")
});

pub static MANAGER_CONTACT_GIVEOUT: Lazy<Regex> = Lazy::new(|| {
    re(r"(?iu)номер\s+(?:нашего\s+)?менеджера[^\d]{0,20}\+?\d")
});

pub static FAKE_CLIENT_NAME: Lazy<Regex> = Lazy::new(|| {
    re(r"(?u)наш\s+клиент\s+[А-ЯЁ][а-яё]+(?:\s+[А-ЯЁ][а-яё]+)?\s+(?:говорит|отметил|рассказал)")
});

pub static OFF_TOPIC_RECOMMENDATION: Lazy<Regex> = Lazy::new(|| {
    re(r"(?iu)(?:советую|рекомендую)\s+(?:купить|заказать|обратиться)\s+(?:в|к)\s+(?:друг|магазин|стороннем)")
});

pub static POLICY_DISCLOSURE: Lazy<Regex> = Lazy::new(|| {
    re(r"(?iu)системн\w*\s+промпт|мне\s+запрещено|согласно\s+(?:моей\s+)?инструкци|как\s+(?:ии|языковая\s+модель|бот\s+я\s+не)")
});

pub static CONTACT_CONFIRMED: Lazy<Regex> = Lazy::new(|| {
    re(r"(?iu)(?:записал|сохранил|зафиксировал)\s+(?:ваш\s+)?(?:номер|контакт|телефон)")
});

pub static IIN_CONFIRMED: Lazy<Regex> = Lazy::new(|| {
    re(r"(?iu)иин\s+(?:получен|принят|записан|сохран[её]н|зафиксирован)")
});

pub static INVOICE_READY: Lazy<Regex> = Lazy::new(|| {
    re(r"(?iu)сч[её]т\s+(?:готов|выставлен|сформирован|отправлен)")
});

pub static META_INSTRUCTION: Lazy<Regex> = Lazy::new(|| {
    re(r"(?iu)\[(?:инструкция|шаблон|системное)\]|согласно\s+шаблону|as\s+an\s+ai")
});

pub static META_NARRATION: Lazy<Regex> = Lazy::new(|| {
    re(r"(?iu)вот\s+(?:мой\s+)?(?:вариант\s+)?ответ|ниже\s+привед[её]н|я\s+сгенерировал|в\s+качестве\s+ответа\s+менеджера")
});

pub static IIN_REASK: Lazy<Regex> = Lazy::new(|| {
    re(r"(?iu)(?:укажите|назовите|пришлите|нужен)\s+(?:ваш\s+)?иин")
});

pub static IIN_REFUSAL: Lazy<Regex> = Lazy::new(|| {
    re(r"(?iu)(?:не\s+(?:дам|буду\s+давать|скажу|хочу\s+давать)|без)\s+иин")
});

pub static QUANT_CLAIM: Lazy<Regex> = Lazy::new(|| {
    re(r"(?iu)в\s+\d+(?:[.,]\d+)?\s+раз|на\s+\d+\s*%|\b\d+\s*%")
});

pub static UNGROUNDED_GUARANTEE: Lazy<Regex> = Lazy::new(|| {
    re(r"(?iu)гарантируем|100%\s+результат|точно\s+окупится|стопроцентно")
});

pub static UNGROUNDED_SOCIAL_PROOF: Lazy<Regex> = Lazy::new(|| {
    re(r"(?iu)многие\s+(?:наши\s+)?клиенты|тысячи\s+компаний|большинство\s+клиентов")
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rub_matches_declensions() {
        for text in ["100 руб.", "100 рублей", "двести ₽"] {
            assert!(RUB_PATTERN.is_match(text), "{text}");
        }
        assert!(!RUB_PATTERN.is_match("рубеж интересов"));
    }

    #[test]
    fn phone_pattern_matches_kz_formats() {
        for text in ["+7 707 123 45 67", "87071234567", "+7(707)123-45-67"] {
            assert!(KZ_PHONE_PATTERN.is_match(text), "{text}");
        }
    }

    #[test]
    fn iin_is_exactly_twelve_digits() {
        assert!(IIN_PATTERN.is_match("123456789012"));
        assert!(!IIN_PATTERN.is_match("12345678901"));
        assert!(!IIN_PATTERN.is_match("1234567890123"));
    }

    #[test]
    fn greeting_detector_anchors_at_start() {
        assert!(MID_CONV_GREETING.is_match("Здравствуйте! Продолжим."));
        assert!(!MID_CONV_GREETING.is_match("Мы уже поздоровались, здравствуйте не нужно."));
    }

    #[test]
    fn send_promise_needs_object() {
        assert!(SEND_PROMISE.is_match("отправлю вам файл с тарифами"));
        assert!(!SEND_PROMISE.is_match("отправлю запрос менеджеру"));
    }
}
