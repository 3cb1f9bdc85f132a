//! Tone marker tables (Russian-language dialogues).

use once_cell::sync::Lazy;
use regex::Regex;

use sf_domain::tone::Tone;

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(&format!("(?iu){p}")).expect("static tone pattern"))
        .collect()
}

/// Marker patterns per tone. Order inside a tone does not matter; every
/// matching pattern counts as one signal.
pub static TONE_MARKERS: Lazy<Vec<(Tone, Vec<Regex>)>> = Lazy::new(|| {
    vec![
        (
            Tone::Frustrated,
            compile(&[
                r"сколько\s+можно",
                r"надоел",
                r"достал",
                r"задолбал",
                r"бесит",
                r"раздража",
                r"опять\s+(вы|эти|то\s+же)",
                r"хватит",
                r"ужас",
                r"да\s+что\s+ж",
                r"вы\s+издева",
                r"ничего\s+не\s+работает",
            ]),
        ),
        (
            Tone::Rushed,
            compile(&[
                r"быстрее",
                r"побыстрее",
                r"некогда",
                r"не\s+тяни",
                r"времени\s+нет",
                r"нет\s+времени",
                r"срочно",
                r"давай\s+к\s+делу",
                r"короче",
                r"по\s+сути",
                r"тороплюсь",
            ]),
        ),
        (
            Tone::Skeptical,
            compile(&[
                r"сомнева",
                r"не\s+верю",
                r"вряд\s+ли",
                r"да\s+ну",
                r"правда\s*\?",
                r"серь[её]зно\s*\?",
                r"звучит\s+слишком",
                r"все\s+так\s+говорят",
                r"докажите",
            ]),
        ),
        (
            Tone::Confused,
            compile(&[
                r"не\s+понимаю",
                r"не\s+понял",
                r"не\s+поняла",
                r"запутал",
                r"что\s+это\s+значит",
                r"как\s+это\s+работает\s*\?",
                r"поясните",
                r"сложно\s+понять",
            ]),
        ),
        (
            Tone::Positive,
            compile(&[
                r"отлично",
                r"супер",
                r"здорово",
                r"замечательно",
                r"круто",
                r"спасибо",
                r"благодарю",
                r"нравится",
            ]),
        ),
        (
            Tone::Interested,
            compile(&[
                r"интересно",
                r"расскажите\s+подробнее",
                r"подробнее",
                r"хочу\s+узнать",
                r"любопытно",
                r"а\s+как\s+насч[её]т",
            ]),
        ),
    ]
});

/// Informality markers for style detection.
pub static INFORMAL_MARKERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"\bприв(ет|етик)\b",
        r"\bага\b",
        r"\bокей\b",
        r"\bок\b",
        r"\bдавай\b",
        r"\bщас\b",
        r"\bнорм\b",
        r"\bч[её]\b",
        r"\bкороч\b",
        r"\)\)\)",
        r"\bспс\b",
    ])
});

/// Frustration increase per negative tone.
pub fn frustration_weight(tone: Tone) -> i32 {
    match tone {
        Tone::Frustrated => 3,
        Tone::Rushed => 2,
        Tone::Skeptical => 1,
        Tone::Confused => 1,
        _ => 0,
    }
}

/// Frustration decrease per positive tone.
pub fn frustration_decay(tone: Tone) -> i32 {
    match tone {
        Tone::Positive => 2,
        Tone::Interested => 1,
        _ => 0,
    }
}
