//! Response diversity: opening rotation and near-duplicate suppression.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Overused openings that get rotated out when repeated.
static BANNED_OPENINGS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^Отлично[!,.]?\s*",
        r"^Понимаю вас[!,.]?\s*",
        r"^Хорошо[!,.]?\s*",
        r"^Конечно[!,.]?\s*",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?iu){p}")).expect("static opening pattern"))
    .collect()
});

/// Replacement openings, rotated per category.
const ALTERNATIVE_OPENINGS: &[&str] = &["Смотрите: ", "Если коротко: ", "По сути: ", ""];

/// Jaccard word-set similarity above which two responses are considered
/// duplicates.
const DEDUP_THRESHOLD: f64 = 0.6;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiversityState {
    #[serde(default)]
    pub last_bot_response: Option<String>,
    #[serde(default)]
    pub opening_rotation: usize,
    #[serde(default)]
    pub recent_openings: Vec<String>,
}

#[derive(Default)]
pub struct DiversityEngine {
    state: DiversityState,
}

impl DiversityEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Post-process a drafted response: rotate a repeated opening away
    /// and rewrite near-duplicates of the previous reply.
    pub fn apply(&mut self, response: &str) -> String {
        let mut text = response.trim().to_owned();

        // Opening rotation: the same opening twice in a row is rewritten.
        if let Some(opening) = current_opening(&text) {
            if self.state.recent_openings.last() == Some(&opening) {
                for pattern in BANNED_OPENINGS.iter() {
                    if pattern.is_match(&text) {
                        let replacement =
                            ALTERNATIVE_OPENINGS[self.state.opening_rotation % ALTERNATIVE_OPENINGS.len()];
                        self.state.opening_rotation += 1;
                        text = pattern.replace(&text, replacement).into_owned();
                        text = capitalize_first(&text);
                        break;
                    }
                }
            }
            self.state.recent_openings.push(opening);
            if self.state.recent_openings.len() > 5 {
                self.state.recent_openings.remove(0);
            }
        }

        // Dedup: too similar to the previous reply gets a prefix nudge.
        if let Some(previous) = &self.state.last_bot_response {
            if jaccard(previous, &text) > DEDUP_THRESHOLD {
                let nudge =
                    ALTERNATIVE_OPENINGS[self.state.opening_rotation % ALTERNATIVE_OPENINGS.len()];
                self.state.opening_rotation += 1;
                if !nudge.is_empty() && !text.starts_with(nudge) {
                    text = format!("{nudge}{}", decapitalize_first(&text));
                }
            }
        }

        self.state.last_bot_response = Some(text.clone());
        text
    }

    pub fn reset(&mut self) {
        self.state = DiversityState::default();
    }

    pub fn to_state(&self) -> DiversityState {
        self.state.clone()
    }

    pub fn load_state(&mut self, state: DiversityState) {
        self.state = state;
    }
}

/// The opening token of a response, used to detect repetition.
fn current_opening(text: &str) -> Option<String> {
    text.split_whitespace()
        .next()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| !w.is_empty())
}

/// Word-set Jaccard similarity.
pub fn jaccard(a: &str, b: &str) -> f64 {
    let set_a: std::collections::HashSet<String> =
        a.to_lowercase().split_whitespace().map(str::to_owned).collect();
    let set_b: std::collections::HashSet<String> =
        b.to_lowercase().split_whitespace().map(str::to_owned).collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count() as f64;
    let union = set_a.union(&set_b).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

fn capitalize_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn decapitalize_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
