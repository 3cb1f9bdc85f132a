//! Multi-tier fallback handler.
//!
//! Tier 1 rephrases, tier 2 offers structured options, tier 3 proposes
//! skipping ahead, soft close ends the dialogue. Template pools rotate
//! LRU-style so consecutive fallbacks never repeat verbatim.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::flow::FlowConfig;
use crate::guard::InterventionTier;

/// States where tier-2 options are tailored from context.
const DYNAMIC_CTA_STATES: &[&str] = &["spin_problem", "presentation", "handle_objection"];

const TIER1_TEMPLATES: &[&str] = &[
    "Кажется, я неудачно сформулировал вопрос. Попробую иначе: {goal}",
    "Давайте я спрошу по-другому: {goal}",
    "Переформулирую: {goal}",
];

const TIER2_TEMPLATES: &[&str] = &[
    "Чтобы не гадать, выберите что вам ближе:",
    "Давайте упростим. Что из этого интереснее?",
];

const TIER3_TEMPLATES: &[&str] = &[
    "Предлагаю не застревать на этом — двигаемся дальше.",
    "Хорошо, этот вопрос можно пропустить. Перейдём к следующему шагу.",
];

const SOFT_CLOSE_TEMPLATES: &[&str] = &[
    "Похоже, сейчас не самое удачное время. Оставлю контакты — возвращайтесь, когда будет удобно.",
    "Не буду больше отнимать время. Если решите вернуться к вопросу — я на связи.",
];

const STATIC_OPTIONS: &[&str] = &["Узнать цену", "Записаться на демо", "Задать вопрос"];

/// What the orchestrator does with a fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackAction {
    Rephrase,
    OfferOptions,
    Skip,
    Close,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackResponse {
    pub message: String,
    #[serde(default)]
    pub options: Option<Vec<String>>,
    pub action: FallbackAction,
    #[serde(default)]
    pub next_state: Option<String>,
}

/// Usage statistics, serialized with the session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FallbackStats {
    pub total: u64,
    #[serde(default)]
    pub by_tier: HashMap<String, u64>,
    #[serde(default)]
    pub by_state: HashMap<String, u64>,
    #[serde(default)]
    pub last_tier: Option<String>,
    #[serde(default)]
    pub last_state: Option<String>,
    #[serde(default)]
    pub dynamic_cta_uses: HashMap<String, u64>,
}

/// Serialized handler state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FallbackState {
    #[serde(default)]
    pub used_templates: HashMap<String, Vec<usize>>,
    #[serde(default)]
    pub stats: FallbackStats,
}

#[derive(Default)]
pub struct FallbackHandler {
    state: FallbackState,
}

impl FallbackHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &FallbackStats {
        &self.state.stats
    }

    /// Produce a fallback for the given tier and state.
    pub fn get_fallback(
        &mut self,
        tier: InterventionTier,
        state: &str,
        goal: &str,
        collected_data: &Map<String, Value>,
        flow: &FlowConfig,
        dynamic_cta_enabled: bool,
    ) -> FallbackResponse {
        self.state.stats.total += 1;
        *self
            .state
            .stats
            .by_tier
            .entry(tier.as_str().to_owned())
            .or_insert(0) += 1;
        *self
            .state
            .stats
            .by_state
            .entry(state.to_owned())
            .or_insert(0) += 1;
        self.state.stats.last_tier = Some(tier.as_str().to_owned());
        self.state.stats.last_state = Some(state.to_owned());

        match tier {
            InterventionTier::Tier1 => {
                let template = self.rotate(tier, TIER1_TEMPLATES);
                FallbackResponse {
                    message: template.replace("{goal}", goal),
                    options: None,
                    action: FallbackAction::Rephrase,
                    next_state: None,
                }
            }
            InterventionTier::Tier2 => {
                let template = self.rotate(tier, TIER2_TEMPLATES);
                let options = self.build_options(state, collected_data, dynamic_cta_enabled);
                FallbackResponse {
                    message: template.to_owned(),
                    options: Some(options),
                    action: FallbackAction::OfferOptions,
                    next_state: None,
                }
            }
            InterventionTier::Tier3 => {
                let template = self.rotate(tier, TIER3_TEMPLATES);
                FallbackResponse {
                    message: template.to_owned(),
                    options: None,
                    action: FallbackAction::Skip,
                    next_state: next_state_after(flow, state),
                }
            }
            InterventionTier::SoftClose => {
                let template = self.rotate(tier, SOFT_CLOSE_TEMPLATES);
                FallbackResponse {
                    message: template.to_owned(),
                    options: None,
                    action: FallbackAction::Close,
                    next_state: Some("soft_close".into()),
                }
            }
        }
    }

    /// Pick the least recently used template from a pool.
    fn rotate(&mut self, tier: InterventionTier, pool: &[&'static str]) -> &'static str {
        let used = self
            .state
            .used_templates
            .entry(tier.as_str().to_owned())
            .or_default();
        let index = (0..pool.len())
            .find(|i| !used.contains(i))
            .unwrap_or_else(|| {
                // Everything used: the front of the ring is oldest.
                used.first().copied().unwrap_or(0)
            });
        used.retain(|i| *i != index);
        used.push(index);
        if used.len() >= pool.len() {
            used.remove(0);
        }
        pool[index]
    }

    /// Tier-2 options: context-tailored in dynamic CTA states, static
    /// defaults otherwise.
    fn build_options(
        &mut self,
        state: &str,
        collected_data: &Map<String, Value>,
        dynamic_cta_enabled: bool,
    ) -> Vec<String> {
        if dynamic_cta_enabled && DYNAMIC_CTA_STATES.contains(&state) {
            let pain = collected_data
                .get("pain_points")
                .and_then(|v| v.as_array())
                .and_then(|a| a.first())
                .and_then(|v| v.as_str());
            let competitor = collected_data
                .get("competitor_mentioned")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);

            if let Some(pain) = pain {
                *self
                    .state
                    .stats
                    .dynamic_cta_uses
                    .entry("pain".into())
                    .or_insert(0) += 1;
                return vec![
                    format!("Как решить: {pain}"),
                    "Записаться на демо".into(),
                    "Узнать цену".into(),
                ];
            }
            if competitor {
                *self
                    .state
                    .stats
                    .dynamic_cta_uses
                    .entry("competitor".into())
                    .or_insert(0) += 1;
                return vec![
                    "Сравнить с вашей системой".into(),
                    "Записаться на демо".into(),
                    "Узнать цену".into(),
                ];
            }
        }
        STATIC_OPTIONS.iter().map(|s| s.to_string()).collect()
    }

    pub fn reset(&mut self) {
        self.state = FallbackState::default();
    }

    pub fn to_state(&self) -> FallbackState {
        self.state.clone()
    }

    pub fn load_state(&mut self, state: FallbackState) {
        self.state = state;
    }
}

/// Next non-final state in flow order after `state`.
fn next_state_after(flow: &FlowConfig, state: &str) -> Option<String> {
    let current = flow.order_of(state)?;
    flow.states
        .iter()
        .filter(|s| !s.is_final)
        .filter_map(|s| flow.order_of(&s.name).map(|o| (s, o)))
        .filter(|(s, o)| *o > current && s.name != state)
        .min_by_key(|(_, o)| *o)
        .map(|(s, _)| s.name.clone())
}
