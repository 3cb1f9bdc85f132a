//! Flow configuration: a named graph of dialogue states with phase
//! labels, data requirements, and intent-keyed transitions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use sf_domain::intents;

/// One dialogue state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    pub name: String,
    pub phase: String,
    /// What the bot is trying to achieve while in this state.
    pub goal: String,
    #[serde(default)]
    pub required_data: Vec<String>,
    #[serde(default)]
    pub optional_data: Vec<String>,
    /// Intent → next state.
    #[serde(default)]
    pub transitions: HashMap<String, String>,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default)]
    pub is_terminal_success: bool,
}

/// A complete flow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    pub name: String,
    pub version: String,
    /// Persona → entry state; "default" must be present.
    pub entry_points: HashMap<String, String>,
    pub phase_order: Vec<String>,
    pub states: Vec<StateConfig>,
    /// State → position in the funnel, used for progress deltas.
    /// States absent from this map yield a neutral delta.
    pub state_order: HashMap<String, i32>,
}

impl FlowConfig {
    pub fn get(&self, state: &str) -> Option<&StateConfig> {
        self.states.iter().find(|s| s.name == state)
    }

    pub fn entry(&self, persona: Option<&str>) -> &str {
        persona
            .and_then(|p| self.entry_points.get(p))
            .or_else(|| self.entry_points.get("default"))
            .map(String::as_str)
            .unwrap_or("greeting")
    }

    pub fn phase_of<'a>(&'a self, state: &'a str) -> &'a str {
        self.get(state).map(|s| s.phase.as_str()).unwrap_or(state)
    }

    pub fn order_of(&self, state: &str) -> Option<i32> {
        self.state_order.get(state).copied()
    }

    /// First state (by flow order) belonging to the given phase.
    pub fn state_for_phase(&self, phase: &str) -> Option<&str> {
        self.states
            .iter()
            .find(|s| s.phase == phase)
            .map(|s| s.name.as_str())
    }

    /// Resolve a flow by name. Unknown names fall back to the default
    /// flow with a warning.
    pub fn by_name(name: &str) -> FlowConfig {
        match name {
            "spin_selling" => spin_selling(),
            other => {
                tracing::warn!(flow = other, "unknown flow name, using spin_selling");
                spin_selling()
            }
        }
    }
}

/// The built-in SPIN selling flow.
///
/// greeting → situation → problem → implication → need-payoff →
/// presentation → close → success, with handle_objection parallel to
/// presentation and soft_close as the negative exit.
pub fn spin_selling() -> FlowConfig {
    let transitions = |pairs: &[(&str, &str)]| -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    };

    let states = vec![
        StateConfig {
            name: "greeting".into(),
            phase: "greeting".into(),
            goal: "Поздороваться и узнать о компании клиента".into(),
            required_data: vec![],
            optional_data: vec!["contact_name".into()],
            transitions: transitions(&[
                (intents::GREETING, "spin_situation"),
                (intents::SITUATION_PROVIDED, "spin_situation"),
                (intents::INFO_PROVIDED, "spin_situation"),
                (intents::AGREEMENT, "spin_situation"),
                (intents::PROBLEM_REVEALED, "spin_problem"),
                (intents::PRICE_QUESTION, "presentation"),
                (intents::DEMO_REQUEST, "close"),
                (intents::CALLBACK_REQUEST, "close"),
                (intents::CONTACT_PROVIDED, "spin_situation"),
                (intents::REJECTION, "soft_close"),
                (intents::FAREWELL, "soft_close"),
            ]),
            is_final: false,
            is_terminal_success: false,
        },
        StateConfig {
            name: "spin_situation".into(),
            phase: "spin_situation".into(),
            goal: "Понять текущую ситуацию: компания, размер, отрасль".into(),
            required_data: vec!["company_name".into()],
            optional_data: vec!["company_size".into(), "industry".into()],
            transitions: transitions(&[
                (intents::SITUATION_PROVIDED, "spin_problem"),
                (intents::INFO_PROVIDED, "spin_problem"),
                (intents::PROBLEM_REVEALED, "spin_implication"),
                (intents::NEED_EXPRESSED, "presentation"),
                (intents::PRICE_QUESTION, "presentation"),
                (intents::DEMO_REQUEST, "close"),
                (intents::CALLBACK_REQUEST, "close"),
                (intents::OBJECTION_PRICE, "handle_objection"),
                (intents::OBJECTION_COMPETITOR, "handle_objection"),
                (intents::OBJECTION_NO_TIME, "handle_objection"),
                (intents::OBJECTION_THINK, "handle_objection"),
                (intents::OBJECTION_NO_NEED, "handle_objection"),
                (intents::OBJECTION_TRUST, "handle_objection"),
                (intents::OBJECTION_TIMING, "handle_objection"),
                (intents::OBJECTION_COMPLEXITY, "handle_objection"),
                (intents::REJECTION, "soft_close"),
            ]),
            is_final: false,
            is_terminal_success: false,
        },
        StateConfig {
            name: "spin_problem".into(),
            phase: "spin_problem".into(),
            goal: "Выявить проблемы в текущих процессах".into(),
            required_data: vec!["pain_points".into()],
            optional_data: vec![],
            transitions: transitions(&[
                (intents::PROBLEM_REVEALED, "spin_implication"),
                (intents::INFO_PROVIDED, "spin_implication"),
                (intents::NEED_EXPRESSED, "presentation"),
                (intents::PRICE_QUESTION, "presentation"),
                (intents::DEMO_REQUEST, "close"),
                (intents::CALLBACK_REQUEST, "close"),
                (intents::OBJECTION_PRICE, "handle_objection"),
                (intents::OBJECTION_COMPETITOR, "handle_objection"),
                (intents::OBJECTION_NO_TIME, "handle_objection"),
                (intents::OBJECTION_THINK, "handle_objection"),
                (intents::OBJECTION_NO_NEED, "handle_objection"),
                (intents::OBJECTION_TRUST, "handle_objection"),
                (intents::OBJECTION_TIMING, "handle_objection"),
                (intents::OBJECTION_COMPLEXITY, "handle_objection"),
                (intents::REJECTION, "soft_close"),
            ]),
            is_final: false,
            is_terminal_success: false,
        },
        StateConfig {
            name: "spin_implication".into(),
            phase: "spin_implication".into(),
            goal: "Показать последствия нерешённых проблем".into(),
            required_data: vec![],
            optional_data: vec![],
            transitions: transitions(&[
                (intents::IMPLICATION_ACKNOWLEDGED, "spin_need_payoff"),
                (intents::INFO_PROVIDED, "spin_need_payoff"),
                (intents::AGREEMENT, "spin_need_payoff"),
                (intents::NEED_EXPRESSED, "presentation"),
                (intents::PRICE_QUESTION, "presentation"),
                (intents::DEMO_REQUEST, "close"),
                (intents::OBJECTION_PRICE, "handle_objection"),
                (intents::OBJECTION_NO_NEED, "handle_objection"),
                (intents::OBJECTION_THINK, "handle_objection"),
                (intents::REJECTION, "soft_close"),
            ]),
            is_final: false,
            is_terminal_success: false,
        },
        StateConfig {
            name: "spin_need_payoff".into(),
            phase: "spin_need_payoff".into(),
            goal: "Подвести клиента к ценности решения".into(),
            required_data: vec![],
            optional_data: vec![],
            transitions: transitions(&[
                (intents::NEED_EXPRESSED, "presentation"),
                (intents::AGREEMENT, "presentation"),
                (intents::INFO_PROVIDED, "presentation"),
                (intents::PRICE_QUESTION, "presentation"),
                (intents::DEMO_REQUEST, "close"),
                (intents::OBJECTION_PRICE, "handle_objection"),
                (intents::OBJECTION_THINK, "handle_objection"),
                (intents::REJECTION, "soft_close"),
            ]),
            is_final: false,
            is_terminal_success: false,
        },
        StateConfig {
            name: "presentation".into(),
            phase: "presentation".into(),
            goal: "Презентовать решение под выявленные потребности".into(),
            required_data: vec![],
            optional_data: vec!["interested_features".into()],
            transitions: transitions(&[
                (intents::AGREEMENT, "close"),
                (intents::DEMO_REQUEST, "close"),
                (intents::CALLBACK_REQUEST, "close"),
                (intents::CONTACT_PROVIDED, "close"),
                (intents::NEED_EXPRESSED, "close"),
                (intents::OBJECTION_PRICE, "handle_objection"),
                (intents::OBJECTION_COMPETITOR, "handle_objection"),
                (intents::OBJECTION_NO_TIME, "handle_objection"),
                (intents::OBJECTION_THINK, "handle_objection"),
                (intents::OBJECTION_NO_NEED, "handle_objection"),
                (intents::OBJECTION_TRUST, "handle_objection"),
                (intents::OBJECTION_TIMING, "handle_objection"),
                (intents::OBJECTION_COMPLEXITY, "handle_objection"),
                (intents::REJECTION, "soft_close"),
            ]),
            is_final: false,
            is_terminal_success: false,
        },
        StateConfig {
            name: "handle_objection".into(),
            phase: "presentation".into(),
            goal: "Отработать возражение и вернуть диалог к ценности".into(),
            required_data: vec![],
            optional_data: vec![],
            transitions: transitions(&[
                (intents::AGREEMENT, "presentation"),
                (intents::INFO_PROVIDED, "presentation"),
                (intents::QUESTION_FEATURES, "presentation"),
                (intents::PRICE_QUESTION, "presentation"),
                (intents::NEED_EXPRESSED, "presentation"),
                (intents::DEMO_REQUEST, "close"),
                (intents::CALLBACK_REQUEST, "close"),
                (intents::CONTACT_PROVIDED, "close"),
                (intents::REJECTION, "soft_close"),
            ]),
            is_final: false,
            is_terminal_success: false,
        },
        StateConfig {
            name: "close".into(),
            phase: "close".into(),
            goal: "Получить контакт и договориться о демо".into(),
            required_data: vec!["contact_info".into()],
            optional_data: vec!["contact_name".into()],
            transitions: transitions(&[
                (intents::CONTACT_PROVIDED, "success"),
                (intents::AGREEMENT, "success"),
                (intents::DEMO_REQUEST, "success"),
                (intents::CALLBACK_REQUEST, "success"),
                (intents::OBJECTION_PRICE, "handle_objection"),
                (intents::OBJECTION_THINK, "handle_objection"),
                (intents::REJECTION, "soft_close"),
            ]),
            is_final: false,
            is_terminal_success: false,
        },
        StateConfig {
            name: "success".into(),
            phase: "success".into(),
            goal: "Подтвердить договорённость и попрощаться".into(),
            required_data: vec![],
            optional_data: vec![],
            transitions: HashMap::new(),
            is_final: true,
            is_terminal_success: true,
        },
        StateConfig {
            name: "soft_close".into(),
            phase: "soft_close".into(),
            goal: "Мягко завершить диалог, оставив дверь открытой".into(),
            required_data: vec![],
            optional_data: vec![],
            transitions: HashMap::new(),
            is_final: true,
            is_terminal_success: false,
        },
    ];

    FlowConfig {
        name: "spin_selling".into(),
        version: "2.0".into(),
        entry_points: HashMap::from([("default".to_string(), "greeting".to_string())]),
        phase_order: vec![
            "greeting".into(),
            "spin_situation".into(),
            "spin_problem".into(),
            "spin_implication".into(),
            "spin_need_payoff".into(),
            "presentation".into(),
            "close".into(),
        ],
        states,
        state_order: HashMap::from([
            ("greeting".to_string(), 0),
            ("spin_situation".to_string(), 1),
            ("spin_problem".to_string(), 2),
            ("spin_implication".to_string(), 3),
            ("spin_need_payoff".to_string(), 4),
            ("presentation".to_string(), 5),
            ("handle_objection".to_string(), 5),
            ("close".to_string(), 6),
            ("success".to_string(), 7),
            ("soft_close".to_string(), -1),
        ]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_transition_target_exists() {
        let flow = spin_selling();
        for state in &flow.states {
            for target in state.transitions.values() {
                assert!(
                    flow.get(target).is_some(),
                    "state {} has dangling transition to {}",
                    state.name,
                    target
                );
            }
        }
    }

    #[test]
    fn every_state_has_an_order() {
        let flow = spin_selling();
        for state in &flow.states {
            assert!(
                flow.order_of(&state.name).is_some(),
                "state {} missing from state_order",
                state.name
            );
        }
    }

    #[test]
    fn entry_point_resolves() {
        let flow = spin_selling();
        assert_eq!(flow.entry(None), "greeting");
        assert_eq!(flow.entry(Some("no_such_persona")), "greeting");
    }

    #[test]
    fn terminal_states_marked() {
        let flow = spin_selling();
        assert!(flow.get("success").unwrap().is_terminal_success);
        assert!(flow.get("soft_close").unwrap().is_final);
        assert!(!flow.get("soft_close").unwrap().is_terminal_success);
    }

    #[test]
    fn unknown_flow_falls_back() {
        let flow = FlowConfig::by_name("enterprise_custom");
        assert_eq!(flow.name, "spin_selling");
    }
}
