//! Guarded dialogue state machine.
//!
//! Transition priority per turn: disambiguation routing (owned by the
//! orchestrator via the mode flags kept here) → data-collection gates →
//! the state's intent transition map, with `continue_current_goal` for
//! unmapped intents. Policy overrides are applied by the orchestrator
//! after the machine has produced its result.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use sf_analysis::intent::DisambiguationContext;
use sf_domain::intents;

use crate::flow::FlowConfig;

/// List-valued collected-data keys accumulate instead of overwriting.
const LIST_KEYS: &[&str] = &["pain_points", "interested_features", "objection_types"];

/// Bound on circular (go-back) transitions per session.
const MAX_GOBACKS: u32 = 3;

/// Tracks controlled phase regressions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CircularFlowState {
    pub goback_count: u32,
    #[serde(default)]
    pub goback_history: Vec<(String, String)>,
}

impl CircularFlowState {
    pub fn can_go_back(&self) -> bool {
        self.goback_count < MAX_GOBACKS
    }

    pub fn record(&mut self, from: &str, to: &str) {
        self.goback_count += 1;
        self.goback_history.push((from.to_owned(), to.to_owned()));
    }
}

/// Serialized machine state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMachineState {
    pub current_state: String,
    pub current_phase: String,
    pub collected_data: Map<String, Value>,
    #[serde(default)]
    pub in_disambiguation: bool,
    #[serde(default)]
    pub disambiguation_context: Option<DisambiguationContext>,
    #[serde(default)]
    pub pre_disambiguation_state: Option<String>,
    #[serde(default)]
    pub turns_since_last_disambiguation: u32,
    #[serde(default)]
    pub circular_flow: CircularFlowState,
}

/// Result of one `process` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMachineResult {
    pub prev_state: String,
    pub next_state: String,
    pub action: String,
    pub goal: String,
    pub collected_data: Map<String, Value>,
    pub missing_data: Vec<String>,
    pub optional_data: Vec<String>,
    pub is_final: bool,
    pub spin_phase: String,
}

pub struct StateMachine {
    flow: FlowConfig,
    state: StateMachineState,
}

impl StateMachine {
    pub fn new(flow: FlowConfig, persona: Option<&str>) -> Self {
        let entry = flow.entry(persona).to_owned();
        let phase = flow.phase_of(&entry).to_owned();
        Self {
            flow,
            state: StateMachineState {
                current_state: entry,
                current_phase: phase,
                collected_data: Map::new(),
                in_disambiguation: false,
                disambiguation_context: None,
                pre_disambiguation_state: None,
                turns_since_last_disambiguation: 0,
                circular_flow: CircularFlowState::default(),
            },
        }
    }

    pub fn flow(&self) -> &FlowConfig {
        &self.flow
    }

    pub fn state(&self) -> &str {
        &self.state.current_state
    }

    pub fn phase(&self) -> &str {
        &self.state.current_phase
    }

    pub fn collected_data(&self) -> &Map<String, Value> {
        &self.state.collected_data
    }

    pub fn collected_data_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.state.collected_data
    }

    pub fn in_disambiguation(&self) -> bool {
        self.state.in_disambiguation
    }

    pub fn disambiguation_context(&self) -> Option<&DisambiguationContext> {
        self.state.disambiguation_context.as_ref()
    }

    /// Force the current state (fallback skip, policy override).
    /// The phase invariant is maintained here.
    pub fn set_state(&mut self, state: &str) {
        self.state.current_state = state.to_owned();
        self.state.current_phase = self.flow.phase_of(state).to_owned();
    }

    /// Advance the disambiguation cooldown counter; called once per turn.
    pub fn increment_turn(&mut self) {
        self.state.turns_since_last_disambiguation =
            self.state.turns_since_last_disambiguation.saturating_add(1);
    }

    /// Enter disambiguation mode, remembering where we came from.
    pub fn enter_disambiguation(&mut self, context: DisambiguationContext) {
        self.state.pre_disambiguation_state = Some(self.state.current_state.clone());
        self.state.disambiguation_context = Some(context);
        self.state.in_disambiguation = true;
        self.state.turns_since_last_disambiguation = 0;
    }

    /// Leave disambiguation mode, returning the resolution context.
    pub fn exit_disambiguation(&mut self) -> Option<DisambiguationContext> {
        self.state.in_disambiguation = false;
        self.state.pre_disambiguation_state = None;
        self.state.disambiguation_context.take()
    }

    /// Bump the attempt counter inside an active disambiguation.
    /// Returns the updated attempt count.
    pub fn record_disambiguation_attempt(&mut self) -> u32 {
        if let Some(ctx) = self.state.disambiguation_context.as_mut() {
            ctx.attempts += 1;
            ctx.attempts
        } else {
            0
        }
    }

    /// Merge extracted data into collected data.
    ///
    /// Scalar keys overwrite (newer value replaces older); list keys
    /// append with order-preserving dedup.
    pub fn merge_extracted(&mut self, extracted: &Map<String, Value>) {
        for (key, value) in extracted {
            if LIST_KEYS.contains(&key.as_str()) {
                let entry = self
                    .state
                    .collected_data
                    .entry(key.clone())
                    .or_insert_with(|| Value::Array(Vec::new()));
                if let Value::Array(list) = entry {
                    let incoming: Vec<Value> = match value {
                        Value::Array(items) => items.clone(),
                        other => vec![other.clone()],
                    };
                    for item in incoming {
                        if !list.contains(&item) {
                            list.push(item);
                        }
                    }
                }
            } else if !value.is_null() {
                self.state.collected_data.insert(key.clone(), value.clone());
            }
        }
    }

    /// Required fields of the current state still missing.
    pub fn missing_data(&self) -> Vec<String> {
        self.flow
            .get(&self.state.current_state)
            .map(|config| {
                config
                    .required_data
                    .iter()
                    .filter(|field| !self.state.collected_data.contains_key(*field))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Run one transition.
    pub fn process(&mut self, intent: &str, extracted: &Map<String, Value>) -> StateMachineResult {
        let prev_state = self.state.current_state.clone();

        // 1. Merge data first: the message may simultaneously answer the
        // current ask and trigger a transition.
        self.merge_extracted(extracted);

        let config = self.flow.get(&prev_state).cloned();
        let missing = self.missing_data();
        let optional = config
            .as_ref()
            .map(|c| c.optional_data.clone())
            .unwrap_or_default();
        let goal = config.as_ref().map(|c| c.goal.clone()).unwrap_or_default();

        // 2. Transition selection. The data gate outranks the intent
        // map: while required fields are missing, the machine stays put
        // and asks for the next one; only a complete state consults its
        // outgoing transitions.
        let mapped_target = config
            .as_ref()
            .and_then(|c| c.transitions.get(intent).cloned());

        let (next_state, action) = if !missing.is_empty() {
            (prev_state.clone(), "ask_missing_data".to_owned())
        } else if let Some(target) = mapped_target {
            (target.clone(), action_for(intent, &target))
        } else {
            (prev_state.clone(), action_for(intent, &prev_state))
        };

        // 3. Apply the transition and keep the phase invariant.
        if next_state != prev_state {
            let from_order = self.flow.order_of(&prev_state);
            let to_order = self.flow.order_of(&next_state);
            if let (Some(from), Some(to)) = (from_order, to_order) {
                if to < from && to >= 0 && self.state.circular_flow.can_go_back() {
                    self.state.circular_flow.record(&prev_state, &next_state);
                }
            }
            self.set_state(&next_state);
        }

        let is_final = self
            .flow
            .get(&next_state)
            .map(|c| c.is_final)
            .unwrap_or(false);

        StateMachineResult {
            prev_state,
            next_state: next_state.clone(),
            action,
            goal,
            collected_data: self.state.collected_data.clone(),
            missing_data: self.missing_data(),
            optional_data: optional,
            is_final,
            spin_phase: self.flow.phase_of(&next_state).to_owned(),
        }
    }

    pub fn reset(&mut self) {
        let entry = self.flow.entry(None).to_owned();
        self.state = StateMachineState {
            current_phase: self.flow.phase_of(&entry).to_owned(),
            current_state: entry,
            collected_data: Map::new(),
            in_disambiguation: false,
            disambiguation_context: None,
            pre_disambiguation_state: None,
            turns_since_last_disambiguation: 0,
            circular_flow: CircularFlowState::default(),
        };
    }

    pub fn to_state(&self) -> StateMachineState {
        self.state.clone()
    }

    pub fn load_state(&mut self, mut state: StateMachineState) {
        // The phase is derived, never trusted from the wire.
        state.current_phase = self.flow.phase_of(&state.current_state).to_owned();
        self.state = state;
    }
}

/// Map an intent (and its target) onto an abstract action label.
fn action_for(intent: &str, target_state: &str) -> String {
    if intents::is_objection(intent) || target_state == "handle_objection" {
        return "handle_objection".into();
    }
    match intent {
        intents::PRICE_QUESTION | intents::PRICING_DETAILS => "answer_with_pricing".into(),
        intents::QUESTION_FEATURES | intents::QUESTION_INTEGRATIONS | intents::COMPARISON => {
            "answer_question".into()
        }
        intents::DEMO_REQUEST | intents::CALLBACK_REQUEST => "book_demo".into(),
        intents::CONTACT_PROVIDED if target_state == "success" => "confirm_success".into(),
        intents::REJECTION | intents::FAREWELL => "soft_close".into(),
        _ if target_state == "success" => "confirm_success".into(),
        _ if target_state == "soft_close" => "soft_close".into(),
        _ => "continue_current_goal".into(),
    }
}
