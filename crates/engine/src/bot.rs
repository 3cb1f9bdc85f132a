//! The per-turn orchestrator.
//!
//! Wires tone analysis, the guard, the intent cascade, objection
//! handling, lead scoring, the state machine, the policy overlay, and
//! the generator into one `process` call, and owns the snapshot
//! round-trip for the whole session.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use sf_analysis::intent::{
    keyword, Classification, ClassifyContext, DisambiguationContext, DisambiguationDecision,
    DisambiguationEngine, IntentClassifier, OptionMatch, WindowSummary,
};
use sf_analysis::objection::{ObjectionHandler, ObjectionState};
use sf_analysis::tone::frustration::FrustrationState;
use sf_analysis::tone::CascadeToneAnalyzer;
use sf_dialogue::context_window::{ContextWindow, ContextWindowState, TurnRecord, TurnType};
use sf_dialogue::envelope::build_context_envelope;
use sf_dialogue::fallback::{FallbackAction, FallbackResponse, FallbackState};
use sf_dialogue::flow::FlowConfig;
use sf_dialogue::guard::{ConversationGuard, GuardConfig, GuardState, InterventionTier};
use sf_dialogue::lead::{LeadScorer, LeadScorerState};
use sf_dialogue::policy::{build_response_directives, DialoguePolicy};
use sf_dialogue::state_machine::{StateMachine, StateMachineState};
use sf_dialogue::FallbackHandler;
use sf_domain::flags::Flags;
use sf_domain::frustration::FrustrationThresholds;
use sf_domain::intents;
use sf_domain::snapshot::{HistoryTurn, Snapshot, SNAPSHOT_VERSION};
use sf_domain::tone::ToneAnalysis;
use sf_domain::trace::{DecisionTrace, DecisionTraceBuilder, TraceStage};
use sf_domain::{Error, Result};
use sf_llm::LlmClient;

use crate::boundary::BoundaryValidator;
use crate::compactor::{FallbackContext, HistoryCompactor};
use crate::generator::diversity::DiversityState;
use crate::generator::{GenerationContext, ResponseGenerator};
use crate::metrics::{ConversationMetrics, ConversationOutcome, MetricsState};
use crate::retriever::KnowledgeRetriever;

/// Turns a disambiguation sub-dialogue may take before resolving to
/// `unclear`.
const DISAMBIGUATION_MAX_ATTEMPTS: u32 = 2;
/// Cooldown (turns) between disambiguation initiations.
const DISAMBIGUATION_COOLDOWN_TURNS: u32 = 3;

/// Injected collaborators shared across sessions.
#[derive(Clone)]
pub struct BotDeps {
    pub llm: Option<Arc<LlmClient>>,
    pub retriever: Arc<dyn KnowledgeRetriever>,
    pub flags: Arc<Flags>,
    pub thresholds: FrustrationThresholds,
}

impl BotDeps {
    pub fn offline(retriever: Arc<dyn KnowledgeRetriever>) -> Self {
        Self {
            llm: None,
            retriever,
            flags: Arc::new(Flags::new()),
            thresholds: FrustrationThresholds::default(),
        }
    }
}

/// The result of one turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub response: String,
    pub intent: String,
    pub action: String,
    pub state: String,
    pub is_final: bool,
    pub spin_phase: String,
    pub tone: String,
    pub frustration_level: i32,
    pub lead_score: Option<i32>,
    pub objection_detected: bool,
    pub fallback_used: bool,
    pub fallback_tier: Option<String>,
    pub options: Option<Vec<String>>,
    pub decision_trace: Option<DecisionTrace>,
}

/// Serialized `last_*` bookkeeping (the `intent_tracker` snapshot key).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct IntentTrackerState {
    last_intent: String,
    last_action: String,
    turn: u32,
    #[serde(default)]
    diversity: DiversityState,
}

pub struct SalesBot {
    pub conversation_id: String,
    client_id: Option<String>,
    flow_name: String,
    config_name: String,
    deps: BotDeps,
    flow: FlowConfig,

    classifier: IntentClassifier,
    disambiguation: DisambiguationEngine,
    tone: CascadeToneAnalyzer,
    guard: ConversationGuard,
    state_machine: StateMachine,
    lead_scorer: LeadScorer,
    fallback: FallbackHandler,
    objections: ObjectionHandler,
    context_window: ContextWindow,
    policy: DialoguePolicy,
    generator: ResponseGenerator,
    validator: BoundaryValidator,
    metrics: ConversationMetrics,

    history: Vec<HistoryTurn>,
    history_compact: Option<sf_domain::snapshot::HistoryCompact>,
    history_compact_meta: Option<sf_domain::snapshot::CompactionMeta>,
    last_action: String,
    last_intent: String,
    turn: u32,
    traces: Vec<DecisionTrace>,
}

impl SalesBot {
    pub fn new(
        conversation_id: &str,
        client_id: Option<&str>,
        flow_name: &str,
        config_name: &str,
        deps: BotDeps,
    ) -> Self {
        let flow = FlowConfig::by_name(flow_name);
        let guard_config = match config_name {
            "strict" => GuardConfig::strict(&deps.thresholds),
            "relaxed" => GuardConfig::relaxed(&deps.thresholds),
            _ => GuardConfig::default_with(&deps.thresholds),
        };
        Self {
            conversation_id: conversation_id.to_owned(),
            client_id: client_id.map(str::to_owned),
            flow_name: flow.name.clone(),
            config_name: config_name.to_owned(),
            flow: flow.clone(),
            classifier: IntentClassifier::new(),
            disambiguation: DisambiguationEngine::default(),
            tone: CascadeToneAnalyzer::new(deps.thresholds),
            guard: ConversationGuard::new(guard_config),
            state_machine: StateMachine::new(flow, None),
            lead_scorer: LeadScorer::default(),
            fallback: FallbackHandler::new(),
            objections: ObjectionHandler::new(),
            context_window: ContextWindow::default(),
            policy: DialoguePolicy::new(deps.thresholds),
            generator: ResponseGenerator::new(),
            validator: BoundaryValidator::new(),
            metrics: ConversationMetrics::new(conversation_id),
            deps,
            history: Vec::new(),
            history_compact: None,
            history_compact_meta: None,
            last_action: String::new(),
            last_intent: String::new(),
            turn: 0,
            traces: Vec::new(),
        }
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn flow_name(&self) -> &str {
        &self.flow_name
    }

    pub fn config_name(&self) -> &str {
        &self.config_name
    }

    pub fn turn(&self) -> u32 {
        self.turn
    }

    pub fn state(&self) -> &str {
        self.state_machine.state()
    }

    pub fn history(&self) -> &[HistoryTurn] {
        &self.history
    }

    pub fn collected_data(&self) -> &Map<String, Value> {
        self.state_machine.collected_data()
    }

    pub fn context_window(&self) -> &ContextWindow {
        &self.context_window
    }

    pub fn metrics(&self) -> &ConversationMetrics {
        &self.metrics
    }

    pub fn last_trace(&self) -> Option<&DecisionTrace> {
        self.traces.last()
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // The per-turn pipeline
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub async fn process(&mut self, user_message: &str) -> TurnOutcome {
        self.turn += 1;
        self.state_machine.increment_turn();

        let flags = self.deps.flags.clone();
        if flags.lead_scoring() {
            self.lead_scorer.apply_turn_decay();
        }
        if flags.metrics_tracking() {
            self.metrics.start_turn_timer();
        }

        let mut trace = flags
            .decision_tracing()
            .then(|| DecisionTraceBuilder::new(self.turn, user_message));

        // Disambiguation sub-dialogue routes before everything else.
        if self.state_machine.in_disambiguation() {
            return self
                .handle_disambiguation_response(user_message, flags.as_ref(), trace)
                .await;
        }

        // Tone.
        let tone_started = std::time::Instant::now();
        let tone = if flags.tone_analysis() {
            self.tone.analyze(user_message, flags.as_ref()).await
        } else {
            ToneAnalysis::neutral(0)
        };
        if let Some(trace) = trace.as_mut() {
            trace.record(TraceStage::Tone {
                tone: tone.tone.as_str().into(),
                confidence: tone.confidence,
                frustration_level: tone.frustration_level,
                tier_used: tone.tier_used.clone(),
                elapsed_ms: tone_started.elapsed().as_secs_f64() * 1000.0,
            });
        }

        // Guard.
        let mut fallback_used = false;
        let mut fallback_tier: Option<InterventionTier> = None;
        let mut fallback_response: Option<FallbackResponse> = None;

        if flags.conversation_guard() {
            let state = self.state_machine.state().to_owned();
            let (can_continue, intervention) = self.guard.check(
                &state,
                user_message,
                self.state_machine.collected_data().len(),
                tone.frustration_level,
                &self.last_intent.clone(),
                tone.pre_intervention_triggered,
            );
            let intervention =
                intervention.map(|tier| self.guard.apply_tier_2_escalation(&state, tier));
            if let Some(trace) = trace.as_mut() {
                trace.record(TraceStage::Guard {
                    intervention: intervention.map(|t| t.as_str().into()),
                    frustration_level: tone.frustration_level,
                    elapsed_ms: 0.0,
                });
            }

            if let Some(tier) = intervention {
                fallback_used = true;
                fallback_tier = Some(tier);
                let goal = self
                    .flow
                    .get(&state)
                    .map(|s| s.goal.clone())
                    .unwrap_or_default();
                let fb = self.fallback.get_fallback(
                    tier,
                    &state,
                    &goal,
                    self.state_machine.collected_data(),
                    &self.flow,
                    flags.dynamic_cta_fallback(),
                );
                if let Some(trace) = trace.as_mut() {
                    trace.record(TraceStage::Fallback {
                        tier: tier.as_str().into(),
                        reason: format!("{:?}", fb.action),
                    });
                }

                match fb.action {
                    FallbackAction::Close => {
                        return self.soft_close_turn(user_message, &tone, tier, fb, trace);
                    }
                    FallbackAction::Skip => {
                        if let Some(next) = &fb.next_state {
                            tracing::info!(from = %state, to = %next, "fallback skip applied");
                            self.state_machine.set_state(next);
                            self.guard.record_progress();
                        }
                        // The skip breaks the loop; generate normally.
                    }
                    _ => fallback_response = Some(fb),
                }
            }
            let _ = can_continue; // a SoftClose tier always accompanies false
        }

        // Intent classification (refinement included).
        let classify_started = std::time::Instant::now();
        let ctx = self.classify_context();
        let classification = self.classifier.classify(user_message, &ctx, flags.as_ref()).await;
        if let Some(trace) = trace.as_mut() {
            trace.record(TraceStage::Classification {
                intent: classification.intent.clone(),
                confidence: classification.confidence,
                method: classification.method_used.clone(),
                all_scores: classification.all_scores.clone(),
                elapsed_ms: classify_started.elapsed().as_secs_f64() * 1000.0,
            });
            for refinement in &classification.refinements {
                trace.record(TraceStage::Refinement {
                    layer: refinement.layer.clone(),
                    from_intent: refinement.from_intent.clone(),
                    to_intent: refinement.to_intent.clone(),
                    reason: refinement.reason.clone(),
                });
            }
        }

        // Disambiguation initiation.
        if fallback_response.is_none()
            && flags.is_enabled("unified_disambiguation")
            && classification.intent != intents::UNCLEAR
            && !classification.alternatives.is_empty()
            && self.state_machine.to_state().turns_since_last_disambiguation
                >= DISAMBIGUATION_COOLDOWN_TURNS
        {
            let outcome = self.disambiguation.decide(&classification);
            if outcome.needs_disambiguation() {
                return self.initiate_disambiguation(user_message, &tone, outcome, trace);
            }
            if outcome.decision == DisambiguationDecision::Fallback {
                // Unclassifiable: hand the turn to the unclear path.
                let mut unclear = Classification::unclear();
                unclear.extracted_data = classification.extracted_data.clone();
                return self
                    .finish_turn(
                        user_message,
                        unclear,
                        tone,
                        fallback_used,
                        fallback_tier,
                        fallback_response,
                        false,
                        trace,
                    )
                    .await;
            }
        }

        self.finish_turn(
            user_message,
            classification,
            tone,
            fallback_used,
            fallback_tier,
            fallback_response,
            false,
            trace,
        )
        .await
    }

    /// Everything after classification; shared with the disambiguation
    /// re-entry path.
    #[allow(clippy::too_many_arguments)]
    async fn finish_turn(
        &mut self,
        user_message: &str,
        classification: Classification,
        tone: ToneAnalysis,
        fallback_used: bool,
        fallback_tier: Option<InterventionTier>,
        fallback_response: Option<FallbackResponse>,
        is_disambiguation_turn: bool,
        mut trace: Option<DecisionTraceBuilder>,
    ) -> TurnOutcome {
        let flags = self.deps.flags.clone();
        let intent = classification.intent.clone();
        let extracted = classification.extracted_data.clone();
        let prev_state = self.state_machine.state().to_owned();

        // Competitor tracking feeds the dynamic CTA.
        if intent == intents::OBJECTION_COMPETITOR {
            self.state_machine
                .collected_data_mut()
                .insert("competitor_mentioned".into(), Value::Bool(true));
        }

        // Objection handling runs independently of classification.
        let objection = self
            .objections
            .handle_objection(user_message, self.state_machine.collected_data());
        if let Some(objection) = &objection {
            if flags.metrics_tracking() {
                self.metrics.record_objection(
                    objection.objection_type.as_str(),
                    objection.attempt_number,
                );
            }
            self.context_window
                .episodic_mut()
                .record_objection(objection.objection_type.intent(), self.turn);
            if let Some(trace) = trace.as_mut() {
                trace.record(TraceStage::Objection {
                    objection_type: objection.objection_type.as_str().into(),
                    attempt: objection.attempt_number,
                    soft_close: objection.should_soft_close,
                });
            }
        }

        // Lead scoring.
        let lead_before = self.lead_scorer.current_score();
        if flags.lead_scoring() {
            for signal in lead_signals(&intent, &extracted, &tone, &self.context_window) {
                self.lead_scorer.add_signal(signal);
            }
            if flags.metrics_tracking() {
                self.metrics.record_lead_score(self.lead_scorer.current_score());
            }
        }
        if let Some(trace) = trace.as_mut() {
            trace.record(TraceStage::LeadScore {
                previous: lead_before,
                new: self.lead_scorer.current_score(),
                temperature: self.lead_scorer.temperature().as_str().into(),
            });
        }

        // Context envelope.
        let envelope = build_context_envelope(
            &self.state_machine,
            &self.context_window,
            &tone,
            fallback_tier.map(|t| t.as_str()),
            &self.last_action,
            &self.last_intent,
            self.turn,
            self.lead_scorer.current_score(),
            self.lead_scorer.temperature(),
        );

        // State machine.
        let sm_started = std::time::Instant::now();
        let mut sm_result = self.state_machine.process(&intent, &extracted);
        if let Some(trace) = trace.as_mut() {
            trace.record(TraceStage::StateMachine {
                prev_state: sm_result.prev_state.clone(),
                next_state: sm_result.next_state.clone(),
                action: sm_result.action.clone(),
                elapsed_ms: sm_started.elapsed().as_secs_f64() * 1000.0,
            });
        }

        // Policy overlay.
        let mut policy_reason_codes: Vec<String> = Vec::new();
        if flags.context_policy_overlays() {
            if let Some(override_) = self.policy.maybe_override(&sm_result, &envelope, flags.as_ref()) {
                if let Some(trace) = trace.as_mut() {
                    trace.record(TraceStage::PolicyOverride {
                        decision: format!("{:?}", override_.decision).to_lowercase(),
                        action: override_.action.clone(),
                        next_state: override_.next_state.clone(),
                        reason_codes: override_.reason_codes.clone(),
                    });
                }
                if override_.has_override() {
                    if let Some(action) = &override_.action {
                        sm_result.action = action.clone();
                        if let Some(next_state) = &override_.next_state {
                            sm_result.next_state = next_state.clone();
                            self.state_machine.set_state(next_state);
                        }
                    }
                    policy_reason_codes = override_.reason_codes.clone();
                }
            }
        }

        let mut action = sm_result.action.clone();
        let mut next_state = sm_result.next_state.clone();
        let mut is_final = sm_result.is_final;

        // Objection exhaustion forces a soft close.
        let objection_soft_close = objection
            .as_ref()
            .map(|o| o.should_soft_close)
            .unwrap_or(false);
        let mut response;
        let mut options = fallback_response.as_ref().and_then(|fb| fb.options.clone());

        if objection_soft_close {
            action = "soft_close".into();
            next_state = "soft_close".into();
            is_final = true;
            self.state_machine.set_state("soft_close");
            response = objection
                .as_ref()
                .and_then(|o| o.response_parts.get("message").cloned())
                .unwrap_or_else(|| sf_llm::fallback_for_state("soft_close").to_owned());
            options = None;
        } else if let Some(fb) = &fallback_response {
            response = fb.message.clone();
        } else {
            let directives = if flags.context_response_directives() {
                build_response_directives(&envelope, &self.deps.thresholds).instruction()
            } else {
                self.tone.response_guidance(&tone).tone_instruction
            };
            let guidance = self.tone.response_guidance(&tone);
            let generation_ctx = GenerationContext {
                user_message,
                intent: &intent,
                state: &next_state,
                goal: &sm_result.goal,
                history: &self.history,
                history_compact: self.history_compact.as_ref(),
                collected_data: sm_result.collected_data.clone(),
                missing_data: &sm_result.missing_data,
                profile_summary: self.context_window.episodic().profile_summary(),
                directive_instruction: directives,
                frustration_level: tone.frustration_level,
                should_apologize: guidance.should_apologize,
                should_offer_exit: guidance.should_offer_exit,
                objection: objection.as_ref(),
                policy_reason_codes: &policy_reason_codes,
                last_action: &self.last_action,
                history_user_text: self.recent_user_text(),
            };
            let generated = self
                .generator
                .generate(
                    &action,
                    &generation_ctx,
                    self.deps.llm.as_ref(),
                    &self.deps.retriever,
                    &mut self.validator,
                    flags.as_ref(),
                )
                .await;
            if let Some(trace) = trace.as_mut() {
                trace.record(TraceStage::Response {
                    template_key: generated.template_key.clone(),
                    response_chars: generated.text.chars().count(),
                    elapsed_ms: 0.0,
                });
            }
            response = generated.text;
        }

        if tone.should_offer_exit
            && !is_final
            && !response.to_lowercase().contains("заверш")
            && fallback_response.is_none()
        {
            response = format!("{response} Если сейчас неудобно, можем завершить — как скажете.");
        }

        // History + context window + episodic action outcomes.
        self.history.push(HistoryTurn {
            user: user_message.to_owned(),
            bot: response.clone(),
        });
        self.context_window.add_turn(
            TurnRecord {
                user_message,
                bot_response: &response,
                intent: &intent,
                confidence: classification.confidence,
                method: &classification.method_used,
                action: &action,
                state: &prev_state,
                next_state: &next_state,
                extracted_data: &extracted,
                is_disambiguation: is_disambiguation_turn,
                is_fallback: fallback_used,
                fallback_tier: fallback_tier.map(|t| t.as_str()),
            },
            &self.flow,
            self.turn,
        );
        if !self.last_action.is_empty() {
            let successful = self
                .context_window
                .last_turn_type()
                .map(|t| t == TurnType::Progress)
                .unwrap_or(false);
            self.context_window.episodic_mut().record_action_outcome(
                &self.last_action.clone(),
                self.turn,
                successful,
            );
        }

        // Progress bookkeeping.
        if sm_result.prev_state != next_state || !extracted.is_empty() {
            self.guard.record_progress();
        }

        // Metrics + outcome.
        if flags.metrics_tracking() {
            self.metrics.record_turn(
                self.turn,
                &next_state,
                &intent,
                Some(tone.tone.as_str()),
                fallback_used,
                fallback_tier.map(|t| t.as_str()),
            );
            for key in extracted.keys() {
                self.metrics.record_collected_data(key);
            }
        }

        let is_success = is_final || next_state == "success";
        if is_success {
            let outcome = if intent == intents::REJECTION {
                ConversationOutcome::Rejected
            } else if intent == intents::CONTACT_PROVIDED
                || self
                    .metrics
                    .intents_sequence()
                    .iter()
                    .any(|i| i == intents::CONTACT_PROVIDED)
            {
                ConversationOutcome::Success
            } else if intent == intents::DEMO_REQUEST
                || self
                    .metrics
                    .intents_sequence()
                    .iter()
                    .any(|i| i == intents::DEMO_REQUEST)
                || (intent == intents::AGREEMENT && sm_result.prev_state == "close")
                || intent == intents::CALLBACK_REQUEST
                || intent == intents::CONSULTATION_REQUEST
            {
                ConversationOutcome::DemoScheduled
            } else {
                ConversationOutcome::SoftClose
            };
            self.metrics.set_outcome(outcome);
        }

        self.last_action = action.clone();
        self.last_intent = intent.clone();

        let decision_trace = trace.map(|t| t.build());
        if let Some(trace) = &decision_trace {
            self.traces.push(trace.clone());
        }

        if flags.lead_scoring() {
            self.lead_scorer.end_turn();
        }

        TurnOutcome {
            response,
            intent,
            action,
            state: next_state,
            is_final,
            spin_phase: sm_result.spin_phase,
            tone: tone.tone.as_str().into(),
            frustration_level: tone.frustration_level,
            lead_score: flags.lead_scoring().then(|| self.lead_scorer.current_score()),
            objection_detected: objection.is_some(),
            fallback_used,
            fallback_tier: fallback_tier.map(|t| t.as_str().into()),
            options,
            decision_trace,
        }
    }

    /// Guard- or objection-driven immediate soft close.
    fn soft_close_turn(
        &mut self,
        user_message: &str,
        tone: &ToneAnalysis,
        tier: InterventionTier,
        fb: FallbackResponse,
        trace: Option<DecisionTraceBuilder>,
    ) -> TurnOutcome {
        self.state_machine.set_state("soft_close");
        self.history.push(HistoryTurn {
            user: user_message.to_owned(),
            bot: fb.message.clone(),
        });
        if self.deps.flags.metrics_tracking() {
            self.metrics.record_turn(
                self.turn,
                "soft_close",
                "fallback_close",
                Some(tone.tone.as_str()),
                true,
                Some(tier.as_str()),
            );
        }
        self.metrics.set_outcome(ConversationOutcome::SoftClose);
        if self.deps.flags.lead_scoring() {
            self.lead_scorer.end_turn();
        }
        let decision_trace = trace.map(|t| t.build());
        if let Some(trace) = &decision_trace {
            self.traces.push(trace.clone());
        }

        TurnOutcome {
            response: fb.message,
            intent: "fallback_close".into(),
            action: "soft_close".into(),
            state: "soft_close".into(),
            is_final: true,
            spin_phase: "soft_close".into(),
            tone: tone.tone.as_str().into(),
            frustration_level: tone.frustration_level,
            lead_score: self
                .deps
                .flags
                .lead_scoring()
                .then(|| self.lead_scorer.current_score()),
            objection_detected: false,
            fallback_used: true,
            fallback_tier: Some(tier.as_str().into()),
            options: fb.options,
            decision_trace,
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Disambiguation
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    fn initiate_disambiguation(
        &mut self,
        user_message: &str,
        tone: &ToneAnalysis,
        outcome: sf_analysis::intent::DisambiguationOutcome,
        trace: Option<DecisionTraceBuilder>,
    ) -> TurnOutcome {
        let question = outcome.question();
        let options = if outcome.options.is_empty() {
            // Confirm mode: the sole option is the intent being confirmed.
            vec![sf_analysis::intent::DisambiguationOption {
                intent: outcome.intent.clone(),
                label: intents::label(&outcome.intent).to_owned(),
                confidence: outcome.confidence,
            }]
        } else {
            outcome.options.clone()
        };
        let option_labels: Vec<String> = options.iter().map(|o| o.label.clone()).collect();

        self.state_machine.enter_disambiguation(DisambiguationContext {
            options,
            question: question.clone(),
            original_intent: outcome.intent.clone(),
            attempts: 0,
            max_attempts: DISAMBIGUATION_MAX_ATTEMPTS,
        });

        self.history.push(HistoryTurn {
            user: user_message.to_owned(),
            bot: question.clone(),
        });
        if self.deps.flags.metrics_tracking() {
            self.metrics.record_turn(
                self.turn,
                self.state_machine.state(),
                intents::DISAMBIGUATION_NEEDED,
                Some(tone.tone.as_str()),
                false,
                None,
            );
        }
        let decision_trace = trace.map(|t| t.build());
        if let Some(trace) = &decision_trace {
            self.traces.push(trace.clone());
        }
        if self.deps.flags.lead_scoring() {
            self.lead_scorer.end_turn();
        }

        TurnOutcome {
            response: question,
            intent: intents::DISAMBIGUATION_NEEDED.into(),
            action: "disambiguate".into(),
            state: self.state_machine.state().to_owned(),
            is_final: false,
            spin_phase: self.state_machine.phase().to_owned(),
            tone: tone.tone.as_str().into(),
            frustration_level: tone.frustration_level,
            lead_score: self
                .deps
                .flags
                .lead_scoring()
                .then(|| self.lead_scorer.current_score()),
            objection_detected: false,
            fallback_used: false,
            fallback_tier: None,
            options: Some(option_labels),
            decision_trace,
        }
    }

    async fn handle_disambiguation_response(
        &mut self,
        user_message: &str,
        flags: &Flags,
        trace: Option<DecisionTraceBuilder>,
    ) -> TurnOutcome {
        let tone = if flags.tone_analysis() {
            self.tone.analyze(user_message, flags).await
        } else {
            ToneAnalysis::neutral(0)
        };

        let ctx = self.classify_context();
        let classification = self.classifier.classify(user_message, &ctx, flags).await;

        // Critical intents interrupt the sub-dialogue outright.
        if intents::is_critical(&classification.intent) {
            self.state_machine.exit_disambiguation();
            return self
                .finish_turn(user_message, classification, tone, false, None, None, true, trace)
                .await;
        }

        let context = self
            .state_machine
            .disambiguation_context()
            .cloned()
            .unwrap_or_default();

        // Option matching: index, ordinal, or exact label. A plain
        // agreement confirms the top option.
        let matched = if classification.intent == intents::AGREEMENT && !context.options.is_empty()
        {
            OptionMatch::Selected(context.options[0].intent.clone())
        } else {
            sf_analysis::intent::disambiguation::resolve_option(user_message, &context.options)
        };

        match matched {
            OptionMatch::Selected(selected_intent) => {
                self.state_machine.exit_disambiguation();
                let mut resolved = Classification {
                    intent: selected_intent,
                    confidence: 0.9,
                    extracted_data: keyword::extract_data(user_message),
                    alternatives: Vec::new(),
                    method_used: "disambiguation".into(),
                    reasoning: "option selected".into(),
                    all_scores: Default::default(),
                    refinements: Vec::new(),
                };
                resolved
                    .all_scores
                    .insert(resolved.intent.clone(), resolved.confidence);
                self.finish_turn(user_message, resolved, tone, false, None, None, true, trace)
                    .await
            }
            OptionMatch::Other | OptionMatch::Unmatched => {
                // Free text that classifies confidently resolves the
                // sub-dialogue on its own.
                if matched == OptionMatch::Unmatched
                    && classification.confidence >= 0.65
                    && classification.intent != intents::UNCLEAR
                {
                    self.state_machine.exit_disambiguation();
                    return self
                        .finish_turn(user_message, classification, tone, false, None, None, true, trace)
                        .await;
                }

                let attempts = self.state_machine.record_disambiguation_attempt();
                if attempts >= context.max_attempts {
                    tracing::info!(attempts, "disambiguation exhausted, resolving to unclear");
                    self.state_machine.exit_disambiguation();
                    let unclear = Classification::unclear();
                    return self
                        .finish_turn(user_message, unclear, tone, false, None, None, true, trace)
                        .await;
                }

                // Repeat the question.
                self.history.push(HistoryTurn {
                    user: user_message.to_owned(),
                    bot: context.question.clone(),
                });
                let option_labels: Vec<String> =
                    context.options.iter().map(|o| o.label.clone()).collect();
                let decision_trace = trace.map(|t| t.build());
                if flags.lead_scoring() {
                    self.lead_scorer.end_turn();
                }
                TurnOutcome {
                    response: context.question,
                    intent: intents::DISAMBIGUATION_NEEDED.into(),
                    action: "disambiguate".into(),
                    state: self.state_machine.state().to_owned(),
                    is_final: false,
                    spin_phase: self.state_machine.phase().to_owned(),
                    tone: tone.tone.as_str().into(),
                    frustration_level: tone.frustration_level,
                    lead_score: flags
                        .lead_scoring()
                        .then(|| self.lead_scorer.current_score()),
                    objection_detected: false,
                    fallback_used: false,
                    fallback_tier: None,
                    options: Some(option_labels),
                    decision_trace,
                }
            }
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Helpers
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    fn classify_context(&self) -> ClassifyContext {
        ClassifyContext {
            current_state: self.state_machine.state().to_owned(),
            current_phase: self.state_machine.phase().to_owned(),
            collected_data: self.state_machine.collected_data().clone(),
            missing_data: self.state_machine.missing_data(),
            last_action: self.last_action.clone(),
            last_intent: self.last_intent.clone(),
            turn: self.turn,
            in_disambiguation: self.state_machine.in_disambiguation(),
            window: WindowSummary {
                intent_history: self.context_window.intent_history(),
                objection_count: self.context_window.objection_count(),
                positive_count: self.context_window.positive_count(),
                question_count: self.context_window.question_count(),
                unclear_count: self.context_window.unclear_count(),
                oscillation: self.context_window.oscillation_detected(),
                stuck: self.context_window.stuck_detected(3),
                repeated_question: self.context_window.repeated_question_detected(),
                confidence_trend: self.context_window.confidence_trend(),
            },
        }
    }

    fn recent_user_text(&self) -> String {
        self.history
            .iter()
            .rev()
            .take(4)
            .map(|t| t.user.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Reset all per-session components for a fresh conversation.
    pub fn reset(&mut self, conversation_id: &str) {
        if self.turn > 0 {
            self.metrics.set_outcome(ConversationOutcome::Abandoned);
        }
        self.conversation_id = conversation_id.to_owned();
        self.state_machine.reset();
        self.guard.reset();
        self.lead_scorer.reset();
        self.fallback.reset();
        self.objections.reset();
        self.context_window.reset();
        self.tone.reset();
        self.generator.reset();
        self.metrics.reset(conversation_id);
        self.history.clear();
        self.history_compact = None;
        self.history_compact_meta = None;
        self.last_action.clear();
        self.last_intent.clear();
        self.turn = 0;
        self.traces.clear();
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Snapshot round-trip
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Serialize the session. `history` is always empty in the snapshot;
    /// the tail travels separately. With `compact_history`, older turns
    /// are folded into the structured compact.
    pub async fn to_snapshot(&mut self, compact_history: bool, tail_size: usize) -> Snapshot {
        if compact_history && self.history.len() > tail_size {
            let fallback_ctx = FallbackContext {
                collected_data: self.state_machine.collected_data().clone(),
                objection_intents: self
                    .context_window
                    .episodic()
                    .all_objections()
                    .to_vec(),
            };
            let (compact, meta) = HistoryCompactor::compact(
                &self.history,
                tail_size,
                self.history_compact.as_ref(),
                self.history_compact_meta.as_ref(),
                self.deps.llm.as_ref(),
                &fallback_ctx,
            )
            .await;
            self.history_compact = Some(compact);
            self.history_compact_meta = Some(meta);
        }

        let tracker = IntentTrackerState {
            last_intent: self.last_intent.clone(),
            last_action: self.last_action.clone(),
            turn: self.turn,
            diversity: self.generator.diversity_state(),
        };

        Snapshot {
            version: SNAPSHOT_VERSION,
            client_id: self.client_id.clone(),
            conversation_id: self.conversation_id.clone(),
            flow_name: self.flow_name.clone(),
            config_name: self.config_name.clone(),
            state_machine: to_value(&self.state_machine.to_state()),
            conversation_guard: to_value(&self.guard.to_state()),
            lead_scorer: to_value(&self.lead_scorer.to_state()),
            fallback_handler: to_value(&self.fallback.to_state()),
            objection_handler: to_value(&self.objections.to_state()),
            tone_analyzer: to_value(&self.tone.to_state()),
            context_window: to_value(&self.context_window.to_state()),
            metrics: to_value(&self.metrics.to_state()),
            intent_tracker: to_value(&tracker),
            history: Vec::new(),
            history_compact: self.history_compact.clone(),
            history_compact_meta: self.history_compact_meta.clone(),
        }
    }

    /// Rebuild a bot from a snapshot plus the separately stored history
    /// tail. Fails on version skew or component schema mismatch.
    pub fn from_snapshot(
        snapshot: &Snapshot,
        deps: BotDeps,
        history_tail: Vec<HistoryTurn>,
    ) -> Result<SalesBot> {
        if !snapshot.version_supported() {
            return Err(Error::Snapshot(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }

        let mut bot = SalesBot::new(
            &snapshot.conversation_id,
            snapshot.client_id.as_deref(),
            &snapshot.flow_name,
            &snapshot.config_name,
            deps,
        );

        bot.state_machine
            .load_state(from_value::<StateMachineState>(&snapshot.state_machine, "state_machine")?);
        bot.guard
            .load_state(from_value::<GuardState>(&snapshot.conversation_guard, "conversation_guard")?);
        bot.lead_scorer
            .load_state(from_value::<LeadScorerState>(&snapshot.lead_scorer, "lead_scorer")?);
        bot.fallback
            .load_state(from_value::<FallbackState>(&snapshot.fallback_handler, "fallback_handler")?);
        bot.objections
            .load_state(from_value::<ObjectionState>(&snapshot.objection_handler, "objection_handler")?);
        bot.tone
            .load_state(from_value::<FrustrationState>(&snapshot.tone_analyzer, "tone_analyzer")?);
        bot.context_window
            .load_state(from_value::<ContextWindowState>(&snapshot.context_window, "context_window")?);
        bot.metrics
            .load_state(from_value::<MetricsState>(&snapshot.metrics, "metrics")?);

        let tracker = from_value::<IntentTrackerState>(&snapshot.intent_tracker, "intent_tracker")?;
        bot.last_intent = tracker.last_intent;
        bot.last_action = tracker.last_action;
        bot.turn = tracker.turn;
        bot.generator.load_diversity_state(tracker.diversity);

        bot.history = history_tail;
        bot.history_compact = snapshot.history_compact.clone();
        bot.history_compact_meta = snapshot.history_compact_meta.clone();

        Ok(bot)
    }
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn from_value<T: serde::de::DeserializeOwned>(value: &Value, component: &str) -> Result<T> {
    serde_json::from_value(value.clone())
        .map_err(|e| Error::Snapshot(format!("{component}: {e}")))
}

/// Map an intent (plus extraction and tone) onto lead signals.
fn lead_signals(
    intent: &str,
    extracted: &Map<String, Value>,
    tone: &ToneAnalysis,
    window: &ContextWindow,
) -> Vec<&'static str> {
    let mut signals = Vec::new();
    match intent {
        intents::DEMO_REQUEST => signals.push("demo_request"),
        intents::CALLBACK_REQUEST => signals.push("callback_request"),
        intents::CONSULTATION_REQUEST => signals.push("consultation_request"),
        intents::CONTACT_PROVIDED => signals.push("contact_provided"),
        intents::PRICE_QUESTION => {
            if extracted.contains_key("company_size") {
                signals.push("price_with_size");
            } else {
                signals.push("price_question");
            }
        }
        intents::QUESTION_FEATURES => signals.push("features_question"),
        intents::QUESTION_INTEGRATIONS => signals.push("integrations_question"),
        intents::COMPARISON => signals.push("competitor_comparison"),
        intents::PROBLEM_REVEALED => signals.push("explicit_problem"),
        intents::OBJECTION_PRICE => signals.push("objection_price"),
        intents::OBJECTION_COMPETITOR => signals.push("objection_competitor"),
        intents::OBJECTION_NO_TIME => signals.push("objection_no_time"),
        intents::OBJECTION_THINK => signals.push("objection_think"),
        intents::OBJECTION_NO_NEED => signals.push("objection_no_need"),
        intents::REJECTION => signals.push("rejection_soft"),
        intents::UNCLEAR if window.unclear_count() >= 2 => signals.push("unclear_repeated"),
        _ => {}
    }
    if extracted.contains_key("budget_range") {
        signals.push("budget_mentioned");
    }
    if extracted.contains_key("timeline") {
        signals.push("timeline_mentioned");
    }
    if tone.tone == sf_domain::tone::Tone::Frustrated {
        signals.push("frustration");
    }
    signals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retriever::StaticRetriever;

    fn bot() -> SalesBot {
        let deps = BotDeps::offline(Arc::new(StaticRetriever::default()));
        SalesBot::new("sess-test", Some("c1"), "spin_selling", "default", deps)
    }

    #[tokio::test]
    async fn greeting_turn_advances_the_funnel() {
        let mut b = bot();
        let outcome = b.process("Здравствуйте!").await;
        assert_eq!(outcome.intent, intents::GREETING);
        assert_eq!(outcome.state, "spin_situation");
        assert!(!outcome.is_final);
        assert!(!outcome.response.is_empty());
    }

    #[tokio::test]
    async fn facts_flow_into_collected_data_and_profile() {
        let mut b = bot();
        b.process("Здравствуйте!").await;
        b.process("у нас компания ТехноМаркет, 120 сотрудников").await;
        assert_eq!(
            b.collected_data()["company_name"],
            Value::String("ТехноМаркет".into())
        );
        assert_eq!(
            b.context_window()
                .episodic()
                .client_profile
                .company_name
                .as_deref(),
            Some("ТехноМаркет")
        );
    }

    #[tokio::test]
    async fn rejection_ends_the_conversation() {
        let mut b = bot();
        let outcome = b.process("не интересно, не пишите мне").await;
        assert!(outcome.is_final);
        assert_eq!(outcome.state, "soft_close");
        assert_eq!(b.metrics().outcome(), ConversationOutcome::Rejected);
    }

    #[tokio::test]
    async fn contact_in_close_is_success() {
        let mut b = bot();
        b.process("Здравствуйте!").await;
        b.process("у нас компания Ромашка, покажите демо").await;
        let outcome = b.process("записывайте: +7 707 123 45 67").await;
        assert_eq!(outcome.state, "success");
        assert!(outcome.is_final);
        assert_eq!(b.metrics().outcome(), ConversationOutcome::Success);
    }

    #[tokio::test]
    async fn objection_is_detected_and_handled() {
        let mut b = bot();
        b.process("Здравствуйте!").await;
        // Company and pain arrive together, so no data gate is pending
        // when the objection lands.
        b.process("у нас компания Ромашка, всё ведём вручную").await;
        let outcome = b.process("это слишком дорого для нас").await;
        assert!(outcome.objection_detected);
        assert_eq!(outcome.intent, intents::OBJECTION_PRICE);
        assert_eq!(outcome.state, "handle_objection");
    }

    #[tokio::test]
    async fn mapped_intent_waits_for_required_data() {
        let mut b = bot();
        b.process("Здравствуйте!").await;
        // price_question maps to presentation, but company_name is
        // still missing in spin_situation: the bot stays and asks.
        let outcome = b.process("сколько стоит?").await;
        assert_eq!(outcome.state, "spin_situation");
        assert_eq!(outcome.action, "ask_missing_data");
        assert!(outcome.response.contains("как называется"));
    }

    #[tokio::test]
    async fn empty_message_is_unclear_without_state_change() {
        let mut b = bot();
        b.process("Здравствуйте!").await;
        let state_before = b.state().to_owned();
        let outcome = b.process("").await;
        assert_eq!(outcome.intent, intents::UNCLEAR);
        assert_eq!(outcome.state, state_before);
    }

    #[tokio::test]
    async fn turn_counter_is_monotone() {
        let mut b = bot();
        for i in 0..4 {
            b.process(&format!("сообщение {i}")).await;
        }
        assert_eq!(b.turn(), 4);
    }

    #[tokio::test]
    async fn snapshot_round_trip_preserves_behavior() {
        let mut b = bot();
        b.process("Здравствуйте!").await;
        b.process("компания Ромашка, 50 сотрудников").await;
        b.process("всё ведём вручную, теряем заявки").await;

        let snapshot = b.to_snapshot(false, 4).await;
        let tail: Vec<HistoryTurn> = b.history().to_vec();
        let deps = BotDeps::offline(Arc::new(StaticRetriever::default()));
        let mut restored = SalesBot::from_snapshot(&snapshot, deps, tail).unwrap();

        assert_eq!(restored.turn(), b.turn());
        assert_eq!(restored.state(), b.state());
        assert_eq!(restored.collected_data(), b.collected_data());

        // The same next message produces the same decision path.
        let next_original = b.process("сколько стоит?").await;
        let next_restored = restored.process("сколько стоит?").await;
        assert_eq!(next_original.intent, next_restored.intent);
        assert_eq!(next_original.state, next_restored.state);
        assert_eq!(next_original.action, next_restored.action);
    }

    #[tokio::test]
    async fn compacted_snapshot_has_empty_history() {
        let mut b = bot();
        for i in 0..8 {
            b.process(&format!("сообщение номер {i}")).await;
        }
        let snapshot = b.to_snapshot(true, 4).await;
        assert!(snapshot.history.is_empty());
        let meta = snapshot.history_compact_meta.as_ref().unwrap();
        assert_eq!(meta.tail_size, 4);
        assert_eq!(meta.compacted_turns, 4);
        assert!(snapshot.history_compact.is_some());
    }

    #[tokio::test]
    async fn reset_marks_abandoned_and_clears() {
        let mut b = bot();
        b.process("Здравствуйте!").await;
        b.reset("sess-new");
        assert_eq!(b.turn(), 0);
        assert!(b.history().is_empty());
        assert_eq!(b.state(), "greeting");
    }

    #[tokio::test]
    async fn ambiguous_message_confirms_then_resolves() {
        let mut b = bot();
        b.process("Здравствуйте!").await;
        b.process("у нас компания Ромашка").await;
        b.process("ведём всё вручную").await;

        // Two strong candidate intents with no gap: confirm first.
        let outcome = b.process("демо покажете? и сколько стоит?").await;
        assert_eq!(outcome.intent, intents::DISAMBIGUATION_NEEDED);
        assert!(outcome.options.is_some());

        // A plain agreement confirms the top option.
        let resolved = b.process("да").await;
        assert_eq!(resolved.intent, intents::DEMO_REQUEST);
        assert_eq!(resolved.state, "close");
    }

    #[tokio::test]
    async fn unresolved_disambiguation_exhausts_to_unclear() {
        let mut b = bot();
        b.process("Здравствуйте!").await;
        b.process("у нас компания Ромашка").await;
        b.process("ведём всё вручную").await;
        let outcome = b.process("демо покажете? и сколько стоит?").await;
        assert_eq!(outcome.intent, intents::DISAMBIGUATION_NEEDED);

        // Two uninterpretable replies exhaust the attempt budget.
        let first = b.process("хм").await;
        assert_eq!(first.intent, intents::DISAMBIGUATION_NEEDED);
        let second = b.process("эм").await;
        assert_eq!(second.intent, intents::UNCLEAR);
    }

    #[tokio::test]
    async fn unicode_and_long_messages_pass_through() {
        let mut b = bot();
        let long = "очень ".repeat(2000) + "длинное сообщение 🚀";
        let outcome = b.process(&long).await;
        assert!(!outcome.response.is_empty());
        assert_eq!(b.turn(), 1);
    }
}
