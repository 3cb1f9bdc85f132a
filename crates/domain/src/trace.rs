//! Per-turn decision trace.
//!
//! Each pipeline stage appends one typed record; the assembled trace is
//! returned with the turn result and logged for offline analysis.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One stage record inside a turn trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum TraceStage {
    Tone {
        tone: String,
        confidence: f64,
        frustration_level: i32,
        tier_used: String,
        elapsed_ms: f64,
    },
    Guard {
        intervention: Option<String>,
        frustration_level: i32,
        elapsed_ms: f64,
    },
    Classification {
        intent: String,
        confidence: f64,
        method: String,
        all_scores: HashMap<String, f64>,
        elapsed_ms: f64,
    },
    Refinement {
        layer: String,
        from_intent: String,
        to_intent: String,
        reason: String,
    },
    Objection {
        objection_type: String,
        attempt: u32,
        soft_close: bool,
    },
    LeadScore {
        previous: i32,
        new: i32,
        temperature: String,
    },
    StateMachine {
        prev_state: String,
        next_state: String,
        action: String,
        elapsed_ms: f64,
    },
    PolicyOverride {
        decision: String,
        action: Option<String>,
        next_state: Option<String>,
        reason_codes: Vec<String>,
    },
    Response {
        template_key: String,
        response_chars: usize,
        elapsed_ms: f64,
    },
    Fallback {
        tier: String,
        reason: String,
    },
}

/// The assembled decision trace for one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTrace {
    pub turn: u32,
    pub message: String,
    pub stages: Vec<TraceStage>,
}

/// Incremental builder used by the orchestrator during a turn.
#[derive(Debug)]
pub struct DecisionTraceBuilder {
    trace: DecisionTrace,
}

impl DecisionTraceBuilder {
    pub fn new(turn: u32, message: &str) -> Self {
        Self {
            trace: DecisionTrace {
                turn,
                message: message.to_owned(),
                stages: Vec::new(),
            },
        }
    }

    pub fn record(&mut self, stage: TraceStage) {
        self.trace.stages.push(stage);
    }

    pub fn build(self) -> DecisionTrace {
        self.trace
    }
}
