//! Versioned session snapshot schema.
//!
//! A snapshot serializes every stateful component of a bot. Component
//! payloads are kept as raw JSON values so the schema stays stable as
//! individual components evolve; each component owns its own
//! `to_state`/`from_state` pair.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current snapshot schema version.
pub const SNAPSHOT_VERSION: u32 = 2;

/// One user/bot exchange in the history tail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryTurn {
    pub user: String,
    pub bot: String,
}

/// Metadata describing a history compaction pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionMeta {
    pub compacted_turns: usize,
    pub tail_size: usize,
    pub compacted_at: f64,
    pub compaction_version: String,
    pub llm_model: Option<String>,
}

/// Structured summary of compacted history.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HistoryCompact {
    #[serde(default)]
    pub summary: Vec<String>,
    #[serde(default)]
    pub key_facts: Vec<String>,
    #[serde(default)]
    pub objections: Vec<String>,
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub open_questions: Vec<String>,
    #[serde(default)]
    pub next_steps: Vec<String>,
}

/// The full serialized form of a session.
///
/// `history` is intentionally empty when the snapshot was produced with
/// compaction; the last-N tail is supplied separately on restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub client_id: Option<String>,
    pub conversation_id: String,
    pub flow_name: String,
    pub config_name: String,
    pub state_machine: Value,
    pub conversation_guard: Value,
    pub lead_scorer: Value,
    pub fallback_handler: Value,
    pub objection_handler: Value,
    pub tone_analyzer: Value,
    pub context_window: Value,
    pub metrics: Value,
    pub intent_tracker: Value,
    #[serde(default)]
    pub history: Vec<HistoryTurn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_compact: Option<HistoryCompact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_compact_meta: Option<CompactionMeta>,
}

impl Snapshot {
    /// Whether this snapshot can be restored by the current code.
    pub fn version_supported(&self) -> bool {
        self.version <= SNAPSHOT_VERSION && self.version >= 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Snapshot {
        Snapshot {
            version: SNAPSHOT_VERSION,
            client_id: Some("c1".into()),
            conversation_id: "sess-1".into(),
            flow_name: "spin_selling".into(),
            config_name: "default".into(),
            state_machine: Value::Null,
            conversation_guard: Value::Null,
            lead_scorer: Value::Null,
            fallback_handler: Value::Null,
            objection_handler: Value::Null,
            tone_analyzer: Value::Null,
            context_window: Value::Null,
            metrics: Value::Null,
            intent_tracker: Value::Null,
            history: vec![],
            history_compact: None,
            history_compact_meta: None,
        }
    }

    #[test]
    fn json_round_trip() {
        let snap = minimal();
        let json = serde_json::to_string(&snap).unwrap();
        let back: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.conversation_id, "sess-1");
        assert_eq!(back.client_id.as_deref(), Some("c1"));
        assert!(back.version_supported());
    }

    #[test]
    fn future_version_rejected() {
        let mut snap = minimal();
        snap.version = SNAPSHOT_VERSION + 1;
        assert!(!snap.version_supported());
    }
}
