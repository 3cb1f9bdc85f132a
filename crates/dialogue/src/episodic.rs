//! Episodic memory: long-lived per-session facts and outcomes.
//!
//! Survives context-window rotation. Episodes reference turns by index,
//! never by object, so serialization stays acyclic.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Episodes are ringed at this size; the client profile is unbounded
/// but grows by distinct facts only.
const MAX_EPISODES: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub episode_type: String,
    pub turn: u32,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// Accumulated knowledge about the client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientProfile {
    pub company_name: Option<String>,
    pub company_size: Option<String>,
    pub industry: Option<String>,
    pub role: Option<String>,
    pub contact_name: Option<String>,
    #[serde(default)]
    pub pain_points: Vec<String>,
    #[serde(default)]
    pub interested_features: Vec<String>,
    #[serde(default)]
    pub objections: Vec<String>,
}

/// Serialized memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EpisodicMemory {
    #[serde(default)]
    pub episodes: Vec<Episode>,
    #[serde(default)]
    pub client_profile: ClientProfile,
    /// Action → turns on which it led to progress.
    #[serde(default)]
    pub successful_actions: HashMap<String, Vec<u32>>,
    /// Action → turns on which it led to regress or stall.
    #[serde(default)]
    pub failed_actions: HashMap<String, Vec<u32>>,
    #[serde(default)]
    pub first_objection_recorded: bool,
    #[serde(default)]
    pub breakthrough_recorded: bool,
}

impl EpisodicMemory {
    fn push_episode(&mut self, episode: Episode) {
        self.episodes.push(episode);
        if self.episodes.len() > MAX_EPISODES {
            let excess = self.episodes.len() - MAX_EPISODES;
            self.episodes.drain(..excess);
        }
    }

    /// Record the first objection of the session. Later objections only
    /// extend the profile's objection list.
    pub fn record_objection(&mut self, objection_intent: &str, turn: u32) {
        if !self.client_profile.objections.iter().any(|o| o == objection_intent) {
            self.client_profile.objections.push(objection_intent.to_owned());
        }
        if !self.first_objection_recorded {
            self.first_objection_recorded = true;
            self.push_episode(Episode {
                episode_type: "first_objection".into(),
                turn,
                metadata: HashMap::from([(
                    "objection".to_string(),
                    Value::String(objection_intent.to_owned()),
                )]),
            });
        }
    }

    /// Record the first progress turn after a regress.
    pub fn record_breakthrough(&mut self, turn: u32) {
        if self.breakthrough_recorded {
            return;
        }
        self.breakthrough_recorded = true;
        self.push_episode(Episode {
            episode_type: "breakthrough".into(),
            turn,
            metadata: HashMap::new(),
        });
    }

    /// Record whether an action worked out, by the turn type it produced.
    pub fn record_action_outcome(&mut self, action: &str, turn: u32, successful: bool) {
        let bucket = if successful {
            &mut self.successful_actions
        } else {
            &mut self.failed_actions
        };
        let turns = bucket.entry(action.to_owned()).or_default();
        if !turns.contains(&turn) {
            turns.push(turn);
        }
    }

    /// Merge extracted data into the client profile with dedup.
    pub fn absorb_extracted(&mut self, extracted: &serde_json::Map<String, Value>) {
        let as_text = |v: &Value| -> Option<String> {
            match v {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            }
        };
        if let Some(v) = extracted.get("company_name").and_then(|v| as_text(v)) {
            self.client_profile.company_name = Some(v);
        }
        if let Some(v) = extracted.get("company_size").and_then(|v| as_text(v)) {
            self.client_profile.company_size = Some(v);
        }
        if let Some(v) = extracted.get("industry").and_then(|v| as_text(v)) {
            self.client_profile.industry = Some(v);
        }
        if let Some(v) = extracted.get("role").and_then(|v| as_text(v)) {
            self.client_profile.role = Some(v);
        }
        if let Some(v) = extracted.get("contact_name").and_then(|v| as_text(v)) {
            self.client_profile.contact_name = Some(v);
        }
        if let Some(Value::Array(points)) = extracted.get("pain_points") {
            for point in points.iter().filter_map(as_text) {
                if !self.client_profile.pain_points.contains(&point) {
                    self.client_profile.pain_points.push(point);
                }
            }
        }
        if let Some(Value::Array(features)) = extracted.get("interested_features") {
            for feature in features.iter().filter_map(as_text) {
                if !self.client_profile.interested_features.contains(&feature) {
                    self.client_profile.interested_features.push(feature);
                }
            }
        }
    }

    /// All objections raised so far, in order of first appearance.
    pub fn all_objections(&self) -> &[String] {
        &self.client_profile.objections
    }

    /// Actions that have at least one successful outcome and none failed
    /// more often than succeeded.
    pub fn effective_actions(&self) -> Vec<String> {
        self.successful_actions
            .iter()
            .filter(|(action, wins)| {
                let losses = self.failed_actions.get(*action).map(Vec::len).unwrap_or(0);
                wins.len() >= losses
            })
            .map(|(action, _)| action.clone())
            .collect()
    }

    pub fn ineffective_actions(&self) -> Vec<String> {
        self.failed_actions
            .iter()
            .filter(|(action, losses)| {
                let wins = self
                    .successful_actions
                    .get(*action)
                    .map(Vec::len)
                    .unwrap_or(0);
                losses.len() > wins
            })
            .map(|(action, _)| action.clone())
            .collect()
    }

    /// Compact textual recall of the profile for prompts.
    pub fn profile_summary(&self) -> String {
        let p = &self.client_profile;
        let mut parts = Vec::new();
        if let Some(name) = &p.company_name {
            parts.push(format!("компания {name}"));
        }
        if let Some(size) = &p.company_size {
            parts.push(format!("{size} сотрудников"));
        }
        if let Some(industry) = &p.industry {
            parts.push(format!("отрасль: {industry}"));
        }
        if let Some(contact) = &p.contact_name {
            parts.push(format!("контакт: {contact}"));
        }
        if !p.pain_points.is_empty() {
            parts.push(format!("боли: {}", p.pain_points.join(", ")));
        }
        parts.join("; ")
    }
}
