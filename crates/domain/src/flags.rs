//! Feature flags with runtime and environment overrides.
//!
//! Flags are resolved in three layers: built-in defaults, a one-shot
//! environment sweep (`FF_<NAME>=true|false`), and runtime overrides
//! set through [`Flags::set_override`]. Runtime overrides win.

use std::collections::HashMap;

use parking_lot::RwLock;

/// Built-in flag defaults. Anything not listed here resolves to `false`.
fn defaults() -> HashMap<&'static str, bool> {
    HashMap::from([
        // Dialogue naturalness
        ("tone_analysis", true),
        ("tone_semantic_tier2", false),
        ("tone_llm_tier3", false),
        ("response_variations", true),
        // Flow optimisation
        ("lead_scoring", true),
        ("circular_flow", false),
        // Protection
        ("multi_tier_fallback", true),
        ("conversation_guard", true),
        // Infrastructure
        ("metrics_tracking", true),
        ("decision_tracing", true),
        // Classification
        ("cascade_classifier", true),
        ("llm_classifier", false),
        ("semantic_objection_detection", false),
        ("unified_disambiguation", true),
        // Refinement pipeline (toggled together via the group below)
        ("classification_refinement", true),
        ("composite_refinement", true),
        ("objection_refinement", true),
        ("confidence_calibration", true),
        ("first_contact_refinement", true),
        ("data_aware_refinement", true),
        // Context policy
        ("context_full_envelope", true),
        ("context_shadow_mode", false),
        ("context_response_directives", true),
        ("context_policy_overlays", true),
        // Fallback extras
        ("dynamic_cta_fallback", true),
        ("cta_generator", true),
        // Boundary validation
        ("response_boundary_validator", true),
        ("response_boundary_retry", true),
        ("response_boundary_fallback", true),
    ])
}

/// Flag groups that are toggled as a unit.
const REFINEMENT_PIPELINE_ALL: &[&str] = &[
    "classification_refinement",
    "composite_refinement",
    "objection_refinement",
    "confidence_calibration",
    "first_contact_refinement",
    "data_aware_refinement",
];

/// Process-wide feature flags.
///
/// Constructed once at bootstrap and passed down explicitly; components
/// never reach for a global instance.
pub struct Flags {
    base: HashMap<&'static str, bool>,
    overrides: RwLock<HashMap<String, bool>>,
}

impl Default for Flags {
    fn default() -> Self {
        Self::new()
    }
}

impl Flags {
    /// Flags with built-in defaults only.
    pub fn new() -> Self {
        Self {
            base: defaults(),
            overrides: RwLock::new(HashMap::new()),
        }
    }

    /// Flags with defaults plus a one-shot environment sweep.
    ///
    /// Every `FF_<NAME>` variable overrides the flag `<name>`
    /// (lowercased). Accepted truthy values: `true`, `1`, `yes`, `on`.
    pub fn from_env() -> Self {
        let flags = Self::new();
        for (key, value) in std::env::vars() {
            let Some(name) = key.strip_prefix("FF_") else {
                continue;
            };
            let enabled = matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on");
            flags
                .overrides
                .write()
                .insert(name.to_lowercase(), enabled);
        }
        flags
    }

    /// Check a flag by name. Unknown flags are disabled.
    pub fn is_enabled(&self, flag: &str) -> bool {
        if let Some(v) = self.overrides.read().get(flag) {
            return *v;
        }
        self.base.get(flag).copied().unwrap_or(false)
    }

    /// Set a runtime override.
    pub fn set_override(&self, flag: &str, value: bool) {
        self.overrides.write().insert(flag.to_owned(), value);
    }

    /// Remove a runtime override, falling back to env/default.
    pub fn clear_override(&self, flag: &str) {
        self.overrides.write().remove(flag);
    }

    /// Toggle the whole refinement pipeline as one unit.
    pub fn set_refinement_pipeline(&self, value: bool) {
        for flag in REFINEMENT_PIPELINE_ALL {
            self.set_override(flag, value);
        }
    }

    // ── Typed accessors for the hot flags ──────────────────────────

    pub fn tone_analysis(&self) -> bool {
        self.is_enabled("tone_analysis")
    }

    pub fn tone_semantic_tier2(&self) -> bool {
        self.is_enabled("tone_semantic_tier2")
    }

    pub fn tone_llm_tier3(&self) -> bool {
        self.is_enabled("tone_llm_tier3")
    }

    pub fn lead_scoring(&self) -> bool {
        self.is_enabled("lead_scoring")
    }

    pub fn conversation_guard(&self) -> bool {
        self.is_enabled("conversation_guard")
    }

    pub fn metrics_tracking(&self) -> bool {
        self.is_enabled("metrics_tracking")
    }

    pub fn decision_tracing(&self) -> bool {
        self.is_enabled("decision_tracing")
    }

    pub fn semantic_objection_detection(&self) -> bool {
        self.is_enabled("semantic_objection_detection")
    }

    pub fn context_full_envelope(&self) -> bool {
        self.is_enabled("context_full_envelope")
    }

    pub fn context_shadow_mode(&self) -> bool {
        self.is_enabled("context_shadow_mode")
    }

    pub fn context_response_directives(&self) -> bool {
        self.is_enabled("context_response_directives")
    }

    pub fn context_policy_overlays(&self) -> bool {
        self.is_enabled("context_policy_overlays")
    }

    pub fn dynamic_cta_fallback(&self) -> bool {
        self.is_enabled("dynamic_cta_fallback")
    }

    pub fn response_boundary_validator(&self) -> bool {
        self.is_enabled("response_boundary_validator")
    }

    pub fn response_boundary_retry(&self) -> bool {
        self.is_enabled("response_boundary_retry")
    }

    pub fn response_boundary_fallback(&self) -> bool {
        self.is_enabled("response_boundary_fallback")
    }
}
