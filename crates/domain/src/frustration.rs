//! Single source of truth for frustration thresholds.
//!
//! Every component that gates on the accumulated frustration level —
//! the conversation guard, fallback conditions, response directives —
//! must read these values. Keeping them in one place guarantees the
//! "is high frustration" predicate agrees everywhere for the same
//! integer level.

use serde::{Deserialize, Serialize};

/// Frustration level ceiling.
pub const MAX_FRUSTRATION: i32 = 10;

/// Named thresholds over the `[0, MAX_FRUSTRATION]` scale.
///
/// Invariant: `elevated < moderate < warning < high < critical`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FrustrationThresholds {
    pub elevated: i32,
    pub moderate: i32,
    pub warning: i32,
    pub high: i32,
    pub critical: i32,
}

impl Default for FrustrationThresholds {
    fn default() -> Self {
        Self {
            elevated: 2,
            moderate: 3,
            warning: 5,
            high: 7,
            critical: 9,
        }
    }
}

impl FrustrationThresholds {
    /// Validate strict monotonicity and range.
    pub fn validate(&self) -> Result<(), String> {
        let seq = [
            self.elevated,
            self.moderate,
            self.warning,
            self.high,
            self.critical,
        ];
        if seq.windows(2).any(|w| w[0] >= w[1]) {
            return Err(format!("frustration thresholds must be strictly increasing: {seq:?}"));
        }
        if seq[0] < 0 || seq[4] > MAX_FRUSTRATION {
            return Err(format!(
                "frustration thresholds out of range [0, {MAX_FRUSTRATION}]: {seq:?}"
            ));
        }
        Ok(())
    }

    pub fn is_warning(&self, level: i32) -> bool {
        level >= self.warning
    }

    pub fn is_high(&self, level: i32) -> bool {
        level >= self.high
    }

    pub fn is_critical(&self, level: i32) -> bool {
        level >= self.critical
    }

    /// Whether the guard should consider intervening at this level.
    pub fn needs_intervention(&self, level: i32) -> bool {
        self.is_high(level)
    }
}

/// Clamp a raw level into the valid range.
pub fn clamp_level(level: i32) -> i32 {
    level.clamp(0, MAX_FRUSTRATION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        FrustrationThresholds::default().validate().unwrap();
    }

    #[test]
    fn non_monotone_rejected() {
        let t = FrustrationThresholds {
            elevated: 5,
            moderate: 3,
            warning: 5,
            high: 7,
            critical: 9,
        };
        assert!(t.validate().is_err());
    }

    #[test]
    fn predicates_agree_on_boundaries() {
        let t = FrustrationThresholds::default();
        assert!(!t.is_high(t.high - 1));
        assert!(t.is_high(t.high));
        assert!(t.is_critical(t.critical));
        assert_eq!(t.needs_intervention(t.high), t.is_high(t.high));
    }

    #[test]
    fn clamp_bounds() {
        assert_eq!(clamp_level(-3), 0);
        assert_eq!(clamp_level(42), MAX_FRUSTRATION);
        assert_eq!(clamp_level(4), 4);
    }
}
