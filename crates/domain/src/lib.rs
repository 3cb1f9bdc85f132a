//! Shared domain types for the salesflow workspace: the common error
//! type, feature flags, frustration thresholds, intent and tone
//! vocabularies, the snapshot schema, and the per-turn decision trace.

pub mod error;
pub mod flags;
pub mod frustration;
pub mod intents;
pub mod snapshot;
pub mod tone;
pub mod trace;

pub use error::{Error, Result};
