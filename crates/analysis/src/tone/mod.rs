//! Cascaded tone analysis.
//!
//! Tier 1 (regex markers) → tier 2 (semantic, embeddings) → tier 3
//! (LLM single-word classification), with a shared frustration tracker
//! feeding the guard and the response directives.

pub mod cascade;
pub mod frustration;
pub mod llm_tier;
pub mod markers;
pub mod regex_tier;
pub mod semantic_tier;

pub use cascade::CascadeToneAnalyzer;
pub use frustration::FrustrationTracker;
pub use regex_tier::RegexToneAnalyzer;
