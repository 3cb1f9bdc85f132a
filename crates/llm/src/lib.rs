//! LLM and embedding provider layer.
//!
//! Exposes the provider traits consumed by the rest of the workspace,
//! the HTTP client with retry/backoff and a shared circuit breaker,
//! state-keyed canned fallbacks, and cosine-similarity helpers for the
//! semantic tiers.

pub mod breaker;
pub mod client;
pub mod embeddings;
pub mod fallback;

pub use breaker::{BreakerState, CircuitBreaker};
pub use client::{
    GenerateOptions, HttpLlm, HttpLlmConfig, LlmClient, LlmProvider, LlmStats, MockLlm,
    RetryPolicy,
};
pub use embeddings::{cosine_similarity, top_k_mean, EmbeddingProvider, StaticEmbedder};
pub use fallback::fallback_for_state;
