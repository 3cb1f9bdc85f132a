//! The per-turn engine: response generation, boundary validation,
//! conversation metrics, history compaction, and the orchestrator that
//! glues the whole decision pipeline together.

pub mod bot;
pub mod boundary;
pub mod compactor;
pub mod generator;
pub mod metrics;
pub mod retriever;

pub use bot::{BotDeps, SalesBot, TurnOutcome};
pub use boundary::{BoundaryValidator, ValidationResult};
pub use compactor::HistoryCompactor;
pub use metrics::{ConversationMetrics, ConversationOutcome};
pub use retriever::{KnowledgeRetriever, StaticRetriever};
