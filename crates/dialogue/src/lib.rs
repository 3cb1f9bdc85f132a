//! Dialogue control: the flow graph and state machine, conversation
//! guard, fallback handler, lead scorer, context window with episodic
//! memory, and the policy overlay.

pub mod context_window;
pub mod envelope;
pub mod episodic;
pub mod fallback;
pub mod flow;
pub mod guard;
pub mod lead;
pub mod policy;
pub mod state_machine;

pub use envelope::ContextEnvelope;
pub use fallback::{FallbackHandler, FallbackResponse};
pub use flow::{FlowConfig, StateConfig};
pub use guard::{ConversationGuard, GuardConfig, InterventionTier};
pub use lead::{LeadScorer, LeadTemperature};
pub use policy::{DialoguePolicy, PolicyDecision, PolicyOverride, ResponseDirectives};
pub use state_machine::{StateMachine, StateMachineResult};
