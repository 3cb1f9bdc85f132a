//! Shared application state for the gateway.

use std::sync::Arc;

use sf_sessions::SessionManager;

use crate::store::ConversationStore;

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub store: Arc<ConversationStore>,
    /// SHA-256 of the bearer secret; `None` disables auth (dev mode).
    pub api_token_hash: Option<[u8; 32]>,
    /// Model identifier reported by `/health`.
    pub model_name: String,
}
