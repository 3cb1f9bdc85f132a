//! API authentication middleware.
//!
//! The bearer secret is read once at startup and cached as a SHA-256
//! digest; requests are compared in constant time. An empty secret
//! disables auth (dev mode) with a single startup warning.

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::api::error_response;
use crate::state::AppState;

/// Hash the configured token, or `None` for dev mode.
pub fn token_hash(api_key: &str) -> Option<[u8; 32]> {
    if api_key.is_empty() {
        tracing::warn!("API_KEY is empty; running without authentication");
        return None;
    }
    Some(Sha256::digest(api_key.as_bytes()).into())
}

/// Axum middleware enforcing `Authorization: Bearer <token>`.
pub async fn require_api_token(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let expected = match &state.api_token_hash {
        Some(hash) => hash,
        None => return next.run(req).await,
    };

    let provided = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    let provided_hash: [u8; 32] = Sha256::digest(provided.as_bytes()).into();
    if !bool::from(provided_hash.ct_eq(expected)) {
        return error_response(
            axum::http::StatusCode::UNAUTHORIZED,
            "UNAUTHORIZED",
            "invalid or missing API token",
        )
        .into_response();
    }

    next.run(req).await
}
