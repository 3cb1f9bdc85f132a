//! HTTP API surface.
//!
//! `GET /health`, `POST /api/v1/process` (bearer), and
//! `GET /api/v1/users/{user_id}/profile` (bearer). Errors use the
//! structured `{error: {code, message}}` envelope.

use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::auth::require_api_token;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Schemas
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct MessagePayload {
    pub text: String,
    #[serde(default)]
    pub timestamp_ms: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ContextPayload {
    #[serde(default)]
    pub time_of_day: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub meta: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct ProcessRequest {
    #[serde(default)]
    pub request_id: Option<String>,
    pub channel: String,
    pub session_id: String,
    pub user_id: String,
    pub message: MessagePayload,
    #[serde(default)]
    pub context: Option<ContextPayload>,
}

#[derive(Debug, Serialize)]
pub struct ProcessMeta {
    pub model: String,
    pub processing_ms: u64,
    pub kb_used: bool,
}

#[derive(Debug, Serialize)]
pub struct ProcessResponse {
    pub answer: String,
    pub meta: ProcessMeta,
}

/// Structured error envelope.
pub fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": { "code": code, "message": message }
        })),
    )
        .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Router
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/v1/process", post(process_message))
        .route("/api/v1/users/:user_id/profile", get(user_profile))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_api_token,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "model": state.model_name,
    }))
}

/// Actions that consult the knowledge base.
fn action_uses_kb(action: &str) -> bool {
    matches!(
        action,
        "answer_with_pricing" | "answer_with_pricing_direct" | "answer_question"
    )
}

async fn process_message(
    State(state): State<AppState>,
    payload: Result<Json<ProcessRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "BAD_REQUEST",
                &rejection.body_text(),
            );
        }
    };

    if req.session_id.trim().is_empty() || req.user_id.trim().is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "BAD_REQUEST",
            "session_id and user_id must be non-empty",
        );
    }

    let started = Instant::now();
    tracing::info!(
        request_id = req.request_id.as_deref(),
        channel = %req.channel,
        session_id = %req.session_id,
        user_id = %req.user_id,
        "processing message"
    );

    let outcome = match state
        .sessions
        .process_message(
            &req.session_id,
            Some(&req.user_id),
            None,
            None,
            &req.message.text,
        )
        .await
    {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::error!(error = %err, "turn processing failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", "internal error");
        }
    };

    // Profile upkeep is best-effort; the reply does not depend on it.
    let _ = state.sessions.inspect(&req.session_id, Some(&req.user_id), |bot| {
        if let Err(err) = state
            .store
            .save_user_profile(&req.session_id, &req.user_id, bot)
        {
            tracing::warn!(error = %err, "user profile save failed");
        }
    });

    Json(ProcessResponse {
        answer: outcome.response.clone(),
        meta: ProcessMeta {
            model: state.model_name.clone(),
            processing_ms: started.elapsed().as_millis() as u64,
            kb_used: action_uses_kb(&outcome.action),
        },
    })
    .into_response()
}

async fn user_profile(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Response {
    match state.store.load_user_profiles(&user_id) {
        Ok(profiles) if profiles.is_empty() => error_response(
            StatusCode::NOT_FOUND,
            "BAD_REQUEST",
            "no profiles for this user",
        ),
        Ok(profiles) => Json(serde_json::json!({
            "user_id": user_id,
            "profiles": profiles,
        }))
        .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "profile load failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", "internal error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token_hash;
    use crate::store::ConversationStore;
    use axum::body::Body;
    use axum::http::Request;
    use sf_engine::retriever::StaticRetriever;
    use sf_engine::BotDeps;
    use sf_sessions::{SessionManager, SessionManagerConfig};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app(dir: &std::path::Path, api_key: &str) -> Router {
        let deps = BotDeps::offline(Arc::new(StaticRetriever::default()));
        let sessions = SessionManager::new(
            &dir.join("buffer.sqlite"),
            &dir.join("locks"),
            deps,
            SessionManagerConfig::default(),
        )
        .unwrap();
        let store = Arc::new(ConversationStore::open(&dir.join("db.sqlite")).unwrap());
        router(AppState {
            sessions: Arc::new(sessions),
            store,
            api_token_hash: token_hash(api_key),
            model_name: "offline".into(),
        })
    }

    fn process_body(session: &str, user: &str, text: &str) -> Body {
        Body::from(
            serde_json::json!({
                "channel": "web",
                "session_id": session,
                "user_id": user,
                "message": { "text": text, "timestamp_ms": 0 },
                "context": { "time_of_day": "day", "timezone": "Asia/Almaty", "meta": {} }
            })
            .to_string(),
        )
    }

    #[tokio::test]
    async fn health_is_open() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), "secret");
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn process_requires_bearer() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), "secret");
        let response = app
            .oneshot(
                Request::post("/api/v1/process")
                    .header("content-type", "application/json")
                    .body(process_body("s1", "u1", "привет"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn process_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), "secret");
        let response = app
            .oneshot(
                Request::post("/api/v1/process")
                    .header("content-type", "application/json")
                    .header("authorization", "Bearer secret")
                    .body(process_body("s1", "u1", "Здравствуйте!"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(!json["answer"].as_str().unwrap().is_empty());
        assert_eq!(json["meta"]["model"], "offline");
    }

    #[tokio::test]
    async fn malformed_body_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), "secret");
        let response = app
            .oneshot(
                Request::post("/api/v1/process")
                    .header("content-type", "application/json")
                    .header("authorization", "Bearer secret")
                    .body(Body::from("{\"oops\": true}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["error"]["code"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn unknown_user_profile_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), "secret");
        let response = app
            .oneshot(
                Request::get("/api/v1/users/ghost/profile")
                    .header("authorization", "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn profile_appears_after_dialogue() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), "");
        let _ = app
            .clone()
            .oneshot(
                Request::post("/api/v1/process")
                    .header("content-type", "application/json")
                    .body(process_body("s2", "u2", "у нас компания Ромашка, 25 сотрудников"))
                    .unwrap(),
            )
            .await
            .unwrap();
        let response = app
            .oneshot(
                Request::get("/api/v1/users/u2/profile")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["profiles"][0]["company_name"], "Ромашка");
    }
}
