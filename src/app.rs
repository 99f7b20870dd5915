//! Route dispatch, CORS, and error envelopes.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tower_http::cors::{Any, CorsLayer};

use crate::dispatch::dispatch;
use crate::openai::{ChatCompletionRequest, ErrorEnvelope, ModelInfo, ModelList};
use crate::response::{unix_now, MODEL_IDS};
use crate::AppState;

const BODY_LIMIT: usize = 10 * 1024 * 1024;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    provider: &'static str,
    timestamp: String,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    let mut router = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/health", get(get_health))
        .fallback(not_found)
        .layer(cors)
        .layer(DefaultBodyLimit::max(BODY_LIMIT));

    if state.config.request_logging {
        router = router.layer(tower_http::trace::TraceLayer::new_for_http());
    }

    router.with_state(state)
}

async fn chat_completions(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    // Parsed by hand so a syntactically invalid body gets the same error
    // envelope as every other validation failure, not the extractor's
    // plain-text rejection.
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorEnvelope::invalid_request(
                    format!("malformed request body: {err}"),
                    "invalid_body",
                )),
            )
                .into_response();
        }
    };

    let has_messages = payload
        .get("messages")
        .and_then(Value::as_array)
        .is_some_and(|messages| !messages.is_empty());
    if !has_messages {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorEnvelope::invalid_request(
                "messages must be a non-empty array",
                "invalid_messages",
            )),
        )
            .into_response();
    }

    let request: ChatCompletionRequest = match serde_json::from_value(payload) {
        Ok(request) => request,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorEnvelope::invalid_request(
                    format!("malformed request body: {err}"),
                    "invalid_body",
                )),
            )
                .into_response();
        }
    };

    dispatch(state, request).await
}

async fn list_models() -> Json<ModelList> {
    let created = unix_now();
    Json(ModelList {
        object: "list",
        data: MODEL_IDS
            .into_iter()
            .map(|id| ModelInfo {
                id,
                object: "model",
                created,
                owned_by: "anthropic",
            })
            .collect(),
    })
}

async fn get_health() -> Json<HealthResponse> {
    let timestamp = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();
    Json(HealthResponse {
        status: "ok",
        provider: "claude-code-cli",
        timestamp,
    })
}

async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorEnvelope::invalid_request("unknown route", "unknown_url")),
    )
        .into_response()
}
