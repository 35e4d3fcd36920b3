//! POST /sessions and POST /sessions/{session}/cancel.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use kiso_core::types::validate_session_id;

use crate::app::AppState;
use crate::auth;

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    pub session: String,
    #[serde(default)]
    pub webhook: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

pub async fn create_session_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let caller = auth::authenticate(&state, &headers)
        .ok_or_else(|| error(StatusCode::UNAUTHORIZED, "missing or invalid bearer token"))?;
    if !auth::check_rate_limit(&state, &caller.connector) {
        return Err(error(
            StatusCode::TOO_MANY_REQUESTS,
            "rate limit exceeded; retry in a minute",
        ));
    }
    if validate_session_id(&req.session).is_err() {
        return Err(error(StatusCode::BAD_REQUEST, "invalid session id"));
    }

    // Webhook URLs are vetted at registration so delivery failures later are
    // transport problems, not policy surprises.
    if let Some(url) = &req.webhook {
        let config = state.config.load();
        kiso_runtime::webhook::validate_webhook_url(
            url,
            config.webhook.require_https,
            &config.webhook.allow_list,
        )
        .map_err(|reason| error(StatusCode::BAD_REQUEST, reason))?;
    }

    state
        .store
        .create_or_update_session(
            &req.session,
            Some(&caller.connector),
            req.webhook.as_deref(),
            req.description.as_deref(),
        )
        .map_err(|e| error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))?;

    info!(session = %req.session, connector = %caller.connector, "session registered");
    Ok((
        StatusCode::CREATED,
        Json(json!({ "session": req.session, "registered": true })),
    ))
}

pub async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    Path(session): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    auth::authenticate(&state, &headers)
        .ok_or_else(|| error(StatusCode::UNAUTHORIZED, "missing or invalid bearer token"))?;
    if validate_session_id(&session).is_err() {
        return Err(error(StatusCode::BAD_REQUEST, "invalid session id"));
    }

    let outcome = state.supervisor.on_cancel(&session);
    info!(session, cancelled = outcome.cancelled, "cancel requested");
    Ok(Json(serde_json::to_value(outcome).unwrap_or(json!({"cancelled": false}))))
}

fn error(status: StatusCode, message: &str) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "error": message })))
}
