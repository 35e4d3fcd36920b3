//! POST /msg — the single entry point for messages into the core.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use kiso_core::config::MAX_CONTENT_BYTES;
use kiso_core::types::{validate_session_id, validate_username};
use kiso_runtime::EnqueueOutcome;

use crate::app::AppState;
use crate::auth;

#[derive(Deserialize)]
pub struct MsgRequest {
    pub session: String,
    pub user: String,
    pub content: String,
}

#[derive(Serialize)]
pub struct MsgReply {
    pub queued: bool,
    pub session: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub untrusted: Option<bool>,
}

pub async fn msg_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<MsgRequest>,
) -> Result<(StatusCode, Json<MsgReply>), (StatusCode, Json<Value>)> {
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
    if validate_username(&req.user).is_err() {
        return Err(error(StatusCode::BAD_REQUEST, "invalid username"));
    }
    if req.content.len() > MAX_CONTENT_BYTES {
        return Err(error(StatusCode::PAYLOAD_TOO_LARGE, "content too large"));
    }
    if req.content.trim().is_empty() {
        return Err(error(StatusCode::BAD_REQUEST, "content must not be empty"));
    }

    let resolved = auth::resolve_user(&state, &caller.connector, &req.user);
    let outcome = state
        .supervisor
        .on_message(&req.session, resolved.as_deref(), &req.content)
        .await
        .map_err(|e| {
            error(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("storage failure: {e}"),
            )
        })?;

    info!(
        session = %req.session,
        connector = %caller.connector,
        ?outcome,
        "message accepted"
    );

    let reply = match outcome {
        EnqueueOutcome::Queued => MsgReply {
            queued: true,
            session: req.session,
            untrusted: None,
        },
        EnqueueOutcome::Untrusted => MsgReply {
            queued: false,
            session: req.session,
            untrusted: Some(true),
        },
        EnqueueOutcome::QueueFull => {
            return Err(error(
                StatusCode::TOO_MANY_REQUESTS,
                "session queue is full; retry later",
            ));
        }
    };
    Ok((StatusCode::ACCEPTED, Json(reply)))
}

fn error(status: StatusCode, message: &str) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "error": message })))
}
