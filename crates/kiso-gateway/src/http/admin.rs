//! POST /admin/reload-env — atomic reload of the config file and the
//! deploy-secret set. Admin tokens only.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::app::AppState;
use crate::auth;

pub async fn reload_env_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let caller = auth::authenticate(&state, &headers).ok_or_else(|| {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "missing or invalid bearer token"})),
        )
    })?;
    if !caller.admin {
        return Err((
            StatusCode::FORBIDDEN,
            Json(json!({"error": "admin token required"})),
        ));
    }

    let kiso_dir = state.config.load().kiso_dir();

    // Secrets first: a new provider key should be visible to the config
    // validation that follows.
    state.secrets.reload(&kiso_dir.join(".env"));

    match kiso_core::KisoConfig::load(None) {
        Ok(fresh) => {
            state.config.replace(fresh);
            info!(connector = %caller.connector, "config and secrets reloaded");
            Ok(Json(json!({ "reloaded": true })))
        }
        Err(e) => {
            // Secrets were swapped but the old config stays — a broken edit
            // must not take a running instance down.
            warn!(error = %e, "config reload failed; keeping previous config");
            Err((
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "reloaded": false, "error": e.to_string() })),
            ))
        }
    }
}
