use axum::Json;
use serde_json::{json, Value};

/// GET /health — liveness only; no auth, no store access.
pub async fn health_handler() -> Json<Value> {
    Json(json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
