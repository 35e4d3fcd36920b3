//! GET /pub/{token}/{filename} — unauthenticated downloads backed by an
//! HMAC capability token. The token binds one (session, filename) pair; the
//! handler re-derives the expected token per session directory, so no
//! database row is involved.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::Response,
};
use tracing::debug;

use kiso_tasks::pubfiles::verify_pub_token;

use crate::app::AppState;

pub async fn pub_file_handler(
    State(state): State<Arc<AppState>>,
    Path((token, filename)): Path<(String, String)>,
) -> Result<Response, StatusCode> {
    // A filename with path structure is an attack, not a mistake.
    if filename.contains('/') || filename.contains("..") || filename.starts_with('.') {
        return Err(StatusCode::NOT_FOUND);
    }

    let sessions_dir = state.config.load().kiso_dir().join("sessions");
    let entries = std::fs::read_dir(&sessions_dir).map_err(|_| StatusCode::NOT_FOUND)?;

    for entry in entries.flatten() {
        if !entry.path().is_dir() {
            continue;
        }
        let session = entry.file_name().to_string_lossy().to_string();
        if !verify_pub_token(&state.pub_secret, &session, &filename, &token) {
            continue;
        }

        let file_path = entry.path().join("pub").join(&filename);
        let bytes = tokio::fs::read(&file_path)
            .await
            .map_err(|_| StatusCode::NOT_FOUND)?;
        debug!(session, filename, "pub file served");
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            )
            .body(Body::from(bytes))
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR);
    }

    // Any non-matching path is a plain 404 — no distinction between bad
    // token, unknown file, and unknown session.
    Err(StatusCode::NOT_FOUND)
}
