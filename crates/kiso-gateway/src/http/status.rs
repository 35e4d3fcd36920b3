//! GET /status/{session} — polling surface for CLI clients.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use kiso_core::types::validate_session_id;
use kiso_store::{PlanRow, TaskRow};

use crate::app::AppState;
use crate::auth;

#[derive(Deserialize)]
pub struct StatusQuery {
    #[serde(default)]
    pub after: i64,
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Serialize)]
pub struct StatusReply {
    pub tasks: Vec<TaskRow>,
    pub queue_length: usize,
    pub plan: Option<PlanRow>,
    pub worker_running: bool,
    pub active_task: Option<i64>,
}

pub async fn status_handler(
    State(state): State<Arc<AppState>>,
    Path(session): Path<String>,
    Query(query): Query<StatusQuery>,
    headers: HeaderMap,
) -> Result<Json<StatusReply>, (StatusCode, Json<Value>)> {
    auth::authenticate(&state, &headers).ok_or_else(|| {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "missing or invalid bearer token"})),
        )
    })?;
    if validate_session_id(&session).is_err() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid session id"})),
        ));
    }

    let snapshot = state.store.get_status(&session, query.after).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
    })?;

    let (queue_length, worker_running) = state.supervisor.session_stats(&session);

    let mut tasks = snapshot.tasks;
    let mut plan = snapshot.plan;
    if !query.verbose {
        // The per-call LLM audit is only shipped on request.
        for task in &mut tasks {
            task.llm_calls = None;
        }
        if let Some(p) = &mut plan {
            p.llm_calls = None;
        }
    }
    let active_task = tasks
        .iter()
        .find(|t| t.status == kiso_core::types::TaskStatus::Running)
        .map(|t| t.id);

    Ok(Json(StatusReply {
        tasks,
        queue_length,
        plan,
        worker_running,
        active_task,
    }))
}
