use serde::{Deserialize, Serialize};

use kiso_core::types::{
    FactCategory, FactSource, LearningStatus, PlanStatus, TaskStatus, TaskType,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRow {
    pub session: String,
    pub connector: Option<String>,
    pub webhook: Option<String>,
    pub description: Option<String>,
    pub summary: String,
    pub last_summary_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: i64,
    pub session: String,
    pub user: Option<String>,
    pub role: String,
    pub content: String,
    pub trusted: bool,
    pub processed: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRow {
    pub id: i64,
    pub session: String,
    pub message_id: i64,
    pub parent_id: Option<i64>,
    pub goal: String,
    pub status: PlanStatus,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    /// Per-call audit records, JSON in the table; deserialized on read.
    pub llm_calls: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRow {
    pub id: i64,
    pub plan_id: i64,
    pub session: String,
    pub idx: i64,
    pub task_type: TaskType,
    pub detail: String,
    pub skill: Option<String>,
    pub args: Option<String>,
    pub expect: Option<String>,
    pub status: TaskStatus,
    pub substatus: Option<String>,
    pub output: Option<String>,
    pub stderr: Option<String>,
    pub review_verdict: Option<String>,
    pub review_reason: Option<String>,
    pub review_learning: Option<String>,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub llm_calls: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields for inserting one task of a freshly persisted plan.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub plan_id: i64,
    pub session: String,
    pub idx: i64,
    pub task_type: TaskType,
    pub detail: String,
    pub skill: Option<String>,
    pub args: Option<String>,
    pub expect: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactRow {
    pub id: i64,
    pub content: String,
    pub source: FactSource,
    pub session: Option<String>,
    pub category: FactCategory,
    pub confidence: f64,
    pub last_used: Option<String>,
    pub use_count: i64,
    pub created_at: String,
}

/// Fields for (re-)inserting a fact, e.g. during consolidation.
#[derive(Debug, Clone)]
pub struct NewFact {
    pub content: String,
    pub source: FactSource,
    pub session: Option<String>,
    pub category: FactCategory,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningRow {
    pub id: i64,
    pub content: String,
    pub session: String,
    pub user: Option<String>,
    pub status: LearningStatus,
    pub reason: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingItemRow {
    pub id: i64,
    pub content: String,
    pub scope: String,
    pub source: String,
    pub status: String,
    pub created_at: String,
}

/// Snapshot returned for `GET /status/{session}`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub tasks: Vec<TaskRow>,
    pub plan: Option<PlanRow>,
}
