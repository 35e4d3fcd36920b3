use serde::{Deserialize, Serialize};

use kiso_core::types::{LlmCallAudit, TaskType};
use kiso_llm::LlmReply;

/// Token spend accumulated across one role invocation (including its
/// validation retries).
#[derive(Debug, Default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub calls: Vec<LlmCallAudit>,
}

impl Usage {
    pub fn add(&mut self, reply: &LlmReply) {
        self.prompt_tokens += reply.prompt_tokens;
        self.completion_tokens += reply.completion_tokens;
        self.calls.push(reply.call_audit.clone());
    }

    pub fn merge(&mut self, other: Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.calls.extend(other.calls);
    }
}

/// A role's validated output plus what it cost.
#[derive(Debug)]
pub struct RoleReply<T> {
    pub value: T,
    pub usage: Usage,
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

/// One planned task as emitted by the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedTask {
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub detail: String,
    #[serde(default)]
    pub skill: Option<String>,
    /// JSON object serialized to a string for skill tasks.
    #[serde(default)]
    pub args: Option<serde_json::Value>,
    #[serde(default)]
    pub expect: Option<String>,
}

/// A secret the planner spotted in the user's message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedSecret {
    pub key: String,
    pub value: String,
}

/// Full planner output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanOutput {
    pub goal: String,
    #[serde(default)]
    pub secrets: Vec<ExtractedSecret>,
    pub tasks: Vec<PlannedTask>,
    #[serde(default)]
    pub extend_replan: Option<i64>,
}

/// Host facts the planner and translator see.
#[derive(Debug, Clone, Default)]
pub struct SystemEnvironment {
    pub os: String,
    pub binaries: Vec<String>,
    pub exec_cwd: String,
    /// Workspace listing, already capped by the caller.
    pub workspace_files: Vec<String>,
    pub registry_url: Option<String>,
    pub blocked_hints: Vec<String>,
    pub max_plan_tasks: usize,
    pub max_replan_depth: u32,
}

/// One prior attempt in a replan chain.
#[derive(Debug, Clone)]
pub struct ReplanAttempt {
    pub goal: String,
    pub failure: String,
    pub tried: Vec<String>,
}

// ---------------------------------------------------------------------------
// Reviewer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewOutput {
    pub status: ReviewStatus,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub learn: Vec<String>,
    #[serde(default)]
    pub retry_hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    Ok,
    Replan,
}

// ---------------------------------------------------------------------------
// Searcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub max_results: Option<i64>,
    #[serde(default)]
    pub lang: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOutput {
    pub results: Vec<SearchResult>,
    pub summary: String,
    #[serde(default)]
    pub sources: Vec<String>,
}

// ---------------------------------------------------------------------------
// Curator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CuratorOutput {
    pub evaluations: Vec<CuratorEvaluation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CuratorEvaluation {
    pub learning_id: i64,
    pub verdict: CuratorVerdict,
    #[serde(default)]
    pub fact: Option<String>,
    #[serde(default)]
    pub category: Option<kiso_core::types::FactCategory>,
    #[serde(default)]
    pub question: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CuratorVerdict {
    Promote,
    Ask,
    Discard,
}

// ---------------------------------------------------------------------------
// Facts summarizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidatedFact {
    pub content: String,
    pub category: kiso_core::types::FactCategory,
    pub confidence: f64,
    /// Provenance session echoed back so user facts keep their scope.
    #[serde(default)]
    pub session: Option<String>,
}
