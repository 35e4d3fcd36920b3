use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::KisoError;

/// Task substatus labels shown to clients while a task is running.
pub mod substatus {
    pub const TRANSLATING: &str = "translating";
    pub const EXECUTING: &str = "executing";
    pub const REVIEWING: &str = "reviewing";
    pub const SEARCHING: &str = "searching";
    pub const COMPOSING: &str = "composing";
}

/// The kind of work a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Exec,
    Skill,
    Search,
    Msg,
    Replan,
}

impl TaskType {
    /// `msg` and `replan` tasks carry no expectation; everything else must.
    pub fn requires_expect(self) -> bool {
        !matches!(self, TaskType::Msg | TaskType::Replan)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskType::Exec => "exec",
            TaskType::Skill => "skill",
            TaskType::Search => "search",
            TaskType::Msg => "msg",
            TaskType::Replan => "replan",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskType {
    type Err = KisoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exec" => Ok(TaskType::Exec),
            "skill" => Ok(TaskType::Skill),
            "search" => Ok(TaskType::Search),
            "msg" => Ok(TaskType::Msg),
            "replan" => Ok(TaskType::Replan),
            other => Err(KisoError::Config(format!("unknown task type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = KisoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "done" => Ok(TaskStatus::Done),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(KisoError::Config(format!("unknown task status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Running,
    Done,
    Failed,
    Cancelled,
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlanStatus::Running => "running",
            PlanStatus::Done => "done",
            PlanStatus::Failed => "failed",
            PlanStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for PlanStatus {
    type Err = KisoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(PlanStatus::Running),
            "done" => Ok(PlanStatus::Done),
            "failed" => Ok(PlanStatus::Failed),
            "cancelled" => Ok(PlanStatus::Cancelled),
            other => Err(KisoError::Config(format!("unknown plan status: {other}"))),
        }
    }
}

/// Reviewer verdict on a completed non-msg task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewVerdict {
    Ok,
    Replan,
}

impl fmt::Display for ReviewVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReviewVerdict::Ok => "ok",
            ReviewVerdict::Replan => "replan",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactCategory {
    Project,
    User,
    Tool,
    General,
}

impl fmt::Display for FactCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FactCategory::Project => "project",
            FactCategory::User => "user",
            FactCategory::Tool => "tool",
            FactCategory::General => "general",
        };
        f.write_str(s)
    }
}

impl FromStr for FactCategory {
    type Err = KisoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "project" => Ok(FactCategory::Project),
            "user" => Ok(FactCategory::User),
            "tool" => Ok(FactCategory::Tool),
            "general" => Ok(FactCategory::General),
            other => Err(KisoError::Config(format!("unknown fact category: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactSource {
    Curator,
    Summarizer,
    Manual,
}

impl fmt::Display for FactSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FactSource::Curator => "curator",
            FactSource::Summarizer => "summarizer",
            FactSource::Manual => "manual",
        };
        f.write_str(s)
    }
}

impl FromStr for FactSource {
    type Err = KisoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "curator" => Ok(FactSource::Curator),
            "summarizer" => Ok(FactSource::Summarizer),
            "manual" => Ok(FactSource::Manual),
            other => Err(KisoError::Config(format!("unknown fact source: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LearningStatus {
    Pending,
    Promoted,
    Discarded,
}

impl fmt::Display for LearningStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LearningStatus::Pending => "pending",
            LearningStatus::Promoted => "promoted",
            LearningStatus::Discarded => "discarded",
        };
        f.write_str(s)
    }
}

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MsgRole {
    User,
    Assistant,
    System,
}

impl fmt::Display for MsgRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MsgRole::User => "user",
            MsgRole::Assistant => "assistant",
            MsgRole::System => "system",
        })
    }
}

/// Per-call audit record attached to plans and tasks.
///
/// Produced by the LLM gateway, persisted as JSON by the store, surfaced in
/// `/status` responses when `verbose=true`. Never carries prompt text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCallAudit {
    pub role: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub latency_ms: u64,
    pub status: String,
}

// ---------------------------------------------------------------------------
// Identifier validation
// ---------------------------------------------------------------------------

fn session_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_@.\-]{1,255}$").expect("static regex"))
}

fn username_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").expect("static regex"))
}

/// Validate a session identifier against the wire contract.
pub fn validate_session_id(session: &str) -> crate::Result<()> {
    if session_re().is_match(session) {
        Ok(())
    } else {
        Err(KisoError::InvalidSessionId(session.to_string()))
    }
}

/// Validate a username against the wire contract.
pub fn validate_username(user: &str) -> crate::Result<()> {
    if username_re().is_match(user) {
        Ok(())
    } else {
        Err(KisoError::InvalidUsername(user.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_one_char_accepted() {
        assert!(validate_session_id("a").is_ok());
    }

    #[test]
    fn session_id_255_chars_accepted() {
        let s = "x".repeat(255);
        assert!(validate_session_id(&s).is_ok());
    }

    #[test]
    fn session_id_256_chars_rejected() {
        let s = "x".repeat(256);
        assert!(validate_session_id(&s).is_err());
    }

    #[test]
    fn session_id_allows_connector_style_names() {
        assert!(validate_session_id("telegram@room-42.main").is_ok());
    }

    #[test]
    fn session_id_rejects_slash() {
        assert!(validate_session_id("a/b").is_err());
    }

    #[test]
    fn username_rejects_leading_digit() {
        assert!(validate_username("1alice").is_err());
    }

    #[test]
    fn username_rejects_uppercase() {
        assert!(validate_username("Alice").is_err());
    }

    #[test]
    fn username_accepts_underscore_prefix() {
        assert!(validate_username("_deploy-bot").is_ok());
    }

    #[test]
    fn username_max_32_chars() {
        assert!(validate_username(&"a".repeat(32)).is_ok());
        assert!(validate_username(&"a".repeat(33)).is_err());
    }

    #[test]
    fn task_type_round_trip() {
        for t in ["exec", "skill", "search", "msg", "replan"] {
            let parsed: TaskType = t.parse().unwrap();
            assert_eq!(parsed.to_string(), t);
        }
    }

    #[test]
    fn expect_required_only_for_work_tasks() {
        assert!(TaskType::Exec.requires_expect());
        assert!(TaskType::Skill.requires_expect());
        assert!(TaskType::Search.requires_expect());
        assert!(!TaskType::Msg.requires_expect());
        assert!(!TaskType::Replan.requires_expect());
    }
}
