//! Shared handler plumbing — `TaskContext` in, `TaskResult` out.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use kiso_brain::types::{SystemEnvironment, Usage};
use kiso_core::config::ConfigHandle;
use kiso_core::skills::SkillManifest;
use kiso_core::DeploySecrets;
use kiso_llm::{CallBudget, LlmGateway};
use kiso_store::Store;

/// Binaries probed for the planner/translator environment section.
const PROBE_BINARIES: &[&str] = &[
    "sh", "bash", "ls", "cat", "grep", "sed", "awk", "find", "curl", "wget", "tar", "zip",
    "unzip", "git", "python3", "pip3", "node", "npm", "cargo", "make", "jq", "sqlite3",
];

/// One completed task's contribution to the plan-output chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanOutputRecord {
    pub task_id: i64,
    pub task_type: String,
    pub detail: String,
    pub output: String,
}

/// What a handler hands back to the worker.
#[derive(Debug)]
pub struct TaskResult {
    pub success: bool,
    pub output: String,
    pub stderr: Option<String>,
    pub replan_reason: Option<String>,
    pub retry_hint: Option<String>,
    pub usage: Usage,
}

impl TaskResult {
    pub fn failure(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            success: false,
            output: reason.clone(),
            stderr: None,
            replan_reason: Some(reason),
            retry_hint: None,
            usage: Usage::default(),
        }
    }
}

/// Everything a handler needs for one task.
pub struct TaskContext {
    pub store: Arc<Store>,
    pub config: Arc<ConfigHandle>,
    pub gateway: Arc<LlmGateway>,
    pub deploy_secrets: Arc<DeploySecrets>,
    pub session: String,
    /// Resolved username of the message author, when whitelisted.
    pub user: Option<String>,
    pub plan_id: i64,
    pub goal: String,
    /// The original user message this plan answers.
    pub user_message: String,
    pub workspace: PathBuf,
    /// Outputs of tasks already completed in this plan, in order.
    pub plan_outputs: Vec<PlanOutputRecord>,
    /// Ephemeral secrets extracted from the user's message. In-memory only.
    pub secrets: HashMap<String, String>,
    pub cancel: CancellationToken,
    pub allowed_skills: Vec<SkillManifest>,
    pub budget: Arc<CallBudget>,
    pub is_admin: bool,
    /// HMAC secret for pub-file download tokens.
    pub pub_secret: Arc<String>,
    /// Externally reachable base URL, for rendering pub links.
    pub public_base_url: String,
}

impl TaskContext {
    /// Every secret value that must never appear in persisted text: the
    /// ephemeral session secrets plus the deploy secrets.
    pub fn secret_values(&self) -> Vec<String> {
        let mut values: Vec<String> = self.secrets.values().cloned().collect();
        values.extend(self.deploy_secrets.values());
        values
    }

    /// Strip all known secrets from `text`.
    pub fn sanitize(&self, text: &str) -> String {
        kiso_guard::sanitize(text, &self.secret_values())
    }

    /// Snapshot of the host environment for planner/translator prompts.
    pub fn environment(&self) -> SystemEnvironment {
        system_environment(&self.config.load(), &self.workspace)
    }

    /// Write the accumulated plan outputs where exec commands can read them.
    pub fn write_plan_outputs(&self) -> std::io::Result<()> {
        let dir = self.workspace.join(".kiso");
        std::fs::create_dir_all(&dir)?;
        let json = serde_json::to_string_pretty(&self.plan_outputs).unwrap_or_default();
        std::fs::write(dir.join("plan_outputs.json"), json)
    }

    /// Remove the chaining file at the end of a message cycle.
    pub fn cleanup_plan_outputs(&self) {
        let _ = std::fs::remove_file(self.workspace.join(".kiso/plan_outputs.json"));
    }

    /// Sanitized preceding outputs, for prompt injection.
    pub fn preceding_output_texts(&self) -> Vec<String> {
        self.plan_outputs
            .iter()
            .map(|r| self.sanitize(&r.output))
            .collect()
    }
}

/// Build the environment section shared by planner and translator prompts.
pub fn system_environment(
    config: &kiso_core::KisoConfig,
    workspace: &std::path::Path,
) -> SystemEnvironment {
    let settings = &config.settings;
    SystemEnvironment {
        os: std::env::consts::OS.to_string(),
        binaries: probe_binaries(),
        exec_cwd: workspace.display().to_string(),
        workspace_files: list_workspace(workspace),
        registry_url: config.registry_url.clone(),
        blocked_hints: vec![
            "delete the filesystem root or the home directory".to_string(),
            "pipe downloaded content into a shell".to_string(),
            "write to Kiso's own config or secrets files".to_string(),
        ],
        max_plan_tasks: settings.max_plan_tasks,
        max_replan_depth: settings.max_replan_depth,
    }
}

fn probe_binaries() -> Vec<String> {
    let path_var = std::env::var("PATH").unwrap_or_default();
    let dirs: Vec<&str> = path_var.split(':').collect();
    PROBE_BINARIES
        .iter()
        .filter(|bin| {
            dirs.iter()
                .any(|dir| std::path::Path::new(dir).join(bin).is_file())
        })
        .map(|s| s.to_string())
        .collect()
}

/// Top-level workspace entries, dotfiles skipped, sorted for stable prompts.
fn list_workspace(workspace: &std::path::Path) -> Vec<String> {
    let mut entries: Vec<String> = std::fs::read_dir(workspace)
        .map(|rd| {
            rd.flatten()
                .filter_map(|e| {
                    let name = e.file_name().to_string_lossy().to_string();
                    if name.starts_with('.') {
                        None
                    } else {
                        Some(name)
                    }
                })
                .collect()
        })
        .unwrap_or_default();
    entries.sort();
    entries
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use kiso_core::audit::AuditLog;
    use kiso_core::config::KisoConfig;

    pub(crate) fn test_context(workspace: PathBuf) -> TaskContext {
        let config = Arc::new(ConfigHandle::new(KisoConfig::default()));
        let secrets = Arc::new(DeploySecrets::empty());
        let audit = Arc::new(AuditLog::new(std::env::temp_dir().join("kiso-task-test-audit")));
        TaskContext {
            store: Arc::new(Store::open_in_memory().unwrap()),
            gateway: Arc::new(LlmGateway::new(config.clone(), secrets.clone(), audit)),
            config,
            deploy_secrets: secrets,
            session: "s1".to_string(),
            user: None,
            plan_id: 1,
            goal: "test".to_string(),
            user_message: "test".to_string(),
            workspace,
            plan_outputs: vec![],
            secrets: HashMap::new(),
            cancel: CancellationToken::new(),
            allowed_skills: vec![],
            budget: Arc::new(CallBudget::new(10)),
            is_admin: false,
            pub_secret: Arc::new("test-secret".to_string()),
            public_base_url: "http://127.0.0.1:18600".to_string(),
        }
    }

    #[test]
    fn plan_outputs_round_trip_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_context(dir.path().to_path_buf());
        ctx.plan_outputs.push(PlanOutputRecord {
            task_id: 1,
            task_type: "exec".to_string(),
            detail: "list".to_string(),
            output: "a b c".to_string(),
        });
        ctx.write_plan_outputs().unwrap();
        let path = dir.path().join(".kiso/plan_outputs.json");
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("a b c"));
        ctx.cleanup_plan_outputs();
        assert!(!path.exists());
    }

    #[test]
    fn sanitize_uses_ephemeral_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_context(dir.path().to_path_buf());
        ctx.secrets.insert("API_KEY".to_string(), "sk-hidden-value".to_string());
        let out = ctx.sanitize("using sk-hidden-value here");
        assert!(!out.contains("sk-hidden-value"));
    }

    #[test]
    fn workspace_listing_skips_dotfiles() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("visible.txt"), "x").unwrap();
        std::fs::create_dir(dir.path().join(".kiso")).unwrap();
        let listed = list_workspace(dir.path());
        assert_eq!(listed, vec!["visible.txt"]);
    }
}
