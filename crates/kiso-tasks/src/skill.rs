//! Skill handler — runs a skill's `run.py` inside its own virtualenv, fed a
//! JSON document on stdin. Skills are subprocesses by contract; no user code
//! ever runs inside the core process.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use kiso_brain::reviewer::{self, ReviewInput};
use kiso_brain::types::{ReviewStatus, Usage};
use kiso_core::skills::{validate_args, SkillManifest};
use kiso_core::types::substatus;
use kiso_store::TaskRow;

use crate::context::{TaskContext, TaskResult};
use crate::error::TaskError;
use crate::exec::{join_learnings, persist_learnings};
use crate::output::{capture_text, truncate_output};

pub async fn run_skill(ctx: &TaskContext, task: &TaskRow) -> TaskResult {
    let config = ctx.config.load();
    let settings = config.settings.clone();
    let mut usage = Usage::default();

    // 1. Resolve the skill and re-validate args against the live manifest —
    // the manifest may have changed since the plan was made.
    let name = match task.skill.as_deref() {
        Some(n) => n,
        None => return TaskResult::failure("skill task has no skill name"),
    };
    let manifest = match ctx.allowed_skills.iter().find(|s| s.name == name) {
        Some(m) => m.clone(),
        None => {
            return TaskResult::failure(format!(
                "skill '{name}' is not available to this user"
            ))
        }
    };
    let args_json = task.args.as_deref().unwrap_or("{}");
    let args = match validate_args(&manifest, args_json) {
        Ok(v) => v,
        Err(e) => return TaskResult::failure(format!("skill args rejected: {e}")),
    };

    if let Err(e) = ctx.write_plan_outputs() {
        return TaskResult::failure(format!("workspace staging failed: {e}"));
    }

    // 2. Run the subprocess.
    let _ = ctx
        .store
        .update_task_substatus(task.id, substatus::EXECUTING);
    let run = run_skill_process(ctx, &manifest, &args, settings.skill_timeout_secs,
        settings.max_output_bytes)
        .await;
    let (exit_code, stdout, stderr) = match run {
        Ok(r) => r,
        Err(TaskError::Timeout { secs }) => (
            -1,
            String::new(),
            format!("skill timed out after {secs}s and was killed"),
        ),
        Err(e) => return TaskResult::failure(format!("skill spawn failed: {e}")),
    };

    let output = ctx.sanitize(&stdout);
    let stderr = ctx.sanitize(&stderr);

    // 3. Review. Skills are never retried at the worker level — their side
    // effects are unknown, so a second blind run could double them.
    let _ = ctx
        .store
        .update_task_substatus(task.id, substatus::REVIEWING);
    let review = reviewer::review(
        &ctx.gateway,
        &config.kiso_dir(),
        &ctx.budget,
        settings.max_validation_retries,
        &ReviewInput {
            session: &ctx.session,
            goal: &ctx.goal,
            detail: &task.detail,
            expect: task.expect.as_deref().unwrap_or(""),
            output: &output,
            user_message: &ctx.user_message,
            exit_code: Some(exit_code),
            success_flag: exit_code == 0,
        },
    )
    .await;

    let review = match review {
        Ok(r) => {
            usage.merge(r.usage);
            r.value
        }
        Err(e) => {
            return TaskResult {
                success: false,
                output,
                stderr: Some(stderr),
                replan_reason: Some(format!("review failed: {e}")),
                retry_hint: None,
                usage,
            };
        }
    };

    let verdict = match review.status {
        ReviewStatus::Ok => "ok",
        ReviewStatus::Replan => "replan",
    };
    let learning = join_learnings(&review.learn);
    let _ = ctx.store.update_task_review(
        task.id,
        verdict,
        review.reason.as_deref(),
        learning.as_deref(),
    );
    persist_learnings(ctx, &review.learn);

    match review.status {
        ReviewStatus::Ok => TaskResult {
            success: true,
            output,
            stderr: Some(stderr),
            replan_reason: None,
            retry_hint: None,
            usage,
        },
        ReviewStatus::Replan => TaskResult {
            success: false,
            output,
            stderr: Some(stderr),
            replan_reason: review.reason,
            // Worker-level retry is never offered for skills.
            retry_hint: None,
            usage,
        },
    }
}

/// The JSON document a skill reads from stdin.
fn stdin_document(
    ctx: &TaskContext,
    manifest: &SkillManifest,
    args: &serde_json::Value,
) -> serde_json::Value {
    // Only the ephemeral secrets the manifest declares — a skill never sees
    // the whole session secret map.
    let declared: HashMap<&String, &String> = ctx
        .secrets
        .iter()
        .filter(|(k, _)| manifest.session_secrets.contains(k))
        .collect();

    serde_json::json!({
        "args": args,
        "session": ctx.session,
        "workspace": ctx.workspace.display().to_string(),
        "session_secrets": declared,
        "plan_outputs": ctx.plan_outputs,
    })
}

async fn run_skill_process(
    ctx: &TaskContext,
    manifest: &SkillManifest,
    args: &serde_json::Value,
    timeout_secs: u64,
    max_output_bytes: usize,
) -> crate::error::Result<(i32, String, String)> {
    let config = ctx.config.load();
    let python = manifest.dir.join(".venv/bin/python");
    let entry = manifest.dir.join("run.py");
    if !python.is_file() || !entry.is_file() {
        return Err(TaskError::Subprocess(format!(
            "skill '{}' is missing its virtualenv or run.py",
            manifest.name
        )));
    }

    let mut cmd = Command::new(&python);
    cmd.arg(&entry)
        .current_dir(&ctx.workspace)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env_clear();

    let base_path = std::env::var("PATH")
        .unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".to_string());
    cmd.env("PATH", base_path);
    cmd.env("HOME", &ctx.workspace);
    // Declared deploy-secret env vars only.
    for var in &manifest.env {
        match ctx.deploy_secrets.get(var) {
            Some(value) => {
                cmd.env(var, value);
            }
            None => warn!(skill = %manifest.name, var, "declared env var not set"),
        }
    }

    #[cfg(unix)]
    if let Some(uid) = config.sandbox.uid {
        if !ctx.is_admin {
            cmd.uid(uid);
        }
    }

    debug!(skill = %manifest.name, session = %ctx.session, "skill spawn");
    let mut child = cmd
        .spawn()
        .map_err(|e| TaskError::Subprocess(format!("spawn failed: {e}")))?;

    let doc = stdin_document(ctx, manifest, args);
    if let Some(mut stdin) = child.stdin.take() {
        let payload = serde_json::to_vec(&doc)?;
        let _ = stdin.write_all(&payload).await;
        // Dropping stdin closes the pipe so the skill sees EOF.
    }

    let pid = child.id();
    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let _ = tx.send(child.wait_with_output().await);
    });

    match tokio::time::timeout(Duration::from_secs(timeout_secs), rx).await {
        Ok(Ok(Ok(output))) => {
            let exit_code = output.status.code().unwrap_or(-1);
            let stdout = truncate_output(&capture_text(&output.stdout), max_output_bytes);
            let stderr = truncate_output(&capture_text(&output.stderr), max_output_bytes);
            Ok((exit_code, stdout, stderr))
        }
        Ok(Ok(Err(e))) => Err(TaskError::Subprocess(format!("wait failed: {e}"))),
        Ok(Err(_)) => Err(TaskError::Subprocess("wait task dropped".to_string())),
        Err(_elapsed) => {
            if let Some(raw_pid) = pid {
                #[cfg(unix)]
                // Safety: raw_pid is our direct child, still running.
                unsafe {
                    libc::kill(raw_pid as libc::pid_t, libc::SIGKILL);
                }
            }
            Err(TaskError::Timeout { secs: timeout_secs })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiso_core::skills::{ArgSpec, ArgType};

    #[test]
    fn stdin_document_filters_secrets_to_declared_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = crate::context::tests::test_context(dir.path().to_path_buf());
        ctx.secrets
            .insert("DECLARED_TOKEN".to_string(), "v1".to_string());
        ctx.secrets
            .insert("UNDECLARED_TOKEN".to_string(), "v2".to_string());

        let manifest = SkillManifest {
            manifest_type: "skill".to_string(),
            name: "notes".to_string(),
            summary: "notes".to_string(),
            args: vec![ArgSpec {
                name: "text".to_string(),
                arg_type: ArgType::String,
                required: true,
                default: None,
                description: String::new(),
            }],
            session_secrets: vec!["DECLARED_TOKEN".to_string()],
            env: vec![],
            dir: dir.path().to_path_buf(),
        };

        let doc = stdin_document(&ctx, &manifest, &serde_json::json!({"text": "hi"}));
        let secrets = doc["session_secrets"].as_object().unwrap();
        assert!(secrets.contains_key("DECLARED_TOKEN"));
        assert!(!secrets.contains_key("UNDECLARED_TOKEN"));
        assert_eq!(doc["session"], "s1");
    }
}
