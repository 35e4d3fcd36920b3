//! Exec handler — translate, gate, run, publish, review, maybe retry.

use std::collections::HashSet;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use kiso_brain::reviewer::{self, ReviewInput};
use kiso_brain::translator::{self, TranslatorInput, CANNOT_TRANSLATE};
use kiso_brain::types::{ReviewStatus, Usage};
use kiso_core::types::substatus;
use kiso_store::TaskRow;

use crate::context::{TaskContext, TaskResult};
use crate::error::{Result, TaskError};
use crate::output::{capture_text, truncate_output};
use crate::pubfiles;

/// Fixed failure reason when the translator declines a task.
const UNTRANSLATABLE_REASON: &str =
    "the task could not be translated into a shell command";

pub async fn run_exec(ctx: &TaskContext, task: &TaskRow) -> TaskResult {
    let config = ctx.config.load();
    let settings = config.settings.clone();
    let mut usage = Usage::default();
    let mut retry_context: Option<String> = None;
    let mut retries = 0u32;

    loop {
        // 1. Translate the task description into a command line.
        let _ = ctx
            .store
            .update_task_substatus(task.id, substatus::TRANSLATING);
        let env = ctx.environment();
        let preceding = ctx.preceding_output_texts();
        let translated = translator::translate(
            &ctx.gateway,
            &config.kiso_dir(),
            &ctx.budget,
            &TranslatorInput {
                session: &ctx.session,
                detail: &task.detail,
                environment: &env,
                retry_hint: retry_context.as_deref(),
                preceding_outputs: &preceding,
            },
        )
        .await;

        let command = match translated {
            Ok(reply) => {
                usage.merge(reply.usage);
                reply.value
            }
            Err(e) => {
                return TaskResult {
                    usage,
                    ..TaskResult::failure(format!("exec translation failed: {e}"))
                };
            }
        };

        if command == CANNOT_TRANSLATE {
            return TaskResult {
                usage,
                ..TaskResult::failure(UNTRANSLATABLE_REASON)
            };
        }

        // 2. Deny list — a hit fails immediately, no retry.
        if let Err(reason) = kiso_guard::check_command(&command) {
            warn!(session = %ctx.session, command = %command, "command blocked");
            return TaskResult {
                usage,
                ..TaskResult::failure(format!("command blocked: {reason}"))
            };
        }

        // 3. Stage the workspace: chaining file and pub dir.
        if let Err(e) = ctx.write_plan_outputs() {
            return TaskResult {
                usage,
                ..TaskResult::failure(format!("workspace staging failed: {e}"))
            };
        }
        let pub_before = prepare_pub_dir(ctx);

        // 4. Run.
        let _ = ctx
            .store
            .update_task_substatus(task.id, substatus::EXECUTING);
        debug!(session = %ctx.session, command = %command, "exec");
        let run = run_shell(ctx, &command, settings.exec_timeout_secs, settings.max_output_bytes)
            .await;
        let (exit_code, stdout, stderr) = match run {
            Ok(r) => r,
            Err(TaskError::Timeout { secs }) => (
                -1,
                String::new(),
                format!("command timed out after {secs}s and was killed"),
            ),
            Err(e) => {
                return TaskResult {
                    usage,
                    ..TaskResult::failure(format!("spawn failed: {e}"))
                };
            }
        };

        // 5. Publish: new pub/ files become download URLs on the output.
        let mut output = stdout;
        let fresh = pubfiles::new_pub_files(&ctx.workspace, &pub_before);
        if !fresh.is_empty() {
            output.push_str("\n\nDownloads:\n");
            for name in &fresh {
                output.push_str(&format!(
                    "- {}\n",
                    pubfiles::pub_url(&ctx.public_base_url, &ctx.pub_secret, &ctx.session, name)
                ));
            }
            info!(count = fresh.len(), session = %ctx.session, "pub files published");
        }

        let output = ctx.sanitize(&output);
        let stderr = ctx.sanitize(&stderr);

        // 6. Review with the exit code in context.
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
            ReviewStatus::Ok => {
                if exit_code != 0 {
                    // Known reviewer weakness: rubber-stamping a failed exit.
                    warn!(
                        session = %ctx.session,
                        exit_code,
                        "reviewer approved a non-zero exit; honoring the verdict"
                    );
                }
                return TaskResult {
                    success: true,
                    output,
                    stderr: Some(stderr),
                    replan_reason: None,
                    retry_hint: None,
                    usage,
                };
            }
            ReviewStatus::Replan => {
                if let Some(hint) = review
                    .retry_hint
                    .as_deref()
                    .filter(|_| retries < settings.max_worker_retries)
                {
                    // Local retry: re-translate with the failure context.
                    retries += 1;
                    let stderr_snippet = truncate_output(&stderr, 1000);
                    retry_context = Some(format!(
                        "previous command: {command}\nexit code: {exit_code}\n\
                         stderr: {stderr_snippet}\nhint: {hint}"
                    ));
                    info!(session = %ctx.session, retries, "worker-level exec retry");
                    continue;
                }
                return TaskResult {
                    success: false,
                    output,
                    stderr: Some(stderr),
                    replan_reason: review.reason,
                    retry_hint: review.retry_hint,
                    usage,
                };
            }
        }
    }
}

/// Ensure `pub/` exists (owned by the sandbox uid when configured) and
/// return its pre-run contents.
fn prepare_pub_dir(ctx: &TaskContext) -> HashSet<String> {
    let pub_dir = ctx.workspace.join("pub");
    let _ = std::fs::create_dir_all(&pub_dir);
    #[cfg(unix)]
    if let Some(uid) = ctx.config.load().sandbox.uid {
        if !ctx.is_admin {
            let _ = std::os::unix::fs::chown(&pub_dir, Some(uid), None);
        }
    }
    pubfiles::snapshot_pub_dir(&ctx.workspace)
}

/// Spawn `sh -c command` in the workspace with a restricted environment,
/// the sandbox uid for non-admins, a hard timeout, and capped capture.
pub(crate) async fn run_shell(
    ctx: &TaskContext,
    command: &str,
    timeout_secs: u64,
    max_output_bytes: usize,
) -> Result<(i32, String, String)> {
    let config = ctx.config.load();
    let sys_dir = config.sys_dir();

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(&ctx.workspace)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env_clear();

    // Restricted environment: PATH (with the user-writable sys/bin ahead of
    // the system dirs), HOME pinned to the workspace, git plumbing only when
    // the operator has staged the files.
    let base_path = std::env::var("PATH")
        .unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".to_string());
    cmd.env("PATH", format!("{}:{base_path}", sys_dir.join("bin").display()));
    cmd.env("HOME", &ctx.workspace);
    let git_config = sys_dir.join("gitconfig");
    if git_config.is_file() {
        cmd.env("GIT_CONFIG_GLOBAL", &git_config);
    }
    let ssh_config = sys_dir.join("ssh/config");
    let ssh_key = sys_dir.join("ssh/id_ed25519");
    if ssh_config.is_file() && ssh_key.is_file() {
        cmd.env(
            "GIT_SSH_COMMAND",
            format!("ssh -F {} -i {}", ssh_config.display(), ssh_key.display()),
        );
    }

    #[cfg(unix)]
    if let Some(uid) = config.sandbox.uid {
        if !ctx.is_admin {
            cmd.uid(uid);
        }
    }

    let child = cmd
        .spawn()
        .map_err(|e| TaskError::Subprocess(format!("spawn failed: {e}")))?;
    let pid = child.id();

    // wait_with_output takes the child by value; drive it on a task so the
    // timeout can race it, keeping the PID for the kill path.
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

pub(crate) fn join_learnings(learn: &[String]) -> Option<String> {
    if learn.is_empty() {
        None
    } else {
        Some(learn.join("\n"))
    }
}

/// Queue reviewer learnings for the curator.
pub(crate) fn persist_learnings(ctx: &TaskContext, learn: &[String]) {
    for entry in learn {
        if let Err(e) = ctx.store.save_learning(entry, &ctx.session, ctx.user.as_deref()) {
            warn!(error = %e, "failed to save learning");
        }
    }
}
