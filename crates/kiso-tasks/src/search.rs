//! Search handler — searcher role plus the same review/retry loop as exec.

use tracing::{info, warn};

use kiso_brain::reviewer::{self, ReviewInput};
use kiso_brain::searcher;
use kiso_brain::types::{ReviewStatus, SearchParams, Usage};
use kiso_core::types::substatus;
use kiso_store::TaskRow;

use crate::context::{TaskContext, TaskResult};
use crate::exec::{join_learnings, persist_learnings};

pub async fn run_search(ctx: &TaskContext, task: &TaskRow) -> TaskResult {
    let config = ctx.config.load();
    let settings = config.settings.clone();
    let mut usage = Usage::default();
    let mut retries = 0u32;
    let mut query = task.detail.clone();

    // Malformed args degrade to defaults rather than failing the task.
    let params: SearchParams = match task.args.as_deref() {
        None | Some("") => SearchParams::default(),
        Some(raw) => serde_json::from_str(raw).unwrap_or_else(|e| {
            warn!(session = %ctx.session, error = %e, "malformed search args; using defaults");
            SearchParams::default()
        }),
    };

    loop {
        let _ = ctx
            .store
            .update_task_substatus(task.id, substatus::SEARCHING);
        let search = searcher::search(
            &ctx.gateway,
            &config.kiso_dir(),
            &ctx.budget,
            &ctx.session,
            &query,
            &params,
        )
        .await;

        let result = match search {
            Ok(r) => {
                usage.merge(r.usage);
                r.value
            }
            Err(e) => {
                return TaskResult {
                    usage,
                    ..TaskResult::failure(format!("search failed: {e}"))
                };
            }
        };

        let mut output = result.summary.clone();
        if !result.results.is_empty() {
            output.push_str("\n\nResults:\n");
            for r in &result.results {
                output.push_str(&format!("- {} — {}\n  {}\n", r.title, r.url, r.snippet));
            }
        }
        if !result.sources.is_empty() {
            output.push_str("\nSources:\n");
            for s in &result.sources {
                output.push_str(&format!("- {s}\n"));
            }
        }
        let output = ctx.sanitize(&output);

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
                exit_code: None,
                success_flag: true,
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
                    stderr: None,
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
                return TaskResult {
                    success: true,
                    output,
                    stderr: None,
                    replan_reason: None,
                    retry_hint: None,
                    usage,
                };
            }
            ReviewStatus::Replan => {
                // A refined query is a legitimate worker retry for search.
                if let Some(hint) = review
                    .retry_hint
                    .as_deref()
                    .filter(|_| retries < settings.max_worker_retries)
                {
                    retries += 1;
                    query = format!("{} ({hint})", task.detail);
                    info!(session = %ctx.session, retries, "worker-level search retry");
                    continue;
                }
                return TaskResult {
                    success: false,
                    output,
                    stderr: None,
                    replan_reason: review.reason,
                    retry_hint: review.retry_hint,
                    usage,
                };
            }
        }
    }
}
