//! Msg handler — composes the user-facing reply. Never reviewed; delivery
//! to a registered webhook happens in the worker once the output is
//! persisted.

use kiso_brain::messenger::{self, MessengerInput};
use kiso_brain::types::Usage;
use kiso_core::types::substatus;
use kiso_store::TaskRow;

use crate::context::{TaskContext, TaskResult};

pub async fn run_msg(ctx: &TaskContext, task: &TaskRow) -> TaskResult {
    let config = ctx.config.load();
    let mut usage = Usage::default();

    let _ = ctx
        .store
        .update_task_substatus(task.id, substatus::COMPOSING);

    let facts = ctx
        .store
        .search_facts(&ctx.goal, &ctx.session, ctx.is_admin, 15)
        .unwrap_or_default();
    let summary = ctx
        .store
        .get_session(&ctx.session)
        .ok()
        .flatten()
        .map(|s| s.summary)
        .unwrap_or_default();
    let preceding = ctx.preceding_output_texts();

    let composed = messenger::compose(
        &ctx.gateway,
        &config.kiso_dir(),
        &ctx.budget,
        &MessengerInput {
            session: &ctx.session,
            goal: &ctx.goal,
            detail: &task.detail,
            facts: &facts,
            summary: &summary,
            preceding_outputs: &preceding,
        },
    )
    .await;

    match composed {
        Ok(reply) => {
            usage.merge(reply.usage);
            TaskResult {
                success: true,
                output: ctx.sanitize(&reply.value),
                stderr: None,
                replan_reason: None,
                retry_hint: None,
                usage,
            }
        }
        Err(e) => TaskResult {
            usage,
            ..TaskResult::failure(format!("message composition failed: {e}"))
        },
    }
}
