//! Per-session worker — drains the message queue, runs the classifier or
//! planner, executes tasks sequentially, reviews, retries, replans,
//! delivers, and maintains knowledge. One worker per session, cooperative:
//! exactly one task advances at a time.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use kiso_brain::classifier::{self, Route};
use kiso_brain::planner::{self, PlannerInput};
use kiso_brain::types::{PlanOutput, ReplanAttempt, Usage};
use kiso_brain::{paraphraser, BrainError};
use kiso_core::config::{ConfigHandle, KisoConfig};
use kiso_core::skills::{discover_skills, SkillManifest};
use kiso_core::types::{PlanStatus, TaskStatus, TaskType};
use kiso_core::DeploySecrets;
use kiso_knowledge::KnowledgeKeeper;
use kiso_llm::{CallBudget, LlmError, LlmGateway};
use kiso_store::{MessageRow, NewTask, Store, TaskRow};
use kiso_tasks::context::{system_environment, PlanOutputRecord, TaskContext};
use kiso_tasks::{exec, msg, search, skill};

use crate::supervisor::WorkerRegistry;
use crate::webhook::WebhookDeliverer;

/// Shared handles every worker needs. One instance per process.
pub struct WorkerDeps {
    pub store: Arc<Store>,
    pub config: Arc<ConfigHandle>,
    pub gateway: Arc<LlmGateway>,
    pub deploy_secrets: Arc<DeploySecrets>,
    pub keeper: Arc<KnowledgeKeeper>,
    pub deliverer: Arc<WebhookDeliverer>,
    pub pub_secret: Arc<String>,
    pub public_base_url: String,
}

/// How one plan execution ended.
enum PlanOutcome {
    Completed,
    Cancelled,
    /// A task failed review (or failed outright); carries replan context.
    Failed { failure: String, tried: Vec<String> },
    /// The plan ended with an explicit replan task.
    ReplanTask { tried: Vec<String> },
    BudgetExhausted,
}

/// Main worker loop: drain the queue, idle out, honor shutdown.
pub async fn run_worker(
    deps: Arc<WorkerDeps>,
    registry: WorkerRegistry,
    session: String,
    mut rx: mpsc::Receiver<i64>,
    cancel_slot: Arc<Mutex<CancellationToken>>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(session, "worker started");
    // Session-scoped ephemeral secrets: filled from planner output, handed
    // to declared skill recipients, gone when the worker exits.
    let mut session_secrets: HashMap<String, String> = HashMap::new();

    loop {
        let idle = Duration::from_secs(
            deps.config.load().settings.worker_idle_timeout_secs,
        );
        tokio::select! {
            maybe_id = rx.recv() => match maybe_id {
                Some(message_id) => {
                    process_message(&deps, &session, &cancel_slot, message_id, &mut session_secrets)
                        .await;
                }
                None => break,
            },
            _ = tokio::time::sleep(idle) => {
                // Deregister under the registry lock so the supervisor
                // cannot enqueue into a worker that has decided to exit.
                let mut workers = registry.lock().unwrap();
                match rx.try_recv() {
                    Ok(message_id) => {
                        drop(workers);
                        process_message(&deps, &session, &cancel_slot, message_id, &mut session_secrets)
                            .await;
                    }
                    Err(_) => {
                        workers.remove(&session);
                        break;
                    }
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(session, "worker stopping on shutdown signal");
                    break;
                }
            }
        }
    }
    info!(session, "worker exited; ephemeral secrets discarded");
}

/// Full message cycle: mark processed, stage workspace,
/// re-validate permissions, classify, plan, execute with replan escalation,
/// maintain knowledge, clean up.
async fn process_message(
    deps: &Arc<WorkerDeps>,
    session: &str,
    cancel_slot: &Arc<Mutex<CancellationToken>>,
    message_id: i64,
    session_secrets: &mut HashMap<String, String>,
) {
    let config = deps.config.load();
    let message = match deps.store.get_message(message_id) {
        Ok(m) => m,
        Err(e) => {
            error!(session, message_id, error = %e, "message vanished before processing");
            return;
        }
    };
    if let Err(e) = deps.store.mark_message_processed(message_id) {
        error!(session, message_id, error = %e, "failed to mark message processed");
        return;
    }

    let workspace = match ensure_workspace(&config, session) {
        Ok(ws) => ws,
        Err(e) => {
            error!(session, error = %e, "workspace setup failed");
            deliver_synthetic_msg(
                deps,
                session,
                message_id,
                "workspace setup failed",
                "I could not prepare the session workspace; please contact the operator.",
            )
            .await;
            return;
        }
    };

    // Live permission re-check: the config may have changed since enqueue.
    if let Some(user) = &message.user {
        if !config.users.contains_key(user) {
            warn!(session, user, "user removed from whitelist since enqueue");
            deliver_synthetic_msg(
                deps,
                session,
                message_id,
                "access revoked",
                "Your access to this Kiso instance was revoked while the message \
                 was queued, so it was not processed.",
            )
            .await;
            return;
        }
    }
    let is_admin = message
        .user
        .as_deref()
        .map(|u| config.is_admin(u))
        .unwrap_or(false);

    // Fresh cancel token per message; /cancel trips the one in the slot.
    let cancel = CancellationToken::new();
    *cancel_slot.lock().unwrap() = cancel.clone();

    let budget = Arc::new(CallBudget::new(config.settings.max_llm_calls_per_message));
    let mut shown_fact_ids: HashSet<i64> = HashSet::new();

    // Classifier fast path: plain chat skips the planner entirely.
    let mut handled = false;
    if config.settings.fast_path_enabled {
        let route = classifier::classify(
            &deps.gateway,
            &config.kiso_dir(),
            &budget,
            session,
            &message.content,
        )
        .await;
        if route.value == Route::Chat {
            fast_path_chat(
                deps,
                session,
                &message,
                &workspace,
                &budget,
                &cancel,
                is_admin,
                session_secrets.clone(),
            )
            .await;
            handled = true;
        }
    }

    if !handled {
        run_planned_message(
            deps,
            &config,
            session,
            &message,
            &workspace,
            &budget,
            &cancel,
            is_admin,
            session_secrets,
            &mut shown_fact_ids,
        )
        .await;
    }

    // Knowledge maintenance: curator → summarizer → consolidation → usage.
    let plan_succeeded = deps
        .store
        .last_plan_for_session(session)
        .ok()
        .flatten()
        .map(|p| p.status == PlanStatus::Done)
        .unwrap_or(false);
    let ids: Vec<i64> = shown_fact_ids.into_iter().collect();
    deps.keeper
        .maintain(session, &budget, &ids, plan_succeeded)
        .await;

    // Transient chaining file is gone once the message is done.
    let _ = std::fs::remove_file(workspace.join(".kiso/plan_outputs.json"));
}

/// Create `<kiso-dir>/sessions/<session>/` with its `.kiso/` and `pub/`
/// subdirectories, private perms, and sandbox ownership when configured.
fn ensure_workspace(config: &KisoConfig, session: &str) -> std::io::Result<PathBuf> {
    let workspace = config.workspace_dir(session);
    std::fs::create_dir_all(workspace.join(".kiso"))?;
    std::fs::create_dir_all(workspace.join("pub"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&workspace, std::fs::Permissions::from_mode(0o700))?;
        if let Some(uid) = config.sandbox.uid {
            let _ = std::os::unix::fs::chown(&workspace, Some(uid), None);
            let _ = std::os::unix::fs::chown(workspace.join("pub"), Some(uid), None);
            let _ = std::os::unix::fs::chown(workspace.join(".kiso"), Some(uid), None);
        }
    }
    Ok(workspace)
}

/// Fast path: one synthetic plan with a single msg task, no planner call.
/// A plan row is still persisted so `/status` clients see a uniform shape.
#[allow(clippy::too_many_arguments)]
async fn fast_path_chat(
    deps: &Arc<WorkerDeps>,
    session: &str,
    message: &MessageRow,
    workspace: &PathBuf,
    budget: &Arc<CallBudget>,
    cancel: &CancellationToken,
    is_admin: bool,
    secrets: HashMap<String, String>,
) {
    let goal = snippet(&message.content, 120);
    let plan_id = match deps.store.create_plan(session, message.id, None, &goal) {
        Ok(id) => id,
        Err(e) => {
            error!(session, error = %e, "fast path: plan row failed");
            return;
        }
    };
    let new_task = NewTask {
        plan_id,
        session: session.to_string(),
        idx: 0,
        task_type: TaskType::Msg,
        detail: "Reply to the user's message conversationally.".to_string(),
        skill: None,
        args: None,
        expect: None,
    };
    let task_id = match deps.store.create_task(&new_task) {
        Ok(id) => id,
        Err(e) => {
            error!(session, error = %e, "fast path: task row failed");
            let _ = deps.store.update_plan_status(plan_id, PlanStatus::Failed);
            return;
        }
    };

    let ctx = build_context(
        deps, session, message, workspace, plan_id, &goal, budget, cancel, is_admin,
        secrets, Vec::new(),
    );
    let _ = deps.store.update_task(task_id, TaskStatus::Running, None, None);
    let Some(task_row) = stored_task(deps, task_id) else {
        return;
    };
    let result = msg::run_msg(&ctx, &task_row).await;
    record_usage(deps, plan_id, task_id, &result.usage);

    if result.success {
        let _ = deps
            .store
            .update_task(task_id, TaskStatus::Done, Some(&result.output), None);
        let _ = deps.store.update_plan_status(plan_id, PlanStatus::Done);
        deliver_webhook(deps, session, task_id, &result.output, true).await;
        info!(session, plan_id, "fast path chat complete");
    } else {
        let _ = deps
            .store
            .update_task(task_id, TaskStatus::Failed, Some(&result.output), None);
        let _ = deps.store.update_plan_status(plan_id, PlanStatus::Failed);
        deliver_synthetic_msg(
            deps,
            session,
            message.id,
            "reply failed",
            "I could not compose a reply to your message; please try again.",
        )
        .await;
    }
}

/// Full path: plan → execute → replan loop, bounded by
/// `max_replan_depth + extend_replan`.
#[allow(clippy::too_many_arguments)]
async fn run_planned_message(
    deps: &Arc<WorkerDeps>,
    config: &Arc<KisoConfig>,
    session: &str,
    message: &MessageRow,
    workspace: &PathBuf,
    budget: &Arc<CallBudget>,
    cancel: &CancellationToken,
    is_admin: bool,
    secrets: &mut HashMap<String, String>,
    shown_fact_ids: &mut HashSet<i64>,
) {
    let settings = &config.settings;
    let skills = allowed_skill_manifests(config, message.user.as_deref());

    let mut history: Vec<ReplanAttempt> = Vec::new();
    let mut parent_id: Option<i64> = None;
    let mut replan_depth: u32 = 0;
    let mut extend: u32 = 0;

    loop {
        // --- Plan -----------------------------------------------------------
        let planned = build_plan(
            deps, config, session, message, workspace, budget, &skills, &history,
            is_admin, shown_fact_ids,
        )
        .await;

        let (plan_output, plan_usage) = match planned {
            Ok(reply) => (reply.value, reply.usage),
            Err(e) if is_budget_error(&e) => {
                warn!(session, "LLM budget exhausted during planning");
                deliver_synthetic_msg(
                    deps,
                    session,
                    message.id,
                    "budget exceeded",
                    "Processing this message hit the per-message LLM call budget \
                     before a plan could be made. Try a narrower request.",
                )
                .await;
                return;
            }
            Err(e) => {
                // The message never vanishes silently: planning failure
                // produces a delivered recovery msg.
                error!(session, error = %e, "planning failed");
                deliver_synthetic_msg(
                    deps,
                    session,
                    message.id,
                    "planning failed",
                    &format!(
                        "I could not build a plan for your request ({e}). \
                         Rephrasing it or splitting it up may help."
                    ),
                )
                .await;
                return;
            }
        };

        // Ephemeral secrets live in worker memory only; the count is logged,
        // the values never are.
        if !plan_output.secrets.is_empty() {
            info!(
                session,
                count = plan_output.secrets.len(),
                "ephemeral secrets extracted from planner output"
            );
            for s in &plan_output.secrets {
                secrets.insert(s.key.clone(), s.value.clone());
            }
        }
        if let Some(e) = plan_output.extend_replan {
            extend = extend.max(e as u32).min(kiso_core::config::MAX_EXTEND_REPLAN);
        }

        // --- Persist the plan ----------------------------------------------
        let secret_values: Vec<String> = secrets.values().cloned().collect();
        let goal = kiso_guard::sanitize(&plan_output.goal, &secret_values);
        let plan_id = match deps.store.create_plan(session, message.id, parent_id, &goal) {
            Ok(id) => id,
            Err(e) => {
                error!(session, error = %e, "plan row failed");
                return;
            }
        };
        let _ = deps.store.update_plan_usage(
            plan_id,
            plan_usage.prompt_tokens,
            plan_usage.completion_tokens,
            Some(&plan_usage.calls),
        );

        let tasks = match persist_tasks(deps, session, plan_id, &plan_output, &secret_values) {
            Ok(t) => t,
            Err(e) => {
                error!(session, error = %e, "task rows failed");
                let _ = deps.store.update_plan_status(plan_id, PlanStatus::Failed);
                return;
            }
        };

        // --- Execute --------------------------------------------------------
        let mut ctx = build_context(
            deps, session, message, workspace, plan_id, &goal, budget, cancel,
            is_admin, secrets.clone(), skills.clone(),
        );
        let outcome = execute_plan(deps, &mut ctx, &tasks).await;

        // Plan token totals grew task by task; KEEP preserves the per-call
        // audit stored at planning time.
        match outcome {
            PlanOutcome::Completed => {
                let _ = deps.store.update_plan_status(plan_id, PlanStatus::Done);
                info!(session, plan_id, "plan complete");
                return;
            }
            PlanOutcome::Cancelled => {
                let _ = deps.store.cancel_pending_tasks(plan_id);
                let _ = deps.store.update_plan_status(plan_id, PlanStatus::Cancelled);
                let done = completed_count(deps, plan_id);
                deliver_synthetic_msg(
                    deps,
                    session,
                    message.id,
                    "cancelled",
                    &format!(
                        "Cancelled as requested. {done} task(s) had completed; the rest \
                         were skipped. Send a follow-up message to continue from here."
                    ),
                )
                .await;
                return;
            }
            PlanOutcome::BudgetExhausted => {
                let _ = deps.store.update_plan_status(plan_id, PlanStatus::Failed);
                deliver_synthetic_msg(
                    deps,
                    session,
                    message.id,
                    "budget exceeded",
                    "Processing this message used up the per-message LLM call budget. \
                     Partial results are visible in the session status.",
                )
                .await;
                return;
            }
            PlanOutcome::ReplanTask { tried } => {
                // An explicit replan task terminates its plan successfully.
                let _ = deps.store.update_plan_status(plan_id, PlanStatus::Done);
                history.push(ReplanAttempt {
                    goal: goal.clone(),
                    failure: "the plan requested a replan to continue with intermediate results"
                        .to_string(),
                    tried,
                });
            }
            PlanOutcome::Failed { failure, tried } => {
                let _ = deps.store.cancel_pending_tasks(plan_id);
                let _ = deps.store.update_plan_status(plan_id, PlanStatus::Failed);
                history.push(ReplanAttempt {
                    goal: goal.clone(),
                    failure,
                    tried,
                });
            }
        }

        replan_depth += 1;
        let cap = settings.max_replan_depth + extend;
        if replan_depth >= cap {
            warn!(session, replan_depth, cap, "replan cap reached");
            let last_failure = history
                .last()
                .map(|a| a.failure.clone())
                .unwrap_or_else(|| "unknown failure".to_string());
            deliver_synthetic_msg(
                deps,
                session,
                message.id,
                "replan limit reached",
                &format!(
                    "I could not complete the request after {replan_depth} attempts. \
                     Last failure: {last_failure}"
                ),
            )
            .await;
            return;
        }
        parent_id = Some(plan_id);
    }
}

/// Gather planner context from the store and run the planner.
#[allow(clippy::too_many_arguments)]
async fn build_plan(
    deps: &Arc<WorkerDeps>,
    config: &Arc<KisoConfig>,
    session: &str,
    message: &MessageRow,
    workspace: &PathBuf,
    budget: &Arc<CallBudget>,
    skills: &[SkillManifest],
    history: &[ReplanAttempt],
    is_admin: bool,
    shown_fact_ids: &mut HashSet<i64>,
) -> Result<kiso_brain::RoleReply<PlanOutput>, BrainError> {
    let settings = &config.settings;
    let summary = deps
        .store
        .get_session(session)
        .ok()
        .flatten()
        .map(|s| s.summary)
        .unwrap_or_default();
    let facts = deps
        .store
        .search_facts(&message.content, session, is_admin, 15)
        .unwrap_or_default();
    shown_fact_ids.extend(facts.iter().map(|f| f.id));
    let pending = deps.store.open_pending_items(session).unwrap_or_default();
    let recent = deps
        .store
        .recent_messages(session, settings.recent_messages)
        .unwrap_or_default();
    let msg_outputs = deps.store.recent_msg_outputs(session, 5).unwrap_or_default();

    // Untrusted messages reach the planner only as fenced paraphrases.
    let untrusted = deps
        .store
        .recent_untrusted_messages(session, 5)
        .unwrap_or_default();
    let paraphrased = if untrusted.is_empty() {
        Vec::new()
    } else {
        match paraphraser::paraphrase(
            &deps.gateway,
            &config.kiso_dir(),
            budget,
            session,
            &untrusted,
        )
        .await
        {
            Ok(reply) => reply.value,
            Err(e) => {
                warn!(session, error = %e, "paraphrasing failed; untrusted context omitted");
                Vec::new()
            }
        }
    };

    let environment = system_environment(config, workspace);
    planner::plan(
        &deps.gateway,
        &config.kiso_dir(),
        budget,
        settings.max_validation_retries,
        &PlannerInput {
            session,
            user_message: &message.content,
            summary: &summary,
            facts: &facts,
            pending_items: &pending,
            recent: &recent,
            recent_msg_outputs: &msg_outputs,
            skills,
            environment: &environment,
            paraphrased_untrusted: &paraphrased,
            replan_history: history,
        },
    )
    .await
}

/// Insert task rows for a validated plan, details sanitized first.
fn persist_tasks(
    deps: &Arc<WorkerDeps>,
    session: &str,
    plan_id: i64,
    plan: &PlanOutput,
    secret_values: &[String],
) -> Result<Vec<TaskRow>, kiso_store::StoreError> {
    for (idx, task) in plan.tasks.iter().enumerate() {
        deps.store.create_task(&NewTask {
            plan_id,
            session: session.to_string(),
            idx: idx as i64,
            task_type: task.task_type,
            detail: kiso_guard::sanitize(&task.detail, secret_values),
            skill: task.skill.clone(),
            args: task.args.as_ref().map(|v| v.to_string()),
            expect: task.expect.clone(),
        })?;
    }
    deps.store.tasks_for_plan(plan_id)
}

/// Sequential task execution with cancel checks between tasks.
async fn execute_plan(
    deps: &Arc<WorkerDeps>,
    ctx: &mut TaskContext,
    tasks: &[TaskRow],
) -> PlanOutcome {
    let max_calls = deps.config.load().settings.max_llm_calls_per_message;
    let last_idx = tasks.len().saturating_sub(1);
    let mut tried: Vec<String> = Vec::new();

    for (i, task) in tasks.iter().enumerate() {
        // Cancellation is only observed between tasks, never mid-task.
        if ctx.cancel.is_cancelled() {
            info!(session = %ctx.session, "cancel observed between tasks");
            return PlanOutcome::Cancelled;
        }

        let _ = deps.store.update_task(task.id, TaskStatus::Running, None, None);

        match task.task_type {
            TaskType::Replan => {
                let _ = deps.store.update_task(
                    task.id,
                    TaskStatus::Done,
                    Some("replanning with intermediate results"),
                    None,
                );
                return PlanOutcome::ReplanTask { tried };
            }
            TaskType::Msg => {
                let result = msg::run_msg(ctx, task).await;
                record_usage(deps, ctx.plan_id, task.id, &result.usage);
                if result.success {
                    let _ = deps.store.update_task(
                        task.id,
                        TaskStatus::Done,
                        Some(&result.output),
                        None,
                    );
                    // final only on the last msg of a plan that ends in msg.
                    let is_final = i == last_idx;
                    deliver_webhook(deps, &ctx.session, task.id, &result.output, is_final)
                        .await;
                } else {
                    let _ = deps.store.update_task(
                        task.id,
                        TaskStatus::Failed,
                        Some(&result.output),
                        None,
                    );
                    if ctx.budget.used() >= max_calls {
                        return PlanOutcome::BudgetExhausted;
                    }
                    return PlanOutcome::Failed {
                        failure: result
                            .replan_reason
                            .unwrap_or_else(|| "message composition failed".to_string()),
                        tried,
                    };
                }
            }
            TaskType::Exec | TaskType::Skill | TaskType::Search => {
                let result = match task.task_type {
                    TaskType::Exec => exec::run_exec(ctx, task).await,
                    TaskType::Skill => skill::run_skill(ctx, task).await,
                    _ => search::run_search(ctx, task).await,
                };
                record_usage(deps, ctx.plan_id, task.id, &result.usage);
                tried.push(format!("{}: {}", task.task_type, task.detail));

                if result.success {
                    let _ = deps.store.update_task(
                        task.id,
                        TaskStatus::Done,
                        Some(&result.output),
                        result.stderr.as_deref(),
                    );
                    ctx.plan_outputs.push(PlanOutputRecord {
                        task_id: task.id,
                        task_type: task.task_type.to_string(),
                        detail: task.detail.clone(),
                        output: result.output,
                    });
                } else {
                    let _ = deps.store.update_task(
                        task.id,
                        TaskStatus::Failed,
                        Some(&result.output),
                        result.stderr.as_deref(),
                    );
                    if ctx.budget.used() >= max_calls {
                        return PlanOutcome::BudgetExhausted;
                    }
                    return PlanOutcome::Failed {
                        failure: result
                            .replan_reason
                            .unwrap_or_else(|| "task failed".to_string()),
                        tried,
                    };
                }
            }
        }
    }
    PlanOutcome::Completed
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
fn build_context(
    deps: &Arc<WorkerDeps>,
    session: &str,
    message: &MessageRow,
    workspace: &PathBuf,
    plan_id: i64,
    goal: &str,
    budget: &Arc<CallBudget>,
    cancel: &CancellationToken,
    is_admin: bool,
    secrets: HashMap<String, String>,
    allowed_skills: Vec<SkillManifest>,
) -> TaskContext {
    TaskContext {
        store: Arc::clone(&deps.store),
        config: Arc::clone(&deps.config),
        gateway: Arc::clone(&deps.gateway),
        deploy_secrets: Arc::clone(&deps.deploy_secrets),
        session: session.to_string(),
        user: message.user.clone(),
        plan_id,
        goal: goal.to_string(),
        user_message: message.content.clone(),
        workspace: workspace.clone(),
        plan_outputs: Vec::new(),
        secrets,
        cancel: cancel.clone(),
        allowed_skills,
        budget: Arc::clone(budget),
        is_admin,
        pub_secret: Arc::clone(&deps.pub_secret),
        public_base_url: deps.public_base_url.clone(),
    }
}

/// Skill manifests this user may invoke.
fn allowed_skill_manifests(config: &Arc<KisoConfig>, user: Option<&str>) -> Vec<SkillManifest> {
    let discovered = discover_skills(&config.skills_dir());
    let names: Vec<String> = discovered.iter().map(|s| s.name.clone()).collect();
    let allowed = match user {
        Some(u) => config.allowed_skills(u, &names),
        None => Vec::new(),
    };
    discovered
        .into_iter()
        .filter(|s| allowed.contains(&s.name))
        .collect()
}

/// A plan + single done msg task, persisted and delivered without an LLM
/// call. Used for planning failure, budget exhaustion, cancel summaries,
/// revoked access — every path where the user must still hear back.
async fn deliver_synthetic_msg(
    deps: &Arc<WorkerDeps>,
    session: &str,
    message_id: i64,
    goal: &str,
    text: &str,
) {
    let plan_id = match deps.store.create_plan(session, message_id, None, goal) {
        Ok(id) => id,
        Err(e) => {
            error!(session, error = %e, "synthetic msg: plan row failed");
            return;
        }
    };
    let task = NewTask {
        plan_id,
        session: session.to_string(),
        idx: 0,
        task_type: TaskType::Msg,
        detail: goal.to_string(),
        skill: None,
        args: None,
        expect: None,
    };
    match deps.store.create_task(&task) {
        Ok(task_id) => {
            let _ = deps
                .store
                .update_task(task_id, TaskStatus::Done, Some(text), None);
            let _ = deps.store.update_plan_status(plan_id, PlanStatus::Done);
            deliver_webhook(deps, session, task_id, text, true).await;
        }
        Err(e) => {
            error!(session, error = %e, "synthetic msg: task row failed");
            let _ = deps.store.update_plan_status(plan_id, PlanStatus::Failed);
        }
    }
}

async fn deliver_webhook(
    deps: &Arc<WorkerDeps>,
    session: &str,
    task_id: i64,
    content: &str,
    is_final: bool,
) {
    let webhook_url = deps
        .store
        .get_session(session)
        .ok()
        .flatten()
        .and_then(|s| s.webhook);
    if let Some(url) = webhook_url {
        deps.deliverer
            .deliver(&url, session, task_id, content, is_final)
            .await;
    }
}

/// Push one role invocation's spend onto the task row and the plan totals.
fn record_usage(deps: &Arc<WorkerDeps>, plan_id: i64, task_id: i64, usage: &Usage) {
    if usage.prompt_tokens == 0 && usage.completion_tokens == 0 && usage.calls.is_empty() {
        return;
    }
    let _ = deps
        .store
        .update_task_usage(task_id, usage.prompt_tokens, usage.completion_tokens);
    for call in &usage.calls {
        let _ = deps.store.append_task_llm_call(task_id, call);
    }
    if let Ok(plan) = deps.store.get_plan(plan_id) {
        // KEEP sentinel: refresh totals without touching the stored
        // planner-call audit.
        let _ = deps.store.update_plan_usage(
            plan_id,
            plan.prompt_tokens + usage.prompt_tokens,
            plan.completion_tokens + usage.completion_tokens,
            None,
        );
    }
}

fn completed_count(deps: &Arc<WorkerDeps>, plan_id: i64) -> usize {
    deps.store
        .tasks_for_plan(plan_id)
        .map(|tasks| {
            tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Done)
                .count()
        })
        .unwrap_or(0)
}

fn stored_task(deps: &Arc<WorkerDeps>, task_id: i64) -> Option<TaskRow> {
    deps.store.get_task(task_id).ok()
}

fn is_budget_error(e: &BrainError) -> bool {
    matches!(e, BrainError::Llm(LlmError::BudgetExceeded { .. }))
}

fn snippet(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}…")
}
