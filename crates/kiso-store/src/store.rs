use std::path::Path;
use std::sync::Mutex;

use regex::Regex;
use rusqlite::Connection;
use tracing::{debug, info, warn};

use kiso_core::types::{
    FactCategory, FactSource, LearningStatus, LlmCallAudit, PlanStatus, TaskStatus,
};

use crate::db::init_db;
use crate::error::{Result, StoreError};
use crate::types::*;

/// Single-file embedded store owning all persistent state.
///
/// One SQLite connection behind a `Mutex` — writes are serialized, which is
/// what SQLite wants anyway, and the worker model keeps contention low (one
/// writer per session, short transactions).
pub struct Store {
    db: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the store at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        init_db(&conn)?;
        info!(path = %path.display(), "store opened");
        Ok(Self { db: Mutex::new(conn) })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_db(&conn)?;
        Ok(Self { db: Mutex::new(conn) })
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    pub fn save_message(
        &self,
        session: &str,
        user: Option<&str>,
        role: &str,
        content: &str,
        trusted: bool,
    ) -> Result<i64> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        db.execute(
            "INSERT INTO messages (session, user, role, content, trusted, processed, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
            rusqlite::params![session, user, role, content, trusted, now],
        )?;
        Ok(db.last_insert_rowid())
    }

    pub fn mark_message_processed(&self, id: i64) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute("UPDATE messages SET processed = 1 WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(StoreError::NotFound { entity: "message", id });
        }
        Ok(())
    }

    pub fn get_message(&self, id: i64) -> Result<MessageRow> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, session, user, role, content, trusted, processed, created_at
             FROM messages WHERE id = ?1",
            [id],
            row_to_message,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound { entity: "message", id },
            other => StoreError::Database(other),
        })
    }

    /// Trusted, unprocessed messages across all sessions (startup re-enqueue).
    pub fn get_unprocessed_messages(&self) -> Result<Vec<MessageRow>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, session, user, role, content, trusted, processed, created_at
             FROM messages WHERE trusted = 1 AND processed = 0 ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_message)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Last `limit` trusted messages of a session, oldest first.
    pub fn recent_messages(&self, session: &str, limit: usize) -> Result<Vec<MessageRow>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, session, user, role, content, trusted, processed, created_at
             FROM messages WHERE session = ?1 AND trusted = 1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![session, limit as i64], row_to_message)?;
        let mut msgs: Vec<_> = rows.filter_map(|r| r.ok()).collect();
        msgs.reverse();
        Ok(msgs)
    }

    /// Last `limit` untrusted messages — paraphraser input, never enqueued.
    pub fn recent_untrusted_messages(&self, session: &str, limit: usize) -> Result<Vec<MessageRow>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, session, user, role, content, trusted, processed, created_at
             FROM messages WHERE session = ?1 AND trusted = 0
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![session, limit as i64], row_to_message)?;
        let mut msgs: Vec<_> = rows.filter_map(|r| r.ok()).collect();
        msgs.reverse();
        Ok(msgs)
    }

    /// Trusted messages newer than the session's last summary, oldest first.
    pub fn messages_since_summary(&self, session: &str) -> Result<Vec<MessageRow>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT m.id, m.session, m.user, m.role, m.content, m.trusted, m.processed, m.created_at
             FROM messages m
             JOIN sessions s ON s.session = m.session
             WHERE m.session = ?1 AND m.trusted = 1
               AND (s.last_summary_at IS NULL OR m.created_at > s.last_summary_at)
             ORDER BY m.id",
        )?;
        let rows = stmt.query_map([session], row_to_message)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // -----------------------------------------------------------------------
    // Plans
    // -----------------------------------------------------------------------

    pub fn create_plan(
        &self,
        session: &str,
        message_id: i64,
        parent_id: Option<i64>,
        goal: &str,
    ) -> Result<i64> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        db.execute(
            "INSERT INTO plans (session, message_id, parent_id, goal, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'running', ?5, ?5)",
            rusqlite::params![session, message_id, parent_id, goal, now],
        )?;
        Ok(db.last_insert_rowid())
    }

    pub fn update_plan_status(&self, plan_id: i64, status: PlanStatus) -> Result<()> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        let n = db.execute(
            "UPDATE plans SET status = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![status.to_string(), now, plan_id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound { entity: "plan", id: plan_id });
        }
        Ok(())
    }

    /// Refresh a plan's token totals. `llm_calls = None` is the KEEP
    /// sentinel: totals change but the stored per-call audit stays intact.
    pub fn update_plan_usage(
        &self,
        plan_id: i64,
        prompt_tokens: u32,
        completion_tokens: u32,
        llm_calls: Option<&[LlmCallAudit]>,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        let n = match llm_calls {
            Some(calls) => {
                let json = serde_json::to_string(calls)?;
                db.execute(
                    "UPDATE plans SET prompt_tokens = ?1, completion_tokens = ?2,
                                      llm_calls = ?3, updated_at = ?4
                     WHERE id = ?5",
                    rusqlite::params![prompt_tokens, completion_tokens, json, now, plan_id],
                )?
            }
            None => db.execute(
                "UPDATE plans SET prompt_tokens = ?1, completion_tokens = ?2, updated_at = ?3
                 WHERE id = ?4",
                rusqlite::params![prompt_tokens, completion_tokens, now, plan_id],
            )?,
        };
        if n == 0 {
            return Err(StoreError::NotFound { entity: "plan", id: plan_id });
        }
        Ok(())
    }

    pub fn get_plan(&self, plan_id: i64) -> Result<PlanRow> {
        let db = self.db.lock().unwrap();
        db.query_row(
            &format!("{PLAN_COLUMNS} WHERE id = ?1"),
            [plan_id],
            row_to_plan,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                StoreError::NotFound { entity: "plan", id: plan_id }
            }
            other => StoreError::Database(other),
        })
    }

    pub fn last_plan_for_session(&self, session: &str) -> Result<Option<PlanRow>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            &format!("{PLAN_COLUMNS} WHERE session = ?1 ORDER BY id DESC LIMIT 1"),
            [session],
            row_to_plan,
        ) {
            Ok(p) => Ok(Some(p)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    pub fn create_task(&self, task: &NewTask) -> Result<i64> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        db.execute(
            "INSERT INTO tasks (plan_id, session, idx, task_type, detail, skill, args, expect,
                                status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9, ?9)",
            rusqlite::params![
                task.plan_id,
                task.session,
                task.idx,
                task.task_type.to_string(),
                task.detail,
                task.skill,
                task.args,
                task.expect,
                now
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    pub fn update_task(
        &self,
        task_id: i64,
        status: TaskStatus,
        output: Option<&str>,
        stderr: Option<&str>,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        let n = db.execute(
            "UPDATE tasks SET status = ?1,
                              output = COALESCE(?2, output),
                              stderr = COALESCE(?3, stderr),
                              substatus = NULL,
                              updated_at = ?4
             WHERE id = ?5",
            rusqlite::params![status.to_string(), output, stderr, now, task_id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound { entity: "task", id: task_id });
        }
        Ok(())
    }

    pub fn update_task_substatus(&self, task_id: i64, substatus: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        db.execute(
            "UPDATE tasks SET substatus = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![substatus, now, task_id],
        )?;
        Ok(())
    }

    pub fn update_task_usage(
        &self,
        task_id: i64,
        prompt_tokens: u32,
        completion_tokens: u32,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE tasks SET prompt_tokens = prompt_tokens + ?1,
                              completion_tokens = completion_tokens + ?2
             WHERE id = ?3",
            rusqlite::params![prompt_tokens, completion_tokens, task_id],
        )?;
        Ok(())
    }

    pub fn update_task_review(
        &self,
        task_id: i64,
        verdict: &str,
        reason: Option<&str>,
        learning: Option<&str>,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        db.execute(
            "UPDATE tasks SET review_verdict = ?1, review_reason = ?2,
                              review_learning = ?3, updated_at = ?4
             WHERE id = ?5",
            rusqlite::params![verdict, reason, learning, now, task_id],
        )?;
        Ok(())
    }

    /// Append one per-call audit record to the task's `llm_calls` JSON array.
    pub fn append_task_llm_call(&self, task_id: i64, call: &LlmCallAudit) -> Result<()> {
        let db = self.db.lock().unwrap();
        let existing: Option<String> = db
            .query_row("SELECT llm_calls FROM tasks WHERE id = ?1", [task_id], |r| {
                r.get(0)
            })
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    StoreError::NotFound { entity: "task", id: task_id }
                }
                other => StoreError::Database(other),
            })?;
        let mut calls: Vec<LlmCallAudit> = match existing {
            Some(json) => serde_json::from_str(&json).unwrap_or_default(),
            None => Vec::new(),
        };
        calls.push(call.clone());
        let json = serde_json::to_string(&calls)?;
        db.execute(
            "UPDATE tasks SET llm_calls = ?1 WHERE id = ?2",
            rusqlite::params![json, task_id],
        )?;
        Ok(())
    }

    pub fn get_task(&self, task_id: i64) -> Result<TaskRow> {
        let db = self.db.lock().unwrap();
        db.query_row(&format!("{TASK_COLUMNS} WHERE id = ?1"), [task_id], row_to_task)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    StoreError::NotFound { entity: "task", id: task_id }
                }
                other => StoreError::Database(other),
            })
    }

    pub fn tasks_for_plan(&self, plan_id: i64) -> Result<Vec<TaskRow>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!("{TASK_COLUMNS} WHERE plan_id = ?1 ORDER BY idx"))?;
        let rows = stmt.query_map([plan_id], row_to_task)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Mark every still-pending task of a plan cancelled.
    pub fn cancel_pending_tasks(&self, plan_id: i64) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        let n = db.execute(
            "UPDATE tasks SET status = 'cancelled', updated_at = ?1
             WHERE plan_id = ?2 AND status = 'pending'",
            rusqlite::params![now, plan_id],
        )?;
        Ok(n)
    }

    /// Recent completed `msg` task outputs for a session, oldest first.
    pub fn recent_msg_outputs(&self, session: &str, limit: usize) -> Result<Vec<String>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT output FROM tasks
             WHERE session = ?1 AND task_type = 'msg' AND status = 'done' AND output IS NOT NULL
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![session, limit as i64], |r| {
            r.get::<_, String>(0)
        })?;
        let mut out: Vec<_> = rows.filter_map(|r| r.ok()).collect();
        out.reverse();
        Ok(out)
    }

    /// Tasks with id greater than `after_id`, plus the latest plan.
    pub fn get_status(&self, session: &str, after_id: i64) -> Result<StatusSnapshot> {
        let tasks = {
            let db = self.db.lock().unwrap();
            let mut stmt = db.prepare(&format!(
                "{TASK_COLUMNS} WHERE session = ?1 AND id > ?2 ORDER BY id"
            ))?;
            let rows = stmt.query_map(rusqlite::params![session, after_id], row_to_task)?;
            rows.filter_map(|r| r.ok()).collect()
        };
        let plan = self.last_plan_for_session(session)?;
        Ok(StatusSnapshot { tasks, plan })
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    pub fn get_session(&self, session: &str) -> Result<Option<SessionRow>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT session, connector, webhook, description, summary, last_summary_at,
                    created_at, updated_at
             FROM sessions WHERE session = ?1",
            [session],
            row_to_session,
        ) {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Upsert a session row. Explicit registration updates connector/webhook/
    /// description; implicit creation (first /msg) passes None for all three.
    pub fn create_or_update_session(
        &self,
        session: &str,
        connector: Option<&str>,
        webhook: Option<&str>,
        description: Option<&str>,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        db.execute(
            "INSERT INTO sessions (session, connector, webhook, description, summary,
                                   created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, '', ?5, ?5)
             ON CONFLICT(session) DO UPDATE SET
                connector   = COALESCE(excluded.connector, connector),
                webhook     = COALESCE(excluded.webhook, webhook),
                description = COALESCE(excluded.description, description),
                updated_at  = excluded.updated_at",
            rusqlite::params![session, connector, webhook, description, now],
        )?;
        Ok(())
    }

    /// Overwrite the session's rolling summary and stamp the summary cursor.
    pub fn update_session_summary(&self, session: &str, summary: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        let n = db.execute(
            "UPDATE sessions SET summary = ?1, last_summary_at = ?2, updated_at = ?2
             WHERE session = ?3",
            rusqlite::params![summary, now, session],
        )?;
        if n == 0 {
            return Err(StoreError::SessionNotFound(session.to_string()));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Facts
    // -----------------------------------------------------------------------

    pub fn save_fact(&self, fact: &NewFact) -> Result<i64> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        db.execute(
            "INSERT INTO facts (content, source, session, category, confidence, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                fact.content,
                fact.source.to_string(),
                fact.session,
                fact.category.to_string(),
                fact.confidence,
                now
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    /// All facts visible to `session`, confidence-descending.
    ///
    /// Scoping: `project`/`tool`/`general` facts are global. `user` facts are
    /// visible only in the session that produced them — unless the fact has
    /// no provenance session (legacy global) or the requester is admin.
    pub fn get_facts(&self, session: &str, is_admin: bool) -> Result<Vec<FactRow>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "{FACT_COLUMNS}
             WHERE category != 'user' OR session IS NULL OR session = ?1 OR ?2
             ORDER BY confidence DESC, id"
        ))?;
        let rows = stmt.query_map(rusqlite::params![session, is_admin], row_to_fact)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// BM25-ranked full-text search with the same scoping as [`get_facts`].
    ///
    /// The query is reduced to `\w+` tokens joined with OR; an empty query or
    /// a query with no matches falls back to the full fact list.
    pub fn search_facts(
        &self,
        query: &str,
        session: &str,
        is_admin: bool,
        limit: usize,
    ) -> Result<Vec<FactRow>> {
        let tokens = fts_tokens(query);
        if tokens.is_empty() {
            debug!("fact search: no tokens, falling back to full list");
            let mut all = self.get_facts(session, is_admin)?;
            all.truncate(limit);
            return Ok(all);
        }
        let match_expr = tokens.join(" OR ");

        let matched = {
            let db = self.db.lock().unwrap();
            let mut stmt = db.prepare(&format!(
                "SELECT f.id, f.content, f.source, f.session, f.category, f.confidence,
                        f.last_used, f.use_count, f.created_at
                 FROM facts f
                 JOIN facts_fts ft ON f.id = ft.rowid
                 WHERE facts_fts MATCH ?1
                   AND (f.category != 'user' OR f.session IS NULL OR f.session = ?2 OR ?3)
                 ORDER BY rank LIMIT {limit}"
            ))?;
            let rows = stmt.query_map(rusqlite::params![match_expr, session, is_admin], row_to_fact);
            match rows {
                Ok(iter) => iter.filter_map(|r| r.ok()).collect::<Vec<_>>(),
                // An FTS syntax error from hostile input degrades to the
                // fallback rather than failing the plan.
                Err(e) => {
                    warn!(error = %e, "fact FTS query failed; falling back");
                    Vec::new()
                }
            }
        };

        if matched.is_empty() {
            let mut all = self.get_facts(session, is_admin)?;
            all.truncate(limit);
            return Ok(all);
        }
        Ok(matched)
    }

    pub fn count_facts(&self) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let n: i64 = db.query_row("SELECT COUNT(*) FROM facts", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    /// All facts regardless of scope — consolidation input.
    pub fn all_facts(&self) -> Result<Vec<FactRow>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!("{FACT_COLUMNS} ORDER BY id"))?;
        let rows = stmt.query_map([], row_to_fact)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Replace the whole facts table with a consolidated set, atomically.
    pub fn replace_facts(&self, facts: &[NewFact]) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let now = chrono::Utc::now().to_rfc3339();
        tx.execute("DELETE FROM facts", [])?;
        for fact in facts {
            tx.execute(
                "INSERT INTO facts (content, source, session, category, confidence, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    fact.content,
                    fact.source.to_string(),
                    fact.session,
                    fact.category.to_string(),
                    fact.confidence,
                    now
                ],
            )?;
        }
        tx.commit()?;
        info!(count = facts.len(), "facts table replaced after consolidation");
        Ok(())
    }

    /// Reduce confidence of facts unused for `decay_days`. Returns how many
    /// rows decayed.
    pub fn decay_facts(&self, decay_days: i64, decay_rate: f64) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let cutoff = (chrono::Utc::now() - chrono::Duration::days(decay_days)).to_rfc3339();
        let n = db.execute(
            "UPDATE facts SET confidence = MAX(0.0, confidence - ?1)
             WHERE COALESCE(last_used, created_at) < ?2",
            rusqlite::params![decay_rate, cutoff],
        )?;
        Ok(n)
    }

    /// Soft-delete facts below the confidence threshold into the archive.
    pub fn archive_low_confidence_facts(&self, threshold: f64) -> Result<usize> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let now = chrono::Utc::now().to_rfc3339();
        tx.execute(
            "INSERT INTO facts_archive (content, source, session, category, confidence,
                                        last_used, use_count, created_at, archived_at)
             SELECT content, source, session, category, confidence,
                    last_used, use_count, created_at, ?1
             FROM facts WHERE confidence < ?2",
            rusqlite::params![now, threshold],
        )?;
        let n = tx.execute(
            "DELETE FROM facts WHERE confidence < ?1",
            rusqlite::params![threshold],
        )?;
        tx.commit()?;
        if n > 0 {
            info!(count = n, threshold, "low-confidence facts archived");
        }
        Ok(n)
    }

    /// Bump `use_count` and `last_used` for every fact shown to the planner
    /// on a successful plan.
    pub fn update_fact_usage(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        let mut stmt = db.prepare(
            "UPDATE facts SET use_count = use_count + 1, last_used = ?1 WHERE id = ?2",
        )?;
        for id in ids {
            stmt.execute(rusqlite::params![now, id])?;
        }
        Ok(())
    }

    pub fn count_archived_facts(&self) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let n: i64 = db.query_row("SELECT COUNT(*) FROM facts_archive", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    // -----------------------------------------------------------------------
    // Learnings & pending items
    // -----------------------------------------------------------------------

    pub fn save_learning(&self, content: &str, session: &str, user: Option<&str>) -> Result<i64> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        db.execute(
            "INSERT INTO learnings (content, session, user, status, created_at)
             VALUES (?1, ?2, ?3, 'pending', ?4)",
            rusqlite::params![content, session, user, now],
        )?;
        Ok(db.last_insert_rowid())
    }

    pub fn pending_learnings(&self) -> Result<Vec<LearningRow>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, content, session, user, status, reason, created_at
             FROM learnings WHERE status = 'pending' ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_learning)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn resolve_learning(
        &self,
        id: i64,
        status: LearningStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        let n = db.execute(
            "UPDATE learnings SET status = ?1, reason = ?2, resolved_at = ?3 WHERE id = ?4",
            rusqlite::params![status.to_string(), reason, now, id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound { entity: "learning", id });
        }
        Ok(())
    }

    pub fn save_pending_item(&self, content: &str, scope: &str, source: &str) -> Result<i64> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        db.execute(
            "INSERT INTO pending_items (content, scope, source, status, created_at)
             VALUES (?1, ?2, ?3, 'open', ?4)",
            rusqlite::params![content, scope, source, now],
        )?;
        Ok(db.last_insert_rowid())
    }

    /// Open pending items visible to a session (its own scope plus global).
    pub fn open_pending_items(&self, session: &str) -> Result<Vec<PendingItemRow>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, content, scope, source, status, created_at
             FROM pending_items
             WHERE status = 'open' AND (scope = 'global' OR scope = ?1)
             ORDER BY id",
        )?;
        let rows = stmt.query_map([session], row_to_pending_item)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // -----------------------------------------------------------------------
    // Startup recovery
    // -----------------------------------------------------------------------

    /// One pass over crash leftovers: running plans and tasks become failed,
    /// and the trusted-but-unprocessed messages are returned for re-enqueue.
    pub fn recover_running_on_startup(&self) -> Result<Vec<(String, i64)>> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();

        let plans = db.execute(
            "UPDATE plans SET status = 'failed', updated_at = ?1 WHERE status = 'running'",
            [&now],
        )?;
        let tasks = db.execute(
            "UPDATE tasks SET status = 'failed', updated_at = ?1 WHERE status = 'running'",
            [&now],
        )?;
        if plans > 0 || tasks > 0 {
            warn!(plans, tasks, "marked in-flight work failed on startup");
        }

        let mut stmt = db.prepare(
            "SELECT session, id FROM messages WHERE trusted = 1 AND processed = 0 ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

// ---------------------------------------------------------------------------
// Row mappers
// ---------------------------------------------------------------------------

const PLAN_COLUMNS: &str = "SELECT id, session, message_id, parent_id, goal, status,
        prompt_tokens, completion_tokens, llm_calls, created_at, updated_at FROM plans";

const TASK_COLUMNS: &str = "SELECT id, plan_id, session, idx, task_type, detail, skill, args,
        expect, status, substatus, output, stderr, review_verdict, review_reason,
        review_learning, prompt_tokens, completion_tokens, llm_calls, created_at, updated_at
        FROM tasks";

const FACT_COLUMNS: &str = "SELECT id, content, source, session, category, confidence,
        last_used, use_count, created_at FROM facts";

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        session: row.get(0)?,
        connector: row.get(1)?,
        webhook: row.get(2)?,
        description: row.get(3)?,
        summary: row.get(4)?,
        last_summary_at: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        session: row.get(1)?,
        user: row.get(2)?,
        role: row.get(3)?,
        content: row.get(4)?,
        trusted: row.get(5)?,
        processed: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn row_to_plan(row: &rusqlite::Row<'_>) -> rusqlite::Result<PlanRow> {
    let status: String = row.get(5)?;
    Ok(PlanRow {
        id: row.get(0)?,
        session: row.get(1)?,
        message_id: row.get(2)?,
        parent_id: row.get(3)?,
        goal: row.get(4)?,
        status: status.parse().unwrap_or(PlanStatus::Failed),
        prompt_tokens: row.get(6)?,
        completion_tokens: row.get(7)?,
        llm_calls: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
    let task_type: String = row.get(4)?;
    let status: String = row.get(9)?;
    Ok(TaskRow {
        id: row.get(0)?,
        plan_id: row.get(1)?,
        session: row.get(2)?,
        idx: row.get(3)?,
        task_type: task_type.parse().unwrap_or(kiso_core::types::TaskType::Msg),
        detail: row.get(5)?,
        skill: row.get(6)?,
        args: row.get(7)?,
        expect: row.get(8)?,
        status: status.parse().unwrap_or(TaskStatus::Failed),
        substatus: row.get(10)?,
        output: row.get(11)?,
        stderr: row.get(12)?,
        review_verdict: row.get(13)?,
        review_reason: row.get(14)?,
        review_learning: row.get(15)?,
        prompt_tokens: row.get(16)?,
        completion_tokens: row.get(17)?,
        llm_calls: row.get(18)?,
        created_at: row.get(19)?,
        updated_at: row.get(20)?,
    })
}

fn row_to_fact(row: &rusqlite::Row<'_>) -> rusqlite::Result<FactRow> {
    let source: String = row.get(2)?;
    let category: String = row.get(4)?;
    Ok(FactRow {
        id: row.get(0)?,
        content: row.get(1)?,
        source: source.parse().unwrap_or(FactSource::Manual),
        session: row.get(3)?,
        category: category.parse().unwrap_or(FactCategory::General),
        confidence: row.get(5)?,
        last_used: row.get(6)?,
        use_count: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn row_to_learning(row: &rusqlite::Row<'_>) -> rusqlite::Result<LearningRow> {
    let status: String = row.get(4)?;
    let status = match status.as_str() {
        "promoted" => LearningStatus::Promoted,
        "discarded" => LearningStatus::Discarded,
        _ => LearningStatus::Pending,
    };
    Ok(LearningRow {
        id: row.get(0)?,
        content: row.get(1)?,
        session: row.get(2)?,
        user: row.get(3)?,
        status,
        reason: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn row_to_pending_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingItemRow> {
    Ok(PendingItemRow {
        id: row.get(0)?,
        content: row.get(1)?,
        scope: row.get(2)?,
        source: row.get(3)?,
        status: row.get(4)?,
        created_at: row.get(5)?,
    })
}

/// Extract `\w+` tokens from a free-text query, quoted for FTS5.
fn fts_tokens(query: &str) -> Vec<String> {
    use std::sync::OnceLock;
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\w+").expect("static regex"));
    re.find_iter(query)
        .map(|m| format!("\"{}\"", m.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiso_core::types::TaskType;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn fact(content: &str, category: FactCategory, session: Option<&str>) -> NewFact {
        NewFact {
            content: content.to_string(),
            source: FactSource::Curator,
            session: session.map(String::from),
            category,
            confidence: 0.8,
        }
    }

    #[test]
    fn message_lifecycle() {
        let s = store();
        let id = s.save_message("s1", Some("alice"), "user", "hello", true).unwrap();
        assert_eq!(s.get_unprocessed_messages().unwrap().len(), 1);
        s.mark_message_processed(id).unwrap();
        assert!(s.get_unprocessed_messages().unwrap().is_empty());
    }

    #[test]
    fn untrusted_messages_are_not_recovered() {
        let s = store();
        s.save_message("s1", None, "user", "injected", false).unwrap();
        assert!(s.get_unprocessed_messages().unwrap().is_empty());
        assert!(s.recover_running_on_startup().unwrap().is_empty());
        assert_eq!(s.recent_untrusted_messages("s1", 5).unwrap().len(), 1);
    }

    #[test]
    fn startup_recovery_fails_running_work() {
        let s = store();
        let mid = s.save_message("s1", None, "user", "do it", true).unwrap();
        let pid = s.create_plan("s1", mid, None, "goal").unwrap();
        let tid = s
            .create_task(&NewTask {
                plan_id: pid,
                session: "s1".to_string(),
                idx: 0,
                task_type: TaskType::Exec,
                detail: "list".to_string(),
                skill: None,
                args: None,
                expect: Some("a listing".to_string()),
            })
            .unwrap();
        s.update_task(tid, TaskStatus::Running, None, None).unwrap();

        let recovered = s.recover_running_on_startup().unwrap();
        assert_eq!(recovered, vec![("s1".to_string(), mid)]);
        assert_eq!(s.get_plan(pid).unwrap().status, PlanStatus::Failed);
        assert_eq!(s.tasks_for_plan(pid).unwrap()[0].status, TaskStatus::Failed);
    }

    #[test]
    fn update_plan_usage_keep_sentinel_preserves_llm_calls() {
        let s = store();
        let mid = s.save_message("s1", None, "user", "x", true).unwrap();
        let pid = s.create_plan("s1", mid, None, "goal").unwrap();

        let call = LlmCallAudit {
            role: "planner".to_string(),
            model: "test-model".to_string(),
            prompt_tokens: 10,
            completion_tokens: 5,
            latency_ms: 42,
            status: "ok".to_string(),
        };
        s.update_plan_usage(pid, 10, 5, Some(std::slice::from_ref(&call))).unwrap();

        // KEEP sentinel: totals change, audit stays.
        s.update_plan_usage(pid, 99, 88, None).unwrap();
        let plan = s.get_plan(pid).unwrap();
        assert_eq!(plan.prompt_tokens, 99);
        assert_eq!(plan.completion_tokens, 88);
        let calls: Vec<LlmCallAudit> =
            serde_json::from_str(plan.llm_calls.as_deref().unwrap()).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].role, "planner");
    }

    #[test]
    fn cancel_pending_tasks_leaves_finished_ones() {
        let s = store();
        let mid = s.save_message("s1", None, "user", "x", true).unwrap();
        let pid = s.create_plan("s1", mid, None, "goal").unwrap();
        let mk = |idx, tt: TaskType| NewTask {
            plan_id: pid,
            session: "s1".to_string(),
            idx,
            task_type: tt,
            detail: String::new(),
            skill: None,
            args: None,
            expect: None,
        };
        let done = s.create_task(&mk(0, TaskType::Exec)).unwrap();
        s.create_task(&mk(1, TaskType::Msg)).unwrap();
        s.update_task(done, TaskStatus::Done, Some("ok"), None).unwrap();

        assert_eq!(s.cancel_pending_tasks(pid).unwrap(), 1);
        let tasks = s.tasks_for_plan(pid).unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Done);
        assert_eq!(tasks[1].status, TaskStatus::Cancelled);
    }

    #[test]
    fn search_facts_empty_query_falls_back_to_get_facts() {
        let s = store();
        s.save_fact(&fact("kiso uses sqlite", FactCategory::Tool, None)).unwrap();
        s.save_fact(&fact("deploys run on fridays", FactCategory::Project, None)).unwrap();

        let all = s.get_facts("s1", false).unwrap();
        let searched = s.search_facts("", "s1", false, 15).unwrap();
        assert_eq!(all.len(), searched.len());
    }

    #[test]
    fn search_facts_no_match_falls_back() {
        let s = store();
        s.save_fact(&fact("kiso uses sqlite", FactCategory::Tool, None)).unwrap();
        let searched = s.search_facts("zzz qqq", "s1", false, 15).unwrap();
        assert_eq!(searched.len(), 1);
    }

    #[test]
    fn search_facts_ranks_matches() {
        let s = store();
        s.save_fact(&fact("postgres is the prod database", FactCategory::Tool, None)).unwrap();
        s.save_fact(&fact("alice prefers terse answers", FactCategory::User, Some("s1"))).unwrap();
        let hits = s.search_facts("database", "s1", false, 15).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("postgres"));
    }

    #[test]
    fn user_facts_are_session_scoped() {
        let s = store();
        s.save_fact(&fact("alice likes rust", FactCategory::User, Some("s1"))).unwrap();
        s.save_fact(&fact("legacy global", FactCategory::User, None)).unwrap();
        s.save_fact(&fact("shared tool note", FactCategory::Tool, Some("s1"))).unwrap();

        let own = s.get_facts("s1", false).unwrap();
        assert_eq!(own.len(), 3);

        let other = s.get_facts("s2", false).unwrap();
        assert_eq!(other.len(), 2); // legacy global + tool fact

        let admin = s.get_facts("s2", true).unwrap();
        assert_eq!(admin.len(), 3);
    }

    #[test]
    fn decay_and_archive() {
        let s = store();
        let id = s.save_fact(&fact("old fact", FactCategory::General, None)).unwrap();
        // Backdate created_at so the decay cutoff catches it.
        {
            let db = s.db.lock().unwrap();
            db.execute(
                "UPDATE facts SET created_at = '2000-01-01T00:00:00+00:00', confidence = 0.35
                 WHERE id = ?1",
                [id],
            )
            .unwrap();
        }
        assert_eq!(s.decay_facts(30, 0.1).unwrap(), 1);
        let archived = s.archive_low_confidence_facts(0.3).unwrap();
        assert_eq!(archived, 1);
        assert_eq!(s.count_facts().unwrap(), 0);
        assert_eq!(s.count_archived_facts().unwrap(), 1);
    }

    #[test]
    fn replace_facts_preserves_session_provenance() {
        let s = store();
        s.save_fact(&fact("will be replaced", FactCategory::User, Some("s1"))).unwrap();
        s.replace_facts(&[fact("consolidated", FactCategory::User, Some("s1"))]).unwrap();
        let all = s.all_facts().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].session.as_deref(), Some("s1"));
        // FTS stays in sync through the triggers.
        let hits = s.search_facts("consolidated", "s1", false, 15).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn fact_usage_updates_once_per_id() {
        let s = store();
        let id = s.save_fact(&fact("used fact", FactCategory::General, None)).unwrap();
        s.update_fact_usage(&[id]).unwrap();
        let f = &s.all_facts().unwrap()[0];
        assert_eq!(f.use_count, 1);
        assert!(f.last_used.is_some());
    }

    #[test]
    fn learning_lifecycle() {
        let s = store();
        let id = s.save_learning("the build needs node 20", "s1", Some("alice")).unwrap();
        assert_eq!(s.pending_learnings().unwrap().len(), 1);
        s.resolve_learning(id, LearningStatus::Promoted, None).unwrap();
        assert!(s.pending_learnings().unwrap().is_empty());
    }

    #[test]
    fn pending_items_scope_filtering() {
        let s = store();
        s.save_pending_item("which repo?", "s1", "curator").unwrap();
        s.save_pending_item("global question", "global", "curator").unwrap();
        assert_eq!(s.open_pending_items("s1").unwrap().len(), 2);
        assert_eq!(s.open_pending_items("s2").unwrap().len(), 1);
    }

    #[test]
    fn session_upsert_keeps_existing_fields() {
        let s = store();
        s.create_or_update_session("s1", Some("telegram"), Some("https://h.example/w"), None)
            .unwrap();
        // Implicit touch from a later /msg must not wipe the webhook.
        s.create_or_update_session("s1", None, None, None).unwrap();
        let row = s.get_session("s1").unwrap().unwrap();
        assert_eq!(row.connector.as_deref(), Some("telegram"));
        assert_eq!(row.webhook.as_deref(), Some("https://h.example/w"));
    }

    #[test]
    fn status_snapshot_after_id_filters() {
        let s = store();
        let mid = s.save_message("s1", None, "user", "x", true).unwrap();
        let pid = s.create_plan("s1", mid, None, "goal").unwrap();
        let t1 = s
            .create_task(&NewTask {
                plan_id: pid,
                session: "s1".to_string(),
                idx: 0,
                task_type: TaskType::Msg,
                detail: "reply".to_string(),
                skill: None,
                args: None,
                expect: None,
            })
            .unwrap();
        let snap = s.get_status("s1", 0).unwrap();
        assert_eq!(snap.tasks.len(), 1);
        assert_eq!(snap.plan.as_ref().unwrap().id, pid);
        let snap2 = s.get_status("s1", t1).unwrap();
        assert!(snap2.tasks.is_empty());
    }

    #[test]
    fn messages_since_summary_resets_on_summarize() {
        let s = store();
        s.create_or_update_session("s1", None, None, None).unwrap();
        s.save_message("s1", None, "user", "one", true).unwrap();
        s.save_message("s1", None, "user", "two", true).unwrap();
        assert_eq!(s.messages_since_summary("s1").unwrap().len(), 2);
        s.update_session_summary("s1", "## Summary\nshort").unwrap();
        assert!(s.messages_since_summary("s1").unwrap().is_empty());
        assert_eq!(s.get_session("s1").unwrap().unwrap().summary, "## Summary\nshort");
    }
}
