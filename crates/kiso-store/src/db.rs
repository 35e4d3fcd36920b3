use rusqlite::Connection;
use tracing::info;

use crate::error::Result;

/// Current schema version, stored in `PRAGMA user_version`.
const SCHEMA_VERSION: i64 = 1;

/// Open pragmas + run migrations. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < SCHEMA_VERSION {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        info!(from = version, to = SCHEMA_VERSION, "store schema migrated");
    }
    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            session         TEXT PRIMARY KEY,
            connector       TEXT,
            webhook         TEXT,
            description     TEXT,
            summary         TEXT NOT NULL DEFAULT '',
            last_summary_at TEXT,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            session    TEXT NOT NULL,
            user       TEXT,
            role       TEXT NOT NULL,
            content    TEXT NOT NULL,
            trusted    INTEGER NOT NULL DEFAULT 0,
            processed  INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_session
            ON messages(session, id);
        CREATE INDEX IF NOT EXISTS idx_messages_pending
            ON messages(trusted, processed);

        CREATE TABLE IF NOT EXISTS plans (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            session           TEXT NOT NULL,
            message_id        INTEGER NOT NULL,
            parent_id         INTEGER,
            goal              TEXT NOT NULL,
            status            TEXT NOT NULL DEFAULT 'running',
            prompt_tokens     INTEGER NOT NULL DEFAULT 0,
            completion_tokens INTEGER NOT NULL DEFAULT 0,
            llm_calls         TEXT,
            created_at        TEXT NOT NULL,
            updated_at        TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_plans_session
            ON plans(session, id);

        CREATE TABLE IF NOT EXISTS tasks (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            plan_id           INTEGER NOT NULL,
            session           TEXT NOT NULL,
            idx               INTEGER NOT NULL,
            task_type         TEXT NOT NULL,
            detail            TEXT NOT NULL,
            skill             TEXT,
            args              TEXT,
            expect            TEXT,
            status            TEXT NOT NULL DEFAULT 'pending',
            substatus         TEXT,
            output            TEXT,
            stderr            TEXT,
            review_verdict    TEXT,
            review_reason     TEXT,
            review_learning   TEXT,
            prompt_tokens     INTEGER NOT NULL DEFAULT 0,
            completion_tokens INTEGER NOT NULL DEFAULT 0,
            llm_calls         TEXT,
            created_at        TEXT NOT NULL,
            updated_at        TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_plan
            ON tasks(plan_id, idx);
        CREATE INDEX IF NOT EXISTS idx_tasks_session
            ON tasks(session, id);

        CREATE TABLE IF NOT EXISTS facts (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            content    TEXT NOT NULL,
            source     TEXT NOT NULL,
            session    TEXT,
            category   TEXT NOT NULL DEFAULT 'general',
            confidence REAL NOT NULL DEFAULT 0.8,
            last_used  TEXT,
            use_count  INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS facts_archive (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            content     TEXT NOT NULL,
            source      TEXT NOT NULL,
            session     TEXT,
            category    TEXT NOT NULL,
            confidence  REAL NOT NULL,
            last_used   TEXT,
            use_count   INTEGER NOT NULL,
            created_at  TEXT NOT NULL,
            archived_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS learnings (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            content     TEXT NOT NULL,
            session     TEXT NOT NULL,
            user        TEXT,
            status      TEXT NOT NULL DEFAULT 'pending',
            reason      TEXT,
            created_at  TEXT NOT NULL,
            resolved_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_learnings_pending
            ON learnings(status);

        CREATE TABLE IF NOT EXISTS pending_items (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            content    TEXT NOT NULL,
            scope      TEXT NOT NULL,
            source     TEXT NOT NULL,
            status     TEXT NOT NULL DEFAULT 'open',
            created_at TEXT NOT NULL
        );

        CREATE VIRTUAL TABLE IF NOT EXISTS facts_fts
            USING fts5(content, content='facts', content_rowid='id');

        CREATE TRIGGER IF NOT EXISTS facts_ai AFTER INSERT ON facts BEGIN
            INSERT INTO facts_fts(rowid, content) VALUES (new.id, new.content);
        END;
        CREATE TRIGGER IF NOT EXISTS facts_ad AFTER DELETE ON facts BEGIN
            INSERT INTO facts_fts(facts_fts, rowid, content)
                VALUES('delete', old.id, old.content);
        END;
        CREATE TRIGGER IF NOT EXISTS facts_au AFTER UPDATE ON facts BEGIN
            INSERT INTO facts_fts(facts_fts, rowid, content)
                VALUES('delete', old.id, old.content);
            INSERT INTO facts_fts(rowid, content) VALUES (new.id, new.content);
        END;",
    )?;
    Ok(())
}
