//! Append-only audit log — one JSONL file per UTC day under
//! `<kiso-dir>/audit/`. Callers are responsible for masking secrets before
//! handing an entry over; the writer itself never inspects content.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::Serialize;
use tracing::warn;

/// One audit record. `detail` carries role/model/token fields for LLM calls,
/// route/status fields for HTTP events.
#[derive(Debug, Serialize)]
pub struct AuditEntry {
    pub ts: String,
    pub kind: String,
    pub session: Option<String>,
    pub detail: serde_json::Value,
}

impl AuditEntry {
    pub fn new(kind: &str, session: Option<&str>, detail: serde_json::Value) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339(),
            kind: kind.to_string(),
            session: session.map(String::from),
            detail,
        }
    }
}

/// Serialized appender. A Mutex keeps concurrent workers from interleaving
/// partial lines; audit write failures are logged and swallowed — the audit
/// trail must never take down message processing.
pub struct AuditLog {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            lock: Mutex::new(()),
        }
    }

    pub fn append(&self, entry: &AuditEntry) {
        let _guard = self.lock.lock().unwrap();
        if let Err(e) = self.try_append(entry) {
            warn!(error = %e, "audit append failed");
        }
    }

    fn try_append(&self, entry: &AuditEntry) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let day = chrono::Utc::now().format("%Y-%m-%d");
        let path = self.dir.join(format!("{day}.jsonl"));
        let mut f = OpenOptions::new().create(true).append(true).open(path)?;
        let line = serde_json::to_string(entry).unwrap_or_else(|_| "{}".to_string());
        writeln!(f, "{line}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_one_line_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().to_path_buf());
        log.append(&AuditEntry::new(
            "llm_call",
            Some("s1"),
            serde_json::json!({"role": "planner", "tokens": 123}),
        ));
        log.append(&AuditEntry::new("http", None, serde_json::json!({"route": "/msg"})));

        let day = chrono::Utc::now().format("%Y-%m-%d");
        let content =
            std::fs::read_to_string(dir.path().join(format!("{day}.jsonl"))).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("\"kind\":\"llm_call\""));
    }
}
